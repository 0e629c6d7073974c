use std::fmt::Display;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::fitter::fit_settings::{BaselineSettings, FitSettings};
use crate::fitter::main_fitter::{
    CoreLevelInputs, FermiEdgeInputs, FitModel, Fitter, SessionModel,
};
use crate::fitter::models::ModelError;

#[derive(Debug)]
pub enum ConfigError {
    NotFound(PathBuf),
    File(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(path) => {
                write!(f, "Settings file not found: {}", path.display())
            }
            ConfigError::File(x) => write!(f, "Settings had an IO error: {}", x),
            ConfigError::Yaml(x) => write!(f, "Settings could not be parsed: {}", x),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::File(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        ConfigError::Yaml(value)
    }
}

impl std::error::Error for ConfigError {}

/// Everything one headless run needs besides the spectrum file.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub region: String,
    pub model: FitModel,
    /// Shirley background is subtracted before fitting when set.
    pub baseline: Option<BaselineSettings>,
    /// Core-level starting values are estimated from the data instead of
    /// taken from `core_level`.
    pub guess: bool,
    pub fit: FitSettings,
    pub core_level: CoreLevelInputs,
    pub fermi_edge: FermiEdgeInputs,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            region: "Region 1".to_owned(),
            model: FitModel::default(),
            baseline: None,
            guess: false,
            fit: FitSettings::default(),
            core_level: CoreLevelInputs::default(),
            fermi_edge: FermiEdgeInputs::default(),
        }
    }
}

impl AnalysisSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let settings: Self = serde_yaml::from_reader(BufReader::new(file))?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let file = File::create(path)?;
        serde_yaml::to_writer(BufWriter::new(file), self)?;
        log::info!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Copies the model selector, fit settings and inputs into a session.
    pub fn configure(&self, fitter: &mut Fitter) {
        fitter.model = self.model;
        fitter.settings = self.fit.clone();
        fitter.core_level = self.core_level.clone();
        fitter.fermi_edge = self.fermi_edge.clone();
    }

    /// Builds the model to fit from the configured inputs, or from a guess
    /// when `guess` is set and the core-level model is selected.
    pub fn prepare(&self, fitter: &mut Fitter) -> Result<SessionModel, ModelError> {
        match fitter.model {
            FitModel::CoreLevel if self.guess => fitter.guess(),
            _ => fitter.setup_model(),
        }
    }
}
