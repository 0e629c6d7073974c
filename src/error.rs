use super::baseline::BaselineError;
use super::fitter::fit::FitError;
use super::fitter::models::ModelError;
use super::reader::ParseError;
use super::settings::ConfigError;
use std::error::Error;
use std::fmt::Display;

#[derive(Debug)]
pub enum XpsError {
    Parser(ParseError),
    Baseline(BaselineError),
    Model(ModelError),
    Fit(FitError),
    Config(ConfigError),
    RegionNotFound(String),
    Serialize(serde_json::Error),
}

impl From<ParseError> for XpsError {
    fn from(err: ParseError) -> XpsError {
        XpsError::Parser(err)
    }
}

impl From<BaselineError> for XpsError {
    fn from(err: BaselineError) -> XpsError {
        XpsError::Baseline(err)
    }
}

impl From<ModelError> for XpsError {
    fn from(value: ModelError) -> Self {
        XpsError::Model(value)
    }
}

impl From<FitError> for XpsError {
    fn from(value: FitError) -> Self {
        XpsError::Fit(value)
    }
}

impl From<ConfigError> for XpsError {
    fn from(value: ConfigError) -> Self {
        XpsError::Config(value)
    }
}

impl From<serde_json::Error> for XpsError {
    fn from(value: serde_json::Error) -> Self {
        XpsError::Serialize(value)
    }
}

impl Display for XpsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XpsError::Parser(x) => write!(f, "Analysis could not read the spectrum: {}", x),
            XpsError::Baseline(x) => write!(f, "Analysis had a baseline error: {}", x),
            XpsError::Model(x) => write!(f, "Analysis had a model error: {}", x),
            XpsError::Fit(x) => write!(f, "Analysis had a fit error: {}", x),
            XpsError::Config(x) => write!(f, "Analysis had a configuration error: {}", x),
            XpsError::RegionNotFound(name) => {
                write!(f, "Spectrum file has no region named '{}'", name)
            }
            XpsError::Serialize(x) => write!(f, "Analysis could not serialize results: {}", x),
        }
    }
}

impl Error for XpsError {}
