use super::fit::{self, FitError, FitResult, PreparedModel, Preview};
use super::fit_settings::{BaselineSettings, FitSettings};
use super::models::fermi_edge::{FermiEdgeModel, FermiEdgeStart};
use super::models::gaussian::GaussianModel;
use super::models::lineshapes::{fwhm2sigma, sigma2fwhm};
use super::models::{Model, ModelError};
use crate::baseline::{self, BaselineError, ShirleyResult};
use crate::reader::Region;

#[derive(PartialEq, Default, Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Data {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl Data {
    pub fn from_points(points: &[[f64; 2]]) -> Self {
        Self {
            x: points.iter().map(|p| p[0]).collect(),
            y: points.iter().map(|p| p[1]).collect(),
        }
    }

    pub fn points(&self) -> Vec<[f64; 2]> {
        self.x.iter().zip(&self.y).map(|(x, y)| [*x, *y]).collect()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum FitModel {
    /// Single Gaussian core-level line.
    #[default]
    CoreLevel,
    /// Fermi-Dirac edge broadened by a Gaussian.
    FermiEdge,
}

/// Core-level fields in eV. `redchi` is filled in by a fit.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct CoreLevelInputs {
    pub center: f64,
    pub area: f64,
    pub fwhm: f64,
    pub redchi: Option<f64>,
}

impl Default for CoreLevelInputs {
    fn default() -> Self {
        Self {
            center: 0.0,
            area: 1.0,
            fwhm: 1.0,
            redchi: None,
        }
    }
}

/// Fermi-edge fields. Energies are entered and reported in meV, the
/// temperature in K.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct FermiEdgeInputs {
    pub temperature: f64,
    pub center_mev: f64,
    pub amplitude: f64,
    pub beamline_de_mev: f64,
    pub conv_de_mev: Option<f64>,
    /// `None` when the beamline width exceeds the convolved width.
    pub instrument_de_mev: Option<f64>,
    pub height: Option<f64>,
    pub redchi: Option<f64>,
}

impl Default for FermiEdgeInputs {
    fn default() -> Self {
        Self {
            temperature: 300.0,
            center_mev: 0.0,
            amplitude: 10.0,
            beamline_de_mev: 0.0,
            conv_de_mev: None,
            instrument_de_mev: None,
            height: None,
            redchi: None,
        }
    }
}

const DEFAULT_FERMI_SIGMA: f64 = 0.2;

/// A model ready to be previewed or fitted.
#[derive(Debug, Clone)]
pub enum SessionModel {
    CoreLevel(PreparedModel<GaussianModel>),
    FermiEdge(PreparedModel<FermiEdgeModel>),
}

impl SessionModel {
    pub fn preview(&self, x: &[f64], y: &[f64]) -> Result<Preview, ModelError> {
        match self {
            Self::CoreLevel(prepared) => prepared.preview(x, y),
            Self::FermiEdge(prepared) => prepared.preview(x, y),
        }
    }

    pub fn fit(&self, x: &[f64], y: &[f64], settings: &FitSettings) -> Result<FitResult, FitError> {
        match self {
            Self::CoreLevel(prepared) => fit::fit(prepared, x, y, settings),
            Self::FermiEdge(prepared) => fit::fit(prepared, x, y, settings),
        }
    }
}

/// Fit session for one region: its data, the model selector, the user-edited
/// inputs and the sigma carried from one Fermi-edge fit to the next.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Fitter {
    pub name: String,

    pub data: Data,
    pub background: Option<Vec<f64>>,

    pub model: FitModel,
    pub core_level: CoreLevelInputs,
    pub fermi_edge: FermiEdgeInputs,
    pub fermi_sigma: Option<f64>,

    pub settings: FitSettings,

    #[serde(skip)]
    pub fit_result: Option<FitResult>,
}

impl Default for Fitter {
    fn default() -> Self {
        Self::new("Fit".to_owned(), Data::default())
    }
}

impl Fitter {
    pub fn new(name: String, data: Data) -> Self {
        Self {
            name,
            data,
            background: None,
            model: FitModel::default(),
            core_level: CoreLevelInputs::default(),
            fermi_edge: FermiEdgeInputs::default(),
            fermi_sigma: None,
            settings: FitSettings::default(),
            fit_result: None,
        }
    }

    pub fn from_region(region: &Region) -> Self {
        Self::new(region.name.clone(), Data::from_points(&region.spectrum))
    }

    /// Replaces the data with its Shirley-corrected (and possibly cropped)
    /// version and keeps the background for plotting.
    pub fn apply_shirley_baseline(
        &mut self,
        settings: &BaselineSettings,
    ) -> Result<ShirleyResult, BaselineError> {
        log::info!("Subtracting Shirley background from {}", self.name);
        let result = baseline::shirley_with(&self.data.points(), settings)?;
        self.data = Data::from_points(&result.corrected);
        self.background = Some(result.background.clone());
        Ok(result)
    }

    pub fn setup_model(&self) -> Result<SessionModel, ModelError> {
        match self.model {
            FitModel::CoreLevel => self.setup_gauss_model().map(SessionModel::CoreLevel),
            FitModel::FermiEdge => self.setup_fermi_model().map(SessionModel::FermiEdge),
        }
    }

    pub fn setup_gauss_model(&self) -> Result<PreparedModel<GaussianModel>, ModelError> {
        let model = GaussianModel::new();
        let inputs = &self.core_level;
        let params = model.params_with(inputs.area, inputs.center, fwhm2sigma(inputs.fwhm))?;
        Ok(PreparedModel::new(model, params))
    }

    pub fn setup_fermi_model(&self) -> Result<PreparedModel<FermiEdgeModel>, ModelError> {
        let model = FermiEdgeModel::new();
        let inputs = &self.fermi_edge;
        let params = model.params_with(&FermiEdgeStart {
            amplitude: inputs.amplitude,
            center: inputs.center_mev / 1000.0,
            sigma: self.fermi_sigma.unwrap_or(DEFAULT_FERMI_SIGMA),
            tempr: inputs.temperature,
            beamline_de: inputs.beamline_de_mev / 1000.0,
        })?;
        Ok(PreparedModel::new(model, params))
    }

    /// Estimates starting values from the data and writes them back into
    /// the core-level inputs. Only the core-level model can guess.
    pub fn guess(&mut self) -> Result<SessionModel, ModelError> {
        match self.model {
            FitModel::CoreLevel => {
                log::info!("Guessing core-level parameters for {}", self.name);
                let model = GaussianModel::new();
                let params = model.guess(&self.data.x, &self.data.y)?;
                self.core_level.center = params.value("center")?;
                self.core_level.area = params.value("amplitude")?;
                self.core_level.fwhm = sigma2fwhm(params.value("sigma")?);
                Ok(SessionModel::CoreLevel(PreparedModel::new(model, params)))
            }
            FitModel::FermiEdge => Err(ModelError::GuessNotSupported(FermiEdgeModel::new().name())),
        }
    }

    pub fn preview(&self, prepared: &SessionModel) -> Result<Preview, ModelError> {
        prepared.preview(&self.data.x, &self.data.y)
    }

    /// Fits the prepared model and copies the results back into the inputs.
    /// A fit that ran out of evaluations still updates the inputs and keeps
    /// its best iterate before the error is returned.
    pub fn fit(&mut self, prepared: &SessionModel) -> Result<&FitResult, FitError> {
        match self.model {
            FitModel::CoreLevel => log::info!("Fitting {} with a Gaussian", self.name),
            FitModel::FermiEdge => log::info!("Fitting {} with a Fermi edge", self.name),
        }

        match prepared.fit(&self.data.x, &self.data.y, &self.settings) {
            Ok(result) => {
                self.update_inputs(prepared, &result);
                Ok(&*self.fit_result.insert(result))
            }
            Err(FitError::NoConvergence { nfev, best }) => {
                self.update_inputs(prepared, &best);
                self.fit_result = Some((*best).clone());
                Err(FitError::NoConvergence { nfev, best })
            }
            Err(e) => {
                log::error!("Fit of {} failed: {}", self.name, e);
                Err(e)
            }
        }
    }

    fn update_inputs(&mut self, prepared: &SessionModel, result: &FitResult) {
        let value = |name: &str| result.param(name).unwrap_or(f64::NAN);
        match prepared {
            SessionModel::CoreLevel(_) => {
                self.core_level.center = value("center");
                self.core_level.area = value("amplitude");
                self.core_level.fwhm = sigma2fwhm(value("sigma"));
                self.core_level.redchi = Some(result.redchi);
            }
            SessionModel::FermiEdge(_) => {
                let sigma = value("sigma");
                let instrument = value("Instrument_dE");
                self.fermi_edge.amplitude = value("amplitude");
                self.fermi_edge.center_mev = value("center") * 1000.0;
                self.fermi_edge.conv_de_mev = Some(sigma2fwhm(sigma) * 1000.0);
                self.fermi_edge.instrument_de_mev =
                    instrument.is_finite().then_some(instrument * 1000.0);
                self.fermi_edge.height = Some(value("Height"));
                self.fermi_edge.redchi = Some(result.redchi);
                self.fermi_sigma = Some(sigma);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_file;
    use approx::assert_relative_eq;

    const TWO_REGIONS: &str = "[Info]
NoOfRegions=2
Version=1.3.1
[Region 1]
[Info 1]
Region Name=Core
[Data 1]
0  1
1  5
2  10
3  5
4  1
[Region 2]
[Info 2]
Region Name=Edge
[Data 2]
-0.1  10
0  5
0.1  0
";

    fn sum_sq(v: &[f64]) -> f64 {
        v.iter().map(|r| r * r).sum()
    }

    #[test]
    fn guess_then_fit_on_first_region() {
        let path = std::env::temp_dir().join(format!("xpsfit-session-{}.txt", std::process::id()));
        std::fs::write(&path, TWO_REGIONS).unwrap();
        let file = read_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut fitter = Fitter::from_region(file.region("Region 1").unwrap());
        let prepared = fitter.guess().unwrap();
        assert_relative_eq!(fitter.core_level.center, 2.0, epsilon = 1e-9);

        let initial = fitter.preview(&prepared).unwrap();
        let result = fitter.fit(&prepared).unwrap();
        assert!(sum_sq(&result.residual) < sum_sq(&initial.residual));
        assert!(fitter.core_level.redchi.is_some());
        assert!(fitter.fit_result.is_some());
    }

    #[test]
    fn fermi_edge_has_no_guess() {
        let mut fitter = Fitter::default();
        fitter.model = FitModel::FermiEdge;
        assert_eq!(
            fitter.guess().unwrap_err(),
            ModelError::GuessNotSupported("fermi_edge")
        );
    }

    #[test]
    fn fermi_inputs_are_converted_from_mev() {
        let mut fitter = Fitter::default();
        fitter.model = FitModel::FermiEdge;
        fitter.fermi_edge.center_mev = 50.0;
        fitter.fermi_edge.beamline_de_mev = 20.0;

        let prepared = fitter.setup_fermi_model().unwrap();
        assert_relative_eq!(prepared.params.value("center").unwrap(), 0.05);
        assert_relative_eq!(prepared.params.value("Beamline_dE").unwrap(), 0.02);
        assert_relative_eq!(prepared.params.value("sigma").unwrap(), DEFAULT_FERMI_SIGMA);

        fitter.fermi_sigma = Some(0.03);
        let prepared = fitter.setup_fermi_model().unwrap();
        assert_relative_eq!(prepared.params.value("sigma").unwrap(), 0.03);
    }

    #[test]
    fn fermi_fit_reports_in_mev_and_carries_sigma() {
        let truth = FermiEdgeStart {
            amplitude: 10.0,
            center: 0.05,
            sigma: 0.03,
            tempr: 30.0,
            beamline_de: 0.02,
        };
        let model = FermiEdgeModel::new();
        let x: Vec<f64> = (0..101).map(|i| -0.2 + 0.004 * i as f64).collect();
        let y = model.eval(&model.params_with(&truth).unwrap(), &x).unwrap();

        let mut fitter = Fitter::new("Region 2".to_owned(), Data { x, y });
        fitter.model = FitModel::FermiEdge;
        fitter.fermi_edge.temperature = 30.0;
        fitter.fermi_edge.amplitude = 10.5;
        fitter.fermi_edge.center_mev = 52.0;
        fitter.fermi_edge.beamline_de_mev = 20.0;
        fitter.fermi_sigma = Some(0.032);

        let prepared = fitter.setup_model().unwrap();
        fitter.fit(&prepared).unwrap();

        assert_relative_eq!(fitter.fermi_edge.center_mev, 50.0, max_relative = 0.01);
        assert_relative_eq!(fitter.fermi_sigma.unwrap(), 0.03, max_relative = 0.01);
        let conv = fitter.fermi_edge.conv_de_mev.unwrap();
        assert_relative_eq!(conv, 2.3548 * 30.0, max_relative = 0.01);
        let instrument = fitter.fermi_edge.instrument_de_mev.unwrap();
        assert_relative_eq!(instrument, (conv * conv - 400.0).sqrt(), max_relative = 1e-6);
    }

    #[test]
    fn shirley_subtraction_replaces_data() {
        // peak over a step falling from 10 to 2
        let points: Vec<[f64; 2]> = (0..101)
            .map(|i| {
                let x = i as f64 * 0.5;
                let peak = 50.0 * (-(x - 25.0).powi(2) / 8.0).exp();
                [x, peak + 2.0 + 8.0 / (1.0 + (x - 25.0).exp())]
            })
            .collect();
        let mut fitter = Fitter::new("peak".to_owned(), Data::from_points(&points));
        let result = fitter
            .apply_shirley_baseline(&BaselineSettings::default())
            .unwrap();
        assert!(result.converged);
        assert!(result.iterations > 0);
        assert_eq!(fitter.background.as_ref().unwrap().len(), 101);

        let (first, last) = (fitter.data.y[0], fitter.data.y[100]);
        assert!(first.abs() < 1e-6, "{first}");
        assert!(last.abs() < 1e-6, "{last}");
        assert_eq!(fitter.data.x, points.iter().map(|p| p[0]).collect::<Vec<_>>());
    }
}
