use super::gaussian::GaussianModel;
use super::lineshapes::fermi_dirac;
use super::{Component, ConvolvedModel, Model, ModelError};
use crate::fitter::parameters::{Expr, Parameters};

/// Fermi-Dirac occupation with parameters `Ef` and `tempr` (K).
#[derive(Debug, Clone, Default)]
pub struct FermiDiracModel;

impl Model for FermiDiracModel {
    fn name(&self) -> &'static str {
        "fermi_dirac"
    }

    fn make_params(&self) -> Result<Parameters, ModelError> {
        let mut params = Parameters::new();
        params.add_free("Ef", 0.0)?;
        params.add_free("tempr", 300.0)?;
        Ok(params)
    }

    fn eval(&self, params: &Parameters, x: &[f64]) -> Result<Vec<f64>, ModelError> {
        Ok(fermi_dirac(x, params.value("Ef")?, params.value("tempr")?))
    }
}

/// Starting values of a Fermi edge fit, all in eV (and K for the temperature).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FermiEdgeStart {
    pub amplitude: f64,
    pub center: f64,
    pub sigma: f64,
    pub tempr: f64,
    pub beamline_de: f64,
}

/// Fermi edge: a Fermi-Dirac step convolved with a Gaussian broadening kernel.
///
/// Parameter layout (free unless noted):
/// - `Ef` = `center`, `tempr` fixed
/// - `amplitude`, `center`, `sigma` (kernel, `sigma >= 0`)
/// - `Height` = 0.3989·amplitude/max(sigma, 1e-12), `FWHM` = 2.3548·sigma
/// - `Beamline_dE` fixed, `Conv_dE` = `FWHM`
/// - `Instrument_dE` = sqrt(Conv_dE² − Beamline_dE²), NaN when not computable
#[derive(Debug, Clone)]
pub struct FermiEdgeModel {
    inner: ConvolvedModel<FermiDiracModel, GaussianModel>,
}

impl Default for FermiEdgeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl FermiEdgeModel {
    pub fn new() -> Self {
        Self {
            inner: ConvolvedModel::new(FermiDiracModel, GaussianModel::bare()),
        }
    }

    pub fn params_with(&self, start: &FermiEdgeStart) -> Result<Parameters, ModelError> {
        let mut params = self.inner.make_params()?;
        params.set_value("amplitude", start.amplitude)?;
        params.set_value("center", start.center)?;
        params.set_value("sigma", start.sigma)?;
        params.set_value("tempr", start.tempr)?;
        params.set_vary("tempr", false)?;

        params.set_expr("Ef", Expr::Alias, &["center"])?;
        params.add_expr("Height", Expr::Height, &["amplitude", "sigma"])?;
        params.add_expr("FWHM", Expr::Fwhm, &["sigma"])?;
        params.add_fixed("Beamline_dE", start.beamline_de)?;
        params.add_expr("Conv_dE", Expr::Alias, &["FWHM"])?;
        params.add_expr(
            "Instrument_dE",
            Expr::Quadrature,
            &["Conv_dE", "Beamline_dE"],
        )?;

        if params.value("Instrument_dE")?.is_nan() {
            log::warn!("Instrument ΔE is not computable: beamline ΔE exceeds convolved ΔE");
        }
        Ok(params)
    }
}

impl Model for FermiEdgeModel {
    fn name(&self) -> &'static str {
        "fermi_edge"
    }

    fn make_params(&self) -> Result<Parameters, ModelError> {
        self.params_with(&FermiEdgeStart {
            amplitude: 10.0,
            center: 0.0,
            sigma: 0.2,
            tempr: 300.0,
            beamline_de: 0.0,
        })
    }

    fn eval(&self, params: &Parameters, x: &[f64]) -> Result<Vec<f64>, ModelError> {
        self.inner.eval(params, x)
    }

    fn eval_components(
        &self,
        params: &Parameters,
        x: &[f64],
    ) -> Result<Vec<Component>, ModelError> {
        self.inner.eval_components(params, x)
    }
}
