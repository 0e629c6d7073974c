use std::fmt::Display;

use nalgebra::{DMatrix, DVector};

use super::fit_settings::{FitSettings, NanPolicy};
use super::levmar::{self, Minimum};
use super::models::{Component, Model, ModelError};
use super::parameters::{ParameterError, Parameters};

#[derive(Debug, Clone)]
pub enum FitError {
    Model(ModelError),
    InvalidParameterBounds { name: String, min: f64, max: f64 },
    NonFiniteData,
    InsufficientData,
    /// The evaluation budget ran out. The last iterate is kept so callers can
    /// still show the best fit found so far.
    NoConvergence { nfev: usize, best: Box<FitResult> },
}

impl From<ModelError> for FitError {
    fn from(value: ModelError) -> Self {
        match value {
            ModelError::Parameter(ParameterError::InvalidParameterBounds { name, min, max }) => {
                FitError::InvalidParameterBounds { name, min, max }
            }
            other => FitError::Model(other),
        }
    }
}

impl From<ParameterError> for FitError {
    fn from(value: ParameterError) -> Self {
        FitError::from(ModelError::Parameter(value))
    }
}

impl Display for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitError::Model(x) => write!(f, "Fit failed to evaluate the model: {}", x),
            FitError::InvalidParameterBounds { name, min, max } => write!(
                f,
                "Fit parameter '{}' has invalid bounds [{}, {}]",
                name, min, max
            ),
            FitError::NonFiniteData => write!(f, "Fit data contains NaN or infinite values"),
            FitError::InsufficientData => write!(f, "Fit has no usable data points"),
            FitError::NoConvergence { nfev, .. } => write!(
                f,
                "Fit did not converge after {} function evaluations",
                nfev
            ),
        }
    }
}

impl std::error::Error for FitError {}

/// A model together with the parameter set it will be fitted with. Building
/// one is the only way to reach [`fit`].
#[derive(Debug, Clone)]
pub struct PreparedModel<M: Model> {
    pub model: M,
    pub params: Parameters,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Preview {
    pub best_fit: Vec<f64>,
    /// model − data
    pub residual: Vec<f64>,
    pub components: Option<Vec<Component>>,
}

impl<M: Model> PreparedModel<M> {
    pub fn new(model: M, params: Parameters) -> Self {
        Self { model, params }
    }

    /// Evaluates the model with the starting parameters, without fitting.
    pub fn preview(&self, x: &[f64], y: &[f64]) -> Result<Preview, ModelError> {
        if x.len() != y.len() {
            return Err(ModelError::LengthMismatch {
                x: x.len(),
                y: y.len(),
            });
        }
        let best_fit = self.model.eval(&self.params, x)?;
        let residual = best_fit.iter().zip(y).map(|(m, d)| m - d).collect();
        let components = self.model.eval_components(&self.params, x)?;
        Ok(Preview {
            best_fit,
            residual,
            components: (components.len() > 1).then_some(components),
        })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FitResult {
    pub model_name: String,
    pub params: Parameters,
    pub init_params: Parameters,
    pub var_names: Vec<String>,
    /// Model evaluated over the full input x with the best-fit parameters.
    pub best_fit: Vec<f64>,
    pub init_fit: Vec<f64>,
    /// model − data over the full input x; NaN where the data was omitted.
    pub residual: Vec<f64>,
    pub components: Option<Vec<Component>>,
    pub covar: Option<Vec<Vec<f64>>>,
    pub ndata: usize,
    pub nvarys: usize,
    pub nfree: usize,
    pub nfev: usize,
    pub chisqr: f64,
    /// NaN when there are no degrees of freedom left.
    pub redchi: f64,
    pub aic: f64,
    pub bic: f64,
    pub success: bool,
    pub message: String,
}

impl FitResult {
    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).map(|p| p.value)
    }

    pub fn stderr(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(|p| p.stderr)
    }

    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        let covar = self.covar.as_ref()?;
        let i = self.var_names.iter().position(|n| n == a)?;
        let j = self.var_names.iter().position(|n| n == b)?;
        Some(covar[i][j] / (covar[i][i] * covar[j][j]).sqrt())
    }

    /// Text report of the fit statistics, variables and correlations.
    pub fn fit_report(&self) -> String {
        let mut lines = vec![
            "[[Model]]".to_owned(),
            format!("    Model({})", self.model_name),
            "[[Fit Statistics]]".to_owned(),
            "    # fitting method   = leastsq".to_owned(),
        ];
        lines.push(format!("    # function evals   = {}", self.nfev));
        lines.push(format!("    # data points      = {}", self.ndata));
        lines.push(format!("    # variables        = {}", self.nvarys));
        lines.push(format!("    chi-square         = {}", fmt_value(self.chisqr)));
        lines.push(format!("    reduced chi-square = {}", fmt_value(self.redchi)));
        lines.push(format!("    Akaike info crit   = {}", fmt_value(self.aic)));
        lines.push(format!("    Bayesian info crit = {}", fmt_value(self.bic)));
        if !self.success {
            lines.push(format!("##  Warning: {}", self.message));
        }

        let width = self.params.iter().map(|p| p.name.len()).max().unwrap_or(0) + 1;
        lines.push("[[Variables]]".to_owned());
        for p in self.params.iter() {
            let mut line = format!("    {:<width$} {}", format!("{}:", p.name), fmt_value(p.value));
            if let Some(stderr) = p.stderr {
                line.push_str(&format!(" +/- {}", fmt_value(stderr)));
                if p.value != 0.0 && stderr.is_finite() {
                    line.push_str(&format!(" ({:.2}%)", (stderr / p.value).abs() * 100.0));
                }
            }
            if let Some(expr) = p.expression() {
                line.push_str(&format!(" == '{}'", expr));
            } else if p.is_free() {
                let init = self.init_params.get(&p.name).map_or(p.init_value, |i| i.value);
                line.push_str(&format!(" (init = {})", fmt_value(init)));
            } else {
                line.push_str(" (fixed)");
            }
            lines.push(line.trim_end().to_owned());
        }

        let mut correlations = Vec::new();
        for (i, a) in self.var_names.iter().enumerate() {
            for b in self.var_names.iter().skip(i + 1) {
                if let Some(c) = self.correlation(a, b)
                    && c.abs() > 0.1
                {
                    correlations.push((format!("C({}, {})", a, b), c));
                }
            }
        }
        if !correlations.is_empty() {
            correlations.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
            lines.push("[[Correlations]] (unreported correlations are < 0.100)".to_owned());
            let width = correlations.iter().map(|c| c.0.len()).max().unwrap_or(0);
            for (name, c) in correlations {
                lines.push(format!("    {:<width$} = {:+.4}", name, c));
            }
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

fn fmt_value(v: f64) -> String {
    if !v.is_finite() {
        return format!("{}", v);
    }
    let a = v.abs();
    if a != 0.0 && !(1e-4..1e7).contains(&a) {
        format!("{:.7e}", v)
    } else {
        let s = format!("{:.8}", v);
        let s = s.trim_end_matches('0').trim_end_matches('.');
        s.to_string()
    }
}

/// Splits x/y according to the nan policy, keeping sample order.
fn usable_points(
    x: &[f64],
    y: &[f64],
    policy: NanPolicy,
) -> Result<(Vec<f64>, Vec<f64>), FitError> {
    let finite = y.iter().filter(|v| v.is_finite()).count();
    if finite < y.len() {
        match policy {
            NanPolicy::Raise => return Err(FitError::NonFiniteData),
            NanPolicy::Omit => log::warn!(
                "Omitting {} non-finite data points from the fit",
                y.len() - finite
            ),
        }
    }
    Ok(x.iter()
        .zip(y)
        .filter(|(_, yi)| yi.is_finite())
        .map(|(xi, yi)| (*xi, *yi))
        .unzip())
}

/// Propagates the free-parameter covariance to every derived parameter
/// through a central-difference gradient.
fn derived_stderr(params: &mut Parameters, covar: &DMatrix<f64>) -> Result<(), ParameterError> {
    let free = params.free_values();
    let derived = params.derived_names();
    let mut work = params.clone();

    let mut gradients = vec![DVector::<f64>::zeros(free.len()); derived.len()];
    for (i, &value) in free.iter().enumerate() {
        let h = (value.abs() * 1e-6).max(1e-10);
        let mut shifted = free.clone();

        shifted[i] = value + h;
        work.apply_external(&shifted)?;
        let upper = derived
            .iter()
            .map(|d| work.value(d))
            .collect::<Result<Vec<f64>, _>>()?;

        shifted[i] = value - h;
        work.apply_external(&shifted)?;
        let lower = derived
            .iter()
            .map(|d| work.value(d))
            .collect::<Result<Vec<f64>, _>>()?;

        for (k, gradient) in gradients.iter_mut().enumerate() {
            gradient[i] = (upper[k] - lower[k]) / (2.0 * h);
        }
    }

    for (name, gradient) in derived.iter().zip(gradients) {
        let variance = gradient.dot(&(covar * &gradient));
        let stderr = (variance.is_finite() && variance >= 0.0).then(|| variance.sqrt());
        params.set_stderr(name, stderr);
    }
    Ok(())
}

/// External covariance of the free parameters, or `None` when the normal
/// matrix cannot be inverted.
fn covariance(
    minimum: &Minimum,
    params: &Parameters,
    redchi: f64,
    scale: bool,
) -> Option<DMatrix<f64>> {
    let jtj = minimum.jacobian.tr_mul(&minimum.jacobian);
    let Some(inverse) = jtj.try_inverse() else {
        log::warn!("Could not estimate error-bars: singular covariance matrix");
        return None;
    };

    let gradients = params.internal_gradients(minimum.x.as_slice());
    let mut covar = DMatrix::from_fn(inverse.nrows(), inverse.ncols(), |i, j| {
        inverse[(i, j)] * gradients[i] * gradients[j]
    });
    if scale && redchi.is_finite() {
        covar *= redchi;
    }
    if covar.diagonal().iter().any(|v| !v.is_finite() || *v < 0.0) {
        log::warn!("Could not estimate error-bars: covariance has invalid diagonal");
        return None;
    }
    Some(covar)
}

/// Fits `prepared` to (x, y) by least squares over its free parameters.
pub fn fit<M: Model>(
    prepared: &PreparedModel<M>,
    x: &[f64],
    y: &[f64],
    settings: &FitSettings,
) -> Result<FitResult, FitError> {
    if x.len() != y.len() {
        return Err(ModelError::LengthMismatch {
            x: x.len(),
            y: y.len(),
        }
        .into());
    }
    prepared.params.check_bounds()?;

    let (xs, ys) = usable_points(x, y, settings.nan_policy)?;
    if xs.is_empty() {
        return Err(FitError::InsufficientData);
    }

    let model = &prepared.model;
    let init_params = prepared.params.clone();
    let var_names = init_params.free_names();
    let nvarys = var_names.len();
    let ndata = xs.len();

    log::info!(
        "Fitting {} points with model '{}' ({} free parameters)",
        ndata,
        model.name(),
        nvarys
    );

    let mut params = init_params.clone();
    let observed = DVector::from_column_slice(&ys);
    let (minimum, termination) = if nvarys == 0 {
        let curve = DVector::from_vec(model.eval(&params, &xs)?);
        let residual = curve - &observed;
        let cost = residual.norm_squared();
        let minimum = Minimum {
            x: DVector::zeros(0),
            jacobian: DMatrix::zeros(ndata, 0),
            residual,
            cost,
            nfev: 1,
            niter: 0,
            termination: levmar::Termination::PerfectFit,
        };
        (minimum, None)
    } else {
        let mut work = params.clone();
        let minimum = levmar::minimize(
            |q: &DVector<f64>| -> Result<DVector<f64>, ModelError> {
                work.apply_internal(q.as_slice())?;
                let curve = DVector::from_vec(model.eval(&work, &xs)?);
                Ok(curve - &observed)
            },
            DVector::from_vec(params.internal_values()),
            &settings.levmar(nvarys),
        )?;
        params.apply_internal(minimum.x.as_slice())?;
        let termination = minimum.termination;
        (minimum, Some(termination))
    };

    let nfree = ndata.saturating_sub(nvarys);
    let chisqr = minimum.cost;
    let redchi = if nfree > 0 {
        chisqr / nfree as f64
    } else {
        f64::NAN
    };
    let neg2_log_likelihood = ndata as f64 * (chisqr.max(1e-250 * ndata as f64) / ndata as f64).ln();
    let aic = neg2_log_likelihood + 2.0 * nvarys as f64;
    let bic = neg2_log_likelihood + (ndata as f64).ln() * nvarys as f64;

    let mut covar = None;
    if nvarys > 0
        && let Some(matrix) = covariance(&minimum, &params, redchi, settings.scale_covar)
    {
        for (i, name) in var_names.iter().enumerate() {
            params.set_stderr(name, Some(matrix[(i, i)].sqrt()));
        }
        derived_stderr(&mut params, &matrix)?;
        covar = Some(
            matrix
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
        );
    }

    let best_fit = model.eval(&params, x)?;
    let init_fit = model.eval(&init_params, x)?;
    let residual = best_fit.iter().zip(y).map(|(m, d)| m - d).collect();
    let components = model.eval_components(&params, x)?;

    let (success, message) = match termination {
        Some(t) => (t.converged(), t.message().to_string()),
        None => (true, "No free parameters; model evaluated once.".to_string()),
    };

    let result = FitResult {
        model_name: model.name().to_string(),
        params,
        init_params,
        var_names,
        best_fit,
        init_fit,
        residual,
        components: (components.len() > 1).then_some(components),
        covar,
        ndata,
        nvarys,
        nfree,
        nfev: minimum.nfev,
        chisqr,
        redchi,
        aic,
        bic,
        success,
        message,
    };

    if !result.success {
        log::warn!("Fit did not converge: {}", result.message);
        return Err(FitError::NoConvergence {
            nfev: result.nfev,
            best: Box::new(result),
        });
    }

    log::info!(
        "Fit converged after {} evaluations: chi-square = {:e}, reduced chi-square = {:e}",
        result.nfev,
        result.chisqr,
        result.redchi
    );
    Ok(result)
}
