use super::levmar::LevMarSettings;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum NanPolicy {
    /// Drop samples whose intensity is not finite.
    #[default]
    Omit,
    /// Refuse to fit data containing non-finite intensities.
    Raise,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct FitSettings {
    pub nan_policy: NanPolicy,
    /// Function evaluation budget; `2000 * (nvarys + 1)` when unset.
    pub max_nfev: Option<usize>,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    pub epsfcn: f64,
    /// Scale the covariance matrix by the reduced chi-square.
    pub scale_covar: bool,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            nan_policy: NanPolicy::Omit,
            max_nfev: None,
            ftol: 1.5e-8,
            xtol: 1.5e-8,
            gtol: 0.0,
            epsfcn: f64::EPSILON,
            scale_covar: true,
        }
    }
}

impl FitSettings {
    pub fn levmar(&self, nvarys: usize) -> LevMarSettings {
        LevMarSettings {
            ftol: self.ftol,
            xtol: self.xtol,
            gtol: self.gtol,
            epsfcn: self.epsfcn,
            max_nfev: self.max_nfev.unwrap_or(2000 * (nvarys + 1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct BaselineSettings {
    /// Crop range in the units of the energy axis; order does not matter.
    pub limits: Option<(f64, f64)>,
    pub max_iter: u32,
    pub tol: f64,
}

impl Default for BaselineSettings {
    fn default() -> Self {
        Self {
            limits: None,
            max_iter: 50,
            tol: 1e-6,
        }
    }
}
