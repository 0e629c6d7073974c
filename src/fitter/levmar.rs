use nalgebra::{DMatrix, DVector};

const LAMBDA_START: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-15;
const LAMBDA_MAX: f64 = 1e16;
const DIAG_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LevMarSettings {
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    pub epsfcn: f64,
    pub max_nfev: usize,
}

impl Default for LevMarSettings {
    fn default() -> Self {
        Self {
            ftol: 1.5e-8,
            xtol: 1.5e-8,
            gtol: 0.0,
            epsfcn: f64::EPSILON,
            max_nfev: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum Termination {
    PerfectFit,
    Ftol,
    Xtol,
    Gtol,
    Stationary,
    MaxNfev,
    NonFiniteStart,
}

impl Termination {
    pub fn converged(&self) -> bool {
        !matches!(self, Termination::MaxNfev | Termination::NonFiniteStart)
    }

    pub fn message(&self) -> &'static str {
        match self {
            Termination::PerfectFit => "Residuals are exactly zero.",
            Termination::Ftol => {
                "Both actual and predicted relative reductions in the sum of squares are at most ftol."
            }
            Termination::Xtol => "The relative error between two consecutive iterates is at most xtol.",
            Termination::Gtol => "The gradient is orthogonal to the residuals to within gtol.",
            Termination::Stationary => "No further reduction in the sum of squares is possible.",
            Termination::MaxNfev => "Number of function evaluations exceeded max_nfev.",
            Termination::NonFiniteStart => "The residuals at the starting point are not finite.",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Minimum {
    pub x: DVector<f64>,
    pub residual: DVector<f64>,
    pub cost: f64,
    pub jacobian: DMatrix<f64>,
    pub nfev: usize,
    pub niter: usize,
    pub termination: Termination,
}

fn sum_of_squares(r: &DVector<f64>) -> f64 {
    if r.iter().all(|v| v.is_finite()) {
        r.norm_squared()
    } else {
        f64::INFINITY
    }
}

/// Forward-difference Jacobian of the residual vector.
fn jacobian<F, E>(
    residuals: &mut F,
    x: &DVector<f64>,
    r: &DVector<f64>,
    epsfcn: f64,
    nfev: &mut usize,
) -> Result<DMatrix<f64>, E>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>, E>,
{
    let eps = epsfcn.max(f64::EPSILON).sqrt();
    let mut jac = DMatrix::zeros(r.len(), x.len());
    let mut shifted = x.clone();

    for j in 0..x.len() {
        let mut h = eps * x[j].abs();
        if h == 0.0 {
            h = eps;
        }
        shifted[j] = x[j] + h;
        let rj = residuals(&shifted)?;
        *nfev += 1;
        shifted[j] = x[j];

        if rj.iter().all(|v| v.is_finite()) {
            jac.set_column(j, &((rj - r) / h));
        } else {
            log::debug!("Non-finite residuals while differentiating column {}", j);
        }
    }
    Ok(jac)
}

/// Minimises the sum of squared residuals with a damped Gauss-Newton
/// (Levenberg-Marquardt) iteration. Errors returned by `residuals` abort the
/// search; non-finite residuals only reject the trial step.
pub fn minimize<F, E>(
    mut residuals: F,
    start: DVector<f64>,
    settings: &LevMarSettings,
) -> Result<Minimum, E>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>, E>,
{
    let n = start.len();
    let mut x = start;
    let mut r = residuals(&x)?;
    let mut nfev = 1;
    let mut niter = 0;
    let mut cost = sum_of_squares(&r);

    if !cost.is_finite() {
        return Ok(Minimum {
            jacobian: DMatrix::zeros(r.len(), n),
            x,
            residual: r,
            cost,
            nfev,
            niter,
            termination: Termination::NonFiniteStart,
        });
    }

    let mut lambda = LAMBDA_START;

    let termination = 'outer: loop {
        if cost == 0.0 {
            break Termination::PerfectFit;
        }
        if nfev >= settings.max_nfev {
            break Termination::MaxNfev;
        }
        niter += 1;

        let jac = jacobian(&mut residuals, &x, &r, settings.epsfcn, &mut nfev)?;
        let jtj = jac.tr_mul(&jac);
        let gradient = jac.tr_mul(&r);
        if gradient.amax() <= settings.gtol {
            break Termination::Gtol;
        }

        loop {
            let mut damped = jtj.clone();
            for i in 0..n {
                damped[(i, i)] += lambda * jtj[(i, i)].max(DIAG_FLOOR);
            }

            let Some(cholesky) = damped.cholesky() else {
                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    break 'outer Termination::Stationary;
                }
                continue;
            };
            let step = cholesky.solve(&(-&gradient));

            let trial = &x + &step;
            let trial_r = residuals(&trial)?;
            nfev += 1;
            let trial_cost = sum_of_squares(&trial_r);

            if trial_cost < cost {
                let reduction = (cost - trial_cost) / cost;
                let step_norm = step.norm();
                let x_norm = trial.norm();

                x = trial;
                r = trial_r;
                cost = trial_cost;
                lambda = (lambda / 10.0).max(LAMBDA_MIN);
                log::debug!(
                    "iteration {}: cost = {:e}, lambda = {:e}, nfev = {}",
                    niter,
                    cost,
                    lambda,
                    nfev
                );

                if cost == 0.0 {
                    break 'outer Termination::PerfectFit;
                }
                if reduction <= settings.ftol {
                    break 'outer Termination::Ftol;
                }
                if step_norm <= settings.xtol * (settings.xtol + x_norm) {
                    break 'outer Termination::Xtol;
                }
                break;
            }

            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                break 'outer Termination::Stationary;
            }
            if nfev >= settings.max_nfev {
                break 'outer Termination::MaxNfev;
            }
        }
    };

    let jacobian = jacobian(&mut residuals, &x, &r, settings.epsfcn, &mut nfev)?;

    Ok(Minimum {
        x,
        residual: r,
        cost,
        jacobian,
        nfev,
        niter,
        termination,
    })
}
