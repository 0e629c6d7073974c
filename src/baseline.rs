use std::fmt::Display;

use crate::fitter::fit_settings::BaselineSettings;

#[derive(Debug, Clone, PartialEq)]
pub enum BaselineError {
    EmptySpectrum,
    LimitsNotFound(f64),
    /// The integrated signal above the background vanished, so the next
    /// pass cannot be normalised.
    DivergentBaseline { iteration: u32, index: usize },
}

impl Display for BaselineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaselineError::EmptySpectrum => write!(f, "Baseline requested on an empty spectrum"),
            BaselineError::LimitsNotFound(limit) => write!(
                f,
                "Baseline limit {} does not match any rounded energy value",
                limit
            ),
            BaselineError::DivergentBaseline { iteration, index } => write!(
                f,
                "Shirley baseline diverged on pass {} at sample {}",
                iteration, index
            ),
        }
    }
}

impl std::error::Error for BaselineError {}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ShirleyResult {
    /// (x, y - background) over the cropped range.
    pub corrected: Vec<[f64; 2]>,
    pub background: Vec<f64>,
    pub iterations: u32,
    pub converged: bool,
}

impl ShirleyResult {
    pub fn x(&self) -> Vec<f64> {
        self.corrected.iter().map(|p| p[0]).collect()
    }

    pub fn y(&self) -> Vec<f64> {
        self.corrected.iter().map(|p| p[1]).collect()
    }
}

fn limit_index(data: &[[f64; 2]], limit: f64) -> Result<usize, BaselineError> {
    data.iter()
        .position(|p| p[0].round_ties_even() == limit)
        .ok_or(BaselineError::LimitsNotFound(limit))
}

/// Crops `data` to the samples between the two limits. Each limit has to
/// equal a rounded energy value exactly; the axis may run either way.
pub fn crop(data: &[[f64; 2]], limits: (f64, f64)) -> Result<&[[f64; 2]], BaselineError> {
    let upper = limit_index(data, limits.0.max(limits.1))?;
    let lower = limit_index(data, limits.0.min(limits.1))?;
    Ok(&data[upper.min(lower)..=upper.max(lower)])
}

/// Iterative Shirley background.
///
/// Every pass redistributes the step between the two end intensities in
/// proportion to the signal integrated above the previous background, so the
/// corrected spectrum tends to zero at both ends. When the end intensity is
/// higher the signal is integrated from the start; otherwise from the end.
/// Iteration stops once the relative change of the background sum drops below
/// `tol`, or after `max_iter` passes.
pub fn shirley_baseline(
    data: &[[f64; 2]],
    limits: Option<(f64, f64)>,
    max_iter: u32,
    tol: f64,
) -> Result<ShirleyResult, BaselineError> {
    let data = match limits {
        Some(limits) => crop(data, limits)?,
        None => data,
    };
    if data.is_empty() {
        return Err(BaselineError::EmptySpectrum);
    }

    let n = data.len();
    let y: Vec<f64> = data.iter().map(|p| p[1]).collect();
    let low = y[0].min(y[n - 1]);
    let range_y = y[n - 1] - y[0];

    let mut background = vec![low; n];
    let mut iterations = 0;
    let mut converged = range_y == 0.0;

    if !converged {
        let scale = y.iter().map(|v| v.abs()).sum::<f64>().max(1.0);
        let rising = range_y > 0.0;
        let mut previous = background.iter().sum::<f64>();

        while iterations < max_iter {
            iterations += 1;
            let signal: Vec<f64> = y.iter().zip(&background).map(|(v, b)| v - b).collect();
            let total: f64 = signal.iter().sum();
            if !total.is_finite() || total.abs() < 1e-12 * scale {
                return Err(BaselineError::DivergentBaseline {
                    iteration: iterations,
                    index: if rising { 0 } else { n - 1 },
                });
            }

            let mut integral = 0.0;
            if rising {
                for i in 0..n {
                    integral += signal[i];
                    background[i] = low + range_y * integral / total;
                }
            } else {
                for i in (0..n).rev() {
                    integral += signal[i];
                    background[i] = low - range_y * integral / total;
                }
            }
            if let Some(index) = background.iter().position(|b| !b.is_finite()) {
                return Err(BaselineError::DivergentBaseline {
                    iteration: iterations,
                    index,
                });
            }

            let sum: f64 = background.iter().sum();
            let change = (sum - previous).abs() / previous.abs().max(1e-12);
            log::debug!("Shirley pass {}: relative change {:e}", iterations, change);
            previous = sum;
            if change < tol {
                converged = true;
                break;
            }
        }
    }

    if converged {
        log::info!("Shirley baseline converged after {} passes", iterations);
    } else {
        log::warn!(
            "Shirley baseline did not converge within {} passes",
            max_iter
        );
    }

    let corrected = data
        .iter()
        .zip(&background)
        .map(|(p, b)| [p[0], p[1] - b])
        .collect();

    Ok(ShirleyResult {
        corrected,
        background,
        iterations,
        converged,
    })
}

pub fn shirley_with(
    data: &[[f64; 2]],
    settings: &BaselineSettings,
) -> Result<ShirleyResult, BaselineError> {
    shirley_baseline(data, settings.limits, settings.max_iter, settings.tol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A Gaussian peak sitting on a step from 10 (start) down to 2 (end).
    fn peak_on_step() -> Vec<[f64; 2]> {
        (0..101)
            .map(|i| {
                let x = i as f64 * 0.5;
                let peak = 50.0 * (-(x - 25.0).powi(2) / 8.0).exp();
                let step = 2.0 + 8.0 / (1.0 + ((x - 25.0) / 1.0).exp());
                [x, peak + step]
            })
            .collect()
    }

    #[test]
    fn flat_spectrum_has_constant_background() {
        let data: Vec<[f64; 2]> = (0..20).map(|i| [i as f64, 7.5]).collect();
        let result = shirley_baseline(&data, None, 50, 1e-6).unwrap();
        assert!(result.converged);
        assert!(result.background.iter().all(|b| *b == 7.5));
        assert!(result.corrected.iter().all(|p| p[1] == 0.0));
    }

    #[test]
    fn converges_on_peak_over_falling_step() {
        let data = peak_on_step();
        let result = shirley_baseline(&data, None, 50, 1e-6).unwrap();
        assert!(result.converged);
        assert!(result.iterations < 50);
        assert_eq!(result.background.len(), data.len());

        let first = result.corrected[0][1];
        let last = result.corrected[data.len() - 1][1];
        assert!(first.abs() < 1e-6, "{first}");
        assert!(last.abs() < 1e-6, "{last}");
    }

    #[test]
    fn converges_on_peak_over_rising_step() {
        let mut data = peak_on_step();
        let y: Vec<f64> = data.iter().rev().map(|p| p[1]).collect();
        for (p, v) in data.iter_mut().zip(y) {
            p[1] = v;
        }
        let result = shirley_baseline(&data, None, 50, 1e-6).unwrap();
        assert!(result.converged);
        assert_relative_eq!(result.background[0], data[0][1], epsilon = 1e-6);
        assert_relative_eq!(
            result.background[100],
            data[100][1],
            epsilon = 1e-6
        );
        // background stays between the two end intensities
        let (lo, hi) = (data[0][1], data[100][1]);
        assert!(result.background.iter().all(|b| *b > lo - 1e-3 && *b < hi + 1e-3));
    }

    #[test]
    fn linear_ramp_terminates() {
        let data: Vec<[f64; 2]> = (0..100)
            .map(|i| [i as f64, 10.0 - 9.0 * i as f64 / 99.0])
            .collect();
        match shirley_baseline(&data, None, 50, 1e-6) {
            Ok(result) => {
                assert!(result.iterations <= 50);
                assert!(result.background.iter().all(|b| b.is_finite()));
            }
            Err(BaselineError::DivergentBaseline { iteration, .. }) => assert!(iteration <= 50),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn crops_descending_axis_between_limits() {
        let data: Vec<[f64; 2]> = (0..21).map(|i| [10.0 - 0.5 * i as f64, 1.0]).collect();
        let cropped = crop(&data, (2.0, 8.0)).unwrap();
        // 8.5 and 2.5 are the first samples rounding to the limits
        assert_eq!(cropped.len(), 13);
        assert_eq!(cropped[0][0], 8.5);
        assert_eq!(cropped[12][0], 2.5);

        let result = shirley_baseline(&data, Some((8.0, 2.0)), 50, 1e-6).unwrap();
        assert_eq!(result.background.len(), 13);
        assert_eq!(result.x()[0], 8.5);
    }

    #[test]
    fn unmatched_limit_is_an_error() {
        let data: Vec<[f64; 2]> = (0..10).map(|i| [i as f64, 1.0]).collect();
        assert_eq!(
            shirley_baseline(&data, Some((2.0, 3.3)), 50, 1e-6).unwrap_err(),
            BaselineError::LimitsNotFound(3.3)
        );
        assert_eq!(
            shirley_baseline(&data, Some((20.0, 3.0)), 50, 1e-6).unwrap_err(),
            BaselineError::LimitsNotFound(20.0)
        );
    }

    #[test]
    fn empty_spectrum_is_an_error() {
        assert_eq!(
            shirley_baseline(&[], None, 50, 1e-6).unwrap_err(),
            BaselineError::EmptySpectrum
        );
    }

    #[test]
    fn settings_are_forwarded() {
        let data = peak_on_step();
        let settings = BaselineSettings {
            max_iter: 2,
            ..Default::default()
        };
        let result = shirley_with(&data, &settings).unwrap();
        assert_eq!(result.iterations, 2);
        assert!(!result.converged);
    }

    #[test]
    fn zero_signal_area_is_divergent() {
        // rising ends with a dip that cancels the bump above the background
        let data = [[0.0, 1.0], [1.0, 0.0], [2.0, 2.0]];
        assert!(matches!(
            shirley_baseline(&data, None, 50, 1e-6),
            Err(BaselineError::DivergentBaseline {
                iteration: 1,
                index: 0
            })
        ));
    }
}
