use super::lineshapes::gaussian;
use super::{Model, ModelError};
use crate::fitter::parameters::{Bounds, Expr, Parameters};

/// Core-level line: an area-normalised Gaussian with `amplitude` (area),
/// `center` and `sigma`. The full model also carries the derived `fwhm` and
/// `height`; the bare variant (used as a broadening kernel) does not.
#[derive(Debug, Clone)]
pub struct GaussianModel {
    with_derived: bool,
}

impl Default for GaussianModel {
    fn default() -> Self {
        Self::new()
    }
}

impl GaussianModel {
    pub fn new() -> Self {
        Self { with_derived: true }
    }

    pub fn bare() -> Self {
        Self {
            with_derived: false,
        }
    }

    pub fn params_with(
        &self,
        amplitude: f64,
        center: f64,
        sigma: f64,
    ) -> Result<Parameters, ModelError> {
        let mut params = Parameters::new();
        params.add_free("amplitude", amplitude)?;
        params.add_free("center", center)?;
        params.add_bounded("sigma", sigma, Bounds::lower(0.0))?;
        if self.with_derived {
            params.add_expr("fwhm", Expr::Fwhm, &["sigma"])?;
            params.add_expr("height", Expr::Height, &["amplitude", "sigma"])?;
        }
        Ok(params)
    }
}

impl Model for GaussianModel {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn make_params(&self) -> Result<Parameters, ModelError> {
        self.params_with(1.0, 0.0, 1.0)
    }

    fn eval(&self, params: &Parameters, x: &[f64]) -> Result<Vec<f64>, ModelError> {
        Ok(gaussian(
            x,
            params.value("amplitude")?,
            params.value("center")?,
            params.value("sigma")?,
        ))
    }

    /// Peak-based estimate: the samples above half maximum give the centre and
    /// width when there are more than two of them, otherwise the maximum and a
    /// sixth of the x-range are used.
    fn guess(&self, x: &[f64], y: &[f64]) -> Result<Parameters, ModelError> {
        if x.len() != y.len() {
            return Err(ModelError::LengthMismatch {
                x: x.len(),
                y: y.len(),
            });
        }

        let mut points: Vec<(f64, f64)> = x
            .iter()
            .copied()
            .zip(y.iter().copied())
            .filter(|(_, yi)| yi.is_finite())
            .collect();
        if points.is_empty() {
            return Err(ModelError::EmptyData);
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let (mut max_y, mut min_y) = (f64::NEG_INFINITY, f64::INFINITY);
        let mut center = points[0].0;
        for &(xi, yi) in &points {
            if yi > max_y {
                max_y = yi;
                center = xi;
            }
            min_y = min_y.min(yi);
        }
        let min_x = points[0].0;
        let max_x = points[points.len() - 1].0;

        let height = (max_y - min_y) * 3.0;
        let mut sigma = (max_x - min_x) / 6.0;

        let half_max = (max_y + min_y) / 2.0;
        let above: Vec<f64> = points
            .iter()
            .filter(|(_, yi)| *yi > half_max)
            .map(|(xi, _)| *xi)
            .collect();
        if above.len() > 2 {
            sigma = (above[above.len() - 1] - above[0]) / 2.0;
            center = above.iter().sum::<f64>() / above.len() as f64;
        }
        let amplitude = height * sigma;

        log::info!(
            "Gaussian guess: center = {:.4}, amplitude = {:.4}, sigma = {:.4}",
            center,
            amplitude,
            sigma
        );

        self.params_with(amplitude, center, sigma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn guess_on_narrow_peak_uses_maximum() {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let y = [1.0, 5.0, 10.0, 5.0, 1.0];
        let params = GaussianModel::new().guess(&x, &y).unwrap();
        assert_relative_eq!(params.value("center").unwrap(), 2.0);
        assert_relative_eq!(params.value("sigma").unwrap(), 4.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(params.value("amplitude").unwrap(), 18.0, epsilon = 1e-12);
    }

    #[test]
    fn guess_on_wide_peak_uses_half_maximum_samples() {
        let x: Vec<f64> = (0..101).map(|i| i as f64 * 0.1).collect();
        let model = GaussianModel::new();
        let truth = model.params_with(4.0, 5.0, 0.8).unwrap();
        let y = model.eval(&truth, &x).unwrap();

        let params = model.guess(&x, &y).unwrap();
        assert_relative_eq!(params.value("center").unwrap(), 5.0, epsilon = 1e-9);
        // half-maximum samples span roughly one FWHM
        let sigma = params.value("sigma").unwrap();
        assert!((sigma - 0.9).abs() < 0.11, "sigma = {sigma}");
    }

    #[test]
    fn guess_handles_descending_axis() {
        let x = [4.0, 3.0, 2.0, 1.0, 0.0];
        let y = [1.0, 2.0, 3.0, 9.0, 2.0];
        let params = GaussianModel::new().guess(&x, &y).unwrap();
        assert_relative_eq!(params.value("center").unwrap(), 1.0);
    }

    #[test]
    fn derived_fwhm_and_height_follow_sigma() {
        let params = GaussianModel::new().params_with(2.0, 0.0, 0.5).unwrap();
        assert_relative_eq!(params.value("fwhm").unwrap(), 2.3548 * 0.5);
        assert_relative_eq!(params.value("height").unwrap(), 0.3989 * 2.0 / 0.5);
        assert!(GaussianModel::bare().make_params().unwrap().get("fwhm").is_none());
    }

    #[test]
    fn guess_rejects_mismatched_lengths() {
        let err = GaussianModel::new().guess(&[1.0, 2.0], &[1.0]).unwrap_err();
        assert_eq!(err, ModelError::LengthMismatch { x: 2, y: 1 });
    }
}
