use crate::fitter::parameters::WIDTH_FLOOR;

pub const FWHM_PER_SIGMA: f64 = 2.3548;
pub const HEIGHT_PER_AREA: f64 = 0.3989;
/// Boltzmann constant in eV/K.
pub const BOLTZMANN_EV: f64 = 8.617e-5;

const TINY: f64 = 1.0e-15;

pub fn sigma2fwhm(sigma: f64) -> f64 {
    FWHM_PER_SIGMA * sigma
}

pub fn fwhm2sigma(fwhm: f64) -> f64 {
    fwhm / FWHM_PER_SIGMA
}

pub fn calculate_height(area: f64, sigma: f64) -> f64 {
    HEIGHT_PER_AREA * area / sigma.max(WIDTH_FLOOR)
}

/// Instrument contribution to a convolved width. NaN when the beamline width
/// exceeds the convolved width, which callers read as "not computable".
pub fn instr_delta_e(beamline_de: f64, conv_de: f64) -> f64 {
    (conv_de.powi(2) - beamline_de.powi(2)).sqrt()
}

/// Area-normalised Gaussian.
pub fn gaussian(x: &[f64], amplitude: f64, center: f64, sigma: f64) -> Vec<f64> {
    let norm = amplitude / (std::f64::consts::TAU.sqrt() * sigma).max(TINY);
    let two_var = (2.0 * sigma * sigma).max(TINY);
    x.iter()
        .map(|&xi| norm * (-(xi - center).powi(2) / two_var).exp())
        .collect()
}

/// Fermi-Dirac occupation with the edge at `ef` and temperature `tempr` in K.
pub fn fermi_dirac(x: &[f64], ef: f64, tempr: f64) -> Vec<f64> {
    let kt = (BOLTZMANN_EV * tempr).max(WIDTH_FLOOR);
    x.iter()
        .map(|&xi| 1.0 / ((-(xi - ef) / kt).exp() + 1.0))
        .collect()
}

/// Discrete convolution of `data` with `kernel`. `data` is edge-padded on both
/// sides and the full convolution is trimmed symmetrically to
/// `min(len(data), len(kernel))` samples. While the kernel fits inside the
/// padded data this is the centre of the "valid" part.
pub fn convolve(data: &[f64], kernel: &[f64]) -> Vec<f64> {
    let npts = data.len().min(kernel.len());
    if npts == 0 {
        return Vec::new();
    }

    let first = data[0];
    let last = data[data.len() - 1];
    let padded: Vec<f64> = std::iter::repeat_n(first, npts)
        .chain(data.iter().copied())
        .chain(std::iter::repeat_n(last, npts))
        .collect();

    let full_len = padded.len() + kernel.len() - 1;
    let start = (full_len - npts) / 2;

    (start..start + npts)
        .map(|k| {
            kernel
                .iter()
                .enumerate()
                .filter_map(|(j, &kj)| {
                    let i = k.checked_sub(j)?;
                    padded.get(i).map(|v| v * kj)
                })
                .sum()
        })
        .collect()
}

/// Min-max normalisation to [0, 1]. A flat input maps to zeros.
pub fn normalize(y: &[f64]) -> Vec<f64> {
    let min = y.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = y.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if range == 0.0 {
        return vec![0.0; y.len()];
    }
    y.iter().map(|&v| (v - min) / range).collect()
}
