//! Gaussian broadening with a wavelength-dependent kernel width.

/// Smallest sigma (in pixels) used for the kernel; narrower requests are
/// treated as this to keep the kernel well defined.
const MIN_SIGMA: f64 = 0.01;

/// Convolve `spec` with a Gaussian whose sigma (in pixels) varies per pixel.
///
/// The kernel half-width is `ceil(3 * max(sigma))` pixels. Pixels closer
/// than that to either end cannot see a full kernel and are set to zero.
/// `sigma` holds one value per pixel of `spec`.
pub fn gaussian_filter1d(spec: &[f64], sigma: &[f64]) -> Vec<f64> {
    debug_assert_eq!(
        spec.len(),
        sigma.len(),
        "spectrum and sigma must have equal length"
    );
    let n = spec.len();
    let sigma: Vec<f64> = sigma.iter().map(|s| s.max(MIN_SIGMA)).collect();
    let max_sigma = sigma.iter().copied().fold(MIN_SIGMA, f64::max);
    let p = (3.0 * max_sigma).ceil() as usize;

    let mut out = vec![0.0; n];
    if n < 2 * p + 1 {
        return out;
    }

    for i in p..n - p {
        let two_var = 2.0 * sigma[i] * sigma[i];
        let mut weight_sum = 0.0;
        let mut acc = 0.0;
        for j in 0..=2 * p {
            let x = j as f64 - p as f64;
            let w = (-x * x / two_var).exp();
            weight_sum += w;
            acc += w * spec[i + j - p];
        }
        out[i] = acc / weight_sum;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_constant_spectrum_is_unchanged_in_interior() {
        let spec = vec![3.0; 50];
        let sigma = vec![1.5; 50];
        let out = gaussian_filter1d(&spec, &sigma);
        let p = 5;
        for v in &out[p..50 - p] {
            assert_relative_eq!(*v, 3.0, max_relative = 1e-12);
        }
        assert!(out[..p].iter().all(|&v| v == 0.0));
        assert!(out[50 - p..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_spike_is_spread_and_conserved() {
        let mut spec = vec![0.0; 41];
        spec[20] = 1.0;
        let out = gaussian_filter1d(&spec, &vec![2.0; 41]);
        let total: f64 = out.iter().sum();
        assert_relative_eq!(total, 1.0, max_relative = 1e-9);
        assert!(out[20] < 0.25);
        assert_relative_eq!(out[18], out[22], max_relative = 1e-12);
    }

    #[test]
    fn test_zero_sigma_is_identity() {
        let spec: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let out = gaussian_filter1d(&spec, &vec![0.0; 10]);
        // p = ceil(0.03) = 1, so only the end pixels are dropped.
        for i in 1..9 {
            assert_relative_eq!(out[i], spec[i], max_relative = 1e-12);
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "equal length")]
    fn test_sigma_length_is_checked_in_debug_builds() {
        gaussian_filter1d(&[1.0; 10], &[1.0; 9]);
    }
}
