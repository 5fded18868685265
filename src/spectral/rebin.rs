//! Logarithmic rebinning of linearly sampled spectra.
//!
//! On a log-wavelength axis a Doppler shift is a constant pixel shift, which
//! is what cross-correlation based fitters need. The resampling follows the
//! `log_rebin` scheme of Cappellari & Emsellem (2004): every output pixel
//! accumulates the input pixels it overlaps, weighted by the overlap.

use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;

use crate::data::model::RebinnedSpectra;
use crate::error::RebinError;

/// Speed of light in km/s.
pub const C_KMS: f64 = 299_792.458;

/// A precomputed linear → logarithmic resampling grid.
///
/// Built once for a wavelength range, input length and velocity scale, then
/// applied to any number of spectra. All outputs share [`log_lam`](Self::log_lam).
#[derive(Debug, Clone)]
pub struct LogRebinner {
    npix_in: usize,
    /// Input pixel borders in units of the input step.
    borders: Vec<f64>,
    /// Output pixel borders in units of the input step.
    new_borders: Vec<f64>,
    /// Input pixel containing each output border.
    k: Vec<usize>,
    log_lam: Vec<f64>,
    velscale: f64,
}

impl LogRebinner {
    /// Build the grid for spectra of `npix` pixels spanning `lam_range`
    /// (centres of the first and last pixel).
    pub fn new(lam_range: [f64; 2], npix: usize, velscale: f64) -> Result<Self, RebinError> {
        if npix < 2 {
            return Err(RebinError::TooShort(npix));
        }
        let [lam0, lam1] = lam_range;
        if !(lam0.is_finite() && lam1.is_finite() && lam0 > 0.0 && lam0 < lam1) {
            return Err(RebinError::InvalidRange(lam0, lam1));
        }
        if !(velscale.is_finite() && velscale > 0.0) {
            return Err(RebinError::NoOutputPixels(velscale));
        }

        let dlam = (lam1 - lam0) / (npix - 1) as f64;
        let lim = [lam0 / dlam - 0.5, lam1 / dlam + 0.5];
        if lim[0] <= 0.0 {
            return Err(RebinError::InvalidRange(lam0, lam1));
        }
        let borders = linspace(lim[0], lim[1], npix + 1);

        let log_scale = velscale / C_KMS;
        let log_lim0 = lim[0].ln();
        let m = ((lim[1].ln() - log_lim0) / log_scale).floor() as usize;
        if m == 0 {
            return Err(RebinError::NoOutputPixels(velscale));
        }
        let log_lim1 = log_lim0 + m as f64 * log_scale;

        let new_borders: Vec<f64> = linspace(log_lim0, log_lim1, m + 1)
            .into_iter()
            .map(f64::exp)
            .collect();
        let k = new_borders
            .iter()
            .map(|b| (b - lim[0]).clamp(0.0, (npix - 1) as f64) as usize)
            .collect();
        let log_lam = new_borders
            .windows(2)
            .map(|w| ((w[0] * w[1]).sqrt() * dlam).ln())
            .collect();

        Ok(Self {
            npix_in: npix,
            borders,
            new_borders,
            k,
            log_lam,
            velscale,
        })
    }

    /// Natural log of the output pixel centres.
    pub fn log_lam(&self) -> &[f64] {
        &self.log_lam
    }

    /// Number of output pixels.
    pub fn len(&self) -> usize {
        self.log_lam.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_lam.is_empty()
    }

    pub fn velscale(&self) -> f64 {
        self.velscale
    }

    /// Resample one spectrum onto the grid.
    pub fn rebin(&self, spec: ArrayView1<'_, f64>) -> Result<Vec<f64>, RebinError> {
        if spec.len() != self.npix_in {
            return Err(RebinError::LengthMismatch {
                expected: self.npix_in,
                got: spec.len(),
            });
        }
        if spec.iter().any(|v| !v.is_finite()) {
            return Err(RebinError::NonFinite);
        }
        if spec.iter().all(|&v| v == 0.0) {
            return Err(RebinError::ZeroFlux);
        }

        // Cumulative sum so each block sum is O(1).
        let mut cumsum = Vec::with_capacity(spec.len() + 1);
        cumsum.push(0.0);
        let mut acc = 0.0;
        for &v in spec.iter() {
            acc += v;
            cumsum.push(acc);
        }

        let out = (0..self.len())
            .map(|i| {
                let (ka, kb) = (self.k[i], self.k[i + 1]);
                let whole = if kb > ka { cumsum[kb] - cumsum[ka] } else { 0.0 };
                let head = (self.new_borders[i] - self.borders[ka]) * spec[ka];
                let tail = (self.new_borders[i + 1] - self.borders[kb]) * spec[kb];
                whole + tail - head
            })
            .collect();
        Ok(out)
    }

    /// Resample every column of `spectra` (pixels × spectra).
    ///
    /// A column that cannot be rebinned is filled with NaN and its index is
    /// recorded in [`RebinnedSpectra::failed`]; the rest of the batch is
    /// unaffected.
    pub fn rebin_batch(&self, spectra: &Array2<f64>) -> RebinnedSpectra {
        let columns: Vec<Result<Vec<f64>, RebinError>> = (0..spectra.ncols())
            .into_par_iter()
            .map(|j| self.rebin(spectra.column(j)))
            .collect();

        let mut flux = Array2::from_elem((self.len(), columns.len()), f64::NAN);
        let mut failed = Vec::new();
        for (j, column) in columns.into_iter().enumerate() {
            match column {
                Ok(values) => flux
                    .column_mut(j)
                    .iter_mut()
                    .zip(values)
                    .for_each(|(dst, v)| *dst = v),
                Err(err) => {
                    log::debug!("log-rebinning of spectrum {j} failed: {err}");
                    failed.push(j);
                }
            }
        }
        if !failed.is_empty() {
            log::warn!(
                "{} of {} spectra could not be log-rebinned and were set to NaN",
                failed.len(),
                spectra.ncols()
            );
        }

        RebinnedSpectra {
            flux,
            log_lam: self.log_lam.clone(),
            velscale: self.velscale,
            failed,
        }
    }
}

/// Log-rebin a batch of spectra sharing the linear axis `wave`.
///
/// The output range is the full min/max of `wave`.
pub fn log_rebin_batch(
    wave: &[f64],
    spectra: &Array2<f64>,
    velscale: f64,
) -> Result<RebinnedSpectra, RebinError> {
    if spectra.nrows() != wave.len() {
        return Err(RebinError::LengthMismatch {
            expected: wave.len(),
            got: spectra.nrows(),
        });
    }
    let rebinner = LogRebinner::new(wave_range(wave)?, wave.len(), velscale)?;
    Ok(rebinner.rebin_batch(spectra))
}

/// Log-rebin a single spectrum; returns `(flux, log_lam)`.
pub fn log_rebin(
    lam_range: [f64; 2],
    spec: &[f64],
    velscale: f64,
) -> Result<(Vec<f64>, Vec<f64>), RebinError> {
    let rebinner = LogRebinner::new(lam_range, spec.len(), velscale)?;
    let flux = rebinner.rebin(ArrayView1::from(spec))?;
    Ok((flux, rebinner.log_lam))
}

fn wave_range(wave: &[f64]) -> Result<[f64; 2], RebinError> {
    if wave.len() < 2 {
        return Err(RebinError::TooShort(wave.len()));
    }
    let (lo, hi) = wave
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &w| {
            (lo.min(w), hi.max(w))
        });
    Ok([lo, hi])
}

fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    let step = (stop - start) / (num - 1) as f64;
    (0..num)
        .map(|i| {
            if i == num - 1 {
                stop
            } else {
                start + i as f64 * step
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array1;

    fn linear_wave(start: f64, step: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| start + i as f64 * step).collect()
    }

    #[test]
    fn test_output_axis_has_constant_velocity_step() {
        let wave = linear_wave(4800.0, 1.0, 500);
        let (_, log_lam) = log_rebin([4800.0, 5299.0], &vec![1.0; 500], 60.0).unwrap();
        assert!(log_lam.len() > 10);
        for w in log_lam.windows(2) {
            assert_relative_eq!((w[1] - w[0]) * C_KMS, 60.0, max_relative = 1e-9);
        }
        assert!(log_lam[0].exp() >= wave[0] - 0.5);
        assert!(log_lam.last().unwrap().exp() <= wave[499] + 0.5);
    }

    #[test]
    fn test_flux_is_conserved() {
        let n = 400;
        let spec: Vec<f64> = (0..n).map(|i| 1.0 + (i as f64 * 0.05).sin().abs()).collect();
        let (rebinned, _) = log_rebin([5000.0, 5399.0], &spec, 30.0).unwrap();
        let before: f64 = spec.iter().sum();
        let after: f64 = rebinned.iter().sum();
        // The output grid is truncated to a whole number of pixels, so a
        // sliver at the red end may be lost.
        assert_relative_eq!(after, before, max_relative = 0.01);
        assert!(after <= before + 1e-9);
    }

    #[test]
    fn test_batch_is_shape_stable() {
        let wave = linear_wave(4500.0, 1.25, 800);
        let spectra = Array2::from_shape_fn((800, 7), |(i, j)| 1.0 + 0.1 * j as f64 + 1e-3 * i as f64);
        let out = log_rebin_batch(&wave, &spectra, 70.0).unwrap();
        assert_eq!(out.flux.ncols(), 7);
        assert_eq!(out.flux.nrows(), out.log_lam.len());
        assert!(out.failed.is_empty());
        assert!(out.flux.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_pathological_column_becomes_nan_without_aborting() {
        let wave = linear_wave(4500.0, 1.0, 300);
        let mut spectra = Array2::from_elem((300, 4), 1.0);
        spectra.column_mut(1).fill(0.0);
        spectra[[17, 3]] = f64::NAN;

        let out = log_rebin_batch(&wave, &spectra, 60.0).unwrap();
        assert_eq!(out.failed, vec![1, 3]);
        assert!(out.flux.column(1).iter().all(|v| v.is_nan()));
        assert!(out.flux.column(3).iter().all(|v| v.is_nan()));

        let clean = log_rebin(wave_range(&wave).unwrap(), &vec![1.0; 300], 60.0).unwrap().0;
        for j in [0, 2] {
            for (a, b) in out.flux.column(j).iter().zip(&clean) {
                assert_relative_eq!(*a, *b);
            }
        }
    }

    #[test]
    fn test_rejects_degenerate_grids() {
        assert_eq!(
            LogRebinner::new([5000.0, 5001.0], 1, 60.0).unwrap_err(),
            RebinError::TooShort(1)
        );
        assert!(matches!(
            LogRebinner::new([5000.0, 4000.0], 10, 60.0),
            Err(RebinError::InvalidRange(..))
        ));
        assert!(matches!(
            LogRebinner::new([5000.0, 5001.0], 2, 1.0e5),
            Err(RebinError::NoOutputPixels(_))
        ));
    }
}
