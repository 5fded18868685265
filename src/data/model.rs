use ndarray::{Array2, Axis};

use crate::config::PrepConfig;
use crate::data::filter::nan_median;
use crate::spectral::rebin::C_KMS;

// ---------------------------------------------------------------------------
// LinearSpectrum – one spectrum on a linear wavelength axis
// ---------------------------------------------------------------------------

/// A single spectrum sampled at `crval + i * cdelt` Angstrom.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSpectrum {
    /// Wavelength of the first pixel.
    pub crval: f64,
    /// Wavelength step per pixel.
    pub cdelt: f64,
    pub flux: Vec<f64>,
}

impl LinearSpectrum {
    /// Wavelength of every pixel.
    pub fn wave(&self) -> Vec<f64> {
        linear_axis(self.crval, self.cdelt, self.flux.len())
    }

    /// Wavelengths of the first and last pixel.
    pub fn lam_range(&self) -> [f64; 2] {
        let n = self.flux.len().saturating_sub(1);
        [self.crval, self.crval + self.cdelt * n as f64]
    }
}

pub(crate) fn linear_axis(crval: f64, cdelt: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| crval + i as f64 * cdelt).collect()
}

// ---------------------------------------------------------------------------
// RawCube – what a cube loader hands over
// ---------------------------------------------------------------------------

/// Flux and error of every spaxel on the observed-frame linear axis.
///
/// Spaxels are stored row-major: spaxel `s` sits at column `s % nx`, row `s / nx`.
#[derive(Debug, Clone)]
pub struct RawCube {
    /// Pixels × spaxels.
    pub flux: Array2<f64>,
    /// Pixels × spaxels, same shape as `flux`.
    pub error: Array2<f64>,
    pub crval: f64,
    pub cdelt: f64,
    pub nx: usize,
    pub ny: usize,
    /// Spatial pixel size in arcsec.
    pub pixsize: f64,
}

// ---------------------------------------------------------------------------
// SpectralCube – one spectrum per spaxel on a shared linear axis
// ---------------------------------------------------------------------------

/// The cube as consumed by the preparation stages.
#[derive(Debug, Clone)]
pub struct SpectralCube {
    /// Spatial coordinates in arcsec, relative to the configured origin.
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Rest-frame linear wavelength axis.
    pub wave: Vec<f64>,
    /// Pixels × spaxels.
    pub spec: Array2<f64>,
    /// Pixels × spaxels.
    pub error: Array2<f64>,
    pub snr: Vec<f64>,
    pub signal: Vec<f64>,
    pub noise: Vec<f64>,
    /// km/s per pixel at the mean wavelength.
    pub velscale: f64,
    /// Spatial pixel size in arcsec.
    pub pixelsize: f64,
}

impl SpectralCube {
    /// Deredshift, measure signal and noise, and cut the spectra to the
    /// configured wavelength range.
    ///
    /// Signal is the NaN-ignoring median flux within `LMIN_SNR..=LMAX_SNR`,
    /// noise the absolute median error in the same window.
    pub fn from_linear(raw: RawCube, config: &PrepConfig) -> anyhow::Result<Self> {
        let (npix, nspax) = raw.flux.dim();
        if raw.error.dim() != (npix, nspax) {
            anyhow::bail!(
                "flux has shape {:?} but error has shape {:?}",
                raw.flux.dim(),
                raw.error.dim()
            );
        }
        if raw.nx * raw.ny != nspax {
            anyhow::bail!(
                "cube declares {}x{} spaxels but holds {nspax} spectra",
                raw.nx,
                raw.ny
            );
        }

        let wave: Vec<f64> = linear_axis(raw.crval, raw.cdelt, npix)
            .into_iter()
            .map(|w| w / (1.0 + config.redshift))
            .collect();
        let within = |lo: f64, hi: f64| -> Vec<usize> {
            wave.iter()
                .enumerate()
                .filter(|(_, &w)| w >= lo && w <= hi)
                .map(|(i, _)| i)
                .collect()
        };
        let idx = within(config.lmin, config.lmax);
        let idx_snr = within(config.lmin_snr, config.lmax_snr);
        if idx.len() < 2 {
            anyhow::bail!(
                "fewer than two pixels between LMIN={} and LMAX={}",
                config.lmin,
                config.lmax
            );
        }
        if idx_snr.is_empty() {
            anyhow::bail!(
                "no pixels between LMIN_SNR={} and LMAX_SNR={}",
                config.lmin_snr,
                config.lmax_snr
            );
        }

        let flux_snr = raw.flux.select(Axis(0), &idx_snr);
        let error_snr = raw.error.select(Axis(0), &idx_snr);
        let signal: Vec<f64> = flux_snr
            .columns()
            .into_iter()
            .map(|c| nan_median(c.iter().copied()))
            .collect();
        let noise: Vec<f64> = error_snr
            .columns()
            .into_iter()
            .map(|c| nan_median(c.iter().copied()).abs())
            .collect();
        let snr = signal.iter().zip(&noise).map(|(s, n)| s / n).collect();

        let spec = raw.flux.select(Axis(0), &idx);
        let error = raw.error.select(Axis(0), &idx);
        let wave: Vec<f64> = idx.iter().map(|&i| wave[i]).collect();
        let mean_wave = wave.iter().sum::<f64>() / wave.len() as f64;
        let velscale = (wave[1] - wave[0]) * C_KMS / mean_wave;

        let [ox, oy] = config.origin;
        let mut x = Vec::with_capacity(nspax);
        let mut y = Vec::with_capacity(nspax);
        for row in 0..raw.ny {
            for col in 0..raw.nx {
                x.push((col as f64 - ox) * raw.pixsize);
                y.push((row as f64 - oy) * raw.pixsize);
            }
        }

        log::info!(
            "Shortened spectra to {:.1}-{:.1} A ({} pixels); velscale is {velscale:.3} km/s",
            config.lmin,
            config.lmax,
            wave.len()
        );

        Ok(SpectralCube {
            x,
            y,
            wave,
            spec,
            error,
            snr,
            signal,
            noise,
            velscale,
            pixelsize: raw.pixsize,
        })
    }

    /// Number of spaxels.
    pub fn len(&self) -> usize {
        self.spec.ncols()
    }

    /// Whether the cube holds no spaxels.
    pub fn is_empty(&self) -> bool {
        self.spec.ncols() == 0
    }
}

// ---------------------------------------------------------------------------
// Rebinned spectra
// ---------------------------------------------------------------------------

/// A batch of spectra on one logarithmic axis.
#[derive(Debug, Clone)]
pub struct RebinnedSpectra {
    /// Pixels × spectra. Columns that failed to rebin are all NaN.
    pub flux: Array2<f64>,
    /// Natural log of the pixel centres, constant step.
    pub log_lam: Vec<f64>,
    /// km/s per pixel.
    pub velscale: f64,
    /// Columns that could not be rebinned.
    pub failed: Vec<usize>,
}

/// Rebinned flux and error of a whole cube, as persisted between runs.
#[derive(Debug, Clone, PartialEq)]
pub struct AllSpectra {
    /// Pixels × spaxels.
    pub spec: Array2<f64>,
    /// Pixels × spaxels.
    pub error: Array2<f64>,
    pub log_lam: Vec<f64>,
    pub velscale: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn config() -> PrepConfig {
        serde_json::from_str(
            r#"{
                "MIN_SNR": 10.0, "SSP_LIB": "templates", "NORM_TEMP": "LIGHT",
                "LMIN": 4800.0, "LMAX": 5000.0,
                "LMIN_SNR": 4850.0, "LMAX_SNR": 4950.0,
                "REDSHIFT": 0.01, "ORIGIN": [1.0, 0.0]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_from_linear_deredshifts_and_measures_snr() {
        let npix = 400;
        let flux = Array2::from_shape_fn((npix, 4), |(_, j)| 2.0 + j as f64);
        let error = Array2::from_elem((npix, 4), 0.5);
        let raw = RawCube {
            flux,
            error,
            crval: 4800.0,
            cdelt: 1.0,
            nx: 2,
            ny: 2,
            pixsize: 0.5,
        };
        let cube = SpectralCube::from_linear(raw, &config()).unwrap();

        assert_eq!(cube.len(), 4);
        assert!(cube.wave[0] >= 4800.0 && *cube.wave.last().unwrap() <= 5000.0);
        assert_relative_eq!(cube.wave[1] - cube.wave[0], 1.0 / 1.01, max_relative = 1e-12);
        assert_eq!(cube.spec.nrows(), cube.wave.len());
        assert_relative_eq!(cube.signal[3], 5.0);
        assert_relative_eq!(cube.noise[0], 0.5);
        assert_relative_eq!(cube.snr[1], 6.0);
        assert_eq!(cube.x, vec![-0.5, 0.0, -0.5, 0.0]);
        assert_eq!(cube.y, vec![0.0, 0.0, 0.5, 0.5]);
        let mean = cube.wave.iter().sum::<f64>() / cube.wave.len() as f64;
        assert_relative_eq!(cube.velscale, (1.0 / 1.01) * C_KMS / mean, max_relative = 1e-12);
    }

    #[test]
    fn test_from_linear_rejects_bad_geometry() {
        let raw = RawCube {
            flux: Array2::zeros((100, 3)),
            error: Array2::zeros((100, 3)),
            crval: 4800.0,
            cdelt: 1.0,
            nx: 2,
            ny: 2,
            pixsize: 1.0,
        };
        assert!(SpectralCube::from_linear(raw, &config()).is_err());
    }
}
