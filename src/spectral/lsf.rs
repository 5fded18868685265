//! Line-spread functions and resolution matching.

use std::path::Path;

use anyhow::{bail, Context};

use crate::error::{PrepError, Result};

/// Conversion factor between a Gaussian's FWHM and its standard deviation.
pub const FWHM_TO_SIGMA: f64 = 2.355;

/// Instrumental resolution (FWHM in Angstrom) as a function of wavelength.
#[derive(Debug, Clone, PartialEq)]
pub enum LineSpreadFunction {
    /// Same FWHM at every wavelength.
    Constant(f64),
    /// Tabulated FWHM, linearly interpolated and extrapolated.
    Tabulated(LsfTable),
}

/// Wavelength/FWHM samples of a tabulated LSF.
///
/// Only [`LineSpreadFunction::tabulated`] builds one, so the axis always has
/// at least two strictly increasing samples.
#[derive(Debug, Clone, PartialEq)]
pub struct LsfTable {
    wave: Vec<f64>,
    fwhm: Vec<f64>,
}

impl LsfTable {
    pub fn wave(&self) -> &[f64] {
        &self.wave
    }

    pub fn fwhm(&self) -> &[f64] {
        &self.fwhm
    }

    fn interpolate(&self, lam: f64) -> f64 {
        let n = self.wave.len();
        // Index of the segment used, including the two end segments for
        // extrapolation.
        let i = self.wave.partition_point(|&w| w <= lam).clamp(1, n - 1);
        let (x0, x1) = (self.wave[i - 1], self.wave[i]);
        let (y0, y1) = (self.fwhm[i - 1], self.fwhm[i]);
        y0 + (lam - x0) * (y1 - y0) / (x1 - x0)
    }
}

impl LineSpreadFunction {
    /// Build a tabulated LSF. `wave` must be strictly increasing and hold at
    /// least two samples.
    pub fn tabulated(wave: Vec<f64>, fwhm: Vec<f64>) -> anyhow::Result<Self> {
        if wave.len() != fwhm.len() {
            bail!(
                "LSF has {} wavelengths but {} FWHM values",
                wave.len(),
                fwhm.len()
            );
        }
        if wave.len() < 2 {
            bail!("LSF needs at least two samples");
        }
        if wave.windows(2).any(|w| w[1] <= w[0]) {
            bail!("LSF wavelengths must be strictly increasing");
        }
        Ok(Self::Tabulated(LsfTable { wave, fwhm }))
    }

    /// Read a whitespace-separated two-column table (wavelength, FWHM).
    /// Lines starting with `#` are ignored.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading LSF file {}", path.display()))?;
        let mut wave = Vec::new();
        let mut fwhm = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut cols = line.split_whitespace();
            let (Some(w), Some(f)) = (cols.next(), cols.next()) else {
                bail!("{}:{}: expected two columns", path.display(), line_no + 1);
            };
            wave.push(
                w.parse::<f64>()
                    .with_context(|| format!("{}:{}: bad wavelength '{w}'", path.display(), line_no + 1))?,
            );
            fwhm.push(
                f.parse::<f64>()
                    .with_context(|| format!("{}:{}: bad FWHM '{f}'", path.display(), line_no + 1))?,
            );
        }
        Self::tabulated(wave, fwhm).with_context(|| format!("in {}", path.display()))
    }

    /// FWHM at `lam`.
    pub fn fwhm(&self, lam: f64) -> f64 {
        match self {
            Self::Constant(v) => *v,
            Self::Tabulated(table) => table.interpolate(lam),
        }
    }
}

/// Per-pixel Gaussian sigma (in template pixels) that broadens the templates
/// to the data resolution.
///
/// `wave` is the linear template axis, `cdelt` its step. Templates can only
/// be degraded, so a data FWHM below the template FWHM anywhere is fatal.
pub fn matching_sigma(
    data: &LineSpreadFunction,
    templates: &LineSpreadFunction,
    wave: &[f64],
    cdelt: f64,
) -> Result<Vec<f64>> {
    wave.iter()
        .map(|&lam| {
            let data_fwhm = data.fwhm(lam);
            let template_fwhm = templates.fwhm(lam);
            if data_fwhm - template_fwhm < 0.0 {
                return Err(PrepError::ResolutionMismatch {
                    wavelength: lam,
                    data_fwhm,
                    template_fwhm,
                });
            }
            let fwhm_diff = (data_fwhm.powi(2) - template_fwhm.powi(2)).sqrt();
            Ok(fwhm_diff / FWHM_TO_SIGMA / cdelt)
        })
        .collect()
}
