use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::spectral::lsf::LineSpreadFunction;

/// How templates are normalised, which decides whether downstream weights
/// are mass- or light-weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TemplateNorm {
    /// Divide the whole library by its global mean.
    Mass,
    /// Divide each template by its own mean.
    Light,
}

/// Run configuration, read from a JSON file with the classic upper-case keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PrepConfig {
    /// SNR of the isophote that bounds the analysis region.
    pub min_snr: f64,
    /// Directory holding the SSP template files.
    pub ssp_lib: PathBuf,
    pub norm_temp: TemplateNorm,
    /// Rest-frame wavelength range used for the analysis.
    pub lmin: f64,
    pub lmax: f64,
    /// Rest-frame wavelength range used to measure signal and noise.
    pub lmin_snr: f64,
    pub lmax_snr: f64,
    pub redshift: f64,
    /// Spatial pixel (column, row) placed at the coordinate origin.
    #[serde(default)]
    pub origin: [f64; 2],
    /// Templates are sampled `VELSCALE_RATIO` times finer than the data.
    #[serde(default = "default_velscale_ratio")]
    pub velscale_ratio: u32,
    /// Where cached spectra and masking files live.
    #[serde(default = "default_outdir")]
    pub outdir: PathBuf,
    /// Two-column LSF table of the data.
    #[serde(default)]
    pub lsf_data: Option<PathBuf>,
    /// Two-column LSF table of the templates.
    #[serde(default)]
    pub lsf_temp: Option<PathBuf>,
}

fn default_velscale_ratio() -> u32 {
    1
}

fn default_outdir() -> PathBuf {
    PathBuf::from(".")
}

impl PrepConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: PrepConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lmin.is_nan() || self.lmax.is_nan() || self.lmin >= self.lmax {
            bail!("LMIN ({}) must be below LMAX ({})", self.lmin, self.lmax);
        }
        if self.lmin_snr.is_nan() || self.lmax_snr.is_nan() || self.lmin_snr >= self.lmax_snr {
            bail!(
                "LMIN_SNR ({}) must be below LMAX_SNR ({})",
                self.lmin_snr,
                self.lmax_snr
            );
        }
        if self.redshift <= -1.0 {
            bail!("REDSHIFT must be above -1, got {}", self.redshift);
        }
        if self.velscale_ratio == 0 {
            bail!("VELSCALE_RATIO must be at least 1");
        }
        Ok(())
    }

    /// Load the data and template LSFs named by `LSF_DATA` and `LSF_TEMP`.
    pub fn line_spread_functions(&self) -> Result<(LineSpreadFunction, LineSpreadFunction)> {
        let data = self
            .lsf_data
            .as_deref()
            .context("LSF_DATA is not configured")?;
        let templates = self
            .lsf_temp
            .as_deref()
            .context("LSF_TEMP is not configured")?;
        Ok((
            LineSpreadFunction::from_file(data)?,
            LineSpreadFunction::from_file(templates)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "MIN_SNR": 10.0, "SSP_LIB": "spectralTemplates/MILES/", "NORM_TEMP": "MASS",
        "LMIN": 4800.0, "LMAX": 5500.0, "LMIN_SNR": 4800.0, "LMAX_SNR": 5500.0,
        "REDSHIFT": 0.008
    }"#;

    #[test]
    fn test_defaults_are_applied() {
        let config: PrepConfig = serde_json::from_str(MINIMAL).unwrap();
        assert_eq!(config.norm_temp, TemplateNorm::Mass);
        assert_eq!(config.velscale_ratio, 1);
        assert_eq!(config.origin, [0.0, 0.0]);
        assert_eq!(config.outdir, PathBuf::from("."));
        assert!(config.lsf_data.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_light_normalisation_and_bad_ranges() {
        let text = MINIMAL
            .replace("\"MASS\"", "\"LIGHT\"")
            .replace("\"LMAX\": 5500.0", "\"LMAX\": 4000.0");
        let config: PrepConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(config.norm_temp, TemplateNorm::Light);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_normalisation_is_rejected() {
        let text = MINIMAL.replace("\"MASS\"", "\"VOLUME\"");
        assert!(serde_json::from_str::<PrepConfig>(&text).is_err());
    }

    #[test]
    fn test_missing_lsf_is_reported() {
        let config: PrepConfig = serde_json::from_str(MINIMAL).unwrap();
        let err = config.line_spread_functions().unwrap_err();
        assert!(err.to_string().contains("LSF_DATA"));
    }
}
