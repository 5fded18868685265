//! The preparation stages strung together: classify → log-rebin (cached)
//! for the observed spectra, masking, and the template library.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array2, Axis};

use crate::config::PrepConfig;
use crate::data::filter::{classify_spaxels, Classification};
use crate::data::loader::load_mask_config;
use crate::data::model::{AllSpectra, SpectralCube};
use crate::data::store;
use crate::spectral::lsf::LineSpreadFunction;
use crate::spectral::mask::good_pixels;
use crate::spectral::rebin::log_rebin_batch;
use crate::templates::{
    prepare_template_library, AnalysisModule, TemplateDir, TemplateLibrary, TemplateRequest,
};

/// Observed spectra ready for fitting.
#[derive(Debug, Clone)]
pub struct PreparedSpectra {
    pub classification: Classification,
    /// Log-rebinned flux and error of every spaxel.
    pub spectra: AllSpectra,
    /// Spaxels whose flux or error could not be rebinned and hold NaN.
    pub failed: Vec<usize>,
}

impl PreparedSpectra {
    /// Flux and error of the spaxels inside the analysis region.
    pub fn inside(&self) -> (Array2<f64>, Array2<f64>) {
        let idx = &self.classification.inside;
        (
            self.spectra.spec.select(Axis(1), idx),
            self.spectra.error.select(Axis(1), idx),
        )
    }
}

/// Classify the spaxels of `cube` and log-rebin its spectra.
///
/// Rebinned spectra are cached in `OUTDIR` under `rootname`; an existing
/// cache is loaded instead of recomputed.
pub fn prepare_spectra(
    cube: &SpectralCube,
    config: &PrepConfig,
    rootname: &str,
) -> Result<PreparedSpectra> {
    let classification = classify_spaxels(cube, config.min_snr);
    let spectra = log_rebinning(cube, &config.outdir, rootname)?;
    if spectra.spec.ncols() != cube.len() {
        anyhow::bail!(
            "cached spectra for '{rootname}' hold {} spaxels but the cube has {}; \
             remove {} to recompute",
            spectra.spec.ncols(),
            cube.len(),
            store::all_spectra_path(&config.outdir, rootname).display()
        );
    }
    let failed = nan_columns(&spectra);
    if !failed.is_empty() {
        log::warn!("{} spaxels hold no rebinned spectrum", failed.len());
    }
    Ok(PreparedSpectra {
        classification,
        spectra,
        failed,
    })
}

/// Columns whose rebinned flux or error is entirely NaN. Rebinning writes
/// such placeholders for spectra it rejects, so this recovers the failures
/// from a fresh run and from a cache alike.
fn nan_columns(spectra: &AllSpectra) -> Vec<usize> {
    let all_nan = |m: &Array2<f64>, j: usize| m.column(j).iter().all(|v| v.is_nan());
    (0..spectra.spec.ncols())
        .filter(|&j| all_nan(&spectra.spec, j) || all_nan(&spectra.error, j))
        .collect()
}

/// Log-rebin flux and error of every spaxel at the cube's velscale, or load
/// the result of an earlier run.
pub fn log_rebinning(cube: &SpectralCube, outdir: &Path, rootname: &str) -> Result<AllSpectra> {
    if store::has_all_spectra(outdir, rootname) {
        log::info!("Loading log-rebinned spectra of '{rootname}' from {}", outdir.display());
        return store::load_all_spectra(outdir, rootname);
    }

    let spec = log_rebin_batch(&cube.wave, &cube.spec, cube.velscale)
        .context("log-rebinning the spectra")?;
    log::info!("Log-rebinned the spectra");
    let error = log_rebin_batch(&cube.wave, &cube.error, cube.velscale)
        .context("log-rebinning the error spectra")?;
    log::info!("Log-rebinned the error spectra");

    if !spec.failed.is_empty() || !error.failed.is_empty() {
        log::warn!(
            "Failed to rebin {} spectra and {} error spectra",
            spec.failed.len(),
            error.failed.len()
        );
    }
    let spectra = AllSpectra {
        spec: spec.flux,
        error: error.flux,
        log_lam: spec.log_lam,
        velscale: spec.velscale,
    };
    store::save_all_spectra(outdir, rootname, &spectra)?;
    Ok(spectra)
}

/// `<OUTDIR>/spectralMasking_<MODULE>.config`
pub fn mask_config_path(config: &PrepConfig, module: AnalysisModule) -> PathBuf {
    config
        .outdir
        .join(format!("spectralMasking_{}.config", module.as_str()))
}

/// Good pixels of `log_lam` for `module`, from its masking file.
pub fn spectral_mask(
    config: &PrepConfig,
    module: AnalysisModule,
    log_lam: &[f64],
) -> Result<Vec<usize>> {
    let entries = load_mask_config(&mask_config_path(config, module))?;
    let good = good_pixels(log_lam, config.redshift, &entries);
    log::info!(
        "Masked {} of {} pixels with {} windows for {module}",
        log_lam.len() - good.len(),
        log_lam.len(),
        entries.len()
    );
    Ok(good)
}

/// Prepare the SSP library in `SSP_LIB` for `module`, covering
/// `LMIN..LMAX` at `velscale / VELSCALE_RATIO`.
pub fn prepare_templates(
    config: &PrepConfig,
    module: AnalysisModule,
    velscale: f64,
    lsf_data: &LineSpreadFunction,
    lsf_temp: &LineSpreadFunction,
) -> Result<TemplateLibrary> {
    let request = TemplateRequest {
        module,
        norm: config.norm_temp,
        lmin: config.lmin,
        lmax: config.lmax,
        velscale,
        velscale_ratio: config.velscale_ratio,
    };
    let source = TemplateDir::new(&config.ssp_lib);
    Ok(prepare_template_library(&source, &request, lsf_data, lsf_temp)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::RawCube;

    fn config(outdir: &Path) -> PrepConfig {
        let mut config: PrepConfig = serde_json::from_str(
            r#"{
                "MIN_SNR": 5.0, "SSP_LIB": "templates", "NORM_TEMP": "LIGHT",
                "LMIN": 4800.0, "LMAX": 5200.0,
                "LMIN_SNR": 4900.0, "LMAX_SNR": 5100.0,
                "REDSHIFT": 0.0
            }"#,
        )
        .unwrap();
        config.outdir = outdir.to_path_buf();
        config
    }

    fn cube_with(config: &PrepConfig, nx: usize, ny: usize) -> SpectralCube {
        let npix = 500;
        let flux = Array2::from_shape_fn((npix, nx * ny), |(i, j)| {
            1.0 + j as f64 + 0.05 * ((i as f64) * 0.1).sin()
        });
        let error = Array2::from_elem((npix, nx * ny), 0.5);
        let raw = RawCube {
            flux,
            error,
            crval: 4750.0,
            cdelt: 1.0,
            nx,
            ny,
            pixsize: 1.0,
        };
        SpectralCube::from_linear(raw, config).unwrap()
    }

    fn cube(config: &PrepConfig) -> SpectralCube {
        cube_with(config, 3, 2)
    }

    #[test]
    fn test_second_run_loads_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let cube = cube(&config);

        let first = prepare_spectra(&cube, &config, "cube").unwrap();
        assert!(store::has_all_spectra(dir.path(), "cube"));
        assert_eq!(first.spectra.spec.ncols(), 6);
        assert_eq!(
            first.classification.inside.len() + first.classification.outside.len(),
            6
        );

        let second = prepare_spectra(&cube, &config, "cube").unwrap();
        assert_eq!(second.spectra.log_lam.len(), first.spectra.log_lam.len());
        for (a, b) in first.spectra.spec.iter().zip(second.spectra.spec.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_inside_selects_columns() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let prepared = prepare_spectra(&cube(&config), &config, "cube").unwrap();
        let (spec, error) = prepared.inside();
        assert_eq!(spec.ncols(), prepared.classification.inside.len());
        assert_eq!(error.dim(), spec.dim());
    }

    #[test]
    fn test_mask_file_is_found_per_module() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(
            dir.path().join("spectralMasking_GAS.config"),
            "# centre width tag\n5000.0 20.0 Hb\n",
        )
        .unwrap();
        let log_lam: Vec<f64> = (0..400).map(|i| 4800f64.ln() + i as f64 * 1e-4).collect();

        let good = spectral_mask(&config, AnalysisModule::Gas, &log_lam).unwrap();
        assert!(good.len() < log_lam.len());
        assert!(spectral_mask(&config, AnalysisModule::Kin, &log_lam).is_err());
    }

    #[test]
    fn test_unrebinnable_spaxels_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut cube = cube(&config);
        cube.spec[[10, 2]] = f64::NAN;
        cube.error.column_mut(5).fill(f64::INFINITY);

        let fresh = prepare_spectra(&cube, &config, "cube").unwrap();
        assert_eq!(fresh.failed, vec![2, 5]);
        assert!(fresh.spectra.spec.column(2).iter().all(|v| v.is_nan()));

        let cached = prepare_spectra(&cube, &config, "cube").unwrap();
        assert_eq!(cached.failed, vec![2, 5]);
    }

    #[test]
    fn test_cache_from_a_different_cube_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        prepare_spectra(&cube(&config), &config, "cube").unwrap();

        let err = prepare_spectra(&cube_with(&config, 2, 2), &config, "cube").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("hold 6 spaxels but the cube has 4"), "{message}");
        assert!(message.contains("cube_AllSpectra.parquet"));
    }
}
