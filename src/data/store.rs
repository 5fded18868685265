//! On-disk cache of log-rebinned spectra.
//!
//! Two Parquet files per dataset root name:
//!
//! * `<root>_AllSpectra.parquet`: one row per spaxel, list columns `SPEC` and
//!   `ESPEC`, schema metadata `VELSCALE`, `CRPIX1`, `CRVAL1`, `CDELT1`, `NPIX`
//! * `<root>_LogLam.parquet`: a single `LOGLAM` column
//!
//! Writers for the same root name must be serialised by the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{Float64Array, Float64Builder, ListBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use ndarray::Array2;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use super::loader::{columns_to_matrix, extract_f64_list, f64_values, header_value};
use super::model::AllSpectra;

pub fn all_spectra_path(outdir: &Path, rootname: &str) -> PathBuf {
    outdir.join(format!("{rootname}_AllSpectra.parquet"))
}

pub fn log_lam_path(outdir: &Path, rootname: &str) -> PathBuf {
    outdir.join(format!("{rootname}_LogLam.parquet"))
}

/// Whether a complete cache exists for `rootname`.
pub fn has_all_spectra(outdir: &Path, rootname: &str) -> bool {
    all_spectra_path(outdir, rootname).is_file() && log_lam_path(outdir, rootname).is_file()
}

/// Write rebinned spectra and their log-wavelength axis.
pub fn save_all_spectra(outdir: &Path, rootname: &str, spectra: &AllSpectra) -> Result<PathBuf> {
    let npix = spectra.log_lam.len();
    if spectra.spec.nrows() != npix || spectra.error.dim() != spectra.spec.dim() {
        bail!(
            "spectra {:?} and errors {:?} do not match a {npix}-pixel axis",
            spectra.spec.dim(),
            spectra.error.dim()
        );
    }
    if npix < 2 {
        bail!("need at least two pixels to describe the log-wavelength axis");
    }
    std::fs::create_dir_all(outdir)
        .with_context(|| format!("creating {}", outdir.display()))?;

    let path = all_spectra_path(outdir, rootname);
    let metadata: HashMap<String, String> = [
        ("VELSCALE", spectra.velscale),
        ("CRPIX1", 1.0),
        ("CRVAL1", spectra.log_lam[0]),
        ("CDELT1", spectra.log_lam[1] - spectra.log_lam[0]),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .chain(std::iter::once(("NPIX".to_string(), npix.to_string())))
    .collect();

    let list = DataType::List(Arc::new(Field::new("item", DataType::Float64, true)));
    let schema = Arc::new(
        Schema::new(vec![
            Field::new("SPEC", list.clone(), false),
            Field::new("ESPEC", list, false),
        ])
        .with_metadata(metadata),
    );
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(list_column(&spectra.spec)),
            Arc::new(list_column(&spectra.error)),
        ],
    )
    .context("building spectra record batch")?;
    write_batch(&path, schema, &batch)?;

    let schema = Arc::new(Schema::new(vec![Field::new(
        "LOGLAM",
        DataType::Float64,
        false,
    )]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(Float64Array::from(spectra.log_lam.clone()))],
    )
    .context("building LOGLAM record batch")?;
    write_batch(&log_lam_path(outdir, rootname), schema, &batch)?;

    log::info!("Wrote: {}", path.display());
    Ok(path)
}

/// Read back what [`save_all_spectra`] wrote.
pub fn load_all_spectra(outdir: &Path, rootname: &str) -> Result<AllSpectra> {
    let path = all_spectra_path(outdir, rootname);
    let file = std::fs::File::open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let metadata = builder.schema().metadata().clone();
    let velscale: f64 = header_value(&metadata, "VELSCALE")?;
    let npix: usize = header_value(&metadata, "NPIX")?;

    let mut spec = Vec::new();
    let mut error = Vec::new();
    for batch in builder.build().context("building parquet reader")? {
        let batch = batch.context("reading spectra record batch")?;
        let spec_col = batch
            .column_by_name("SPEC")
            .context("missing 'SPEC' column")?;
        let error_col = batch
            .column_by_name("ESPEC")
            .context("missing 'ESPEC' column")?;
        for row in 0..batch.num_rows() {
            spec.push(extract_f64_list(spec_col, row)?);
            error.push(extract_f64_list(error_col, row)?);
        }
    }

    let log_lam = load_log_lam(&log_lam_path(outdir, rootname))?;
    if log_lam.len() != npix {
        bail!(
            "{} declares {npix} pixels but LOGLAM has {}",
            path.display(),
            log_lam.len()
        );
    }

    let spec = to_matrix(&spec, npix)?;
    let error = to_matrix(&error, npix)?;
    log::info!(
        "Loaded {} log-rebinned spectra from {}",
        spec.ncols(),
        path.display()
    );
    Ok(AllSpectra {
        spec,
        error,
        log_lam,
        velscale,
    })
}

fn load_log_lam(path: &Path) -> Result<Vec<f64>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?
        .build()
        .context("building parquet reader")?;
    let mut log_lam = Vec::new();
    for batch in reader {
        let batch = batch.context("reading LOGLAM record batch")?;
        let col = batch
            .column_by_name("LOGLAM")
            .context("missing 'LOGLAM' column")?;
        log_lam.extend(f64_values(col)?);
    }
    Ok(log_lam)
}

fn to_matrix(columns: &[Vec<f64>], npix: usize) -> Result<Array2<f64>> {
    if columns.is_empty() {
        return Ok(Array2::zeros((npix, 0)));
    }
    columns_to_matrix(columns)
}

fn list_column(matrix: &Array2<f64>) -> arrow::array::ListArray {
    let mut builder = ListBuilder::new(Float64Builder::new());
    for column in matrix.columns() {
        builder.values().append_slice(&column.to_vec());
        builder.append(true);
    }
    builder.finish()
}

fn write_batch(path: &Path, schema: Arc<Schema>, batch: &RecordBatch) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> AllSpectra {
        let npix = 25;
        let log_lam: Vec<f64> = (0..npix).map(|i| 8.5 + i as f64 * 2e-4).collect();
        let mut spec = Array2::from_shape_fn((npix, 3), |(i, j)| (i * 3 + j) as f64 * 0.1 + 1.0);
        spec.column_mut(1).fill(f64::NAN);
        let error = Array2::from_shape_fn((npix, 3), |(i, _)| 0.01 * i as f64);
        AllSpectra {
            spec,
            error,
            log_lam,
            velscale: 59.958,
        }
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let original = sample();
        assert!(!has_all_spectra(dir.path(), "NGC0000"));
        save_all_spectra(dir.path(), "NGC0000", &original).unwrap();
        assert!(has_all_spectra(dir.path(), "NGC0000"));

        let loaded = load_all_spectra(dir.path(), "NGC0000").unwrap();
        assert_eq!(loaded.spec.dim(), original.spec.dim());
        assert_relative_eq!(loaded.velscale, original.velscale);
        for (a, b) in loaded.log_lam.iter().zip(&original.log_lam) {
            assert_relative_eq!(*a, *b);
        }
        for (a, b) in loaded.spec.iter().zip(original.spec.iter()) {
            assert!((a.is_nan() && b.is_nan()) || (a - b).abs() < 1e-12);
        }
        for (a, b) in loaded.error.iter().zip(original.error.iter()) {
            assert_relative_eq!(*a, *b);
        }
    }

    #[test]
    fn test_axis_metadata_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let original = sample();
        let path = save_all_spectra(dir.path(), "cube", &original).unwrap();
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(std::fs::File::open(path).unwrap()).unwrap();
        let meta = builder.schema().metadata();
        let crval: f64 = meta["CRVAL1"].parse().unwrap();
        let cdelt: f64 = meta["CDELT1"].parse().unwrap();
        assert_eq!(crval, original.log_lam[0]);
        assert_relative_eq!(cdelt, 2e-4, max_relative = 1e-9);
        assert_eq!(meta["NPIX"], "25");
        assert_eq!(meta["CRPIX1"], "1");
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = sample();
        bad.log_lam.pop();
        assert!(save_all_spectra(dir.path(), "bad", &bad).is_err());
    }
}
