use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::data::loader::{extract_f64_list, f64_values, header_value, json_array_to_f64};
use crate::data::model::LinearSpectrum;

/// Where template spectra come from.
///
/// `names` returns the template identifiers in the order they should be
/// processed; `read` loads one of them.
pub trait TemplateSource {
    fn names(&self) -> Result<Vec<String>>;
    fn read(&self, name: &str) -> Result<LinearSpectrum>;
    /// Human-readable location, for messages.
    fn location(&self) -> String;
}

/// A directory of `.json` or `.parquet` template files, one spectrum each.
///
/// * `.json`:    `{ "CRVAL1": 3540.5, "CDELT1": 0.9, "flux": [...] }`
/// * `.parquet`: a `flux` column (Float64 per row, or one List row) with
///   schema metadata `CRVAL1` and `CDELT1`
#[derive(Debug, Clone)]
pub struct TemplateDir {
    dir: PathBuf,
}

impl TemplateDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TemplateSource for TemplateDir {
    /// File names with a supported extension, sorted lexically.
    fn names(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("listing templates in {}", self.dir.display()))?;
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || template_kind(&path).is_none() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> Result<LinearSpectrum> {
        let path = self.dir.join(name);
        match template_kind(&path) {
            Some(TemplateKind::Json) => read_json_template(&path),
            Some(TemplateKind::Parquet) => read_parquet_template(&path),
            None => bail!("unsupported template file {}", path.display()),
        }
        .with_context(|| format!("reading template {}", path.display()))
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

enum TemplateKind {
    Json,
    Parquet,
}

fn template_kind(path: &Path) -> Option<TemplateKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "json" => Some(TemplateKind::Json),
        "parquet" | "pq" => Some(TemplateKind::Parquet),
        _ => None,
    }
}

#[derive(Deserialize)]
struct JsonTemplate {
    #[serde(rename = "CRVAL1")]
    crval1: f64,
    #[serde(rename = "CDELT1")]
    cdelt1: f64,
    flux: JsonValue,
}

fn read_json_template(path: &Path) -> Result<LinearSpectrum> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let tpl: JsonTemplate = serde_json::from_str(&text).context("parsing JSON")?;
    let flux = json_array_to_f64(Some(&tpl.flux), 0, "flux")?;
    Ok(LinearSpectrum {
        crval: tpl.crval1,
        cdelt: tpl.cdelt1,
        flux,
    })
}

fn read_parquet_template(path: &Path) -> Result<LinearSpectrum> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let metadata: HashMap<String, String> = builder.schema().metadata().clone();
    let crval: f64 = header_value(&metadata, "CRVAL1")?;
    let cdelt: f64 = header_value(&metadata, "CDELT1")?;

    let mut flux = Vec::new();
    for batch in builder.build().context("building parquet reader")? {
        let batch = batch.context("reading parquet record batch")?;
        let col = batch
            .column_by_name("flux")
            .context("Parquet file missing 'flux' column")?;
        if col.data_type().is_nested() {
            for row in 0..batch.num_rows() {
                flux.extend(extract_f64_list(col, row)?);
            }
        } else {
            flux.extend(f64_values(col)?);
        }
    }
    Ok(LinearSpectrum { crval, cdelt, flux })
}
