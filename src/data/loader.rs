use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, Float32Array, Float64Array, LargeListArray, ListArray};
use arrow::datatypes::DataType;
use ndarray::Array2;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::RawCube;
use crate::spectral::mask::MaskEntry;

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Load a cube from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – one row per spaxel with `flux` and `error` list columns (recommended)
/// * `.json`    – `{ "crval": .., "cdelt": .., "spaxels": [{ "flux": [...], "error": [...] }] }`
/// * `.csv`     – columns `flux` and `error` containing semicolon-separated floats
///
/// Every format carries the axis keys `CRVAL`, `CDELT`, `PIXSIZE`, `NX`, `NY`.
pub fn load_cube(path: &Path) -> Result<RawCube> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let cube = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path),
        "json" => load_json(path),
        "csv" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("loading cube {}", path.display()))?;

    log::info!(
        "Read {} spectra of {} pixels from {}",
        cube.flux.ncols(),
        cube.flux.nrows(),
        path.display()
    );
    Ok(cube)
}

/// Axis and geometry keys shared by all cube formats.
#[derive(Debug, Clone, Copy)]
struct CubeHeader {
    crval: f64,
    cdelt: f64,
    pixsize: f64,
    nx: usize,
    ny: usize,
}

impl CubeHeader {
    fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            crval: header_value(map, "CRVAL")?,
            cdelt: header_value(map, "CDELT")?,
            pixsize: header_value(map, "PIXSIZE")?,
            nx: header_value(map, "NX")?,
            ny: header_value(map, "NY")?,
        })
    }

    fn into_cube(self, flux: Vec<Vec<f64>>, error: Vec<Vec<f64>>) -> Result<RawCube> {
        if flux.len() != self.nx * self.ny {
            bail!(
                "header declares {}x{} spaxels but {} spectra were read",
                self.nx,
                self.ny,
                flux.len()
            );
        }
        Ok(RawCube {
            flux: columns_to_matrix(&flux)?,
            error: columns_to_matrix(&error)?,
            crval: self.crval,
            cdelt: self.cdelt,
            nx: self.nx,
            ny: self.ny,
            pixsize: self.pixsize,
        })
    }
}

pub(crate) fn header_value<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = map
        .get(key)
        .with_context(|| format!("missing header key '{key}'"))?;
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("header key '{key}' has invalid value '{raw}'"))
}

/// Stack equally long spectra as the columns of a pixels × spectra matrix.
pub(crate) fn columns_to_matrix(columns: &[Vec<f64>]) -> Result<Array2<f64>> {
    let npix = columns.first().map_or(0, Vec::len);
    if let Some((i, c)) = columns.iter().enumerate().find(|(_, c)| c.len() != npix) {
        bail!("spectrum {i} has {} pixels, expected {npix}", c.len());
    }
    Ok(Array2::from_shape_fn((npix, columns.len()), |(p, j)| {
        columns[j][p]
    }))
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema:
///
/// ```json
/// {
///   "CRVAL": 3700.0, "CDELT": 2.0, "PIXSIZE": 1.0, "NX": 2, "NY": 1,
///   "spaxels": [
///     { "flux": [0.12, 0.14, null, ...], "error": [0.01, 0.01, ...] },
///     ...
///   ]
/// }
/// ```
///
/// `null` samples become NaN.
fn load_json(path: &Path) -> Result<RawCube> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;
    let obj = root
        .as_object()
        .context("Expected top-level JSON object")?;

    let header: HashMap<String, String> = obj
        .iter()
        .filter(|(k, _)| k.as_str() != "spaxels")
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();
    let header = CubeHeader::from_map(&header)?;

    let records = obj
        .get("spaxels")
        .and_then(|v| v.as_array())
        .context("missing 'spaxels' array")?;

    let mut flux = Vec::with_capacity(records.len());
    let mut error = Vec::with_capacity(records.len());
    for (i, rec) in records.iter().enumerate() {
        let rec = rec
            .as_object()
            .with_context(|| format!("Spaxel {i} is not a JSON object"))?;
        let f = json_array_to_f64(rec.get("flux"), i, "flux")?;
        let e = json_array_to_f64(rec.get("error"), i, "error")?;
        if f.len() != e.len() {
            bail!("Spaxel {i}: flux has {} values but error has {}", f.len(), e.len());
        }
        flux.push(f);
        error.push(e);
    }

    header.into_cube(flux, error)
}

pub(crate) fn json_array_to_f64(val: Option<&JsonValue>, row: usize, col: &str) -> Result<Vec<f64>> {
    let arr = val
        .and_then(|v| v.as_array())
        .with_context(|| format!("Row {row}: missing or invalid '{col}' array"))?;

    arr.iter()
        .enumerate()
        .map(|(j, v)| match v {
            JsonValue::Null => Ok(f64::NAN),
            other => other
                .as_f64()
                .with_context(|| format!("Row {row}, {col}[{j}]: not a number")),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// CSV layout: a leading comment line with the header keys,
///   `# CRVAL=3700 CDELT=2 PIXSIZE=1 NX=2 NY=1`
/// then a header row and one row per spaxel. `flux` and `error` contain
/// semicolon-separated floats: `"0.12;0.14;nan"`.
fn load_csv(path: &Path) -> Result<RawCube> {
    let text = std::fs::read_to_string(path).context("reading CSV file")?;
    let (first, body) = text.split_once('\n').unwrap_or((text.as_str(), ""));
    let header_line = first
        .trim()
        .strip_prefix('#')
        .context("CSV must start with a '# CRVAL=.. CDELT=..' line")?;
    let header: HashMap<String, String> = header_line
        .split_whitespace()
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let header = CubeHeader::from_map(&header)?;

    let mut reader = csv::Reader::from_reader(body.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let flux_idx = headers
        .iter()
        .position(|h| h == "flux")
        .context("CSV missing 'flux' column")?;
    let error_idx = headers
        .iter()
        .position(|h| h == "error")
        .context("CSV missing 'error' column")?;

    let mut flux = Vec::new();
    let mut error = Vec::new();
    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;

        let f = parse_semicolon_floats(record.get(flux_idx).unwrap_or(""), row_no, "flux")?;
        let e = parse_semicolon_floats(record.get(error_idx).unwrap_or(""), row_no, "error")?;
        if f.len() != e.len() {
            bail!(
                "CSV row {row_no}: flux has {} values but error has {}",
                f.len(),
                e.len()
            );
        }
        flux.push(f);
        error.push(e);
    }

    header.into_cube(flux, error)
}

fn parse_semicolon_floats(s: &str, row: usize, col: &str) -> Result<Vec<f64>> {
    s.split(';')
        .enumerate()
        .map(|(j, tok)| {
            tok.trim()
                .parse::<f64>()
                .with_context(|| format!("Row {row}, {col}[{j}]: '{tok}' is not a number"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet cube.
///
/// Expected schema:
/// - `flux`:  List<Float64> or LargeList<Float64>, one spectrum per row
/// - `error`: List<Float64> or LargeList<Float64>, same lengths as `flux`
/// - schema metadata: `CRVAL`, `CDELT`, `PIXSIZE`, `NX`, `NY`
fn load_parquet(path: &Path) -> Result<RawCube> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let header = CubeHeader::from_map(builder.schema().metadata())?;
    let reader = builder.build().context("building parquet reader")?;

    let mut flux = Vec::new();
    let mut error = Vec::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();

        let flux_idx = schema
            .index_of("flux")
            .map_err(|_| anyhow::anyhow!("Parquet file missing 'flux' column"))?;
        let error_idx = schema
            .index_of("error")
            .map_err(|_| anyhow::anyhow!("Parquet file missing 'error' column"))?;

        let flux_col = batch.column(flux_idx);
        let error_col = batch.column(error_idx);

        for row in 0..batch.num_rows() {
            let f = extract_f64_list(flux_col, row)
                .with_context(|| format!("Row {row}: failed to read 'flux'"))?;
            let e = extract_f64_list(error_col, row)
                .with_context(|| format!("Row {row}: failed to read 'error'"))?;
            if f.len() != e.len() {
                bail!("Row {row}: flux has {} values but error has {}", f.len(), e.len());
            }
            flux.push(f);
            error.push(e);
        }
    }

    header.into_cube(flux, error)
}

// -- Parquet / Arrow helpers --

/// Extract a `Vec<f64>` from a List or LargeList column at the given row.
pub(crate) fn extract_f64_list(col: &Arc<dyn Array>, row: usize) -> Result<Vec<f64>> {
    if col.is_null(row) {
        bail!("null value in list column");
    }

    let values_array = match col.data_type() {
        DataType::List(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<ListArray>()
                .context("expected ListArray")?;
            list_arr.value(row)
        }
        DataType::LargeList(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<LargeListArray>()
                .context("expected LargeListArray")?;
            list_arr.value(row)
        }
        other => bail!("Expected List or LargeList column, got {other:?}"),
    };

    f64_values(&values_array)
}

/// Read a Float64 or Float32 array; nulls become NaN.
pub(crate) fn f64_values(values_array: &Arc<dyn Array>) -> Result<Vec<f64>> {
    if let Some(f64_arr) = values_array.as_any().downcast_ref::<Float64Array>() {
        Ok(f64_arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    } else if let Some(f32_arr) = values_array.as_any().downcast_ref::<Float32Array>() {
        Ok(f32_arr.iter().map(|v| v.unwrap_or(f32::NAN) as f64).collect())
    } else {
        bail!(
            "Value type is {:?}, expected Float64 or Float32",
            values_array.data_type()
        )
    }
}

// ---------------------------------------------------------------------------
// Spectral masking configuration
// ---------------------------------------------------------------------------

/// Read a masking file: whitespace-separated `center width tag` rows.
/// `#` starts a comment; an empty file masks nothing.
pub fn load_mask_config(path: &Path) -> Result<Vec<MaskEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading mask file {}", path.display()))?;
    let mut entries = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 3 {
            bail!(
                "{}:{}: expected 'center width tag'",
                path.display(),
                line_no + 1
            );
        }
        let parse = |tok: &str, what: &str| -> Result<f64> {
            tok.parse::<f64>().with_context(|| {
                format!("{}:{}: bad {what} '{tok}'", path.display(), line_no + 1)
            })
        };
        entries.push(MaskEntry::new(
            parse(cols[0], "center")?,
            parse(cols[1], "width")?,
            cols[2],
        ));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Builder, ListBuilder};
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    #[test]
    fn test_load_json_cube_with_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.json");
        std::fs::write(
            &path,
            r#"{"CRVAL": 4000.0, "CDELT": 2.0, "PIXSIZE": 0.5, "NX": 2, "NY": 1,
                "spaxels": [
                    {"flux": [1.0, 2.0, 3.0], "error": [0.1, 0.1, 0.1]},
                    {"flux": [1.0, null, 3.0], "error": [0.1, 0.1, 0.1]}
                ]}"#,
        )
        .unwrap();
        let cube = load_cube(&path).unwrap();
        assert_eq!(cube.flux.dim(), (3, 2));
        assert_eq!(cube.flux[[1, 0]], 2.0);
        assert!(cube.flux[[1, 1]].is_nan());
        assert_eq!(cube.crval, 4000.0);
        assert_eq!((cube.nx, cube.ny), (2, 1));
    }

    #[test]
    fn test_load_csv_cube() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.csv");
        std::fs::write(
            &path,
            "# CRVAL=4000 CDELT=1.5 PIXSIZE=1 NX=1 NY=2\n\
             flux,error\n\
             1;2;3,0.1;0.1;0.1\n\
             4;nan;6,0.2;0.2;0.2\n",
        )
        .unwrap();
        let cube = load_cube(&path).unwrap();
        assert_eq!(cube.flux.dim(), (3, 2));
        assert_eq!(cube.flux[[2, 1]], 6.0);
        assert!(cube.flux[[1, 1]].is_nan());
        assert_eq!(cube.error[[0, 1]], 0.2);
        assert_eq!(cube.cdelt, 1.5);
    }

    #[test]
    fn test_load_parquet_cube() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.parquet");

        let mut flux = ListBuilder::new(Float64Builder::new());
        let mut error = ListBuilder::new(Float64Builder::new());
        for j in 0..3 {
            for i in 0..4 {
                flux.values().append_value((i + j) as f64);
                error.values().append_value(0.5);
            }
            flux.append(true);
            error.append(true);
        }
        let list = DataType::List(Arc::new(Field::new("item", DataType::Float64, true)));
        let metadata: HashMap<String, String> = [
            ("CRVAL", "3800"),
            ("CDELT", "2"),
            ("PIXSIZE", "1"),
            ("NX", "3"),
            ("NY", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let schema = Arc::new(
            Schema::new(vec![
                Field::new("flux", list.clone(), false),
                Field::new("error", list, false),
            ])
            .with_metadata(metadata),
        );
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(flux.finish()), Arc::new(error.finish())],
        )
        .unwrap();
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let cube = load_cube(&path).unwrap();
        assert_eq!(cube.flux.dim(), (4, 3));
        assert_eq!(cube.flux[[3, 2]], 5.0);
        assert_eq!(cube.crval, 3800.0);
    }

    #[test]
    fn test_spaxel_count_must_match_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.json");
        std::fs::write(
            &path,
            r#"{"CRVAL": 4000.0, "CDELT": 2.0, "PIXSIZE": 0.5, "NX": 2, "NY": 2,
                "spaxels": [{"flux": [1.0], "error": [0.1]}]}"#,
        )
        .unwrap();
        assert!(load_cube(&path).is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(load_cube(Path::new("cube.fits")).is_err());
    }

    #[test]
    fn test_load_mask_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spectralMasking_SFH.config");
        std::fs::write(
            &path,
            "# center width comment\n5577.0  10.0  sky\n4861.33 15.0 Hbeta\n\n",
        )
        .unwrap();
        let entries = load_mask_config(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_sky());
        assert_eq!(entries[1], MaskEntry::new(4861.33, 15.0, "Hbeta"));
    }
}
