//! Writes a small synthetic dataset: a cube, a MILES-named template
//! library, LSF tables, a masking file and a config pointing at all of them.
//!
//! `cargo run --bin generate_sample [outdir]`, then
//! `cargo run -- <outdir>/config.json <outdir>/sample_cube.parquet SFH`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Float64Builder, ListBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use serde_json::json;

const NX: usize = 12;
const NY: usize = 10;
/// Observed-frame axis of the cube.
const CUBE_CRVAL: f64 = 4650.0;
const CUBE_CDELT: f64 = 2.0;
const CUBE_NPIX: usize = 500;
const REDSHIFT: f64 = 0.01;
/// Rest-frame axis of the templates.
const TEMPLATE_CRVAL: f64 = 3540.5;
const TEMPLATE_CDELT: f64 = 0.9;
const TEMPLATE_NPIX: usize = 4300;

/// Absorption lines as (rest wavelength, sigma, depth).
const LINES: [(f64, f64, f64); 4] = [
    (4861.3, 3.0, 0.25),
    (5175.0, 6.0, 0.15),
    (5270.0, 4.0, 0.10),
    (5889.9, 3.0, 0.12),
];

fn gaussian(x: f64, mu: f64, sigma: f64, amplitude: f64) -> f64 {
    amplitude * (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp()
}

/// Continuum with absorption lines; `depth` scales every line.
fn stellar_spectrum(wave: &[f64], slope: f64, depth: f64) -> Vec<f64> {
    wave.iter()
        .map(|&w| {
            let continuum = 1.0 + slope * (w - 5000.0) / 1000.0;
            let lines: f64 = LINES
                .iter()
                .map(|&(mu, sigma, amp)| gaussian(w, mu, sigma, amp * depth))
                .sum();
            continuum * (1.0 - lines)
        })
        .collect()
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5)).rotate_left(7).wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

fn write_cube(path: &Path, rng: &mut SimpleRng) -> Result<()> {
    let rest_wave: Vec<f64> = (0..CUBE_NPIX)
        .map(|i| (CUBE_CRVAL + i as f64 * CUBE_CDELT) / (1.0 + REDSHIFT))
        .collect();
    let template = stellar_spectrum(&rest_wave, -0.3, 1.0);

    let (cx, cy) = (NX as f64 / 2.0, NY as f64 / 2.0);
    let mut flux = ListBuilder::new(Float64Builder::new());
    let mut error = ListBuilder::new(Float64Builder::new());
    for row in 0..NY {
        for col in 0..NX {
            // Exponential surface brightness profile; the corner spaxel is dead.
            let r = ((col as f64 - cx).powi(2) + (row as f64 - cy).powi(2)).sqrt();
            let level = 100.0 * (-r / 2.5).exp();
            let noise = 0.8;
            let dead = row == 0 && col == 0;
            for &t in &template {
                let v = if dead { f64::NAN } else { level * t + rng.gauss(0.0, noise) };
                flux.values().append_value(v);
                error.values().append_value(noise);
            }
            flux.append(true);
            error.append(true);
        }
    }

    let metadata: HashMap<String, String> = [
        ("CRVAL", CUBE_CRVAL.to_string()),
        ("CDELT", CUBE_CDELT.to_string()),
        ("PIXSIZE", "0.5".to_string()),
        ("NX", NX.to_string()),
        ("NY", NY.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    let list = DataType::List(Arc::new(Field::new("item", DataType::Float64, true)));
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
    .context("building cube record batch")?;

    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing cube")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}

/// 3 ages × 3 metallicities × 2 alpha values, minus one combination.
fn write_templates(dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(dir)?;
    let wave: Vec<f64> = (0..TEMPLATE_NPIX)
        .map(|i| TEMPLATE_CRVAL + i as f64 * TEMPLATE_CDELT)
        .collect();

    let mut written = 0;
    for (age_str, age) in [("01.0000", 1.0), ("05.0000", 5.0), ("12.5893", 12.5893)] {
        for (metal_str, metal) in [("m0.40", -0.4), ("p0.00", 0.0), ("p0.22", 0.22)] {
            for alpha_str in ["p0.00", "p0.40"] {
                if age_str == "01.0000" && metal_str == "p0.22" && alpha_str == "p0.40" {
                    continue;
                }
                let name = format!("Mun1.30Z{metal_str}T{age_str}_iTp0.00_E{alpha_str}.json");
                let slope = -0.1 * age / 5.0;
                let depth = 0.5 + 0.3 * metal + 0.05 * age;
                let flux = stellar_spectrum(&wave, slope, depth);
                let body = json!({
                    "CRVAL1": TEMPLATE_CRVAL,
                    "CDELT1": TEMPLATE_CDELT,
                    "flux": flux,
                });
                std::fs::write(dir.join(&name), body.to_string())
                    .with_context(|| format!("writing {name}"))?;
                written += 1;
            }
        }
    }
    Ok(written)
}

fn main() -> Result<()> {
    let outdir = std::env::args().nth(1).unwrap_or_else(|| "sample".to_string());
    let outdir = Path::new(&outdir);
    std::fs::create_dir_all(outdir).with_context(|| format!("creating {}", outdir.display()))?;

    let mut rng = SimpleRng::new(42);
    write_cube(&outdir.join("sample_cube.parquet"), &mut rng)?;
    let n_templates = write_templates(&outdir.join("templates"))?;

    std::fs::write(
        outdir.join("lsf_data.txt"),
        "# wavelength  FWHM\n4000.0 2.70\n5000.0 2.65\n6000.0 2.60\n",
    )?;
    std::fs::write(
        outdir.join("lsf_templates.txt"),
        "# wavelength  FWHM\n3500.0 2.51\n7500.0 2.51\n",
    )?;
    for module in ["KIN", "GAS", "SFH"] {
        std::fs::write(
            outdir.join(format!("spectralMasking_{module}.config")),
            "# centre  width  tag\n5577.0 20.0 sky\n4861.3 15.0 Hb\n5006.8 15.0 [OIII]\n",
        )?;
    }

    let config = json!({
        "MIN_SNR": 10.0,
        "SSP_LIB": outdir.join("templates"),
        "NORM_TEMP": "LIGHT",
        "LMIN": 4750.0,
        "LMAX": 5500.0,
        "LMIN_SNR": 4800.0,
        "LMAX_SNR": 5300.0,
        "REDSHIFT": REDSHIFT,
        "ORIGIN": [NX as f64 / 2.0, NY as f64 / 2.0],
        "VELSCALE_RATIO": 2,
        "OUTDIR": outdir,
        "LSF_DATA": outdir.join("lsf_data.txt"),
        "LSF_TEMP": outdir.join("lsf_templates.txt"),
    });
    std::fs::write(
        outdir.join("config.json"),
        serde_json::to_string_pretty(&config)?,
    )?;

    println!(
        "Wrote a {NX}x{NY} cube ({CUBE_NPIX} pixels), {n_templates} templates and config.json to {}",
        outdir.display()
    );
    Ok(())
}
