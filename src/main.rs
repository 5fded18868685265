use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};

use ifu_prep::data::loader::load_cube;
use ifu_prep::data::model::SpectralCube;
use ifu_prep::pipeline::{self, mask_config_path};
use ifu_prep::templates::{AnalysisModule, Templates};
use ifu_prep::PrepConfig;

const USAGE: &str = "usage: ifu-prep <config.json> <cube.{parquet,json,csv}> [KIN|GAS|SFH]";

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, cube_path, module) = match args.as_slice() {
        [config, cube] => (PathBuf::from(config), PathBuf::from(cube), AnalysisModule::Kin),
        [config, cube, module] => (
            PathBuf::from(config),
            PathBuf::from(cube),
            module.parse::<AnalysisModule>().map_err(anyhow::Error::msg)?,
        ),
        _ => bail!("{USAGE}"),
    };

    let config = PrepConfig::from_file(&config_path)?;
    let rootname = rootname(&cube_path)?;

    let cube = SpectralCube::from_linear(load_cube(&cube_path)?, &config)?;
    let prepared = pipeline::prepare_spectra(&cube, &config, &rootname)?;
    println!(
        "{rootname}: {} spaxels inside, {} outside; {} log-rebinned pixels at {:.3} km/s",
        prepared.classification.inside.len(),
        prepared.classification.outside.len(),
        prepared.spectra.log_lam.len(),
        prepared.spectra.velscale
    );

    if mask_config_path(&config, module).is_file() {
        let good = pipeline::spectral_mask(&config, module, &prepared.spectra.log_lam)?;
        println!("{module}: {} good pixels", good.len());
    } else {
        log::info!(
            "No {} found; fitting all pixels",
            mask_config_path(&config, module).display()
        );
    }

    let (lsf_data, lsf_temp) = config.line_spread_functions()?;
    let library =
        pipeline::prepare_templates(&config, module, cube.velscale, &lsf_data, &lsf_temp)?;
    match &library.templates {
        Templates::Flat(t) => println!(
            "{module}: {} templates of {} pixels at {:.3} km/s",
            t.ncols(),
            t.nrows(),
            library.velscale
        ),
        Templates::Grid(g) => println!(
            "{module}: {} ({} cells filled, {} missing), {} pixels at {:.3} km/s",
            g.params,
            g.n_filled(),
            g.n_missing(),
            library.log_lam.len(),
            library.velscale
        ),
    }
    Ok(())
}

fn rootname(cube_path: &Path) -> Result<String> {
    cube_path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("cannot derive a root name from {}", cube_path.display()))
}
