//! Stellar-population template library preparation.
//!
//! Templates are cut to the observed range plus padding, broadened to the
//! data resolution, log-rebinned at `velscale / velscale_ratio` and
//! normalised. Libraries following the MILES naming convention can be laid
//! out on an age × metallicity × alpha grid.

use std::fmt;

use ndarray::{Array2, Array3, Array4, ArrayView1, Axis};
use rayon::prelude::*;

use super::params::{NamingConvention, ParameterGrid};
use super::source::TemplateSource;
use crate::config::TemplateNorm;
use crate::data::model::LinearSpectrum;
use crate::error::{PrepError, Result};
use crate::spectral::convolve::gaussian_filter1d;
use crate::spectral::lsf::{matching_sigma, LineSpreadFunction};
use crate::spectral::rebin::LogRebinner;

/// Preferred padding (Angstrom) on either side of the observed range.
const TEMPLATE_PADDING: f64 = 150.0;
/// Margin kept from the template edge when the full padding does not fit.
const EDGE_MARGIN: f64 = 5.0;

/// The analysis a template library is prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisModule {
    /// Stellar kinematics.
    Kin,
    /// Emission-line (gas) analysis.
    Gas,
    /// Star-formation history; needs the age/metallicity/alpha grid.
    Sfh,
}

impl AnalysisModule {
    /// Whether the module can only work with a gridded library.
    pub fn requires_grid(self) -> bool {
        matches!(self, Self::Sfh)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kin => "KIN",
            Self::Gas => "GAS",
            Self::Sfh => "SFH",
        }
    }
}

impl fmt::Display for AnalysisModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnalysisModule {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KIN" => Ok(Self::Kin),
            "GAS" => Ok(Self::Gas),
            "SFH" => Ok(Self::Sfh),
            other => Err(format!("unknown module '{other}' (expected KIN, GAS or SFH)")),
        }
    }
}

/// Inputs of [`prepare_template_library`] besides the source and LSFs.
#[derive(Debug, Clone)]
pub struct TemplateRequest {
    pub module: AnalysisModule,
    pub norm: TemplateNorm,
    /// Observed wavelength range to cover.
    pub lmin: f64,
    pub lmax: f64,
    /// km/s per pixel of the observed spectra.
    pub velscale: f64,
    /// Oversampling of the templates relative to the data.
    pub velscale_ratio: u32,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// A prepared template library, immutable once built.
#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    /// Linear wavelength range of the truncated templates.
    pub lam_range: [f64; 2],
    /// Natural log of the template pixel centres.
    pub log_lam: Vec<f64>,
    /// km/s per template pixel (`velscale / velscale_ratio`).
    pub velscale: f64,
    /// Number of template files read.
    pub n_templates: usize,
    pub templates: Templates,
}

#[derive(Debug, Clone)]
pub enum Templates {
    /// Pixels × templates, in file order.
    Flat(Array2<f64>),
    Grid(TemplateGrid),
}

/// Templates arranged as pixels × age × metallicity × alpha.
///
/// Combinations without a template file stay NaN.
#[derive(Debug, Clone)]
pub struct TemplateGrid {
    pub flux: Array4<f64>,
    /// log10(age / Gyr) of every cell.
    pub log_age: Array3<f64>,
    /// [M/H] of every cell.
    pub metal: Array3<f64>,
    /// [alpha/Fe] of every cell.
    pub alpha: Array3<f64>,
    pub params: ParameterGrid,
}

impl TemplateGrid {
    fn cell_filled(&self, j: usize, k: usize, i: usize) -> bool {
        self.template(j, k, i).iter().any(|v| !v.is_nan())
    }

    /// Cells holding a template.
    pub fn n_filled(&self) -> usize {
        let (_, na, nm, nalpha) = self.flux.dim();
        (0..na)
            .flat_map(|j| (0..nm).flat_map(move |k| (0..nalpha).map(move |i| (j, k, i))))
            .filter(|&(j, k, i)| self.cell_filled(j, k, i))
            .count()
    }

    /// Cells without a template.
    pub fn n_missing(&self) -> usize {
        self.params.n_combinations() - self.n_filled()
    }

    /// The template in cell (age, metallicity, alpha).
    pub fn template(&self, age: usize, metal: usize, alpha: usize) -> ArrayView1<'_, f64> {
        self.flux
            .index_axis(Axis(3), alpha)
            .index_axis_move(Axis(2), metal)
            .index_axis_move(Axis(1), age)
    }
}

// ---------------------------------------------------------------------------
// Preparation
// ---------------------------------------------------------------------------

/// Truncation, broadening and rebinning shared by every template.
struct TemplatePlan {
    npix: usize,
    crval: f64,
    cdelt: f64,
    /// First and last native pixel kept.
    first: usize,
    last: usize,
    sigma: Vec<f64>,
    rebinner: LogRebinner,
}

impl TemplatePlan {
    fn new(
        reference: &LinearSpectrum,
        request: &TemplateRequest,
        lsf_data: &LineSpreadFunction,
        lsf_templates: &LineSpreadFunction,
    ) -> Result<Self> {
        let [native_min, native_max] = reference.lam_range();
        let (lmin, lmax) = (request.lmin, request.lmax);
        if lmin < native_min || lmax > native_max {
            return Err(PrepError::TemplateRange {
                template_min: native_min,
                template_max: native_max,
                lmin,
                lmax,
            });
        }

        let overhead_blue = if lmin - native_min > TEMPLATE_PADDING {
            TEMPLATE_PADDING
        } else {
            lmin - native_min - EDGE_MARGIN
        };
        let overhead_red = if native_max - lmax > TEMPLATE_PADDING {
            TEMPLATE_PADDING
        } else {
            native_max - lmax - EDGE_MARGIN
        };
        let lo = lmin - overhead_blue;
        let hi = lmax + overhead_red;

        let wave = reference.wave();
        let kept: Vec<usize> = wave
            .iter()
            .enumerate()
            .filter(|(_, &w)| w > lo && w < hi)
            .map(|(i, _)| i)
            .collect();
        let (first, last) = match (kept.first(), kept.last()) {
            (Some(&f), Some(&l)) if l > f => (f, l),
            _ => {
                return Err(PrepError::TemplateRange {
                    template_min: native_min,
                    template_max: native_max,
                    lmin,
                    lmax,
                })
            }
        };

        let sigma = matching_sigma(lsf_data, lsf_templates, &wave[first..=last], reference.cdelt)?;
        let velscale = request.velscale / request.velscale_ratio as f64;
        let rebinner = LogRebinner::new([wave[first], wave[last]], last - first + 1, velscale)?;

        log::debug!(
            "Templates truncated to {:.2}-{:.2} A ({} pixels), rebinned to {} pixels",
            wave[first],
            wave[last],
            last - first + 1,
            rebinner.len()
        );

        Ok(Self {
            npix: reference.flux.len(),
            crval: reference.crval,
            cdelt: reference.cdelt,
            first,
            last,
            sigma,
            rebinner,
        })
    }

    fn lam_range(&self) -> [f64; 2] {
        [
            self.crval + self.first as f64 * self.cdelt,
            self.crval + self.last as f64 * self.cdelt,
        ]
    }

    /// Read, truncate, broaden and rebin one template.
    fn process<S: TemplateSource + ?Sized>(&self, source: &S, name: &str) -> Result<Vec<f64>> {
        let spectrum = source.read(name).map_err(|err| PrepError::TemplateRead {
            name: name.to_string(),
            reason: format!("{err:#}"),
        })?;
        if spectrum.flux.len() != self.npix
            || spectrum.crval != self.crval
            || spectrum.cdelt != self.cdelt
        {
            return Err(PrepError::TemplateSampling {
                name: name.to_string(),
            });
        }
        let broadened = gaussian_filter1d(&spectrum.flux[self.first..=self.last], &self.sigma);
        Ok(self.rebinner.rebin(ArrayView1::from(&broadened[..]))?)
    }
}

/// Build the template library for `request`.
///
/// The library is gridded only for modules that require it; such modules
/// fail with [`PrepError::NamingConvention`] if the filenames do not follow
/// the MILES convention. Templates are processed in parallel.
pub fn prepare_template_library<S>(
    source: &S,
    request: &TemplateRequest,
    lsf_data: &LineSpreadFunction,
    lsf_templates: &LineSpreadFunction,
) -> Result<TemplateLibrary>
where
    S: TemplateSource + Sync + ?Sized,
{
    let names = source.names().map_err(|err| PrepError::TemplateRead {
        name: source.location(),
        reason: format!("{err:#}"),
    })?;
    if names.is_empty() {
        return Err(PrepError::EmptyLibrary {
            dir: source.location(),
        });
    }

    let grid = match (request.module.requires_grid(), NamingConvention::probe(&names)) {
        (true, NamingConvention::Miles(grid)) => Some(grid),
        (true, NamingConvention::Unrecognised(reason)) => {
            log::error!("{reason}");
            return Err(PrepError::NamingConvention {
                module: request.module.to_string(),
            });
        }
        (false, _) => None,
    };

    let reference = source.read(&names[0]).map_err(|err| PrepError::TemplateRead {
        name: names[0].clone(),
        reason: format!("{err:#}"),
    })?;
    let plan = TemplatePlan::new(&reference, request, lsf_data, lsf_templates)?;

    let templates = match grid {
        None => Templates::Flat(build_flat(source, &names, &plan, request.norm)?),
        Some(params) => Templates::Grid(build_grid(source, params, &plan, request.norm)?),
    };

    match &templates {
        Templates::Flat(t) => log::info!("Prepared {} templates of {} pixels", t.ncols(), t.nrows()),
        Templates::Grid(g) => log::info!(
            "Prepared the stellar population templates: {}, {} of {} cells filled",
            g.params,
            g.n_filled(),
            g.params.n_combinations()
        ),
    }

    Ok(TemplateLibrary {
        lam_range: plan.lam_range(),
        log_lam: plan.rebinner.log_lam().to_vec(),
        velscale: plan.rebinner.velscale(),
        n_templates: names.len(),
        templates,
    })
}

fn build_flat<S>(
    source: &S,
    names: &[String],
    plan: &TemplatePlan,
    norm: TemplateNorm,
) -> Result<Array2<f64>>
where
    S: TemplateSource + Sync + ?Sized,
{
    let processed = names
        .par_iter()
        .map(|name| plan.process(source, name))
        .collect::<Result<Vec<_>>>()?;

    let mut templates = Array2::from_elem((plan.rebinner.len(), names.len()), f64::NAN);
    for (mut column, values) in templates.columns_mut().into_iter().zip(processed) {
        column.assign(&ArrayView1::from(&values[..]));
    }

    match norm {
        TemplateNorm::Mass => {
            let mean = finite_mean(templates.iter().copied());
            templates.mapv_inplace(|v| v / mean);
        }
        TemplateNorm::Light => {
            for mut column in templates.columns_mut() {
                let mean = finite_mean(column.iter().copied());
                column.mapv_inplace(|v| v / mean);
            }
        }
    }
    Ok(templates)
}

fn build_grid<S>(
    source: &S,
    params: ParameterGrid,
    plan: &TemplatePlan,
    norm: TemplateNorm,
) -> Result<TemplateGrid>
where
    S: TemplateSource + Sync + ?Sized,
{
    let shape = (params.n_ages(), params.n_metal(), params.n_alpha());

    // Select files by the regenerated metallicity and alpha tokens; the age
    // index comes from the parse already done for the grid.
    let mut cells: Vec<(usize, [usize; 3])> = Vec::new();
    for (i, alpha_token) in params.alpha_tokens.iter().enumerate() {
        for (k, metal_token) in params.metal_tokens.iter().enumerate() {
            for (f, file) in params.files.iter().enumerate() {
                if !(file.name.contains(metal_token.as_str()) && file.name.contains(alpha_token.as_str())) {
                    continue;
                }
                if let Some(j) = params.age_index(file.age) {
                    cells.push((f, [j, k, i]));
                }
            }
        }
    }
    if cells.len() < params.files.len() {
        log::warn!(
            "{} of {} template files matched no grid cell",
            params.files.len() - cells.len(),
            params.files.len()
        );
    }

    let processed = cells
        .par_iter()
        .map(|&(f, cell)| plan.process(source, &params.files[f].name).map(|t| (cell, t)))
        .collect::<Result<Vec<_>>>()?;

    let mut flux = Array4::from_elem(
        (plan.rebinner.len(), shape.0, shape.1, shape.2),
        f64::NAN,
    );
    for ([j, k, i], mut template) in processed {
        if norm == TemplateNorm::Light {
            let mean = finite_mean(template.iter().copied());
            template.iter_mut().for_each(|v| *v /= mean);
        }
        let mut target = flux
            .index_axis_mut(Axis(3), i)
            .index_axis_move(Axis(2), k)
            .index_axis_move(Axis(1), j);
        if target.iter().any(|v| !v.is_nan()) {
            log::warn!("Grid cell ({j}, {k}, {i}) is filled by more than one template");
        }
        target.assign(&ArrayView1::from(&template[..]));
    }

    if norm == TemplateNorm::Mass {
        // Missing cells are NaN; they must not enter the mean.
        let mean = finite_mean(flux.iter().copied());
        flux.mapv_inplace(|v| v / mean);
    }

    let log_age = Array3::from_shape_fn(shape, |(j, _, _)| params.log_age[j]);
    let metal = Array3::from_shape_fn(shape, |(_, k, _)| params.metal[k]);
    let alpha = Array3::from_shape_fn(shape, |(_, _, i)| params.alpha[i]);

    Ok(TemplateGrid {
        flux,
        log_age,
        metal,
        alpha,
        params,
    })
}

fn finite_mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    sum / n as f64
}
