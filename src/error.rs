use thiserror::Error;

/// Fatal conditions raised while preparing spectra or templates.
///
/// None of these are retried: the pipeline is deterministic, so the caller
/// reports the error and stops.
#[derive(Debug, Error)]
pub enum PrepError {
    #[error(
        "the templates do not follow the MILES naming convention; \
         the {module} module needs SSPs named by age, metallicity and alpha"
    )]
    NamingConvention { module: String },

    #[error("'{name}' is not a standard MILES filename: {reason}")]
    MalformedFilename { name: String, reason: String },

    #[error(
        "template resolution is lower than the data resolution at {wavelength:.2} A \
         (data FWHM {data_fwhm:.3} A, template FWHM {template_fwhm:.3} A)"
    )]
    ResolutionMismatch {
        wavelength: f64,
        data_fwhm: f64,
        template_fwhm: f64,
    },

    #[error("alpha = {alpha:.2} is encoded both as 'baseFe' and as an explicit 'E' field")]
    MixedAlphaConvention { alpha: f64 },

    #[error("no template files found in {dir}")]
    EmptyLibrary { dir: String },

    #[error(
        "templates cover {template_min:.1}-{template_max:.1} A, \
         which does not contain the requested {lmin:.1}-{lmax:.1} A"
    )]
    TemplateRange {
        template_min: f64,
        template_max: f64,
        lmin: f64,
        lmax: f64,
    },

    #[error("failed to read template '{name}': {reason}")]
    TemplateRead { name: String, reason: String },

    #[error("template '{name}' has a different wavelength sampling than the first template")]
    TemplateSampling { name: String },

    #[error(transparent)]
    Rebin(#[from] RebinError),
}

/// Failure to log-rebin a single spectrum.
///
/// Inside a batch these are isolated to the offending column, which is
/// replaced by NaN.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RebinError {
    #[error("need at least two pixels to rebin, got {0}")]
    TooShort(usize),

    #[error("invalid wavelength range [{0}, {1}]")]
    InvalidRange(f64, f64),

    #[error("spectrum has {got} pixels but the grid expects {expected}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("spectrum contains non-finite values")]
    NonFinite,

    #[error("spectrum is identically zero")]
    ZeroFlux,

    #[error("velscale {0} km/s is too coarse for the wavelength range")]
    NoOutputPixels(f64),
}

pub type Result<T> = std::result::Result<T, PrepError>;
