//! SSP template libraries: filename parameters, sources and preparation.

pub mod library;
pub mod params;
pub mod source;

pub use library::{
    prepare_template_library, AnalysisModule, TemplateGrid, TemplateLibrary, TemplateRequest,
    Templates,
};
pub use params::{NamingConvention, ParameterGrid, SspParams};
pub use source::{TemplateDir, TemplateSource};
