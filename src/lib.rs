//! Preparation of integral-field spectroscopic data for spectral fitting.
//!
//! A cube is loaded and brought to the rest frame ([`data`]), its spaxels
//! are classified by signal-to-noise and log-rebinned ([`spectral::rebin`]),
//! and an SSP template library is matched to the data resolution and
//! sampling ([`templates`]). [`pipeline`] strings the stages together.

pub mod config;
pub mod data;
pub mod error;
pub mod pipeline;
pub mod spectral;
pub mod templates;

pub use config::{PrepConfig, TemplateNorm};
pub use error::{PrepError, RebinError};
