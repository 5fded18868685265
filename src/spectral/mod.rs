//! Operations on single spectra and batches of spectra.

pub mod convolve;
pub mod lsf;
pub mod mask;
pub mod rebin;
