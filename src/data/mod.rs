//! Data layer: cube types, loading, spaxel classification and the
//! rebinned-spectra cache.
//!
//! Architecture:
//! ```text
//!  .parquet / .json / .csv
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  parse file → RawCube
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────────┐
//!   │ SpectralCube  │  rest frame, LMIN..LMAX, signal / noise per spaxel
//!   └──────────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  filter   │  defunct spaxels, SNR isophote → inside / outside
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  store    │  <root>_AllSpectra.parquet ⇄ AllSpectra
//!   └──────────┘
//! ```

pub mod filter;
pub mod loader;
pub mod model;
pub mod store;
