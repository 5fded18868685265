//! Stellar-population parameters encoded in MILES-style filenames.
//!
//! A MILES name such as `Mun1.30Zp0.00T12.0000_iTp0.00_Ep0.00.fits` carries
//! the metallicity after `Z` (signed by `m`/`p`), the age in Gyr as the seven
//! characters after the first `T`, and the alpha enhancement after `E`
//! (again signed). E-MILES names (`..._baseFe.fits`) carry no alpha field
//! and belong to a single scaled-solar bucket.

use std::fmt;

use crate::error::{PrepError, Result};

/// Width of the age field that follows the `T` marker.
const AGE_FIELD: usize = 7;
/// Width of the alpha magnitude that follows `E` and its sign.
const ALPHA_FIELD: usize = 4;
/// Marker of the base (scaled-solar) alpha convention.
const BASE_FE: &str = "baseFe";

/// How a file encodes its alpha enhancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaField {
    /// An explicit signed `E` field.
    Explicit,
    /// `baseFe`: no alpha field, alpha taken as 0.
    Base,
}

/// Parameters parsed from one template filename.
#[derive(Debug, Clone, PartialEq)]
pub struct SspParams {
    /// Filename without directory.
    pub name: String,
    /// Age in Gyr.
    pub age: f64,
    /// [M/H] in dex.
    pub metal: f64,
    /// [alpha/Fe] in dex.
    pub alpha: f64,
    pub alpha_field: AlphaField,
}

impl SspParams {
    /// Parse a MILES-style filename. Any directory part is ignored.
    pub fn parse(path: &str) -> Result<Self> {
        let name = path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path);
        let malformed = |reason: String| PrepError::MalformedFilename {
            name: name.to_string(),
            reason,
        };

        let t = name
            .find('T')
            .ok_or_else(|| malformed("no age marker 'T'".into()))?;
        let age_str = name
            .get(t + 1..t + 1 + AGE_FIELD)
            .ok_or_else(|| malformed("age field is truncated".into()))?;
        let age: f64 = age_str
            .parse()
            .map_err(|_| malformed(format!("age '{age_str}' is not a number")))?;

        let z = name[..t]
            .find('Z')
            .ok_or_else(|| malformed("no metallicity marker 'Z' before the age".into()))?;
        let metal_str = &name[z + 1..t];
        let metal = parse_signed(metal_str).ok_or_else(|| {
            malformed(format!(
                "metallicity '{metal_str}' must be 'm' or 'p' followed by a number"
            ))
        })?;

        let (alpha, alpha_field) = if name.contains(BASE_FE) {
            (0.0, AlphaField::Base)
        } else {
            let rest = &name[t + 1 + AGE_FIELD..];
            let e = rest
                .find('E')
                .ok_or_else(|| malformed("no alpha marker 'E' after the age".into()))?;
            let field = rest
                .get(e + 1..e + 2 + ALPHA_FIELD)
                .ok_or_else(|| malformed("alpha field is truncated".into()))?;
            let alpha = parse_signed(field).ok_or_else(|| {
                malformed(format!("alpha '{field}' must be 'm' or 'p' followed by a number"))
            })?;
            (alpha, AlphaField::Explicit)
        };

        Ok(Self {
            name: name.to_string(),
            age,
            metal,
            alpha,
            alpha_field,
        })
    }
}

/// `m0.40` → -0.4, `p0.22` → 0.22; anything else is rejected.
fn parse_signed(field: &str) -> Option<f64> {
    let mut chars = field.chars();
    let sign = match chars.next()? {
        'm' => -1.0,
        'p' => 1.0,
        _ => return None,
    };
    let magnitude: f64 = chars.as_str().parse().ok()?;
    // `+ 0.0` folds m0.00 onto p0.00.
    Some(sign * magnitude + 0.0)
}

/// Signed token in the MILES convention: `p0.00`, `m0.40`.
fn signed_token(value: f64) -> String {
    let prefix = if value < 0.0 { 'm' } else { 'p' };
    format!("{prefix}{:.2}", value.abs())
}

// ---------------------------------------------------------------------------
// ParameterGrid – the unique axes of a template library
// ---------------------------------------------------------------------------

/// Unique sorted age, metallicity and alpha axes of a template library,
/// with the filename tokens that select each metallicity and alpha group.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGrid {
    /// Unique ages in Gyr, ascending.
    pub ages: Vec<f64>,
    /// `log10` of [`ages`](Self::ages).
    pub log_age: Vec<f64>,
    pub metal: Vec<f64>,
    pub alpha: Vec<f64>,
    /// One substring per metallicity, e.g. `m0.40T`.
    pub metal_tokens: Vec<String>,
    /// One substring per alpha value, e.g. `Ep0.00` or `baseFe`.
    pub alpha_tokens: Vec<String>,
    /// Per-file parameters, in input order.
    pub files: Vec<SspParams>,
}

impl ParameterGrid {
    /// Parse every filename and derive the grid axes.
    ///
    /// Fails on the first malformed name, or if one alpha value is written
    /// with both the explicit and the `baseFe` convention (no single token
    /// could select it).
    pub fn from_filenames<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let files = names
            .iter()
            .map(|n| SspParams::parse(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let ages = unique_sorted(files.iter().map(|f| f.age));
        let metal = unique_sorted(files.iter().map(|f| f.metal));
        let alpha = unique_sorted(files.iter().map(|f| f.alpha));

        let metal_tokens = metal
            .iter()
            .map(|&m| format!("{}T", signed_token(m)))
            .collect();
        let alpha_tokens = alpha
            .iter()
            .map(|&a| {
                let mut group = files.iter().filter(|f| f.alpha == a);
                let base = group.clone().any(|f| f.alpha_field == AlphaField::Base);
                let explicit = group.any(|f| f.alpha_field == AlphaField::Explicit);
                match (base, explicit) {
                    (true, true) => Err(PrepError::MixedAlphaConvention { alpha: a }),
                    (true, false) => Ok(BASE_FE.to_string()),
                    _ => Ok(format!("E{}", signed_token(a))),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let conventions = files
            .iter()
            .filter(|f| f.alpha_field == AlphaField::Base)
            .count();
        if conventions != 0 && conventions != files.len() {
            log::warn!(
                "Template library mixes alpha conventions: {conventions} of {} files use '{BASE_FE}'",
                files.len()
            );
        }

        Ok(Self {
            log_age: ages.iter().map(|a| a.log10()).collect(),
            ages,
            metal,
            alpha,
            metal_tokens,
            alpha_tokens,
            files,
        })
    }

    pub fn n_ages(&self) -> usize {
        self.ages.len()
    }

    pub fn n_metal(&self) -> usize {
        self.metal.len()
    }

    pub fn n_alpha(&self) -> usize {
        self.alpha.len()
    }

    /// Number of (age, metallicity, alpha) cells.
    pub fn n_combinations(&self) -> usize {
        self.n_ages() * self.n_metal() * self.n_alpha()
    }

    /// Index of `age` (Gyr, as parsed) on the age axis.
    pub fn age_index(&self, age: f64) -> Option<usize> {
        self.ages.iter().position(|&a| a == age)
    }
}

impl fmt::Display for ParameterGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ages x {} metallicities x {} alpha values",
            self.n_ages(),
            self.n_metal(),
            self.n_alpha()
        )
    }
}

fn unique_sorted(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut v: Vec<f64> = values.collect();
    v.sort_by(f64::total_cmp);
    v.dedup();
    v
}

// ---------------------------------------------------------------------------
// Naming-convention probe
// ---------------------------------------------------------------------------

/// Whether a template library can be arranged on an age/metallicity/alpha grid.
#[derive(Debug)]
pub enum NamingConvention {
    /// All filenames follow the MILES convention.
    Miles(ParameterGrid),
    /// At least one filename does not; the error says which and why.
    Unrecognised(PrepError),
}

impl NamingConvention {
    pub fn probe<S: AsRef<str>>(names: &[S]) -> Self {
        match ParameterGrid::from_filenames(names) {
            Ok(grid) => Self::Miles(grid),
            Err(err) => Self::Unrecognised(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parses_miles_name() {
        let p = SspParams::parse("lib/Mun1.30Zp0.00T12.0000_iTp0.00_Ep0.00.fits").unwrap();
        assert_eq!(p.name, "Mun1.30Zp0.00T12.0000_iTp0.00_Ep0.00.fits");
        assert_relative_eq!(p.age, 12.0);
        assert_relative_eq!(p.metal, 0.0);
        assert_relative_eq!(p.alpha, 0.0);
        assert_eq!(p.alpha_field, AlphaField::Explicit);

        let p = SspParams::parse("Mun1.30Zm0.40T00.0631_iTp0.40_Ep0.40.fits").unwrap();
        assert_relative_eq!(p.age, 0.0631);
        assert_relative_eq!(p.metal, -0.4);
        assert_relative_eq!(p.alpha, 0.4);
    }

    #[test]
    fn test_parses_emiles_name_without_alpha() {
        let p = SspParams::parse("Ech1.30Zm0.40T01.0000_iPp0.00_baseFe.fits").unwrap();
        assert_relative_eq!(p.metal, -0.4);
        assert_relative_eq!(p.age, 1.0);
        assert_relative_eq!(p.alpha, 0.0);
        assert_eq!(p.alpha_field, AlphaField::Base);
    }

    #[test]
    fn test_unsigned_metallicity_is_an_error() {
        let err = SspParams::parse("Mun1.30Z0.00T12.0000_iTp0.00_Ep0.00.fits").unwrap_err();
        match err {
            PrepError::MalformedFilename { name, reason } => {
                assert_eq!(name, "Mun1.30Z0.00T12.0000_iTp0.00_Ep0.00.fits");
                assert!(reason.contains("'m' or 'p'"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(SspParams::parse("template_001.fits").is_err());
    }

    #[test]
    fn test_grid_axes_and_tokens() {
        let names = [
            "Mun1.30Zm0.40T01.0000_iTp0.00_Ep0.00.fits",
            "Mun1.30Zm0.40T12.0000_iTp0.00_Ep0.00.fits",
            "Mun1.30Zp0.22T01.0000_iTp0.00_Ep0.00.fits",
            "Mun1.30Zp0.22T12.0000_iTp0.00_Ep0.00.fits",
            "Mun1.30Zp0.22T12.0000_iTp0.40_Ep0.40.fits",
        ];
        let grid = ParameterGrid::from_filenames(&names).unwrap();
        assert_eq!(grid.ages, vec![1.0, 12.0]);
        assert_relative_eq!(grid.log_age[1], 12f64.log10());
        assert_eq!(grid.metal, vec![-0.4, 0.22]);
        assert_eq!(grid.alpha, vec![0.0, 0.4]);
        assert_eq!(grid.metal_tokens, vec!["m0.40T", "p0.22T"]);
        assert_eq!(grid.alpha_tokens, vec!["Ep0.00", "Ep0.40"]);
        assert_eq!(grid.n_combinations(), 8);
        assert_eq!(grid.age_index(12.0), Some(1));
        assert_eq!(grid.to_string(), "2 ages x 2 metallicities x 2 alpha values");
    }

    #[test]
    fn test_solar_metallicity_gets_plus_token() {
        let grid = ParameterGrid::from_filenames(&["Ech1.30Zp0.00T10.0000_iPp0.00_baseFe.fits"]).unwrap();
        assert_eq!(grid.metal_tokens, vec!["p0.00T"]);
        assert_eq!(grid.alpha_tokens, vec!["baseFe"]);
    }

    #[test]
    fn test_mixed_alpha_convention_is_flagged() {
        let names = [
            "Ech1.30Zp0.00T10.0000_iPp0.00_baseFe.fits",
            "Mun1.30Zp0.00T10.0000_iTp0.00_Ep0.00.fits",
        ];
        assert!(matches!(
            ParameterGrid::from_filenames(&names),
            Err(PrepError::MixedAlphaConvention { .. })
        ));
    }

    #[test]
    fn test_probe_reports_unrecognised_library() {
        match NamingConvention::probe(&["a.json", "b.json"]) {
            NamingConvention::Unrecognised(PrepError::MalformedFilename { name, .. }) => {
                assert_eq!(name, "a.json")
            }
            other => panic!("unexpected probe result {other:?}"),
        }
        assert!(matches!(
            NamingConvention::probe(&["Mun1.30Zp0.00T12.0000_iTp0.00_Ep0.00.fits"]),
            NamingConvention::Miles(_)
        ));
    }
}
