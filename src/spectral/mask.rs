//! Good-pixel selection from configured wavelength windows.

use serde::{Deserialize, Serialize};

/// One masked wavelength window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskEntry {
    /// Window centre in Angstrom (observed frame for sky lines, rest frame otherwise).
    pub center: f64,
    /// Full window width in Angstrom.
    pub width: f64,
    /// Free-form label; `sky` (any case) marks a sky line.
    pub tag: String,
}

impl MaskEntry {
    pub fn new(center: f64, width: f64, tag: impl Into<String>) -> Self {
        Self {
            center,
            width,
            tag: tag.into(),
        }
    }

    pub fn is_sky(&self) -> bool {
        self.tag.eq_ignore_ascii_case("sky")
    }

    /// Centre in the rest frame of a source at `redshift`.
    fn rest_center(&self, redshift: f64) -> f64 {
        if self.is_sky() {
            self.center / (1.0 + redshift)
        } else {
            self.center
        }
    }
}

/// Indices of `log_lam` not covered by any mask window, in ascending order.
///
/// `log_lam` must be uniformly spaced (natural log of wavelength). Window
/// edges are converted to pixels with the inverse of the log transform,
/// rounded half-to-even and clamped to the axis. Windows lying entirely
/// outside the axis mask nothing: they are skipped, not clamped onto the
/// first or last pixel.
pub fn good_pixels(log_lam: &[f64], redshift: f64, entries: &[MaskEntry]) -> Vec<usize> {
    let n = log_lam.len();
    if n < 2 {
        return (0..n).collect();
    }
    let origin = log_lam[0];
    let step = log_lam[1] - log_lam[0];
    let last = (n - 1) as f64;

    let pixel_of = |lam: f64| -> f64 {
        if lam <= 0.0 {
            return f64::NEG_INFINITY;
        }
        ((lam.ln() - origin) / step).round_ties_even()
    };

    let mut good = vec![true; n];
    for entry in entries {
        let center = entry.rest_center(redshift);
        let lo = pixel_of(center - entry.width / 2.0);
        let hi = pixel_of(center + entry.width / 2.0);
        if hi < 0.0 || lo > last {
            continue;
        }
        let lo = lo.clamp(0.0, last) as usize;
        let hi = hi.clamp(0.0, last) as usize;
        for flag in good.iter_mut().take(hi + 1).skip(lo) {
            *flag = false;
        }
    }

    good.iter()
        .enumerate()
        .filter(|(_, &ok)| ok)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Log axis with pixel `i` at exactly `exp(ln(start) + i * step)`.
    fn log_axis(start: f64, step: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| start.ln() + i as f64 * step).collect()
    }

    fn expected_masked(log_lam: &[f64], lo: f64, hi: f64) -> Vec<usize> {
        log_lam
            .iter()
            .enumerate()
            .filter(|(_, &l)| l.exp() >= lo && l.exp() <= hi)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_window_removes_covered_pixels() {
        let log_lam = log_axis(4800.0, 2e-4, 1000);
        let good = good_pixels(&log_lam, 0.05, &[MaskEntry::new(5007.0, 20.0, "[OIII]")]);

        let masked = expected_masked(&log_lam, 4997.0, 5017.0);
        assert!(!masked.is_empty());
        for i in &masked {
            assert!(!good.contains(i), "pixel {i} should be masked");
        }
        // At most one rounding pixel either side of the window.
        assert!(good.len() >= 1000 - masked.len() - 2);
        assert!(good.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sky_lines_are_deredshifted() {
        let log_lam = log_axis(4800.0, 2e-4, 2000);
        let sky = MaskEntry::new(5577.0, 10.0, "Sky");
        let good = good_pixels(&log_lam, 0.1, &[sky]);

        let rest = 5577.0 / 1.1;
        for i in expected_masked(&log_lam, rest - 5.0, rest + 5.0) {
            assert!(!good.contains(&i));
        }
        for i in expected_masked(&log_lam, 5572.0, 5582.0) {
            assert!(good.contains(&i));
        }
    }

    #[test]
    fn test_overlapping_windows_union() {
        let log_lam = log_axis(5000.0, 1e-4, 500);
        let a = MaskEntry::new(5050.0, 10.0, "a");
        let b = MaskEntry::new(5058.0, 10.0, "b");
        let good = good_pixels(&log_lam, 0.0, &[a, b]);
        for i in expected_masked(&log_lam, 5045.0, 5063.0) {
            assert!(!good.contains(&i));
        }
    }

    #[test]
    fn test_windows_clamp_to_axis() {
        let log_lam = log_axis(5000.0, 1e-4, 100);
        // Straddles the blue end.
        let good = good_pixels(&log_lam, 0.0, &[MaskEntry::new(5000.0, 4.0, "edge")]);
        assert!(!good.contains(&0));
        // Entirely outside: nothing is masked, not even the edge pixel.
        let good = good_pixels(&log_lam, 0.0, &[MaskEntry::new(4000.0, 4.0, "far")]);
        assert_eq!(good.len(), 100);
        assert_eq!(good[0], 0);
        let good = good_pixels(&log_lam, 0.0, &[MaskEntry::new(9000.0, 4.0, "far")]);
        assert_eq!(good.len(), 100);
        assert_eq!(good[99], 99);
    }
}
