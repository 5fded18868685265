use ndarray::Array2;

use super::model::SpectralCube;

// ---------------------------------------------------------------------------
// Spaxel classification: defunct spaxels and the isophote-level SNR cut
// ---------------------------------------------------------------------------

/// Spaxel indices inside and outside the analysis region.
///
/// Together the two lists partition the spaxels they were computed from;
/// both are sorted ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub inside: Vec<usize>,
    pub outside: Vec<usize>,
}

/// Half-width of the SNR window used to locate the isophote.
const SNR_WINDOW: f64 = 2.0;

/// Split spaxels (columns of `spec`) into usable and defunct ones.
///
/// A spaxel is defunct if any flux value is non-finite or its median flux
/// is not positive. Returns `(good, defunct)`.
pub fn defunct_spaxels(spec: &Array2<f64>) -> (Vec<usize>, Vec<usize>) {
    let mut good = Vec::new();
    let mut defunct = Vec::new();
    for (j, column) in spec.columns().into_iter().enumerate() {
        let finite = column.iter().all(|v| v.is_finite());
        if finite && nan_median(column.iter().copied()) > 0.0 {
            good.push(j);
        } else {
            defunct.push(j);
        }
    }
    (good, defunct)
}

/// Keep spaxels above the isophote whose mean SNR is `min_snr`.
///
/// The isophote signal is the mean signal of spaxels with
/// `|snr - min_snr| < 2`. Spaxels at or above it are inside. If that leaves
/// both sets empty (no spaxel in the SNR window), every spaxel is inside.
pub fn apply_snr_threshold(snr: &[f64], signal: &[f64], min_snr: f64) -> Classification {
    let window: Vec<f64> = snr
        .iter()
        .zip(signal)
        .filter(|(s, _)| (*s - min_snr).abs() < SNR_WINDOW)
        .map(|(_, &sig)| sig)
        .collect();
    let isophote = if window.is_empty() {
        f64::NAN
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    };

    let inside: Vec<usize> = (0..signal.len())
        .filter(|&i| signal[i] >= isophote)
        .collect();
    let below: Vec<usize> = (0..signal.len())
        .filter(|&i| signal[i] < isophote)
        .collect();

    let classification = if inside.is_empty() && below.is_empty() {
        Classification {
            inside: (0..signal.len()).collect(),
            outside: Vec::new(),
        }
    } else {
        // Spaxels with NaN signal compare false both ways; keep them out.
        let outside = (0..signal.len())
            .filter(|&i| signal[i] < isophote || signal[i].is_nan())
            .collect();
        Classification { inside, outside }
    };

    log::info!(
        "Removed spaxels below the isophote with an average signal-to-noise of {min_snr}: \
         {} inside and {} outside of the analysis region",
        classification.inside.len(),
        classification.outside.len()
    );
    classification
}

/// Classify every spaxel of `cube`.
///
/// Defunct spaxels are always outside; the SNR cut runs on the rest and its
/// indices are mapped back to cube indices.
pub fn classify_spaxels(cube: &SpectralCube, min_snr: f64) -> Classification {
    let (good, defunct) = defunct_spaxels(&cube.spec);
    log::debug!("{} defunct spaxels", defunct.len());

    let snr: Vec<f64> = good.iter().map(|&i| cube.snr[i]).collect();
    let signal: Vec<f64> = good.iter().map(|&i| cube.signal[i]).collect();
    let local = apply_snr_threshold(&snr, &signal, min_snr);

    let inside = local.inside.iter().map(|&i| good[i]).collect();
    let mut outside: Vec<usize> = defunct
        .into_iter()
        .chain(local.outside.iter().map(|&i| good[i]))
        .collect();
    outside.sort_unstable();
    outside.dedup();

    Classification { inside, outside }
}

/// Median of the non-NaN values; NaN if there are none.
pub fn nan_median(values: impl Iterator<Item = f64>) -> f64 {
    let mut v: Vec<f64> = values.filter(|x| !x.is_nan()).collect();
    if v.is_empty() {
        return f64::NAN;
    }
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        0.5 * (v[mid - 1] + v[mid])
    } else {
        v[mid]
    }
}
