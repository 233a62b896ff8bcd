use midi_normalize::Song;

use crate::types::{Features, KeyEstimate, KeyMode};

/// Krumhansl-Kessler major key profile (duration-weighted perception studies).
const MAJOR_PROFILE: [f64; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];

/// Krumhansl-Kessler minor key profile.
const MINOR_PROFILE: [f64; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

/// Tracks scoring above this drum-likeness are excluded from tonal analysis.
const DRUM_EXCLUDE_THRESHOLD: f64 = 0.5;

/// Number of windows used for the stability estimate.
const STABILITY_WINDOWS: usize = 4;

/// Detect the global key with the Krumhansl-Schmuckler algorithm.
///
/// Builds a duration-weighted pitch-class histogram over melodic tracks
/// (drum-likeness <= 0.5) and correlates it against all 24 major/minor
/// profiles. Confidence is the relative margin over the best key with a
/// *different* diatonic set: the relative major/minor shares every scale
/// tone with the winner, so that margin reflects mode assignment rather
/// than key ambiguity (mode decisiveness shows up in the stability
/// windows instead). Stability is how many quartile-sized windows agree
/// with the global pick.
pub fn detect_key(song: &Song, features: &[Features]) -> KeyEstimate {
    let histogram = histogram_in_span(song, features, 0.0, f64::INFINITY);

    let Some((tonic, mode, best, second)) = correlate(&histogram) else {
        return KeyEstimate {
            tonic: 0,
            mode: KeyMode::Major,
            confidence: 0.0,
            stability_samples: 0.0,
        };
    };

    let confidence = if best > 0.0 {
        ((best - second) / best).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // Stability: re-detect on quartile windows, count agreement
    let end = song.end_beat();
    let mut agreeing = 0usize;
    let mut sampled = 0usize;
    if end > 0.0 {
        let window = end / STABILITY_WINDOWS as f64;
        for i in 0..STABILITY_WINDOWS {
            let from = i as f64 * window;
            let to = from + window;
            let h = histogram_in_span(song, features, from, to);
            if let Some((t, m, _, _)) = correlate(&h) {
                sampled += 1;
                if t == tonic && m == mode {
                    agreeing += 1;
                }
            }
        }
    }
    let stability_samples = if sampled > 0 {
        agreeing as f64 / sampled as f64
    } else {
        0.0
    };

    KeyEstimate {
        tonic,
        mode,
        confidence,
        stability_samples,
    }
}

/// Duration-weighted pitch-class histogram over melodic tracks, restricted
/// to notes starting in [from, to).
fn histogram_in_span(song: &Song, features: &[Features], from: f64, to: f64) -> [f64; 12] {
    let mut histogram = [0.0_f64; 12];

    for (i, track) in song.tracks.iter().enumerate() {
        let drummy = features
            .get(i)
            .map(|f| f.drum_likeness > DRUM_EXCLUDE_THRESHOLD)
            .unwrap_or(track.is_drum_channel());
        if drummy {
            continue;
        }
        for note in &track.note_events {
            if note.start_beat >= from && note.start_beat < to {
                histogram[note.pitch_class() as usize] += note.duration_beats;
            }
        }
    }

    histogram
}

/// Pitch classes of a key's scale as a 12-bit mask. The relative
/// major/minor pair produces the same mask.
fn scale_mask(tonic: u8, mode: KeyMode) -> u16 {
    let degrees: [u8; 7] = match mode {
        KeyMode::Major => [0, 2, 4, 5, 7, 9, 11],
        KeyMode::Minor => [0, 2, 3, 5, 7, 8, 10],
    };
    degrees
        .iter()
        .fold(0u16, |mask, &d| mask | 1 << ((d + tonic) % 12))
}

/// Best of the 24 key correlations, plus the runner-up among keys whose
/// diatonic set differs from the winner's. Returns `None` for an empty
/// histogram.
fn correlate(histogram: &[f64; 12]) -> Option<(u8, KeyMode, f64, f64)> {
    let total: f64 = histogram.iter().sum();
    if total <= 0.0 {
        return None;
    }

    let mut normalized = [0.0_f64; 12];
    for (i, h) in histogram.iter().enumerate() {
        normalized[i] = h / total;
    }

    let mut scores: Vec<(u8, KeyMode, f64)> = Vec::with_capacity(24);
    for root in 0..12u8 {
        // Rotate so the candidate tonic is index 0
        let mut rotated = [0.0; 12];
        for i in 0..12 {
            rotated[i] = normalized[(i + root as usize) % 12];
        }
        scores.push((root, KeyMode::Major, pearson(&rotated, &MAJOR_PROFILE)));
        scores.push((root, KeyMode::Minor, pearson(&rotated, &MINOR_PROFILE)));
    }

    // Strict comparison keeps the first of any tie, in root-then-mode order
    let mut best = scores[0];
    for &candidate in &scores[1..] {
        if candidate.2 > best.2 {
            best = candidate;
        }
    }

    let best_mask = scale_mask(best.0, best.1);
    let second = scores
        .iter()
        .filter(|&&(root, mode, _)| scale_mask(root, mode) != best_mask)
        .map(|&(_, _, corr)| corr)
        .fold(f64::NEG_INFINITY, f64::max);

    Some((best.0, best.1, best.2, second))
}

/// Pearson correlation coefficient between two 12-element arrays.
fn pearson(x: &[f64; 12], y: &[f64; 12]) -> f64 {
    let x_mean: f64 = x.iter().sum::<f64>() / 12.0;
    let y_mean: f64 = y.iter().sum::<f64>() / 12.0;

    let mut num = 0.0;
    let mut x_sq = 0.0;
    let mut y_sq = 0.0;

    for i in 0..12 {
        let xd = x[i] - x_mean;
        let yd = y[i] - y_mean;
        num += xd * yd;
        x_sq += xd * xd;
        y_sq += yd * yd;
    }

    let denom = (x_sq * y_sq).sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    num / denom
}
