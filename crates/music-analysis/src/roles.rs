use crate::types::{Features, Role, RoleProbs};

/// Fixed linear weights per role, softmaxed into a probability
/// distribution. Tunable constants, not learned.
pub fn classify_role(features: &Features) -> RoleProbs {
    // Nothing to classify: degenerate distribution
    if features.density == 0.0 {
        return RoleProbs::other_only();
    }

    let f = features;
    let pitch_range_norm = (f.pitch_range / 24.0).min(1.0);
    let mid_register = f.median_pitch >= 48.0 && f.median_pitch <= 84.0;

    // A percussive track is a poor candidate for every melodic role; the
    // suppression keeps a busy drum loop from leaking into arp/bass.
    let melodic_penalty = 3.0 * f.drum_likeness;

    let drums = 4.0 * f.drum_likeness + ind(f.density > 8.0);
    let bass = 2.0 * ind(f.median_pitch < 48.0)
        + (1.0 - f.polyphony_ratio)
        + f.downbeat_ratio
        - melodic_penalty;
    let chords = 2.0 * f.polyphony_ratio + ind(f.mean_duration_beats > 1.0) - melodic_penalty;
    let pad = chords + ind(f.density < 1.0);
    let lead = 1.5 * (1.0 - f.polyphony_ratio)
        + pitch_range_norm
        + 0.5 * ind(mid_register)
        - melodic_penalty;
    let arp = 2.0 * ind(f.density > 6.0) + 1.5 * f.repetition + f.broken_chord_ratio
        - melodic_penalty;
    let other = 0.1;

    softmax([drums, bass, chords, lead, arp, pad, other])
}

fn ind(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

/// Scores in `Role::ALL` order (drums, bass, chords, lead, arp, pad, other).
fn softmax(scores: [f64; 7]) -> RoleProbs {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();

    RoleProbs {
        drums: exps[0] / total,
        bass: exps[1] / total,
        chords: exps[2] / total,
        lead: exps[3] / total,
        arp: exps[4] / total,
        pad: exps[5] / total,
        other: exps[6] / total,
    }
}
