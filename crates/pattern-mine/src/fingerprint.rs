use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunk::Chunk;

/// How the rhythm bitset encodes velocity.
///
/// The two modes produce incompatible fingerprints; a library instance
/// picks one (binary by default) and sticks with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RhythmMode {
    /// One bit per step: set iff any onset quantizes there.
    #[default]
    Binary,
    /// Two bits per step: 0 silent, 1 soft (<64), 2 medium (<96), 3 loud.
    VelocityBuckets,
}

/// Shape descriptors stored alongside a pattern but never hashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeDescriptors {
    /// Onsets per bar within the chunk.
    pub density: f64,
    /// Mean velocity per step; 0.0 where nothing plays.
    pub accent_profile: Vec<f64>,
    /// Pitch deltas between successive onsets, clamped to i8.
    pub contour: Vec<i8>,
    pub onset_count: u32,
}

/// Content fingerprints of a chunk, plus the raw material the miner
/// needs for similarity scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// SHA-256 hex of (length_bars, steps_per_bar) || rhythm bitset.
    pub rhythm_fp: String,
    /// SHA-256 hex of the clamped interval byte sequence.
    pub pitch_fp: String,
    /// SHA-256 hex of rhythm digest || pitch digest.
    pub combo_fp: String,
    /// First 12 hex chars of `combo_fp`.
    pub pattern_id: String,
    /// Raw rhythm bitset, LSB-first within each byte.
    pub rhythm_bits: Vec<u8>,
    /// Grid positions in the bitset (per-step bits x bucket width).
    pub total_bits: u32,
    /// Semitone offsets from the first onset, clamped to [-64, 63].
    pub pitch_intervals: Vec<i8>,
    pub shape: ShapeDescriptors,
}

/// Fingerprint a chunk. Identical normalized input always produces
/// byte-identical fingerprints; transposing every pitch by a constant
/// leaves `pitch_fp` unchanged.
pub fn fingerprint(chunk: &Chunk, mode: RhythmMode) -> Fingerprint {
    let (rhythm_bits, total_bits) = rhythm_bitset(chunk, mode);

    let rhythm_digest = {
        let mut hasher = Sha256::new();
        hasher.update([chunk.length_bars, chunk.steps_per_bar]);
        hasher.update(&rhythm_bits);
        hasher.finalize()
    };

    let pitch_intervals = pitch_intervals(chunk);
    let pitch_digest = {
        let mut hasher = Sha256::new();
        let bytes: Vec<u8> = pitch_intervals.iter().map(|&i| i as u8).collect();
        hasher.update(&bytes);
        hasher.finalize()
    };

    let combo_digest = {
        let mut hasher = Sha256::new();
        hasher.update(rhythm_digest);
        hasher.update(pitch_digest);
        hasher.finalize()
    };

    let combo_fp = hex::encode(combo_digest);
    let pattern_id = combo_fp[..12].to_string();

    Fingerprint {
        rhythm_fp: hex::encode(rhythm_digest),
        pitch_fp: hex::encode(pitch_digest),
        combo_fp,
        pattern_id,
        rhythm_bits,
        total_bits,
        pitch_intervals,
        shape: shape_descriptors(chunk),
    }
}

fn rhythm_bitset(chunk: &Chunk, mode: RhythmMode) -> (Vec<u8>, u32) {
    let steps = chunk.total_steps() as u32;
    match mode {
        RhythmMode::Binary => {
            let mut bits = vec![0u8; steps.div_ceil(8) as usize];
            for onset in &chunk.onsets {
                let step = onset.step as u32;
                if step < steps {
                    bits[(step / 8) as usize] |= 1 << (step % 8);
                }
            }
            (bits, steps)
        }
        RhythmMode::VelocityBuckets => {
            let total = steps * 2;
            let mut bits = vec![0u8; total.div_ceil(8) as usize];
            // Loudest onset wins the step
            let mut buckets = vec![0u8; steps as usize];
            for onset in &chunk.onsets {
                let step = onset.step as usize;
                if step < buckets.len() {
                    buckets[step] = buckets[step].max(velocity_bucket(onset.velocity));
                }
            }
            for (step, &bucket) in buckets.iter().enumerate() {
                let pos = step as u32 * 2;
                bits[(pos / 8) as usize] |= (bucket & 0b11) << (pos % 8);
            }
            (bits, total)
        }
    }
}

fn velocity_bucket(velocity: u8) -> u8 {
    match velocity {
        0..=63 => 1,
        64..=95 => 2,
        _ => 3,
    }
}

/// Semitone offsets from the first onset; rests are not encoded, so the
/// sequence is a transposition-invariant melodic shape.
fn pitch_intervals(chunk: &Chunk) -> Vec<i8> {
    let Some(first) = chunk.first_pitch() else {
        return Vec::new();
    };
    chunk
        .onsets
        .iter()
        .map(|o| (o.pitch as i16 - first as i16).clamp(-64, 63) as i8)
        .collect()
}

fn shape_descriptors(chunk: &Chunk) -> ShapeDescriptors {
    let steps = chunk.total_steps() as usize;
    let mut velocity_sum = vec![0.0_f64; steps];
    let mut velocity_count = vec![0u32; steps];
    for onset in &chunk.onsets {
        let step = onset.step as usize;
        if step < steps {
            velocity_sum[step] += onset.velocity as f64;
            velocity_count[step] += 1;
        }
    }
    let accent_profile: Vec<f64> = velocity_sum
        .iter()
        .zip(&velocity_count)
        .map(|(&sum, &count)| if count > 0 { sum / count as f64 } else { 0.0 })
        .collect();

    let contour: Vec<i8> = chunk
        .onsets
        .windows(2)
        .map(|w| (w[1].pitch as i16 - w[0].pitch as i16).clamp(-128, 127) as i8)
        .collect();

    ShapeDescriptors {
        density: chunk.onsets.len() as f64 / chunk.length_bars as f64,
        accent_profile,
        contour,
        onset_count: chunk.onsets.len() as u32,
    }
}
