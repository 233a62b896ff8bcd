use serde::{Deserialize, Serialize};

use music_analysis::Role;

use crate::fingerprint::ShapeDescriptors;
use crate::representation::Representation;

/// Maps a canonical pattern onto one of its instances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Semitones added to the canonical form.
    pub pitch_offset: i16,
    /// Grid ratio; always 1.0 while lengths are bucketed.
    pub time_scale: f64,
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            pitch_offset: 0,
            time_scale: 1.0,
        }
    }
}

/// Aggregates kept on a canonical pattern. The raw fingerprint material
/// rides along so cross-corpus mining can re-score without the source
/// files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub instance_count: u32,
    pub song_count: u32,
    /// First-onset pitch of the canonical chunk; transposition anchor.
    pub first_pitch: u8,
    /// Hex-encoded raw rhythm bitset.
    pub rhythm_bits: String,
    pub total_bits: u32,
    pub pitch_intervals: Vec<i8>,
    pub shape: ShapeDescriptors,
}

/// A canonical, content-addressed pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// First 12 hex chars of `combo_fp`.
    pub pattern_id: String,
    pub role: Role,
    pub length_bars: u8,
    pub meter: (u8, u8),
    pub grid_resolution: u8,
    pub rhythm_fp: String,
    pub pitch_fp: String,
    pub combo_fp: String,
    pub representation: Representation,
    pub stats: PatternStats,
}

/// One occurrence of a pattern in a specific track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternInstance {
    pub pattern_id: String,
    pub song_id: String,
    pub track_id: String,
    pub start_bar: u32,
    /// Similarity to the canonical pattern; 1.0 for the canonical itself.
    pub confidence: f64,
    pub transform: Transform,
}
