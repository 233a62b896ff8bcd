use midi_normalize::{GridView, Song, Track};
use music_analysis::Role;
use serde::{Deserialize, Serialize};

/// Chunk windows come in these bar lengths.
pub const CHUNK_LENGTHS: [u8; 3] = [1, 2, 4];

/// One onset inside a chunk, addressed by its grid step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOnset {
    /// Step relative to the chunk start: 0..length_bars*steps_per_bar.
    pub step: u16,
    pub pitch: u8,
    pub velocity: u8,
    pub start_beat: f64,
    pub duration_beats: f64,
}

/// A fixed-length window of one track, aligned to bar boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub song_id: String,
    pub track_id: String,
    pub role: Role,
    pub start_bar: u32,
    pub length_bars: u8,
    pub steps_per_bar: u8,
    /// Time signature at the chunk's first bar.
    pub meter: (u8, u8),
    /// Sorted by (step, pitch).
    pub onsets: Vec<StepOnset>,
}

impl Chunk {
    pub fn total_steps(&self) -> u16 {
        self.length_bars as u16 * self.steps_per_bar as u16
    }

    /// Pitch of the first onset; the reference for melodic intervals.
    pub fn first_pitch(&self) -> Option<u8> {
        self.onsets.first().map(|o| o.pitch)
    }
}

/// Cut a track into non-overlapping 1/2/4-bar chunks starting on bar
/// boundaries. Windows without onsets are skipped.
pub fn chunk_track(track: &Track, song: &Song, role: Role, grid: &GridView) -> Vec<Chunk> {
    let bar_count = song.bar_count();
    if bar_count == 0 || track.note_events.is_empty() {
        return Vec::new();
    }

    let quantized = grid.quantize(song, &track.note_events);
    let mut chunks = Vec::new();

    for &length in &CHUNK_LENGTHS {
        let mut start_bar = 0u32;
        while start_bar < bar_count {
            let end_bar = start_bar + length as u32;

            let onsets: Vec<StepOnset> = quantized
                .iter()
                .filter(|o| o.bar >= start_bar && o.bar < end_bar)
                .map(|o| StepOnset {
                    step: (o.bar - start_bar) as u16 * grid.steps_per_bar as u16
                        + o.step as u16,
                    pitch: o.pitch,
                    velocity: o.velocity,
                    start_beat: o.start_beat,
                    duration_beats: o.duration_beats,
                })
                .collect();

            if !onsets.is_empty() {
                let sig = song.time_sig_at(start_bar);
                chunks.push(Chunk {
                    song_id: track.song_id.to_string(),
                    track_id: track.track_id.clone(),
                    role,
                    start_bar,
                    length_bars: length,
                    steps_per_bar: grid.steps_per_bar,
                    meter: (sig.numerator, sig.denominator),
                    onsets,
                });
            }

            start_bar = end_bar;
        }
    }

    chunks
}
