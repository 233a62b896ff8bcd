use serde::{Deserialize, Serialize};

use crate::note::NoteEvent;
use crate::song::Song;

/// Default quantization: 16 steps per bar (16th notes in 4/4).
pub const DEFAULT_STEPS_PER_BAR: u8 = 16;

/// An onset snapped to the per-bar grid. Raw beat timing is kept alongside
/// so quantization never destroys information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedOnset {
    pub bar: u32,
    pub step: u8,
    pub pitch: u8,
    pub velocity: u8,
    pub start_beat: f64,
    pub duration_beats: f64,
}

/// Quantized view of a note stream against a song's bar structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridView {
    pub steps_per_bar: u8,
}

impl Default for GridView {
    fn default() -> Self {
        Self {
            steps_per_bar: DEFAULT_STEPS_PER_BAR,
        }
    }
}

impl GridView {
    pub fn new(steps_per_bar: u8) -> Self {
        Self { steps_per_bar }
    }

    /// Step index of a beat position within its bar. An onset that rounds to
    /// the bar's end spills into step 0 of the next bar.
    pub fn locate(&self, song: &Song, beat: f64) -> (u32, u8) {
        let bar = song.bar_of_beat(beat);
        let bar_start = song.bar_start_beat(bar);
        let beats_per_step = song.beats_per_bar_in(bar) / self.steps_per_bar as f64;

        let step = ((beat - bar_start) / beats_per_step).round() as i64;
        if step >= self.steps_per_bar as i64 {
            (bar + 1, 0)
        } else {
            (bar, step.max(0) as u8)
        }
    }

    /// Quantize every onset of a note stream, sorted by (bar, step, pitch).
    pub fn quantize(&self, song: &Song, notes: &[NoteEvent]) -> Vec<QuantizedOnset> {
        let mut onsets: Vec<QuantizedOnset> = notes
            .iter()
            .map(|n| {
                let (bar, step) = self.locate(song, n.start_beat);
                QuantizedOnset {
                    bar,
                    step,
                    pitch: n.pitch,
                    velocity: n.velocity,
                    start_beat: n.start_beat,
                    duration_beats: n.duration_beats,
                }
            })
            .collect();

        onsets.sort_by(|a, b| {
            a.bar
                .cmp(&b.bar)
                .then(a.step.cmp(&b.step))
                .then(a.pitch.cmp(&b.pitch))
        });
        onsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ContentId;
    use crate::song::{NormalizeWarnings, TempoSegment, TimeSigSegment, Track};

    fn song(numerator: u8, denominator: u8, notes: Vec<NoteEvent>) -> Song {
        let song_id = ContentId::from_data(b"grid test");
        Song {
            song_id: song_id.clone(),
            source_path: "t.mid".into(),
            tempo_map: vec![TempoSegment {
                start_beat: 0.0,
                microseconds_per_quarter: 500_000,
            }],
            time_sig_map: vec![TimeSigSegment {
                start_bar: 0,
                numerator,
                denominator,
            }],
            tracks: vec![Track {
                track_id: format!("{}:0", song_id),
                song_id,
                name: None,
                channel: 0,
                note_events: notes,
            }],
            artist: None,
            title: None,
            genres: vec![],
            tags: vec![],
            meta_texts: vec![],
            warnings: NormalizeWarnings::default(),
        }
    }

    fn note(start: f64, pitch: u8) -> NoteEvent {
        NoteEvent {
            start_beat: start,
            duration_beats: 0.25,
            pitch,
            velocity: 100,
            channel: 0,
        }
    }

    #[test]
    fn on_grid_onsets_are_exact() {
        let s = song(4, 4, vec![]);
        let grid = GridView::default();

        // Beat 1.25 in 4/4 with 16 steps = step 5 of bar 0
        assert_eq!(grid.locate(&s, 1.25), (0, 5));
        assert_eq!(grid.locate(&s, 0.0), (0, 0));
        assert_eq!(grid.locate(&s, 4.0), (1, 0));
    }

    #[test]
    fn near_grid_onset_rounds() {
        let s = song(4, 4, vec![]);
        let grid = GridView::default();

        // Slightly loose timing still lands on the nearest step
        assert_eq!(grid.locate(&s, 1.27), (0, 5));
        assert_eq!(grid.locate(&s, 1.22), (0, 5));
    }

    #[test]
    fn bar_end_spills_to_next_bar() {
        let s = song(4, 4, vec![]);
        let grid = GridView::default();

        // 3.99 beats rounds to step 16 == step 0 of bar 1
        assert_eq!(grid.locate(&s, 3.99), (1, 0));
    }

    #[test]
    fn non_4_4_meter_honored() {
        let s = song(3, 4, vec![]);
        let grid = GridView::default();

        // 3/4 bar is 3 beats; 16 steps over 3 beats
        assert_eq!(grid.locate(&s, 3.0), (1, 0));
        assert_eq!(grid.locate(&s, 1.5), (0, 8));
    }

    #[test]
    fn quantize_is_noop_for_on_grid_input() {
        let notes = vec![note(0.0, 60), note(1.0, 62), note(2.5, 64)];
        let s = song(4, 4, notes.clone());
        let grid = GridView::default();

        let q = grid.quantize(&s, &notes);
        assert_eq!(q.len(), 3);
        assert_eq!((q[0].bar, q[0].step), (0, 0));
        assert_eq!((q[1].bar, q[1].step), (0, 4));
        assert_eq!((q[2].bar, q[2].step), (0, 10));
        // Raw timing preserved
        assert_eq!(q[2].start_beat, 2.5);
    }
}
