use serde::{Deserialize, Serialize};

use crate::id::ContentId;
use crate::note::NoteEvent;

/// MIDI channel 10 (zero-based 9), reserved for percussion in General MIDI.
pub const DRUM_CHANNEL: u8 = 9;

/// A tempo region. Segments are sorted by `start_beat` and non-overlapping;
/// each one runs until the next segment begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoSegment {
    pub start_beat: f64,
    pub microseconds_per_quarter: u32,
}

impl TempoSegment {
    pub fn bpm(&self) -> f64 {
        60_000_000.0 / self.microseconds_per_quarter as f64
    }
}

/// A time-signature region, anchored to a bar boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSigSegment {
    pub start_bar: u32,
    pub numerator: u8,
    pub denominator: u8,
}

impl TimeSigSegment {
    /// Bar length in quarter-note beats: numerator notes of 1/denominator each.
    pub fn beats_per_bar(&self) -> f64 {
        self.numerator as f64 * 4.0 / self.denominator as f64
    }
}

/// Counters for events dropped during normalization.
///
/// Normalization problems downgrade to warnings: the offending events are
/// discarded and the rest of the song survives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeWarnings {
    /// Note-ons with no matching note-off before end of track.
    pub unmatched_note_ons: u32,
    /// Paired notes whose computed duration was zero or negative.
    pub zero_duration_notes: u32,
    /// Note-offs with no pending note-on.
    pub orphan_note_offs: u32,
}

impl NormalizeWarnings {
    pub fn total(&self) -> u32 {
        self.unmatched_note_ons + self.zero_duration_notes + self.orphan_note_offs
    }
}

/// One channel's worth of notes from one SMF track.
///
/// Multi-channel SMF tracks (common in format 0) are split per channel so a
/// track always has a single instrument identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: String,
    pub song_id: ContentId,
    pub name: Option<String>,
    pub channel: u8,
    /// Sorted by (start_beat, pitch); start_beat >= 0, duration_beats > 0.
    pub note_events: Vec<NoteEvent>,
}

impl Track {
    pub fn is_drum_channel(&self) -> bool {
        self.channel == DRUM_CHANNEL
    }

    pub fn onset_count(&self) -> usize {
        self.note_events.len()
    }
}

/// A normalized song: immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub song_id: ContentId,
    pub source_path: String,
    /// Sorted, non-overlapping, first segment starts at beat 0.
    pub tempo_map: Vec<TempoSegment>,
    /// Sorted, first segment starts at bar 0.
    pub time_sig_map: Vec<TimeSigSegment>,
    pub tracks: Vec<Track>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    /// Raw meta text harvested for the metadata resolver.
    pub meta_texts: Vec<String>,
    pub warnings: NormalizeWarnings,
}

impl Song {
    /// Last sounding beat across all tracks.
    pub fn end_beat(&self) -> f64 {
        self.tracks
            .iter()
            .flat_map(|t| t.note_events.iter())
            .map(|n| n.end_beat())
            .fold(0.0, f64::max)
    }

    /// Beat at which `bar` starts, walking the time-signature map.
    pub fn bar_start_beat(&self, bar: u32) -> f64 {
        let mut beat = 0.0;
        let mut current_bar = 0u32;

        for (i, seg) in self.time_sig_map.iter().enumerate() {
            let seg_end_bar = self
                .time_sig_map
                .get(i + 1)
                .map(|next| next.start_bar)
                .unwrap_or(u32::MAX);

            if bar < seg_end_bar {
                return beat + (bar - current_bar) as f64 * seg.beats_per_bar();
            }

            beat += (seg_end_bar - current_bar) as f64 * seg.beats_per_bar();
            current_bar = seg_end_bar;
        }

        beat
    }

    /// Bar index containing `beat`.
    pub fn bar_of_beat(&self, beat: f64) -> u32 {
        let mut seg_start_beat = 0.0;
        let mut current_bar = 0u32;

        for (i, seg) in self.time_sig_map.iter().enumerate() {
            let seg_end_bar = self
                .time_sig_map
                .get(i + 1)
                .map(|next| next.start_bar)
                .unwrap_or(u32::MAX);

            let bpb = seg.beats_per_bar();
            let seg_bars = (seg_end_bar - current_bar) as f64;
            let seg_end_beat = seg_start_beat + seg_bars * bpb;

            if beat < seg_end_beat || i == self.time_sig_map.len() - 1 {
                let offset = ((beat - seg_start_beat) / bpb).floor().max(0.0);
                return current_bar.saturating_add(offset as u32);
            }

            seg_start_beat = seg_end_beat;
            current_bar = seg_end_bar;
        }

        0
    }

    /// Beats per bar at the given bar index.
    pub fn beats_per_bar_in(&self, bar: u32) -> f64 {
        self.time_sig_at(bar).beats_per_bar()
    }

    /// The time signature governing the given bar.
    pub fn time_sig_at(&self, bar: u32) -> &TimeSigSegment {
        self.time_sig_map
            .iter()
            .rev()
            .find(|seg| seg.start_bar <= bar)
            .unwrap_or(&self.time_sig_map[0])
    }

    /// Number of bars covering the song (last partial bar counts).
    pub fn bar_count(&self) -> u32 {
        let end = self.end_beat();
        if end <= 0.0 {
            return 0;
        }
        // Bar containing the last sounding moment, plus one to make it a count.
        // An end exactly on a bar line does not open a new bar.
        let eps = 1e-9;
        self.bar_of_beat(end - eps) + 1
    }

    /// Tempo in effect at `beat`.
    pub fn tempo_at(&self, beat: f64) -> &TempoSegment {
        self.tempo_map
            .iter()
            .rev()
            .find(|seg| seg.start_beat <= beat + 1e-9)
            .unwrap_or(&self.tempo_map[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song_with_sigs(sigs: Vec<TimeSigSegment>, notes: Vec<NoteEvent>) -> Song {
        let song_id = ContentId::from_data(b"test song");
        Song {
            song_id: song_id.clone(),
            source_path: "test.mid".into(),
            tempo_map: vec![TempoSegment {
                start_beat: 0.0,
                microseconds_per_quarter: 500_000,
            }],
            time_sig_map: sigs,
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

    fn note(start: f64, dur: f64) -> NoteEvent {
        NoteEvent {
            start_beat: start,
            duration_beats: dur,
            pitch: 60,
            velocity: 100,
            channel: 0,
        }
    }

    #[test]
    fn bar_math_in_4_4() {
        let song = song_with_sigs(
            vec![TimeSigSegment {
                start_bar: 0,
                numerator: 4,
                denominator: 4,
            }],
            vec![note(0.0, 1.0), note(15.0, 1.0)],
        );

        assert_eq!(song.bar_of_beat(0.0), 0);
        assert_eq!(song.bar_of_beat(3.99), 0);
        assert_eq!(song.bar_of_beat(4.0), 1);
        assert_eq!(song.bar_start_beat(3), 12.0);
        assert_eq!(song.bar_count(), 4);
    }

    #[test]
    fn bar_math_in_3_4() {
        let song = song_with_sigs(
            vec![TimeSigSegment {
                start_bar: 0,
                numerator: 3,
                denominator: 4,
            }],
            vec![note(0.0, 1.0), note(8.0, 1.0)],
        );

        assert_eq!(song.beats_per_bar_in(0), 3.0);
        assert_eq!(song.bar_of_beat(8.5), 2);
        assert_eq!(song.bar_start_beat(2), 6.0);
        assert_eq!(song.bar_count(), 3);
    }

    #[test]
    fn bar_math_across_meter_change() {
        // 2 bars of 4/4, then 6/8 (3 beats per bar)
        let song = song_with_sigs(
            vec![
                TimeSigSegment {
                    start_bar: 0,
                    numerator: 4,
                    denominator: 4,
                },
                TimeSigSegment {
                    start_bar: 2,
                    numerator: 6,
                    denominator: 8,
                },
            ],
            vec![note(0.0, 1.0), note(13.0, 1.0)],
        );

        assert_eq!(song.bar_start_beat(2), 8.0);
        assert_eq!(song.bar_start_beat(3), 11.0);
        assert_eq!(song.bar_of_beat(7.9), 1);
        assert_eq!(song.bar_of_beat(8.0), 2);
        assert_eq!(song.bar_of_beat(12.0), 3);
        assert_eq!(song.beats_per_bar_in(5), 3.0);
    }

    #[test]
    fn end_on_bar_line_does_not_open_new_bar() {
        let song = song_with_sigs(
            vec![TimeSigSegment {
                start_bar: 0,
                numerator: 4,
                denominator: 4,
            }],
            vec![note(3.0, 1.0)],
        );
        assert_eq!(song.bar_count(), 1);
    }

    #[test]
    fn empty_song_has_zero_bars() {
        let song = song_with_sigs(
            vec![TimeSigSegment {
                start_bar: 0,
                numerator: 4,
                denominator: 4,
            }],
            vec![],
        );
        assert_eq!(song.bar_count(), 0);
        assert_eq!(song.end_beat(), 0.0);
    }
}
