use std::collections::BTreeMap;

use midi_normalize::{NoteEvent, Song, Track};

use crate::types::{ArpDescriptor, ArpRate, ArpSummary, ChordEvent};

/// Minimum onsets in a window before it counts as an arpeggio figure.
const MIN_WINDOW_ONSETS: usize = 3;

/// Fraction of IOIs that must agree with the chosen division.
const RATE_CLARITY_THRESHOLD: f64 = 0.6;

/// Relative tolerance when matching an IOI to a named division.
const RATE_TOLERANCE: f64 = 0.2;

/// Analyze the arpeggio content of one track.
///
/// Windows follow the chord timeline when present, else fixed one-bar
/// spans. Each window yields a rate, the interval sequence from the root
/// (mod 12), per-step octave indices, and a gate length.
pub fn analyze_arps(
    track: &Track,
    song: &Song,
    chords: &[ChordEvent],
) -> (Vec<ArpDescriptor>, Option<ArpSummary>) {
    let windows = make_windows(song, chords);

    let mut descriptors = Vec::new();
    for (start, end, chord_root) in windows {
        if let Some(desc) = describe_window(track, start, end, chord_root) {
            descriptors.push(desc);
        }
    }

    let summary = summarize(&descriptors);
    (descriptors, summary)
}

/// (start_beat, end_beat, chord root pitch class) per window.
fn make_windows(song: &Song, chords: &[ChordEvent]) -> Vec<(f64, f64, Option<u8>)> {
    if !chords.is_empty() {
        return chords
            .iter()
            .map(|c| (c.start_beat, c.end_beat, Some(c.root)))
            .collect();
    }

    (0..song.bar_count())
        .map(|bar| {
            let start = song.bar_start_beat(bar);
            (start, start + song.beats_per_bar_in(bar), None)
        })
        .collect()
}

fn describe_window(
    track: &Track,
    start: f64,
    end: f64,
    chord_root: Option<u8>,
) -> Option<ArpDescriptor> {
    let mut notes: Vec<&NoteEvent> = track
        .note_events
        .iter()
        .filter(|n| n.start_beat >= start && n.start_beat < end)
        .collect();
    if notes.len() < MIN_WINDOW_ONSETS {
        return None;
    }
    notes.sort_by(|a, b| a.start_beat.total_cmp(&b.start_beat).then(a.pitch.cmp(&b.pitch)));

    // Root: the chord root sounding in this window, else the lowest pitch
    let lowest = notes.iter().map(|n| n.pitch).min()?;
    let root_pitch = match chord_root {
        Some(pc) => notes
            .iter()
            .map(|n| n.pitch)
            .filter(|p| p % 12 == pc)
            .min()
            .unwrap_or(lowest),
        None => lowest,
    };

    let mut starts: Vec<f64> = notes.iter().map(|n| n.start_beat).collect();
    starts.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    let iois: Vec<f64> = starts.windows(2).map(|w| w[1] - w[0]).collect();

    let (rate, _clarity) = quantize_rate(&iois);

    let interval_sequence: Vec<u8> = notes
        .iter()
        .map(|n| ((n.pitch as i16 - root_pitch as i16).rem_euclid(12)) as u8)
        .collect();

    let first_pitch = notes[0].pitch;
    let octave_jumps: Vec<i8> = notes
        .iter()
        .map(|n| ((n.pitch as i16 - first_pitch as i16).div_euclid(12)) as i8)
        .collect();

    let step_beats = match rate.beats() {
        Some(b) => b,
        None => median(&iois).unwrap_or(1.0),
    };
    let mean_duration =
        notes.iter().map(|n| n.duration_beats).sum::<f64>() / notes.len() as f64;
    let gate = (mean_duration / step_beats).clamp(0.05, 1.0);

    Some(ArpDescriptor {
        start_beat: start,
        end_beat: end,
        root_pitch,
        rate,
        interval_sequence,
        octave_jumps,
        gate,
    })
}

/// Snap a set of inter-onset intervals to the nearest named division.
///
/// Returns the division and the fraction of IOIs that agree with it.
/// Below the clarity threshold the rate is `Unknown`.
pub fn quantize_rate(iois: &[f64]) -> (ArpRate, f64) {
    let Some(med) = median(iois) else {
        return (ArpRate::Unknown, 0.0);
    };

    let nearest = ArpRate::NAMED
        .iter()
        .copied()
        .min_by(|a, b| {
            let da = (a.beats().unwrap_or(f64::MAX) - med).abs();
            let db = (b.beats().unwrap_or(f64::MAX) - med).abs();
            da.total_cmp(&db)
        })
        .unwrap_or(ArpRate::Unknown);

    let Some(target) = nearest.beats() else {
        return (ArpRate::Unknown, 0.0);
    };

    let agreeing = iois
        .iter()
        .filter(|&&ioi| (ioi - target).abs() <= target * RATE_TOLERANCE)
        .count();
    let clarity = agreeing as f64 / iois.len() as f64;

    if clarity < RATE_CLARITY_THRESHOLD {
        (ArpRate::Unknown, clarity)
    } else {
        (nearest, clarity)
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(sorted[sorted.len() / 2])
}

/// Per-track aggregation: dominant rate, mean gate, most common sequence.
fn summarize(descriptors: &[ArpDescriptor]) -> Option<ArpSummary> {
    if descriptors.is_empty() {
        return None;
    }

    let mut rate_counts: BTreeMap<ArpRate, usize> = BTreeMap::new();
    let mut sequence_counts: BTreeMap<&[u8], usize> = BTreeMap::new();
    for d in descriptors {
        *rate_counts.entry(d.rate).or_default() += 1;
        *sequence_counts.entry(&d.interval_sequence).or_default() += 1;
    }

    // BTreeMap iteration makes tie-breaks deterministic
    let dominant_rate = rate_counts
        .iter()
        .max_by_key(|&(_, count)| *count)
        .map(|(&rate, _)| rate)
        .unwrap_or(ArpRate::Unknown);
    let common_interval_sequence = sequence_counts
        .iter()
        .max_by_key(|&(_, count)| *count)
        .map(|(&seq, _)| seq.to_vec())
        .unwrap_or_default();

    let mean_gate = descriptors.iter().map(|d| d.gate).sum::<f64>() / descriptors.len() as f64;

    Some(ArpSummary {
        dominant_rate,
        mean_gate,
        common_interval_sequence,
        window_count: descriptors.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChordQuality;
    use midi_normalize::{ContentId, NormalizeWarnings, TempoSegment, TimeSigSegment};

    fn make_track(notes: Vec<NoteEvent>) -> (Track, Song) {
        let song_id = ContentId::from_data(b"arp test");
        let track = Track {
            track_id: format!("{}:0", song_id),
            song_id: song_id.clone(),
            name: None,
            channel: 0,
            note_events: notes,
        };
        let song = Song {
            song_id,
            source_path: "t.mid".into(),
            tempo_map: vec![TempoSegment {
                start_beat: 0.0,
                microseconds_per_quarter: 500_000,
            }],
            time_sig_map: vec![TimeSigSegment {
                start_bar: 0,
                numerator: 4,
                denominator: 4,
            }],
            tracks: vec![track.clone()],
            artist: None,
            title: None,
            genres: vec![],
            tags: vec![],
            meta_texts: vec![],
            warnings: NormalizeWarnings::default(),
        };
        (track, song)
    }

    fn sixteenth_note(i: usize, pitch: u8) -> NoteEvent {
        NoteEvent {
            start_beat: i as f64 * 0.25,
            duration_beats: 0.2,
            pitch,
            velocity: 100,
            channel: 0,
        }
    }

    #[test]
    fn c_major_arpeggio_figure() {
        // C4 E4 G4 C5 G4 E4 repeated over one bar at 1/16
        let pitches = [60u8, 64, 67, 72, 67, 64, 60, 64, 67, 72, 67, 64, 60, 64, 67, 72];
        let notes: Vec<_> = pitches
            .iter()
            .enumerate()
            .map(|(i, &p)| sixteenth_note(i, p))
            .collect();
        let (track, song) = make_track(notes);

        let (descriptors, summary) = analyze_arps(&track, &song, &[]);
        assert_eq!(descriptors.len(), 1);

        let d = &descriptors[0];
        assert_eq!(d.rate, ArpRate::Sixteenth);
        assert_eq!(d.root_pitch, 60);
        assert_eq!(&d.interval_sequence[..6], &[0, 4, 7, 0, 7, 4]);
        assert_eq!(&d.octave_jumps[..4], &[0, 0, 0, 1]);
        assert!(d.gate > 0.7 && d.gate <= 1.0, "gate {}", d.gate);

        let s = summary.unwrap();
        assert_eq!(s.dominant_rate, ArpRate::Sixteenth);
        assert_eq!(s.window_count, 1);
    }

    #[test]
    fn chord_windows_take_precedence() {
        let pitches = [60u8, 64, 67, 72, 65, 69, 72, 77];
        let notes: Vec<_> = (0..8)
            .map(|i| NoteEvent {
                start_beat: i as f64 * 0.5,
                duration_beats: 0.4,
                pitch: pitches[i],
                velocity: 100,
                channel: 0,
            })
            .collect();
        let (track, song) = make_track(notes);

        let chords = vec![
            ChordEvent {
                start_beat: 0.0,
                end_beat: 2.0,
                root: 0,
                quality: ChordQuality::Maj,
                roman: "I".into(),
                confidence: 0.8,
            },
            ChordEvent {
                start_beat: 2.0,
                end_beat: 4.0,
                root: 5,
                quality: ChordQuality::Maj,
                roman: "IV".into(),
                confidence: 0.8,
            },
        ];

        let (descriptors, _) = analyze_arps(&track, &song, &chords);
        assert_eq!(descriptors.len(), 2);
        // First window roots on C, second on F
        assert_eq!(descriptors[0].root_pitch % 12, 0);
        assert_eq!(descriptors[1].root_pitch % 12, 5);
        assert_eq!(descriptors[1].interval_sequence, vec![0, 4, 7, 0]);
    }

    #[test]
    fn sparse_window_yields_nothing() {
        let notes = vec![sixteenth_note(0, 60), sixteenth_note(8, 64)];
        let (track, song) = make_track(notes);
        let (descriptors, summary) = analyze_arps(&track, &song, &[]);
        assert!(descriptors.is_empty());
        assert!(summary.is_none());
    }

    #[test]
    fn irregular_timing_gives_unknown_rate() {
        // IOIs all over the place: no division reaches 60% agreement
        let starts = [0.0, 0.13, 0.55, 0.81, 1.7, 2.02, 2.9, 3.3];
        let notes: Vec<_> = starts
            .iter()
            .enumerate()
            .map(|(i, &s)| NoteEvent {
                start_beat: s,
                duration_beats: 0.1,
                pitch: 60 + (i % 5) as u8,
                velocity: 100,
                channel: 0,
            })
            .collect();
        let (track, song) = make_track(notes);
        let (descriptors, _) = analyze_arps(&track, &song, &[]);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].rate, ArpRate::Unknown);
    }

    #[test]
    fn quantize_rate_triplets() {
        let third = 1.0 / 3.0;
        let iois = vec![third, third, third, third, third, third];
        let (rate, clarity) = quantize_rate(&iois);
        assert_eq!(rate, ArpRate::EighthTriplet);
        assert!(clarity > 0.99);
    }

    #[test]
    fn quantize_rate_empty() {
        let (rate, clarity) = quantize_rate(&[]);
        assert_eq!(rate, ArpRate::Unknown);
        assert_eq!(clarity, 0.0);
    }

    #[test]
    fn transposition_preserves_interval_sequence() {
        let pitches = [60u8, 64, 67, 72, 67, 64];
        let make = |offset: u8| {
            let notes: Vec<_> = pitches
                .iter()
                .enumerate()
                .map(|(i, &p)| sixteenth_note(i, p + offset))
                .collect();
            make_track(notes)
        };

        let (track_c, song_c) = make(0);
        let (track_d, song_d) = make(2);
        let (desc_c, _) = analyze_arps(&track_c, &song_c, &[]);
        let (desc_d, _) = analyze_arps(&track_d, &song_d, &[]);

        assert_eq!(desc_c[0].interval_sequence, desc_d[0].interval_sequence);
        assert_eq!(desc_c[0].octave_jumps, desc_d[0].octave_jumps);
    }
}
