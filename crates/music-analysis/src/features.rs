use midi_normalize::{GridView, NoteEvent, QuantizedOnset, Song, Track};

use crate::types::Features;

/// Broken-chord moves: thirds, fourths, fifths, sixths, and octaves.
const CHORDAL_LEAPS: [u8; 7] = [3, 4, 5, 7, 8, 9, 12];

/// Metric weight of a grid step within a bar.
///
/// Downbeat 1.0, half-bar 0.7, beat 0.5, half-beat 0.3, everything else 0.1.
/// `metric_beats` is the bar's beat count (the time signature numerator).
pub fn metric_weight(step: u8, steps_per_bar: u8, metric_beats: u8) -> f64 {
    if step == 0 {
        return 1.0;
    }
    if steps_per_bar % 2 == 0 && step == steps_per_bar / 2 {
        return 0.7;
    }

    let spb = steps_per_bar as f64;
    let beats = metric_beats.max(1) as f64;
    for i in 1..metric_beats.max(1) {
        if step == (i as f64 * spb / beats).round() as u8 {
            return 0.5;
        }
    }
    for i in 0..metric_beats.max(1) {
        if step == ((i as f64 + 0.5) * spb / beats).round() as u8 {
            return 0.3;
        }
    }
    0.1
}

/// Compute all per-track descriptors. Every value is finite; an empty track
/// yields all zeros.
pub fn extract_features(track: &Track, song: &Song, grid: &GridView) -> Features {
    let notes = &track.note_events;
    if notes.is_empty() {
        return Features {
            density: 0.0,
            polyphony_ratio: 0.0,
            pitch_range: 0.0,
            median_pitch: 0.0,
            syncopation: 0.0,
            repetition: 0.0,
            drum_likeness: 0.0,
            onset_iqr: 0.0,
            mean_duration_beats: 0.0,
            downbeat_ratio: 0.0,
            broken_chord_ratio: 0.0,
        };
    }

    let onsets = grid.quantize(song, notes);
    let total_bars = song.bar_count().max(1) as f64;

    let density = notes.len() as f64 / total_bars;
    let polyphony_ratio = polyphony_ratio(notes);

    let mut pitches: Vec<u8> = notes.iter().map(|n| n.pitch).collect();
    pitches.sort_unstable();
    let pitch_range = (pitches[pitches.len() - 1] - pitches[0]) as f64;
    let median_pitch = pitches[pitches.len() / 2] as f64;

    let syncopation = syncopation(&onsets, song, grid);
    let repetition = repetition(&onsets);
    let drum_likeness = drum_likeness(track, notes);
    let onset_iqr = onset_iqr(notes);

    let mean_duration_beats =
        notes.iter().map(|n| n.duration_beats).sum::<f64>() / notes.len() as f64;

    let downbeat_count = onsets.iter().filter(|o| o.step == 0).count();
    let downbeat_ratio = downbeat_count as f64 / onsets.len() as f64;

    let broken_chord_ratio = broken_chord_ratio(&onsets);

    Features {
        density,
        polyphony_ratio,
        pitch_range,
        median_pitch,
        syncopation,
        repetition,
        drum_likeness,
        onset_iqr,
        mean_duration_beats,
        downbeat_ratio,
        broken_chord_ratio,
    }
}

/// Time-weighted mean of excess simultaneous voices, scaled by the maximum
/// observed polyphony.
fn polyphony_ratio(notes: &[NoteEvent]) -> f64 {
    // +1 at onset, -1 at offset; sweep in beat order
    let mut events: Vec<(f64, i32)> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        events.push((note.start_beat, 1));
        events.push((note.end_beat(), -1));
    }
    events.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut current = 0i32;
    let mut max_sim = 0i32;
    let mut weighted_excess = 0.0;
    let mut span = 0.0;
    let mut prev_pos = events[0].0;

    for &(pos, delta) in &events {
        let dt = pos - prev_pos;
        if dt > 0.0 && current > 0 {
            weighted_excess += dt * (current - 1).max(0) as f64;
            span += dt;
        }
        current += delta;
        max_sim = max_sim.max(current);
        prev_pos = pos;
    }

    if span <= 0.0 || max_sim <= 1 {
        return 0.0;
    }
    (weighted_excess / span) / max_sim as f64
}

/// Mass of off-grid-weight per onset: strong steps contribute almost
/// nothing, weak steps nearly a full count.
fn syncopation(onsets: &[QuantizedOnset], song: &Song, grid: &GridView) -> f64 {
    if onsets.is_empty() {
        return 0.0;
    }
    let sum: f64 = onsets
        .iter()
        .map(|o| {
            let beats = song.time_sig_at(o.bar).numerator;
            1.0 - metric_weight(o.step, grid.steps_per_bar, beats)
        })
        .sum();
    sum / onsets.len() as f64
}

/// Jaccard similarity of one-bar onset step sets, averaged over adjacent
/// bar pairs. Pairs where both bars are silent are skipped.
fn repetition(onsets: &[QuantizedOnset]) -> f64 {
    let Some(last_bar) = onsets.iter().map(|o| o.bar).max() else {
        return 0.0;
    };
    let first_bar = onsets.iter().map(|o| o.bar).min().unwrap_or(0);
    if last_bar == first_bar {
        return 0.0;
    }

    let mut bar_sets: Vec<Vec<u8>> = vec![Vec::new(); (last_bar - first_bar + 1) as usize];
    for onset in onsets {
        let set = &mut bar_sets[(onset.bar - first_bar) as usize];
        if !set.contains(&onset.step) {
            set.push(onset.step);
        }
    }

    let mut total = 0.0;
    let mut pairs = 0usize;
    for window in bar_sets.windows(2) {
        let (a, b) = (&window[0], &window[1]);
        let union = {
            let mut u: Vec<u8> = a.clone();
            for s in b {
                if !u.contains(s) {
                    u.push(*s);
                }
            }
            u.len()
        };
        if union == 0 {
            continue;
        }
        let intersection = a.iter().filter(|s| b.contains(s)).count();
        total += intersection as f64 / union as f64;
        pairs += 1;
    }

    if pairs == 0 {
        0.0
    } else {
        total / pairs as f64
    }
}

fn drum_likeness(track: &Track, notes: &[NoteEvent]) -> f64 {
    let channel_term = if track.is_drum_channel() { 0.5 } else { 0.0 };

    let mut durations: Vec<f64> = notes.iter().map(|n| n.duration_beats).collect();
    durations.sort_by(f64::total_cmp);
    let median_duration = durations[durations.len() / 2];
    let short_term = if median_duration < 0.25 { 0.25 } else { 0.0 };

    // Low pitch-class entropy reads as percussive (kit pieces repeat pitches)
    let mut counts = [0usize; 12];
    for note in notes {
        counts[note.pitch_class() as usize] += 1;
    }
    let n = notes.len() as f64;
    let entropy: f64 = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum();
    let entropy_term = 0.25 * (1.0 - entropy / 12f64.log2());

    channel_term + short_term + entropy_term.max(0.0)
}

/// Interquartile range of inter-onset intervals, an expressive-timing cue.
fn onset_iqr(notes: &[NoteEvent]) -> f64 {
    let mut starts: Vec<f64> = notes.iter().map(|n| n.start_beat).collect();
    starts.sort_by(f64::total_cmp);
    starts.dedup_by(|a, b| (*a - *b).abs() < 1e-9);

    if starts.len() < 5 {
        return 0.0;
    }

    let mut iois: Vec<f64> = starts.windows(2).map(|w| w[1] - w[0]).collect();
    iois.sort_by(f64::total_cmp);
    let q1 = iois[iois.len() / 4];
    let q3 = iois[(3 * iois.len()) / 4];
    q3 - q1
}

/// Fraction of successive pitch moves that are chordal leaps.
fn broken_chord_ratio(onsets: &[QuantizedOnset]) -> f64 {
    if onsets.len() < 2 {
        return 0.0;
    }
    let moves = onsets.len() - 1;
    let chordal = onsets
        .windows(2)
        .filter(|w| {
            let delta = (w[1].pitch as i16 - w[0].pitch as i16).unsigned_abs() as u8;
            CHORDAL_LEAPS.contains(&delta)
        })
        .count();
    chordal as f64 / moves as f64
}
