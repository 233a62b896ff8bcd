use midi_normalize::Song;
use tracing::debug;

use crate::chord_templates::{is_diatonic, roman_numeral, TEMPLATES};
use crate::types::{ChordEvent, ChordQuality, KeyEstimate, RoleProbs};

/// Chord inference settings.
#[derive(Debug, Clone, Copy)]
pub struct ChordConfig {
    /// Analysis windows per bar. Two = half-bar windows.
    pub windows_per_bar: u8,
}

impl Default for ChordConfig {
    fn default() -> Self {
        Self { windows_per_bar: 2 }
    }
}

/// Out-of-key candidates lose this much score.
const DIATONIC_PENALTY: f64 = 0.25;

/// Events below this confidence are merged into a neighbor.
const MERGE_CONFIDENCE: f64 = 0.2;

/// A window's winning candidate before smoothing.
#[derive(Debug, Clone, Copy)]
struct WindowChord {
    start_beat: f64,
    end_beat: f64,
    root: u8,
    quality: ChordQuality,
    confidence: f64,
}

/// Infer the chord progression of a song.
///
/// Slides a half-bar window (configurable), weights sounding pitches by
/// their overlap with the window, scores every (root, quality) candidate,
/// median-smooths the winners, merges runs, and labels the result with
/// roman numerals relative to the detected key.
pub fn infer_chords(
    song: &Song,
    role_probs: &[RoleProbs],
    key: &KeyEstimate,
    config: ChordConfig,
) -> Vec<ChordEvent> {
    let bar_count = song.bar_count();
    if bar_count == 0 {
        return Vec::new();
    }

    let mut windows: Vec<WindowChord> = Vec::new();

    for bar in 0..bar_count {
        let bar_start = song.bar_start_beat(bar);
        let bar_beats = song.beats_per_bar_in(bar);
        let window_beats = bar_beats / config.windows_per_bar.max(1) as f64;

        for w in 0..config.windows_per_bar.max(1) {
            let start = bar_start + w as f64 * window_beats;
            let end = start + window_beats;

            let weights = pitch_class_weights(song, role_probs, start, end);
            if let Some((root, quality, confidence)) = score_window(&weights, key) {
                windows.push(WindowChord {
                    start_beat: start,
                    end_beat: end,
                    root,
                    quality,
                    confidence,
                });
            }
        }
    }

    if windows.is_empty() {
        return Vec::new();
    }

    median_smooth(&mut windows);
    let merged = merge_windows(windows);
    debug!(events = merged.len(), "chord inference complete");

    merged
        .into_iter()
        .map(|w| ChordEvent {
            start_beat: w.start_beat,
            end_beat: w.end_beat,
            root: w.root,
            quality: w.quality,
            roman: roman_numeral(w.root, w.quality, key),
            confidence: w.confidence,
        })
        .collect()
}

/// Overlap-weighted pitch-class mass inside [start, end), drawn from
/// non-drum tracks.
fn pitch_class_weights(
    song: &Song,
    role_probs: &[RoleProbs],
    start: f64,
    end: f64,
) -> [f64; 12] {
    let mut weights = [0.0_f64; 12];

    for (i, track) in song.tracks.iter().enumerate() {
        let drummy = role_probs
            .get(i)
            .map(|p| p.drums >= 0.5)
            .unwrap_or(track.is_drum_channel());
        if drummy {
            continue;
        }

        for note in &track.note_events {
            let overlap = note.end_beat().min(end) - note.start_beat.max(start);
            if overlap > 0.0 {
                weights[note.pitch_class() as usize] += overlap;
            }
        }
    }

    weights
}

/// Winner and relative margin for one window; `None` when nothing sounds.
///
/// Each (root, quality) candidate scores chord-tone mass minus half the
/// non-chord mass. Template tones that never sound are penalized (and a
/// silent root heavily so), otherwise a bare triad would tie with every
/// superset seventh built on it. Confidence is the margin over the best
/// candidate on a *different* root, so quality refinements on the same
/// root don't read as ambiguity.
fn score_window(weights: &[f64; 12], key: &KeyEstimate) -> Option<(u8, ChordQuality, f64)> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return None;
    }

    let mut best: Option<(u8, ChordQuality, f64)> = None;
    let mut second_root_score = f64::NEG_INFINITY;

    for root in 0..12u8 {
        let mut root_best: Option<(ChordQuality, f64)> = None;

        for template in TEMPLATES {
            let mut in_tones = 0.0;
            let mut out_tones = 0.0;
            let mut present = 0usize;
            for pc in 0..12u8 {
                let interval = (pc + 12 - root) % 12;
                if template.contains(interval) {
                    in_tones += weights[pc as usize];
                    if weights[pc as usize] > 0.0 {
                        present += 1;
                    }
                } else {
                    out_tones += weights[pc as usize];
                }
            }

            let avg_in = if present > 0 {
                in_tones / present as f64
            } else {
                0.0
            };
            let missing = template.size - present;

            let mut score = in_tones - 0.5 * out_tones - 0.25 * avg_in * missing as f64;
            if weights[root as usize] <= 0.0 {
                score -= avg_in;
            }
            if !is_diatonic(root, template.quality, key) {
                score -= DIATONIC_PENALTY;
            }

            if root_best.map(|(_, b)| score > b).unwrap_or(true) {
                root_best = Some((template.quality, score));
            }
        }

        let (quality, score) = root_best.unwrap_or((ChordQuality::Maj, f64::NEG_INFINITY));
        match best {
            Some((_, _, b)) if score <= b => {
                if score > second_root_score {
                    second_root_score = score;
                }
            }
            _ => {
                if let Some((_, _, b)) = best {
                    second_root_score = b;
                }
                best = Some((root, quality, score));
            }
        }
    }

    let (root, quality, best_score) = best?;
    if best_score <= 0.0 {
        return None;
    }
    let confidence = ((best_score - second_root_score) / best_score).clamp(0.0, 1.0);
    Some((root, quality, confidence))
}

/// 3-window median filter on (root, quality) ids. Ends are left alone.
fn median_smooth(windows: &mut [WindowChord]) {
    if windows.len() < 3 {
        return;
    }

    let ids: Vec<u16> = windows
        .iter()
        .map(|w| w.root as u16 * 8 + w.quality.index() as u16)
        .collect();

    for i in 1..windows.len() - 1 {
        let mut triple = [ids[i - 1], ids[i], ids[i + 1]];
        triple.sort_unstable();
        let median = triple[1];
        if median != ids[i] {
            windows[i].root = (median / 8) as u8;
            windows[i].quality = ChordQuality::ALL[(median % 8) as usize];
        }
    }
}

/// Merge adjacent identical chords, then absorb weak events into their
/// strongest neighbor.
fn merge_windows(windows: Vec<WindowChord>) -> Vec<WindowChord> {
    let mut merged: Vec<WindowChord> = Vec::new();
    for w in windows {
        match merged.last_mut() {
            Some(prev) if prev.root == w.root && prev.quality == w.quality => {
                prev.end_beat = w.end_beat;
                prev.confidence = prev.confidence.max(w.confidence);
            }
            _ => merged.push(w),
        }
    }

    // Absorb low-confidence events into the more confident neighbor
    loop {
        if merged.len() <= 1 {
            break;
        }
        let Some(idx) = merged.iter().position(|w| w.confidence < MERGE_CONFIDENCE) else {
            break;
        };

        let left_conf = if idx > 0 {
            merged[idx - 1].confidence
        } else {
            f64::NEG_INFINITY
        };
        let right_conf = if idx + 1 < merged.len() {
            merged[idx + 1].confidence
        } else {
            f64::NEG_INFINITY
        };

        if left_conf >= right_conf {
            merged[idx - 1].end_beat = merged[idx].end_beat;
            merged.remove(idx);
        } else {
            merged[idx + 1].start_beat = merged[idx].start_beat;
            merged.remove(idx);
        }

        // Re-merge identical neighbors the absorption may have created
        let mut again: Vec<WindowChord> = Vec::new();
        for w in merged.drain(..) {
            match again.last_mut() {
                Some(prev) if prev.root == w.root && prev.quality == w.quality => {
                    prev.end_beat = w.end_beat;
                    prev.confidence = prev.confidence.max(w.confidence);
                }
                _ => again.push(w),
            }
        }
        merged = again;
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyMode;
    use midi_normalize::{ContentId, NormalizeWarnings, NoteEvent, TempoSegment, TimeSigSegment, Track};

    fn make_song(notes: Vec<NoteEvent>) -> Song {
        let song_id = ContentId::from_data(b"chords test");
        Song {
            song_id: song_id.clone(),
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

    fn triad(start: f64, dur: f64, root: u8, third: u8, fifth: u8) -> Vec<NoteEvent> {
        [root, third, fifth]
            .iter()
            .map(|&p| NoteEvent {
                start_beat: start,
                duration_beats: dur,
                pitch: p,
                velocity: 90,
                channel: 0,
            })
            .collect()
    }

    fn c_major_key() -> KeyEstimate {
        KeyEstimate {
            tonic: 0,
            mode: KeyMode::Major,
            confidence: 0.8,
            stability_samples: 1.0,
        }
    }

    fn probs_for(song: &Song) -> Vec<RoleProbs> {
        song.tracks.iter().map(|_| RoleProbs::other_only()).collect()
    }

    /// Non-percussive feature rows, enough for key detection to keep
    /// every track.
    fn melodic_features(song: &Song) -> Vec<crate::types::Features> {
        song.tracks
            .iter()
            .map(|_| crate::types::Features {
                density: 1.0,
                polyphony_ratio: 0.5,
                pitch_range: 12.0,
                median_pitch: 64.0,
                syncopation: 0.0,
                repetition: 0.5,
                drum_likeness: 0.0,
                onset_iqr: 0.0,
                mean_duration_beats: 4.0,
                downbeat_ratio: 1.0,
                broken_chord_ratio: 0.0,
            })
            .collect()
    }

    #[test]
    fn empty_song_has_no_chords() {
        let song = make_song(vec![]);
        let chords = infer_chords(&song, &probs_for(&song), &c_major_key(), ChordConfig::default());
        assert!(chords.is_empty());
    }

    #[test]
    fn held_c_major_triad_detected_and_merged() {
        let notes = triad(0.0, 4.0, 60, 64, 67);
        let song = make_song(notes);
        let chords = infer_chords(&song, &probs_for(&song), &c_major_key(), ChordConfig::default());

        assert_eq!(chords.len(), 1);
        assert_eq!(chords[0].root, 0);
        assert_eq!(chords[0].quality, ChordQuality::Maj);
        assert_eq!(chords[0].roman, "I");
        assert_eq!(chords[0].start_beat, 0.0);
        assert_eq!(chords[0].end_beat, 4.0);
    }

    #[test]
    fn i_v_vi_iv_progression_labeled() {
        // C, G, Am, F: one chord per bar, keyed by actual detection
        // rather than a fixture
        let mut notes = Vec::new();
        notes.extend(triad(0.0, 4.0, 60, 64, 67)); // C
        notes.extend(triad(4.0, 4.0, 67, 71, 74)); // G
        notes.extend(triad(8.0, 4.0, 69, 72, 76)); // Am
        notes.extend(triad(12.0, 4.0, 65, 69, 72)); // F
        let song = make_song(notes);

        let features = melodic_features(&song);
        let key = crate::key::detect_key(&song, &features);
        assert_eq!(key.tonic, 0);
        assert_eq!(key.mode, KeyMode::Major);
        assert!(key.confidence > 0.3, "key confidence {}", key.confidence);

        let chords = infer_chords(&song, &probs_for(&song), &key, ChordConfig::default());
        let romans: Vec<&str> = chords.iter().map(|c| c.roman.as_str()).collect();
        assert_eq!(romans, vec!["I", "V", "vi", "IV"]);
    }

    #[test]
    fn events_are_non_overlapping_and_ordered() {
        let mut notes = Vec::new();
        notes.extend(triad(0.0, 2.0, 60, 64, 67));
        notes.extend(triad(2.0, 2.0, 62, 65, 69)); // Dm
        notes.extend(triad(4.0, 4.0, 67, 71, 74)); // G
        let song = make_song(notes);

        let chords = infer_chords(&song, &probs_for(&song), &c_major_key(), ChordConfig::default());
        for pair in chords.windows(2) {
            assert!(pair[0].end_beat <= pair[1].start_beat + 1e-9);
            assert!(pair[0].start_beat < pair[0].end_beat);
        }
    }

    #[test]
    fn drum_tracks_do_not_contribute() {
        let mut song = make_song(triad(0.0, 4.0, 60, 64, 67));
        let song_id = song.song_id.clone();
        song.tracks.push(Track {
            track_id: format!("{}:1", song_id),
            song_id,
            name: Some("Kit".into()),
            channel: 9,
            note_events: (0..16)
                .map(|i| NoteEvent {
                    start_beat: i as f64 * 0.25,
                    duration_beats: 0.1,
                    pitch: 38 + (i % 6) as u8,
                    velocity: 127,
                    channel: 9,
                })
                .collect(),
        });

        let mut probs = probs_for(&song);
        probs[1] = RoleProbs {
            drums: 0.95,
            bass: 0.01,
            chords: 0.01,
            lead: 0.01,
            arp: 0.01,
            pad: 0.005,
            other: 0.005,
        };

        let chords = infer_chords(&song, &probs, &c_major_key(), ChordConfig::default());
        assert_eq!(chords.len(), 1);
        assert_eq!(chords[0].root, 0);
        assert_eq!(chords[0].quality, ChordQuality::Maj);
    }

    #[test]
    fn dominant_seventh_beats_plain_triad_when_seventh_sounds() {
        // G B D F = G7
        let notes: Vec<NoteEvent> = [67u8, 71, 74, 77]
            .iter()
            .map(|&p| NoteEvent {
                start_beat: 0.0,
                duration_beats: 4.0,
                pitch: p,
                velocity: 90,
                channel: 0,
            })
            .collect();
        let song = make_song(notes);

        let chords = infer_chords(&song, &probs_for(&song), &c_major_key(), ChordConfig::default());
        assert_eq!(chords.len(), 1);
        assert_eq!(chords[0].root, 7);
        assert_eq!(chords[0].quality, ChordQuality::Dom7);
        assert_eq!(chords[0].roman, "V7");
    }
}
