use std::collections::HashMap;

use midly::{MetaMessage, MidiMessage, Smf, TrackEventKind};
use tracing::{debug, warn};

use crate::id::ContentId;
use crate::note::NoteEvent;
use crate::song::{NormalizeWarnings, Song, TempoSegment, TimeSigSegment, Track};
use crate::Error;

const DEFAULT_TEMPO: u32 = 500_000; // 120 BPM
const DEFAULT_PPQ: u16 = 480;

/// Convert raw SMF bytes into a beat-domain `Song`.
///
/// Ticks become beats via the header PPQN. Note-ons pair with the next
/// matching off on the same (channel, pitch); stacked re-strikes of the same
/// pitch close most-recent-first. A note-on with velocity 0 is an off.
/// Unmatched note-ons and zero-duration pairs are dropped and counted in
/// `Song.warnings` rather than failing the song.
pub fn normalize(midi_bytes: &[u8], source_path: &str) -> Result<Song, Error> {
    let smf = Smf::parse(midi_bytes).map_err(|e| Error::InputFormat(e.to_string()))?;

    let ppq = match smf.header.timing {
        midly::Timing::Metrical(ticks) => ticks.as_int(),
        midly::Timing::Timecode(_, _) => {
            warn!(path = source_path, "SMPTE timing not supported, assuming {} ppq", DEFAULT_PPQ);
            DEFAULT_PPQ
        }
    };
    let ppq = if ppq == 0 {
        return Err(Error::InputFormat("header declares 0 ticks per quarter".into()));
    } else {
        ppq as f64
    };

    let song_id = ContentId::from_data(midi_bytes);
    let mut warnings = NormalizeWarnings::default();

    let mut tempo_ticks: Vec<(u64, u32)> = Vec::new();
    let mut sig_ticks: Vec<(u64, u8, u8)> = Vec::new();
    let mut meta_texts: Vec<String> = Vec::new();

    // Notes per (smf track index, channel), kept separate so multi-channel
    // tracks split into one Track per channel.
    let mut raw_notes: Vec<(usize, u8, NoteEvent)> = Vec::new();
    let mut track_names: HashMap<usize, String> = HashMap::new();

    for (track_index, track) in smf.tracks.iter().enumerate() {
        let mut current_tick: u64 = 0;
        // (channel, pitch) -> stack of (onset_tick, velocity)
        let mut pending: HashMap<(u8, u8), Vec<(u64, u8)>> = HashMap::new();

        for event in track {
            current_tick += event.delta.as_int() as u64;

            match event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => {
                    tempo_ticks.push((current_tick, tempo.as_int()));
                }
                TrackEventKind::Meta(MetaMessage::TimeSignature(num, denom_pow, _, _)) => {
                    sig_ticks.push((current_tick, num, 1u8 << denom_pow));
                }
                TrackEventKind::Meta(MetaMessage::TrackName(bytes)) => {
                    if let Ok(name) = String::from_utf8(bytes.to_vec()) {
                        let trimmed = name.trim().to_string();
                        if !trimmed.is_empty() {
                            if track_index == 0 {
                                meta_texts.push(trimmed.clone());
                            }
                            track_names.entry(track_index).or_insert(trimmed);
                        }
                    }
                }
                TrackEventKind::Meta(MetaMessage::Text(bytes))
                | TrackEventKind::Meta(MetaMessage::Copyright(bytes)) => {
                    if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                        let trimmed = text.trim().to_string();
                        if !trimmed.is_empty() {
                            meta_texts.push(trimmed);
                        }
                    }
                }
                TrackEventKind::Midi { channel, message } => {
                    let ch = channel.as_int();
                    match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            pending
                                .entry((ch, key.as_int()))
                                .or_default()
                                .push((current_tick, vel.as_int()));
                        }
                        MidiMessage::NoteOff { key, .. } | MidiMessage::NoteOn { key, .. } => {
                            // vel=0 NoteOn is NoteOff
                            match pending.get_mut(&(ch, key.as_int())).and_then(|s| s.pop()) {
                                Some((onset, velocity)) => {
                                    if current_tick <= onset {
                                        warnings.zero_duration_notes += 1;
                                    } else {
                                        raw_notes.push((
                                            track_index,
                                            ch,
                                            NoteEvent {
                                                start_beat: onset as f64 / ppq,
                                                duration_beats: (current_tick - onset) as f64
                                                    / ppq,
                                                pitch: key.as_int(),
                                                velocity,
                                                channel: ch,
                                            },
                                        ));
                                    }
                                }
                                None => warnings.orphan_note_offs += 1,
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        // Unmatched note-ons are discarded, not closed at end of track.
        let unmatched: u32 = pending.values().map(|s| s.len() as u32).sum();
        if unmatched > 0 {
            warn!(
                path = source_path,
                track = track_index,
                count = unmatched,
                "discarding unmatched note-ons"
            );
            warnings.unmatched_note_ons += unmatched;
        }
    }

    let tempo_map = build_tempo_map(tempo_ticks, ppq);
    let end_beat = raw_notes
        .iter()
        .map(|(_, _, n)| n.end_beat())
        .fold(0.0, f64::max);
    let time_sig_map = build_time_sig_map(sig_ticks, ppq, end_beat);

    let tracks = split_tracks(&song_id, raw_notes, &track_names);

    debug!(
        song = %song_id,
        tracks = tracks.len(),
        warnings = warnings.total(),
        "normalized"
    );

    Ok(Song {
        song_id,
        source_path: source_path.to_string(),
        tempo_map,
        time_sig_map,
        tracks,
        artist: None,
        title: None,
        genres: Vec::new(),
        tags: Vec::new(),
        meta_texts,
        warnings,
    })
}

/// Tempo map covering [0, end): sorted, deduplicated, defaulting to 120 BPM.
fn build_tempo_map(mut tempo_ticks: Vec<(u64, u32)>, ppq: f64) -> Vec<TempoSegment> {
    tempo_ticks.sort_by_key(|&(tick, _)| tick);
    // Multiple tracks may repeat the same change in format 1; last one at a
    // tick wins.
    tempo_ticks.reverse();
    tempo_ticks.dedup_by_key(|&mut (tick, _)| tick);
    tempo_ticks.reverse();

    let mut map: Vec<TempoSegment> = tempo_ticks
        .into_iter()
        .map(|(tick, usec)| TempoSegment {
            start_beat: tick as f64 / ppq,
            microseconds_per_quarter: usec,
        })
        .collect();

    if map.first().map(|s| s.start_beat > 0.0).unwrap_or(true) {
        map.insert(
            0,
            TempoSegment {
                start_beat: 0.0,
                microseconds_per_quarter: DEFAULT_TEMPO,
            },
        );
    }
    map
}

/// Time-signature map with bar-aligned starts, defaulting to 4/4.
///
/// The bar index of each change is found by walking the previous segments;
/// changes that fall inside a bar snap to the nearest bar line.
fn build_time_sig_map(mut sig_ticks: Vec<(u64, u8, u8)>, ppq: f64, end_beat: f64) -> Vec<TimeSigSegment> {
    sig_ticks.sort_by_key(|&(tick, _, _)| tick);
    sig_ticks.reverse();
    sig_ticks.dedup_by_key(|&mut (tick, _, _)| tick);
    sig_ticks.reverse();
    sig_ticks.retain(|&(_, num, denom)| num >= 1 && matches!(denom, 1 | 2 | 4 | 8 | 16 | 32));

    let mut map: Vec<TimeSigSegment> = Vec::new();
    let mut prev_start_beat = 0.0;

    for (tick, num, denom) in sig_ticks {
        let beat = tick as f64 / ppq;
        if beat > end_beat && end_beat > 0.0 {
            break;
        }

        let start_bar = match map.last() {
            None if beat <= 1e-9 => 0,
            None => {
                // Change not at the start: cover the prefix with 4/4.
                map.push(TimeSigSegment {
                    start_bar: 0,
                    numerator: 4,
                    denominator: 4,
                });
                ((beat / 4.0).round() as u32).max(1)
            }
            Some(prev) => {
                let bars = ((beat - prev_start_beat) / prev.beats_per_bar()).round() as u32;
                prev.start_bar + bars.max(1)
            }
        };

        // A change landing on an existing segment's bar replaces it.
        if map.last().map(|p| p.start_bar == start_bar).unwrap_or(false) {
            map.pop();
        }
        map.push(TimeSigSegment {
            start_bar,
            numerator: num,
            denominator: denom,
        });
        prev_start_beat = beat;
    }

    if map.first().map(|s| s.start_bar > 0).unwrap_or(true) {
        map.insert(
            0,
            TimeSigSegment {
                start_bar: 0,
                numerator: 4,
                denominator: 4,
            },
        );
    }
    map
}

/// Group paired notes into one `Track` per (SMF track, channel), in stable
/// order, with notes sorted by (start_beat, pitch).
fn split_tracks(
    song_id: &ContentId,
    raw_notes: Vec<(usize, u8, NoteEvent)>,
    track_names: &HashMap<usize, String>,
) -> Vec<Track> {
    let mut grouped: HashMap<(usize, u8), Vec<NoteEvent>> = HashMap::new();
    for (track_index, channel, note) in raw_notes {
        grouped.entry((track_index, channel)).or_default().push(note);
    }

    let mut keys: Vec<(usize, u8)> = grouped.keys().copied().collect();
    keys.sort();

    keys.into_iter()
        .enumerate()
        .map(|(seq, key)| {
            let mut notes = grouped.remove(&key).unwrap_or_default();
            notes.sort_by(|a, b| {
                a.start_beat
                    .total_cmp(&b.start_beat)
                    .then(a.pitch.cmp(&b.pitch))
            });
            Track {
                track_id: song_id.child(seq),
                song_id: *song_id,
                name: track_names.get(&key.0).cloned(),
                channel: key.1,
                note_events: notes,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Minimal format-1 SMF builder for tests.
    pub(crate) struct SmfBuilder {
        tracks: Vec<Vec<u8>>,
        ppq: u16,
    }

    impl SmfBuilder {
        pub fn new(ppq: u16) -> Self {
            Self { tracks: Vec::new(), ppq }
        }

        pub fn track(&mut self, events: Vec<u8>) -> &mut Self {
            self.tracks.push(events);
            self
        }

        pub fn build(&self) -> Vec<u8> {
            let mut buf = Vec::new();
            buf.extend_from_slice(b"MThd");
            buf.extend_from_slice(&6u32.to_be_bytes());
            buf.extend_from_slice(&1u16.to_be_bytes());
            buf.extend_from_slice(&(self.tracks.len() as u16).to_be_bytes());
            buf.extend_from_slice(&self.ppq.to_be_bytes());
            for track in &self.tracks {
                let mut bytes = track.clone();
                bytes.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
                buf.extend_from_slice(b"MTrk");
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(&bytes);
            }
            buf
        }
    }

    fn tempo_and_sig_track() -> Vec<u8> {
        let mut t = Vec::new();
        // 120 BPM
        t.extend_from_slice(&[0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20]);
        // 4/4
        t.extend_from_slice(&[0x00, 0xFF, 0x58, 0x04, 0x04, 0x02, 0x18, 0x08]);
        t
    }

    fn three_note_track() -> Vec<u8> {
        let mut t = Vec::new();
        // C4 for one beat, E4 for one beat, G4 for one beat (480 ppq)
        t.extend_from_slice(&[0x00, 0x90, 60, 100]);
        t.extend_from_slice(&[0x83, 0x60, 0x80, 60, 0]);
        t.extend_from_slice(&[0x00, 0x90, 64, 100]);
        t.extend_from_slice(&[0x83, 0x60, 0x80, 64, 0]);
        t.extend_from_slice(&[0x00, 0x90, 67, 100]);
        t.extend_from_slice(&[0x83, 0x60, 0x80, 67, 0]);
        t
    }

    #[test]
    fn three_notes_land_in_beat_domain() {
        let mut b = SmfBuilder::new(480);
        b.track(tempo_and_sig_track()).track(three_note_track());
        let song = normalize(&b.build(), "test.mid").unwrap();

        assert_eq!(song.tracks.len(), 1);
        let notes = &song.tracks[0].note_events;
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].start_beat, 0.0);
        assert_eq!(notes[0].duration_beats, 1.0);
        assert_eq!(notes[1].start_beat, 1.0);
        assert_eq!(notes[2].pitch, 67);
        assert_eq!(song.warnings.total(), 0);
    }

    #[test]
    fn velocity_zero_note_on_closes_note() {
        let mut t = Vec::new();
        t.extend_from_slice(&[0x00, 0x90, 60, 100]);
        // running-status style off via NoteOn vel=0
        t.extend_from_slice(&[0x83, 0x60, 0x90, 60, 0]);

        let mut b = SmfBuilder::new(480);
        b.track(tempo_and_sig_track()).track(t);
        let song = normalize(&b.build(), "test.mid").unwrap();

        assert_eq!(song.tracks[0].note_events.len(), 1);
        assert_eq!(song.tracks[0].note_events[0].duration_beats, 1.0);
    }

    #[test]
    fn unmatched_note_on_is_dropped_with_warning() {
        let mut t = Vec::new();
        t.extend_from_slice(&[0x00, 0x90, 60, 100]);
        t.extend_from_slice(&[0x83, 0x60, 0x80, 60, 0]);
        // dangling note-on, never closed
        t.extend_from_slice(&[0x00, 0x90, 72, 100]);

        let mut b = SmfBuilder::new(480);
        b.track(tempo_and_sig_track()).track(t);
        let song = normalize(&b.build(), "test.mid").unwrap();

        assert_eq!(song.tracks[0].note_events.len(), 1);
        assert_eq!(song.warnings.unmatched_note_ons, 1);
    }

    #[test]
    fn zero_duration_note_is_dropped_with_warning() {
        let mut t = Vec::new();
        t.extend_from_slice(&[0x00, 0x90, 60, 100]);
        t.extend_from_slice(&[0x00, 0x80, 60, 0]); // off at same tick

        let mut b = SmfBuilder::new(480);
        b.track(tempo_and_sig_track()).track(t);
        let song = normalize(&b.build(), "test.mid").unwrap();

        assert!(song.tracks.is_empty());
        assert_eq!(song.warnings.zero_duration_notes, 1);
    }

    #[test]
    fn default_tempo_and_meter_when_absent() {
        let mut b = SmfBuilder::new(480);
        b.track(three_note_track());
        let song = normalize(&b.build(), "test.mid").unwrap();

        assert_eq!(song.tempo_map.len(), 1);
        assert_eq!(song.tempo_map[0].microseconds_per_quarter, 500_000);
        assert_eq!(song.time_sig_map.len(), 1);
        assert_eq!(song.time_sig_map[0].numerator, 4);
        assert_eq!(song.time_sig_map[0].denominator, 4);
    }

    #[test]
    fn multi_channel_track_splits_per_channel() {
        let mut t = Vec::new();
        // channel 0 note and channel 9 note interleaved
        t.extend_from_slice(&[0x00, 0x90, 60, 100]);
        t.extend_from_slice(&[0x00, 0x99, 36, 110]);
        t.extend_from_slice(&[0x83, 0x60, 0x80, 60, 0]);
        t.extend_from_slice(&[0x00, 0x89, 36, 0]);

        let mut b = SmfBuilder::new(480);
        b.track(tempo_and_sig_track()).track(t);
        let song = normalize(&b.build(), "test.mid").unwrap();

        assert_eq!(song.tracks.len(), 2);
        assert_eq!(song.tracks[0].channel, 0);
        assert_eq!(song.tracks[1].channel, 9);
        assert!(song.tracks[1].is_drum_channel());
    }

    #[test]
    fn time_sig_change_lands_on_bar_boundary() {
        let mut t = Vec::new();
        // 4/4 at tick 0
        t.extend_from_slice(&[0x00, 0xFF, 0x58, 0x04, 0x04, 0x02, 0x18, 0x08]);
        // 3/4 after 2 bars (8 beats = 3840 ticks at 480 ppq), vlq 0x9E 0x00
        t.extend_from_slice(&[0x9E, 0x00, 0xFF, 0x58, 0x04, 0x03, 0x02, 0x18, 0x08]);

        // One note held 12 beats (5760 ticks) so the 3/4 region is in range
        let mut note_track = Vec::new();
        note_track.extend_from_slice(&[0x00, 0x90, 60, 100]);
        note_track.extend_from_slice(&[0xAD, 0x00, 0x80, 60, 0]);

        let mut b = SmfBuilder::new(480);
        b.track(t).track(note_track);
        let song = normalize(&b.build(), "test.mid").unwrap();

        assert_eq!(song.time_sig_map.len(), 2);
        assert_eq!(song.time_sig_map[0].numerator, 4);
        assert_eq!(song.time_sig_map[1].numerator, 3);
        assert_eq!(song.time_sig_map[1].start_bar, 2);
    }

    #[test]
    fn song_id_is_stable_across_reparses() {
        let mut b = SmfBuilder::new(480);
        b.track(tempo_and_sig_track()).track(three_note_track());
        let bytes = b.build();

        let a = normalize(&bytes, "a.mid").unwrap();
        let b2 = normalize(&bytes, "b.mid").unwrap();
        assert_eq!(a.song_id, b2.song_id);
    }

    #[test]
    fn malformed_bytes_are_input_errors() {
        let result = normalize(b"not a midi file", "junk.mid");
        assert!(matches!(result, Err(Error::InputFormat(_))));
    }
}
