use serde::{Deserialize, Serialize};

/// A single note in the beat domain.
///
/// Beat positions are quarter-note units from the start of the file
/// (ticks / PPQN), so tempo changes never move a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub start_beat: f64,
    pub duration_beats: f64,
    pub pitch: u8,
    /// Always > 0: a note-on with velocity 0 is a note-off.
    pub velocity: u8,
    pub channel: u8,
}

impl NoteEvent {
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }

    pub fn pitch_class(&self) -> u8 {
        self.pitch % 12
    }
}
