//! SMF ingestion and normalization.
//!
//! Converts tick-domain MIDI into a beat-domain [`Song`]: paired notes,
//! tempo and time-signature maps, bar arithmetic, and a quantized grid
//! view. Everything downstream (features, fingerprints, mining) works on
//! this representation, so the same file always normalizes to the same
//! `Song` byte-for-byte.

pub mod grid;
pub mod id;
pub mod normalize;
pub mod note;
pub mod song;

pub use grid::{GridView, QuantizedOnset, DEFAULT_STEPS_PER_BAR};
pub use id::ContentId;
pub use normalize::normalize;
pub use note::NoteEvent;
pub use song::{
    NormalizeWarnings, Song, TempoSegment, TimeSigSegment, Track, DRUM_CHANNEL,
};

/// Errors from normalization.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed MIDI: {0}")]
    InputFormat(String),
}

pub type Result<T> = std::result::Result<T, Error>;
