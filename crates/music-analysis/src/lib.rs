//! Musical analysis over normalized songs.
//!
//! Feature extraction, probabilistic role classification, key detection,
//! chord inference with roman-numeral labeling, arpeggio analysis, and
//! section segmentation. Every stage is pure CPU and deterministic: the
//! same `Song` always produces the same results.

pub mod arp;
pub mod chord_templates;
pub mod chords;
pub mod features;
pub mod key;
pub mod roles;
pub mod sections;
pub mod types;

pub use arp::{analyze_arps, quantize_rate};
pub use chords::{infer_chords, ChordConfig};
pub use features::{extract_features, metric_weight};
pub use key::detect_key;
pub use roles::classify_role;
pub use sections::segment_sections;
pub use types::{
    ArpDescriptor, ArpRate, ArpSummary, ChordEvent, ChordQuality, Features, KeyEstimate,
    KeyMode, Role, RoleProbs, Section, SectionType,
};
