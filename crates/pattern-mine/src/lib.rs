//! Pattern chunking, fingerprinting, and mining.
//!
//! Tracks are cut into 1/2/4-bar windows, each window is hashed into
//! rhythm/pitch/combined SHA-256 fingerprints, and patterns are mined in
//! two phases: exact intra-song dedup on `combo_fp`, then cross-corpus
//! single-linkage clustering of near duplicates. Pattern ids are content
//! hashes, so two runs over the same corpus agree byte-for-byte.

pub mod chunk;
pub mod fingerprint;
pub mod mine;
pub mod representation;
pub mod types;

pub use chunk::{chunk_track, Chunk, StepOnset, CHUNK_LENGTHS};
pub use fingerprint::{fingerprint, Fingerprint, RhythmMode, ShapeDescriptors};
pub use mine::{cluster_corpus, dedup_song};
pub use representation::{
    build_representation, from_canonical_json, to_canonical_json, Representation,
};
pub use types::{Pattern, PatternInstance, PatternStats, Transform};
