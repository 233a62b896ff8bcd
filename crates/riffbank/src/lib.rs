//! Batch MIDI corpus analyzer.
//!
//! Ties the pipeline crates together: config loading, metadata
//! resolution, the per-song analysis pipeline, and the worker-per-song
//! batch driver with checkpointing and cooperative cancellation.

pub mod batch;
pub mod config;
pub mod pipeline;
pub mod resolver;

pub use batch::{discover_midi_files, mine_corpus, run_batch, BatchReport};
pub use config::RiffbankConfig;
pub use pipeline::{analyze_song, PipelineError, SongAnalysis, Stage, TrackArps};
pub use resolver::{lookup_tags, resolve, MetadataSink, NullSink, Resolution, Strategy};
