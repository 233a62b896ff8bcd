//! Persistence for the pattern corpus.
//!
//! A SQLite store with idempotent upserts keyed by stable content ids,
//! the clip query contract, a TTL'd metadata cache with per-provider
//! rate gates, and the per-batch checkpoint journal.

pub mod metacache;
pub mod store;

pub use metacache::{CacheLookup, MetaCache, RateGate, TagRecord, TokenBucket};
pub use store::{AnalysisStatus, ClipHit, ClipQuery, Store};
