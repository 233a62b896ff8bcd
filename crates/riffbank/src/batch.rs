//! Batch driver: N workers, one song per worker.
//!
//! Analysis is pure CPU inside `spawn_blocking`; the only suspension
//! points are file reads, store writes, and the metadata sink. Workers
//! observe the cancellation token between songs and between stages, and
//! the checkpoint journal lets a restarted batch skip finished songs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use midi_normalize::ContentId;
use riffstore::{AnalysisStatus, MetaCache, RateGate, Store};

use crate::config::RiffbankConfig;
use crate::pipeline::{analyze_song, PipelineError, SongAnalysis, Stage};
use crate::resolver::{lookup_tags, MetadataSink};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub ok: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

/// Find MIDI files under a root, sorted for determinism.
pub fn discover_midi_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("mid") || e.eq_ignore_ascii_case("midi"))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Stable batch id derived from the sorted input paths.
fn batch_id(paths: &[PathBuf]) -> String {
    let joined = paths
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join("\n");
    ContentId::from_data(joined.as_bytes()).to_hex()
}

/// Analyze a corpus of files and persist the results.
pub async fn run_batch(
    paths: Vec<PathBuf>,
    store: Arc<Store>,
    cache: Arc<MetaCache>,
    sink: Option<Arc<dyn MetadataSink>>,
    gate: Arc<RateGate>,
    config: Arc<RiffbankConfig>,
    cancel: CancellationToken,
) -> Result<BatchReport> {
    let batch = batch_id(&paths);
    let semaphore = Arc::new(Semaphore::new(config.analysis.workers.max(1)));
    let mut handles = Vec::new();

    info!(batch = %batch, songs = paths.len(), workers = config.analysis.workers, "batch starting");

    for path in paths {
        if cancel.is_cancelled() {
            break;
        }

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("acquiring worker permit")?;
        let store = store.clone();
        let cache = cache.clone();
        let sink = sink.clone();
        let gate = gate.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        let batch = batch.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit;
            process_song(&path, &batch, store, cache, sink, gate, config, cancel).await
        }));
    }

    let mut report = BatchReport::default();
    for handle in handles {
        match handle.await {
            Ok(Ok(SongOutcome::Done(AnalysisStatus::Ok))) => report.ok += 1,
            Ok(Ok(SongOutcome::Done(AnalysisStatus::Partial))) => report.partial += 1,
            Ok(Ok(SongOutcome::Done(AnalysisStatus::Failed))) => report.failed += 1,
            Ok(Ok(SongOutcome::Skipped)) => report.skipped += 1,
            Ok(Ok(SongOutcome::Cancelled)) => report.cancelled = true,
            Ok(Err(e)) => {
                // Invariant violations abort the whole batch
                return Err(e);
            }
            Err(join_err) => {
                error!(error = %join_err, "worker panicked");
                report.failed += 1;
            }
        }
    }

    report.cancelled |= cancel.is_cancelled();
    info!(?report, "batch finished");
    Ok(report)
}

enum SongOutcome {
    Done(AnalysisStatus),
    Skipped,
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn process_song(
    path: &Path,
    batch: &str,
    store: Arc<Store>,
    cache: Arc<MetaCache>,
    sink: Option<Arc<dyn MetadataSink>>,
    gate: Arc<RateGate>,
    config: Arc<RiffbankConfig>,
    cancel: CancellationToken,
) -> Result<SongOutcome> {
    if cancel.is_cancelled() {
        return Ok(SongOutcome::Cancelled);
    }

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable file, skipping");
            return Ok(SongOutcome::Done(AnalysisStatus::Failed));
        }
    };

    let song_id = ContentId::from_data(&bytes).to_hex();
    if store.stage_done(batch, &song_id, Stage::Persist.as_str())? {
        info!(song = %song_id, "already analyzed in this batch, skipping");
        return Ok(SongOutcome::Skipped);
    }

    // Pure CPU: run the whole pipeline off the async runtime
    let source_path = path.to_string_lossy().to_string();
    let analyze_config = config.clone();
    let analyze_cancel = cancel.clone();
    let analysis = tokio::task::spawn_blocking(move || {
        analyze_song(
            &bytes,
            &source_path,
            &analyze_config.analysis,
            &analyze_cancel,
        )
    })
    .await
    .context("joining analysis task")?;

    let mut analysis: SongAnalysis = match analysis {
        Ok(analysis) => analysis,
        Err(PipelineError::Cancelled) => return Ok(SongOutcome::Cancelled),
        Err(PipelineError::Input(e)) => {
            warn!(path = %path.display(), error = %e, "malformed input, song failed");
            return Ok(SongOutcome::Done(AnalysisStatus::Failed));
        }
        Err(e @ PipelineError::Invariant(_)) => {
            error!(path = %path.display(), error = %e, "invariant violation, aborting batch");
            return Err(e.into());
        }
    };

    // Genre/tag enrichment through the sink, when configured
    if let (Some(sink), Some(artist), Some(title)) = (
        sink.filter(|_| config.metadata.enable_lookup),
        analysis.song.artist.clone(),
        analysis.song.title.clone(),
    ) {
        match lookup_tags(&sink, &cache, &gate, &artist, &title, &config.metadata).await {
            Ok(Some(record)) => {
                let mut genres: Vec<String> =
                    record.sources.values().flatten().cloned().collect();
                genres.sort();
                genres.dedup();
                analysis.song.genres = genres;
                if let Some(id) = record.recording_id {
                    analysis.song.tags.push(format!("recording:{id}"));
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "metadata enrichment failed, continuing"),
        }
    }

    // Persist; a store error leaves the checkpoint unadvanced so the
    // song is retried on the next run
    match persist(&store, &analysis) {
        Ok(()) => {
            store.mark_stage_done(batch, &song_id, Stage::Persist.as_str())?;
            Ok(SongOutcome::Done(analysis.status))
        }
        Err(e) => {
            error!(song = %song_id, error = %e, "store write failed, song will be retried");
            Ok(SongOutcome::Done(AnalysisStatus::Failed))
        }
    }
}

fn persist(store: &Store, analysis: &SongAnalysis) -> Result<()> {
    store.upsert_song(&analysis.song, Some(&analysis.key), analysis.status)?;
    for (i, track) in analysis.song.tracks.iter().enumerate() {
        store.upsert_track(
            track,
            analysis.features.get(i),
            analysis.role_probs.get(i),
        )?;
    }
    for pattern in &analysis.patterns {
        store.upsert_pattern(pattern)?;
    }
    for instance in &analysis.instances {
        store.upsert_instance(instance)?;
    }
    Ok(())
}

/// Cross-corpus mining post-pass: load everything, cluster, rewrite.
pub fn mine_corpus(store: &Store) -> Result<(usize, usize)> {
    let (patterns, instances) = store.load_corpus()?;
    let before = patterns.len();
    let (clustered, reassigned) = pattern_mine::cluster_corpus(patterns, instances);
    store.replace_corpus(&clustered, &reassigned)?;
    Ok((before, clustered.len()))
}
