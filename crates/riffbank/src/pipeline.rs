//! The per-song analysis pipeline.
//!
//! Stages run in dependency order, entirely on the CPU, with cooperative
//! cancellation checks between stages. Everything here is deterministic:
//! analyzing the same bytes twice produces identical results, down to
//! the pattern ids.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use midi_normalize::{normalize, GridView, Song};
use music_analysis::{
    analyze_arps, classify_role, detect_key, extract_features, infer_chords, segment_sections,
    ArpDescriptor, ArpSummary, ChordConfig, ChordEvent, Features, KeyEstimate, RoleProbs,
    Section,
};
use pattern_mine::{chunk_track, dedup_song, Chunk, Pattern, PatternInstance, RhythmMode};
use riffstore::AnalysisStatus;

use crate::config::AnalysisConfig;
use crate::resolver::{resolve, Resolution};

/// Pipeline stages, in execution order. Checkpointing records the last
/// completed stage per song.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Resolve,
    Features,
    Roles,
    Patterns,
    Key,
    Chords,
    Arps,
    Sections,
    Persist,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Normalize,
        Stage::Resolve,
        Stage::Features,
        Stage::Roles,
        Stage::Patterns,
        Stage::Key,
        Stage::Chords,
        Stage::Arps,
        Stage::Sections,
        Stage::Persist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::Resolve => "resolve",
            Stage::Features => "features",
            Stage::Roles => "roles",
            Stage::Patterns => "patterns",
            Stage::Key => "key",
            Stage::Chords => "chords",
            Stage::Arps => "arps",
            Stage::Sections => "sections",
            Stage::Persist => "persist",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Input(#[from] midi_normalize::Error),

    #[error("cancelled")]
    Cancelled,

    /// An internal consistency check failed; this is a bug, and the
    /// batch aborts.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Arp analysis for one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackArps {
    pub track_id: String,
    pub windows: Vec<ArpDescriptor>,
    pub summary: ArpSummary,
}

/// Everything the pipeline derives from one song.
#[derive(Debug, Clone)]
pub struct SongAnalysis {
    pub song: Song,
    pub resolution: Resolution,
    pub features: Vec<Features>,
    pub role_probs: Vec<RoleProbs>,
    pub patterns: Vec<Pattern>,
    pub instances: Vec<PatternInstance>,
    pub key: KeyEstimate,
    pub chords: Vec<ChordEvent>,
    pub arps: Vec<TrackArps>,
    pub sections: Vec<Section>,
    pub status: AnalysisStatus,
}

/// Run the full per-song pipeline on raw SMF bytes.
pub fn analyze_song(
    midi_bytes: &[u8],
    source_path: &str,
    config: &AnalysisConfig,
    cancel: &CancellationToken,
) -> Result<SongAnalysis, PipelineError> {
    let check = |_stage: Stage| -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    };

    let grid = GridView::new(config.grid_steps_per_bar);
    let mode = if config.weighted_rhythm_fp {
        RhythmMode::VelocityBuckets
    } else {
        RhythmMode::Binary
    };

    let mut song = normalize(midi_bytes, source_path)?;

    check(Stage::Resolve)?;
    let resolution = resolve(&song.meta_texts, source_path);
    song.artist = resolution.artist.clone();
    song.title = resolution.title.clone();

    check(Stage::Features)?;
    let features: Vec<Features> = song
        .tracks
        .iter()
        .map(|t| extract_features(t, &song, &grid))
        .collect();

    check(Stage::Roles)?;
    let role_probs: Vec<RoleProbs> = features.iter().map(classify_role).collect();

    check(Stage::Patterns)?;
    let mut chunks: Vec<Chunk> = Vec::new();
    for (i, track) in song.tracks.iter().enumerate() {
        let (role, _) = role_probs[i].argmax();
        chunks.extend(chunk_track(track, &song, role, &grid));
    }
    let (patterns, instances) = dedup_song(&chunks, mode);

    check(Stage::Key)?;
    let key = detect_key(&song, &features);

    check(Stage::Chords)?;
    let chords = infer_chords(
        &song,
        &role_probs,
        &key,
        ChordConfig {
            windows_per_bar: config.chord_windows_per_bar,
        },
    );

    check(Stage::Arps)?;
    let mut arps = Vec::new();
    for (i, track) in song.tracks.iter().enumerate() {
        if role_probs[i].arp >= 0.5 {
            let (windows, summary) = analyze_arps(track, &song, &chords);
            if let Some(summary) = summary {
                arps.push(TrackArps {
                    track_id: track.track_id.clone(),
                    windows,
                    summary,
                });
            }
        }
    }

    check(Stage::Sections)?;
    let sections = segment_sections(&song, &role_probs, &chords);

    let status = if song.warnings.total() > 0 || !resolution.is_confident() {
        AnalysisStatus::Partial
    } else {
        AnalysisStatus::Ok
    };

    let analysis = SongAnalysis {
        song,
        resolution,
        features,
        role_probs,
        patterns,
        instances,
        key,
        chords,
        arps,
        sections,
        status,
    };

    verify_invariants(&analysis)?;

    info!(
        song = %analysis.song.song_id,
        tracks = analysis.song.tracks.len(),
        patterns = analysis.patterns.len(),
        status = ?analysis.status,
        "song analyzed"
    );
    Ok(analysis)
}

/// Internal consistency checks. A failure here is a bug, not bad input,
/// and aborts the whole batch.
fn verify_invariants(analysis: &SongAnalysis) -> Result<(), PipelineError> {
    for (i, probs) in analysis.role_probs.iter().enumerate() {
        let sum = probs.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(PipelineError::Invariant(format!(
                "track {i} role probabilities sum to {sum}"
            )));
        }
    }

    for pair in analysis.chords.windows(2) {
        if pair[1].start_beat < pair[0].end_beat - 1e-9 {
            return Err(PipelineError::Invariant(format!(
                "chords overlap at beat {}",
                pair[1].start_beat
            )));
        }
    }

    for instance in &analysis.instances {
        if !analysis
            .patterns
            .iter()
            .any(|p| p.pattern_id == instance.pattern_id)
        {
            return Err(PipelineError::Invariant(format!(
                "instance references unknown pattern {}",
                instance.pattern_id
            )));
        }
    }

    let mut expected_start = 0u32;
    for section in &analysis.sections {
        if section.start_bar != expected_start || section.end_bar <= section.start_bar {
            return Err(PipelineError::Invariant(format!(
                "sections do not tile a prefix at bar {}",
                section.start_bar
            )));
        }
        expected_start = section.end_bar;
    }

    Ok(())
}
