//! Artist/title resolution from MIDI meta events, folder structure, and
//! filename heuristics, plus the pluggable tag-lookup sink contract.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use riffstore::{CacheLookup, MetaCache, RateGate, TagRecord};

use crate::config::MetadataConfig;

/// Which strategy produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    MidiMeta,
    FolderStructure,
    Filename,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub confidence: f64,
    pub strategy: Strategy,
}

impl Resolution {
    fn none() -> Self {
        Self {
            artist: None,
            title: None,
            confidence: 0.0,
            strategy: Strategy::None,
        }
    }

    /// Confident enough to persist without human review.
    pub fn is_confident(&self) -> bool {
        self.confidence > 0.5
    }
}

/// Resolve (artist, title) by trying strategies in priority order; the
/// first result with confidence > 0.5 wins. Lower-confidence guesses are
/// still returned so a human can review them later.
pub fn resolve(meta_texts: &[String], source_path: &str) -> Resolution {
    let candidates = [
        from_meta(meta_texts),
        from_folder_structure(source_path),
        from_filename(source_path),
    ];

    for candidate in &candidates {
        if candidate.is_confident() {
            debug!(?candidate.strategy, "metadata resolved");
            return candidate.clone();
        }
    }

    // Best guess below the review threshold
    candidates
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .unwrap_or_else(Resolution::none)
}

/// Track-name / text / copyright meta, looking for "Artist - Title" or
/// "Title / Artist".
fn from_meta(meta_texts: &[String]) -> Resolution {
    for text in meta_texts {
        if let Some((left, right)) = split_two(text, " - ") {
            return Resolution {
                artist: Some(left),
                title: Some(right),
                confidence: 0.8,
                strategy: Strategy::MidiMeta,
            };
        }
        if let Some((left, right)) = split_two(text, " / ") {
            return Resolution {
                artist: Some(right),
                title: Some(left),
                confidence: 0.7,
                strategy: Strategy::MidiMeta,
            };
        }
    }
    Resolution::none()
}

/// Archive layout `<letter>/<artist>/<title>.mid` where the letter shelf
/// is a single character.
fn from_folder_structure(source_path: &str) -> Resolution {
    let path = Path::new(source_path);
    let mut components: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();

    let Some(file) = components.pop() else {
        return Resolution::none();
    };
    if components.len() < 2 {
        return Resolution::none();
    }

    let artist = components[components.len() - 1];
    let shelf = components[components.len() - 2];
    if shelf.chars().count() != 1 {
        return Resolution::none();
    }

    let title = Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file);

    Resolution {
        artist: Some(artist.to_string()),
        title: Some(title.to_string()),
        confidence: 0.9,
        strategy: Strategy::FolderStructure,
    }
}

/// Filename heuristics: strip noise, split on " - ", and use word
/// capitalization to decide which side is the title.
fn from_filename(source_path: &str) -> Resolution {
    let stem = Path::new(source_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    if stem.is_empty() {
        return Resolution::none();
    }

    let cleaned = strip_domain_suffix(&strip_digit_runs(stem));
    let cleaned = cleaned.trim_matches(|c: char| c == '-' || c.is_whitespace());
    if cleaned.is_empty() {
        return Resolution::none();
    }

    if let Some((left, right)) = split_two(cleaned, " - ") {
        // The side with more capitalized words reads as the title
        let (artist, title) = if capitalized_words(&right) >= capitalized_words(&left) {
            (left, right)
        } else {
            (right, left)
        };
        return Resolution {
            artist: Some(artist),
            title: Some(title),
            confidence: 0.4,
            strategy: Strategy::Filename,
        };
    }

    // Hyphen-packed names (scene rips): guess the leading tokens as the
    // artist, keep it below the review threshold
    let tokens: Vec<&str> = cleaned.split('-').filter(|t| !t.is_empty()).collect();
    if tokens.len() >= 4 {
        return Resolution {
            artist: Some(tokens[..2].join(" ")),
            title: Some(tokens[2..].join(" ")),
            confidence: 0.3,
            strategy: Strategy::Filename,
        };
    }

    Resolution {
        artist: None,
        title: Some(cleaned.replace('-', " ")),
        confidence: 0.4,
        strategy: Strategy::Filename,
    }
}

/// Split into exactly two non-empty trimmed parts.
fn split_two(text: &str, separator: &str) -> Option<(String, String)> {
    let mut parts = text.splitn(2, separator);
    let left = parts.next()?.trim();
    let right = parts.next()?.trim();
    if left.is_empty() || right.is_empty() || right.contains(separator) {
        return None;
    }
    Some((left.to_string(), right.to_string()))
}

/// Remove any run of 8 or more digits (release timestamps).
fn strip_digit_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            if digits.len() < 8 {
                out.push_str(&digits);
            }
            digits.clear();
            out.push(c);
        }
    }
    if digits.len() < 8 {
        out.push_str(&digits);
    }
    out
}

/// Drop a trailing `-somesite.com` style scene tag.
fn strip_domain_suffix(s: &str) -> String {
    const TLDS: [&str; 5] = [".com", ".net", ".org", ".io", ".fm"];
    for tld in TLDS {
        if let Some(stripped) = s.strip_suffix(tld) {
            if let Some(dash) = stripped.rfind('-') {
                return stripped[..dash].to_string();
            }
        }
    }
    s.to_string()
}

fn capitalized_words(s: &str) -> usize {
    s.split_whitespace()
        .filter(|w| w.chars().next().map(|c| c.is_uppercase()).unwrap_or(false))
        .count()
}

// --- tag lookup sink ---

/// External tag provider contract. Given an (artist, title) pair the sink
/// returns raw tags per source, or a miss. Transport, auth, and quotas
/// live behind this trait; the resolver has none of that.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn lookup(&self, artist: &str, title: &str) -> Result<Option<TagRecord>>;
}

/// Sink that never finds anything; the default when lookups are off.
pub struct NullSink;

#[async_trait]
impl MetadataSink for NullSink {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn lookup(&self, _artist: &str, _title: &str) -> Result<Option<TagRecord>> {
        Ok(None)
    }
}

/// Cached, rate-gated, retried lookup around a sink.
///
/// Cache hits (positive or negative) short-circuit. Misses call the sink
/// with a timeout and exponential backoff; exhausting the attempt budget
/// records a short-TTL negative entry so the batch moves on.
pub async fn lookup_tags(
    sink: &Arc<dyn MetadataSink>,
    cache: &MetaCache,
    gate: &RateGate,
    artist: &str,
    title: &str,
    config: &MetadataConfig,
) -> Result<Option<TagRecord>> {
    match cache.get(artist, title)? {
        CacheLookup::Hit(record) => return Ok(Some(record)),
        CacheLookup::NegativeHit => return Ok(None),
        CacheLookup::Miss => {}
    }

    let timeout = Duration::from_secs(config.timeout_secs);
    for attempt in 0..config.attempts {
        // Respect the provider's rate limit before each attempt
        while !gate.try_acquire(sink.name()) {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        match tokio::time::timeout(timeout, sink.lookup(artist, title)).await {
            Ok(Ok(Some(record))) => {
                cache.put(artist, title, sink.name(), &record)?;
                return Ok(Some(record));
            }
            Ok(Ok(None)) => {
                // A clean miss is cacheable too
                cache.put_negative(artist, title, sink.name())?;
                return Ok(None);
            }
            Ok(Err(e)) => {
                warn!(attempt, error = %e, "metadata lookup failed");
            }
            Err(_) => {
                warn!(attempt, "metadata lookup timed out");
            }
        }

        let backoff = Duration::from_millis(500 * 2u64.pow(attempt));
        tokio::time::sleep(backoff).await;
    }

    cache.put_negative(artist, title, sink.name())?;
    Ok(None)
}
