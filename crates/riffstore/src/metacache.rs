use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default time-to-live for successful lookups: 30 days.
const POSITIVE_TTL_DAYS: i64 = 30;

/// Failed lookups are remembered briefly so the batch doesn't hammer a
/// broken service: 1 day.
const NEGATIVE_TTL_DAYS: i64 = 1;

/// What an external tag provider returned for an (artist, title) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    /// Provider name -> raw tags as returned.
    pub sources: std::collections::BTreeMap<String, Vec<String>>,
    pub recording_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(TagRecord),
    /// A recent failed lookup; don't retry yet.
    NegativeHit,
    Miss,
}

/// Process-wide metadata cache keyed by normalized (artist, title).
///
/// Entries carry a TTL; expired rows read as misses and are overwritten
/// on the next store.
pub struct MetaCache {
    connection: Mutex<Connection>,
}

impl MetaCache {
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = Connection::open(db_path).context("opening metadata cache db")?;
        Self::init(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("opening in-memory cache")?;
        Self::init(connection)
    }

    fn init(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS metadata_cache (
                    key        TEXT PRIMARY KEY,
                    source     TEXT NOT NULL,
                    fetched_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    payload    TEXT
                );",
            )
            .context("creating metadata cache table")?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Cache key: lowercased and whitespace-normalized artist|title.
    pub fn cache_key(artist: &str, title: &str) -> String {
        let normalize = |s: &str| {
            s.to_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        };
        format!("{}|{}", normalize(artist), normalize(title))
    }

    pub fn get(&self, artist: &str, title: &str) -> Result<CacheLookup> {
        let key = Self::cache_key(artist, title);
        let conn = self
            .connection
            .lock()
            .map_err(|_| anyhow::anyhow!("cache mutex poisoned"))?;

        let row = conn
            .prepare_cached(
                "SELECT payload, expires_at FROM metadata_cache WHERE key = ?1",
            )?
            .query_row(params![key], |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?))
            });

        match row {
            Ok((payload, expires_at)) => {
                let expires: DateTime<Utc> = expires_at
                    .parse()
                    .context("parsing cache expiry timestamp")?;
                if Utc::now() > expires {
                    return Ok(CacheLookup::Miss);
                }
                match payload {
                    Some(json) => {
                        let record: TagRecord =
                            serde_json::from_str(&json).context("deserializing tag record")?;
                        Ok(CacheLookup::Hit(record))
                    }
                    None => Ok(CacheLookup::NegativeHit),
                }
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(CacheLookup::Miss),
            Err(e) => Err(e).context("querying metadata cache"),
        }
    }

    pub fn put(&self, artist: &str, title: &str, source: &str, record: &TagRecord) -> Result<()> {
        self.write(artist, title, source, Some(record), POSITIVE_TTL_DAYS)
    }

    /// Record a failed lookup with a short TTL.
    pub fn put_negative(&self, artist: &str, title: &str, source: &str) -> Result<()> {
        self.write(artist, title, source, None, NEGATIVE_TTL_DAYS)
    }

    fn write(
        &self,
        artist: &str,
        title: &str,
        source: &str,
        record: Option<&TagRecord>,
        ttl_days: i64,
    ) -> Result<()> {
        let key = Self::cache_key(artist, title);
        let payload = record.map(serde_json::to_string).transpose()?;
        let now = Utc::now();
        let expires = now + Duration::days(ttl_days);

        let conn = self
            .connection
            .lock()
            .map_err(|_| anyhow::anyhow!("cache mutex poisoned"))?;
        conn.prepare_cached(
            "INSERT OR REPLACE INTO metadata_cache (key, source, fetched_at, expires_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![
            key,
            source,
            now.to_rfc3339(),
            expires.to_rfc3339(),
            payload,
        ])
        .context("writing metadata cache entry")?;

        debug!(key, source, negative = record.is_none(), "metadata cached");
        Ok(())
    }
}

/// Token-bucket rate limiter for one external service.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-provider rate gates with the published limits:
/// MusicBrainz 1/s, Discogs 60/min, Last.fm 5/s.
pub struct RateGate {
    buckets: Mutex<std::collections::BTreeMap<String, TokenBucket>>,
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RateGate {
    pub fn new() -> Self {
        let mut buckets = std::collections::BTreeMap::new();
        buckets.insert("musicbrainz".to_string(), TokenBucket::new(1.0, 1.0));
        buckets.insert("discogs".to_string(), TokenBucket::new(5.0, 1.0));
        buckets.insert("lastfm".to_string(), TokenBucket::new(5.0, 5.0));
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    /// Take one token for the named provider. Unknown providers are not
    /// limited.
    pub fn try_acquire(&self, source: &str) -> bool {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match buckets.get_mut(source) {
            Some(bucket) => bucket.try_acquire(),
            None => true,
        }
    }
}
