use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use midi_normalize::Song;
use music_analysis::{Features, KeyEstimate, KeyMode, Role, RoleProbs};
use pattern_mine::{
    from_canonical_json, to_canonical_json, Pattern, PatternInstance, PatternStats, Transform,
};

/// Outcome of one song's analysis, persisted for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Ok,
    Partial,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Ok => "ok",
            AnalysisStatus::Partial => "partial",
            AnalysisStatus::Failed => "failed",
        }
    }
}

/// Query contract for clip search. Results are ordered by
/// (popularity desc, pattern_id asc) so pagination is stable.
#[derive(Debug, Clone, Default)]
pub struct ClipQuery {
    pub role: Option<Role>,
    pub genre: Option<String>,
    pub artist: Option<String>,
    pub meter: Option<(u8, u8)>,
    pub min_length_bars: Option<u8>,
    pub max_length_bars: Option<u8>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClipHit {
    pub pattern_id: String,
    pub role: String,
    pub length_bars: u8,
    pub meter: String,
    pub grid_resolution: u8,
    /// Canonical JSON representation.
    pub representation: String,
    pub popularity: u32,
}

/// SQLite-backed corpus store.
///
/// All writes are idempotent upserts keyed by stable content ids, so a
/// retry after a partial failure converges on the same final state.
/// Thread-safe via Mutex; one writer at a time is all the batch driver
/// needs.
pub struct Store {
    connection: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = Connection::open(db_path).context("opening corpus store db")?;
        Self::init(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("opening in-memory store")?;
        Self::init(connection)
    }

    fn init(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(
                "PRAGMA foreign_keys = ON;
                CREATE TABLE IF NOT EXISTS songs (
                    song_id         TEXT PRIMARY KEY,
                    source_path     TEXT NOT NULL,
                    tempo_map       TEXT NOT NULL,
                    time_sig_map    TEXT NOT NULL,
                    detected_tonic  INTEGER,
                    detected_mode   TEXT,
                    artist          TEXT,
                    title           TEXT,
                    genres          TEXT NOT NULL DEFAULT '[]',
                    tags            TEXT NOT NULL DEFAULT '[]',
                    analysis_status TEXT NOT NULL DEFAULT 'ok'
                );
                CREATE TABLE IF NOT EXISTS tracks (
                    track_id   TEXT PRIMARY KEY,
                    song_id    TEXT NOT NULL REFERENCES songs(song_id) ON DELETE CASCADE,
                    name       TEXT,
                    channel    INTEGER NOT NULL,
                    role_probs TEXT,
                    features   TEXT
                );
                CREATE TABLE IF NOT EXISTS patterns (
                    pattern_id      TEXT PRIMARY KEY,
                    role            TEXT NOT NULL,
                    length_bars     INTEGER NOT NULL,
                    meter           TEXT NOT NULL,
                    grid_resolution INTEGER NOT NULL,
                    rhythm_fp       TEXT NOT NULL,
                    pitch_fp        TEXT NOT NULL,
                    combo_fp        TEXT NOT NULL,
                    representation  TEXT NOT NULL,
                    stats           TEXT NOT NULL,
                    tags            TEXT NOT NULL DEFAULT '[]'
                );
                CREATE TABLE IF NOT EXISTS pattern_instances (
                    pattern_id TEXT NOT NULL REFERENCES patterns(pattern_id) ON DELETE CASCADE,
                    song_id    TEXT NOT NULL REFERENCES songs(song_id) ON DELETE CASCADE,
                    track_id   TEXT NOT NULL,
                    start_bar  INTEGER NOT NULL,
                    confidence REAL NOT NULL,
                    transform  TEXT NOT NULL,
                    PRIMARY KEY (pattern_id, song_id, track_id, start_bar)
                );
                CREATE TABLE IF NOT EXISTS checkpoints (
                    batch_id     TEXT NOT NULL,
                    song_id      TEXT NOT NULL,
                    stage        TEXT NOT NULL,
                    completed_at TEXT NOT NULL,
                    PRIMARY KEY (batch_id, song_id, stage)
                );
                CREATE INDEX IF NOT EXISTS idx_patterns_bucket
                    ON patterns(role, length_bars, meter);
                CREATE INDEX IF NOT EXISTS idx_instances_song
                    ON pattern_instances(song_id);
                CREATE INDEX IF NOT EXISTS idx_songs_artist_title
                    ON songs(artist, title);
                CREATE INDEX IF NOT EXISTS idx_songs_genres
                    ON songs(genres);",
            )
            .context("creating store tables")?;

        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| anyhow::anyhow!("store mutex poisoned"))
    }

    // --- songs and tracks ---

    pub fn upsert_song(
        &self,
        song: &Song,
        key: Option<&KeyEstimate>,
        status: AnalysisStatus,
    ) -> Result<()> {
        let conn = self.lock()?;
        let tempo_map = serde_json::to_string(&song.tempo_map)?;
        let time_sig_map = serde_json::to_string(&song.time_sig_map)?;
        let genres = serde_json::to_string(&song.genres)?;
        let tags = serde_json::to_string(&song.tags)?;

        conn.prepare_cached(
            "INSERT INTO songs (song_id, source_path, tempo_map, time_sig_map,
                                detected_tonic, detected_mode, artist, title,
                                genres, tags, analysis_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(song_id) DO UPDATE SET
                source_path = excluded.source_path,
                tempo_map = excluded.tempo_map,
                time_sig_map = excluded.time_sig_map,
                detected_tonic = excluded.detected_tonic,
                detected_mode = excluded.detected_mode,
                artist = excluded.artist,
                title = excluded.title,
                genres = excluded.genres,
                tags = excluded.tags,
                analysis_status = excluded.analysis_status",
        )?
        .execute(params![
            song.song_id.to_hex(),
            song.source_path,
            tempo_map,
            time_sig_map,
            key.map(|k| k.tonic),
            key.map(|k| match k.mode {
                KeyMode::Major => "major",
                KeyMode::Minor => "minor",
            }),
            song.artist,
            song.title,
            genres,
            tags,
            status.as_str(),
        ])
        .context("upserting song")?;

        debug!(song = %song.song_id, "song upserted");
        Ok(())
    }

    pub fn upsert_track(
        &self,
        track: &midi_normalize::Track,
        features: Option<&Features>,
        role_probs: Option<&RoleProbs>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let features_json = features.map(serde_json::to_string).transpose()?;
        let probs_json = role_probs.map(serde_json::to_string).transpose()?;

        conn.prepare_cached(
            "INSERT INTO tracks (track_id, song_id, name, channel, role_probs, features)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(track_id) DO UPDATE SET
                name = excluded.name,
                channel = excluded.channel,
                role_probs = excluded.role_probs,
                features = excluded.features",
        )?
        .execute(params![
            track.track_id,
            track.song_id.to_hex(),
            track.name,
            track.channel,
            probs_json,
            features_json,
        ])
        .context("upserting track")?;
        Ok(())
    }

    pub fn delete_song(&self, song_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let deleted = conn
            .prepare_cached("DELETE FROM songs WHERE song_id = ?1")?
            .execute(params![song_id])
            .context("deleting song")?;
        info!(song = song_id, deleted, "song deleted (tracks and instances cascade)");
        Ok(())
    }

    pub fn song_status(&self, song_id: &str) -> Result<Option<AnalysisStatus>> {
        let conn = self.lock()?;
        let result = conn
            .prepare_cached("SELECT analysis_status FROM songs WHERE song_id = ?1")?
            .query_row(params![song_id], |row| row.get::<_, String>(0));
        match result {
            Ok(s) => Ok(Some(match s.as_str() {
                "partial" => AnalysisStatus::Partial,
                "failed" => AnalysisStatus::Failed,
                _ => AnalysisStatus::Ok,
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("querying song status"),
        }
    }

    // --- patterns and instances ---

    pub fn upsert_pattern(&self, pattern: &Pattern) -> Result<()> {
        let conn = self.lock()?;
        conn.prepare_cached(
            "INSERT INTO patterns (pattern_id, role, length_bars, meter, grid_resolution,
                                   rhythm_fp, pitch_fp, combo_fp, representation, stats)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(pattern_id) DO UPDATE SET
                stats = excluded.stats,
                representation = excluded.representation",
        )?
        .execute(params![
            pattern.pattern_id,
            pattern.role.as_str(),
            pattern.length_bars,
            format!("{}/{}", pattern.meter.0, pattern.meter.1),
            pattern.grid_resolution,
            pattern.rhythm_fp,
            pattern.pitch_fp,
            pattern.combo_fp,
            to_canonical_json(&pattern.representation),
            serde_json::to_string(&pattern.stats)?,
        ])
        .context("upserting pattern")?;
        Ok(())
    }

    pub fn upsert_instance(&self, instance: &PatternInstance) -> Result<()> {
        let conn = self.lock()?;
        conn.prepare_cached(
            "INSERT INTO pattern_instances
                (pattern_id, song_id, track_id, start_bar, confidence, transform)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(pattern_id, song_id, track_id, start_bar) DO UPDATE SET
                confidence = excluded.confidence,
                transform = excluded.transform",
        )?
        .execute(params![
            instance.pattern_id,
            instance.song_id,
            instance.track_id,
            instance.start_bar,
            instance.confidence,
            serde_json::to_string(&instance.transform)?,
        ])
        .context("upserting pattern instance")?;
        Ok(())
    }

    /// Load the whole pattern corpus for cross-corpus mining.
    pub fn load_corpus(&self) -> Result<(Vec<Pattern>, Vec<PatternInstance>)> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare_cached(
            "SELECT pattern_id, role, length_bars, meter, grid_resolution,
                    rhythm_fp, pitch_fp, combo_fp, representation, stats
             FROM patterns ORDER BY pattern_id",
        )?;
        let patterns: Vec<Pattern> = stmt
            .query_map([], |row| {
                let meter_str: String = row.get(3)?;
                let representation_json: String = row.get(8)?;
                let stats_json: String = row.get(9)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u8>(2)?,
                    meter_str,
                    row.get::<_, u8>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    representation_json,
                    stats_json,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter_map(
                |(id, role, length, meter, grid, rhythm, pitch, combo, repr, stats)| {
                    let role = Role::from_str_loose(&role)?;
                    let meter = parse_meter(&meter)?;
                    let representation = from_canonical_json(&repr)?;
                    let stats: PatternStats = serde_json::from_str(&stats).ok()?;
                    Some(Pattern {
                        pattern_id: id,
                        role,
                        length_bars: length,
                        meter,
                        grid_resolution: grid,
                        rhythm_fp: rhythm,
                        pitch_fp: pitch,
                        combo_fp: combo,
                        representation,
                        stats,
                    })
                },
            )
            .collect();

        let mut stmt = conn.prepare_cached(
            "SELECT pattern_id, song_id, track_id, start_bar, confidence, transform
             FROM pattern_instances ORDER BY pattern_id, song_id, track_id, start_bar",
        )?;
        let instances: Vec<PatternInstance> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter_map(|(pattern_id, song_id, track_id, start_bar, confidence, t)| {
                let transform: Transform = serde_json::from_str(&t).ok()?;
                Some(PatternInstance {
                    pattern_id,
                    song_id,
                    track_id,
                    start_bar,
                    confidence,
                    transform,
                })
            })
            .collect();

        Ok((patterns, instances))
    }

    /// Replace the mined corpus in one transaction (used after
    /// cross-corpus clustering rewrites canonical assignments).
    pub fn replace_corpus(
        &self,
        patterns: &[Pattern],
        instances: &[PatternInstance],
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("starting corpus rewrite")?;

        tx.execute("DELETE FROM pattern_instances", [])?;
        tx.execute("DELETE FROM patterns", [])?;

        for pattern in patterns {
            tx.prepare_cached(
                "INSERT INTO patterns (pattern_id, role, length_bars, meter, grid_resolution,
                                       rhythm_fp, pitch_fp, combo_fp, representation, stats)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?
            .execute(params![
                pattern.pattern_id,
                pattern.role.as_str(),
                pattern.length_bars,
                format!("{}/{}", pattern.meter.0, pattern.meter.1),
                pattern.grid_resolution,
                pattern.rhythm_fp,
                pattern.pitch_fp,
                pattern.combo_fp,
                to_canonical_json(&pattern.representation),
                serde_json::to_string(&pattern.stats)?,
            ])?;
        }
        for instance in instances {
            tx.prepare_cached(
                "INSERT OR REPLACE INTO pattern_instances
                    (pattern_id, song_id, track_id, start_bar, confidence, transform)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?
            .execute(params![
                instance.pattern_id,
                instance.song_id,
                instance.track_id,
                instance.start_bar,
                instance.confidence,
                serde_json::to_string(&instance.transform)?,
            ])?;
        }

        tx.commit().context("committing corpus rewrite")?;
        info!(
            patterns = patterns.len(),
            instances = instances.len(),
            "corpus rewritten"
        );
        Ok(())
    }

    // --- clip queries ---

    pub fn query_clips(&self, query: &ClipQuery) -> Result<Vec<ClipHit>> {
        let conn = self.lock()?;

        let mut sql = String::from(
            "SELECT p.pattern_id, p.role, p.length_bars, p.meter, p.grid_resolution,
                    p.representation,
                    (SELECT COUNT(*) FROM pattern_instances pi
                     WHERE pi.pattern_id = p.pattern_id) AS popularity
             FROM patterns p WHERE 1=1",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(role) = query.role {
            sql.push_str(" AND p.role = ?");
            params_vec.push(Box::new(role.as_str().to_string()));
        }
        if let Some((num, den)) = query.meter {
            sql.push_str(" AND p.meter = ?");
            params_vec.push(Box::new(format!("{num}/{den}")));
        }
        if let Some(min) = query.min_length_bars {
            sql.push_str(" AND p.length_bars >= ?");
            params_vec.push(Box::new(min));
        }
        if let Some(max) = query.max_length_bars {
            sql.push_str(" AND p.length_bars <= ?");
            params_vec.push(Box::new(max));
        }
        if let Some(artist) = &query.artist {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM pattern_instances pi
                              JOIN songs s ON s.song_id = pi.song_id
                              WHERE pi.pattern_id = p.pattern_id AND s.artist = ?)",
            );
            params_vec.push(Box::new(artist.clone()));
        }
        if let Some(genre) = &query.genre {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM pattern_instances pi
                              JOIN songs s ON s.song_id = pi.song_id
                              WHERE pi.pattern_id = p.pattern_id AND s.genres LIKE ?)",
            );
            params_vec.push(Box::new(format!("%\"{genre}\"%")));
        }

        sql.push_str(" ORDER BY popularity DESC, p.pattern_id ASC LIMIT ? OFFSET ?");
        params_vec.push(Box::new(if query.limit == 0 { 50 } else { query.limit }));
        params_vec.push(Box::new(query.offset));

        let mut stmt = conn.prepare(&sql)?;
        let hits = stmt
            .query_map(
                rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
                |row| {
                    Ok(ClipHit {
                        pattern_id: row.get(0)?,
                        role: row.get(1)?,
                        length_bars: row.get(2)?,
                        meter: row.get(3)?,
                        grid_resolution: row.get(4)?,
                        representation: row.get(5)?,
                        popularity: row.get(6)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("querying clips")?;

        Ok(hits)
    }

    // --- checkpoint journal ---

    pub fn mark_stage_done(&self, batch_id: &str, song_id: &str, stage: &str) -> Result<()> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.prepare_cached(
            "INSERT OR REPLACE INTO checkpoints (batch_id, song_id, stage, completed_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![batch_id, song_id, stage, now])
        .context("recording checkpoint")?;
        Ok(())
    }

    pub fn stage_done(&self, batch_id: &str, song_id: &str, stage: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: u32 = conn
            .prepare_cached(
                "SELECT COUNT(*) FROM checkpoints
                 WHERE batch_id = ?1 AND song_id = ?2 AND stage = ?3",
            )?
            .query_row(params![batch_id, song_id, stage], |row| row.get(0))
            .context("querying checkpoint")?;
        Ok(count > 0)
    }
}

fn parse_meter(s: &str) -> Option<(u8, u8)> {
    let (num, den) = s.split_once('/')?;
    Some((num.parse().ok()?, den.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use midi_normalize::{ContentId, NormalizeWarnings, NoteEvent, TempoSegment, TimeSigSegment, Track};
    use music_analysis::KeyMode;
    use pattern_mine::{chunk_track, dedup_song, RhythmMode};

    fn sample_song(tag: &[u8]) -> Song {
        let song_id = ContentId::from_data(tag);
        let notes: Vec<NoteEvent> = (0..8)
            .map(|i| NoteEvent {
                start_beat: i as f64 * 0.5,
                duration_beats: 0.4,
                pitch: 36 + (i % 4) as u8 * 3,
                velocity: 100,
                channel: 0,
            })
            .collect();

        Song {
            song_id: song_id.clone(),
            source_path: format!("{}.mid", String::from_utf8_lossy(tag)),
            tempo_map: vec![TempoSegment {
                start_beat: 0.0,
                microseconds_per_quarter: 500_000,
            }],
            time_sig_map: vec![TimeSigSegment {
                start_bar: 0,
                numerator: 4,
                denominator: 4,
            }],
            tracks: vec![Track {
                track_id: format!("{}:0", song_id),
                song_id,
                name: Some("Bass".into()),
                channel: 0,
                note_events: notes,
            }],
            artist: Some("Test Artist".into()),
            title: Some("Test Title".into()),
            genres: vec!["house".into()],
            tags: vec![],
            meta_texts: vec![],
            warnings: NormalizeWarnings::default(),
        }
    }

    fn key() -> KeyEstimate {
        KeyEstimate {
            tonic: 0,
            mode: KeyMode::Major,
            confidence: 0.8,
            stability_samples: 1.0,
        }
    }

    fn mined(song: &Song) -> (Vec<Pattern>, Vec<PatternInstance>) {
        let chunks = chunk_track(
            &song.tracks[0],
            song,
            Role::Bass,
            &midi_normalize::GridView::default(),
        );
        dedup_song(&chunks, RhythmMode::Binary)
    }

    #[test]
    fn song_upsert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let song = sample_song(b"songa");

        store.upsert_song(&song, Some(&key()), AnalysisStatus::Ok).unwrap();
        store.upsert_song(&song, Some(&key()), AnalysisStatus::Ok).unwrap();

        assert_eq!(
            store.song_status(&song.song_id.to_hex()).unwrap(),
            Some(AnalysisStatus::Ok)
        );
    }

    #[test]
    fn missing_song_has_no_status() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.song_status("nope").unwrap(), None);
    }

    #[test]
    fn pattern_round_trip_through_store() {
        let store = Store::open_in_memory().unwrap();
        let song = sample_song(b"songa");
        store.upsert_song(&song, Some(&key()), AnalysisStatus::Ok).unwrap();

        let (patterns, instances) = mined(&song);
        for p in &patterns {
            store.upsert_pattern(p).unwrap();
        }
        for i in &instances {
            store.upsert_instance(i).unwrap();
        }

        let (loaded_patterns, loaded_instances) = store.load_corpus().unwrap();
        assert_eq!(loaded_patterns.len(), patterns.len());
        assert_eq!(loaded_instances.len(), instances.len());

        let mut expected = patterns.clone();
        expected.sort_by(|a, b| a.pattern_id.cmp(&b.pattern_id));
        assert_eq!(loaded_patterns, expected);
    }

    #[test]
    fn rerunning_upserts_leaves_identical_state() {
        let store = Store::open_in_memory().unwrap();
        let song = sample_song(b"songa");
        store.upsert_song(&song, Some(&key()), AnalysisStatus::Ok).unwrap();

        let (patterns, instances) = mined(&song);
        for _ in 0..2 {
            for p in &patterns {
                store.upsert_pattern(p).unwrap();
            }
            for i in &instances {
                store.upsert_instance(i).unwrap();
            }
        }

        let (loaded_patterns, loaded_instances) = store.load_corpus().unwrap();
        assert_eq!(loaded_patterns.len(), patterns.len());
        assert_eq!(loaded_instances.len(), instances.len());
    }

    #[test]
    fn delete_song_cascades_to_tracks_and_instances() {
        let store = Store::open_in_memory().unwrap();
        let song = sample_song(b"songa");
        store.upsert_song(&song, Some(&key()), AnalysisStatus::Ok).unwrap();
        store.upsert_track(&song.tracks[0], None, None).unwrap();

        let (patterns, instances) = mined(&song);
        for p in &patterns {
            store.upsert_pattern(p).unwrap();
        }
        for i in &instances {
            store.upsert_instance(i).unwrap();
        }

        store.delete_song(&song.song_id.to_hex()).unwrap();

        let (_, loaded_instances) = store.load_corpus().unwrap();
        assert!(loaded_instances.is_empty());
        assert_eq!(store.song_status(&song.song_id.to_hex()).unwrap(), None);
    }

    #[test]
    fn clip_query_filters_and_orders() {
        let store = Store::open_in_memory().unwrap();
        let song = sample_song(b"songa");
        store.upsert_song(&song, Some(&key()), AnalysisStatus::Ok).unwrap();

        let (patterns, instances) = mined(&song);
        for p in &patterns {
            store.upsert_pattern(p).unwrap();
        }
        for i in &instances {
            store.upsert_instance(i).unwrap();
        }

        let hits = store
            .query_clips(&ClipQuery {
                role: Some(Role::Bass),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.role == "bass"));
        // Ordered by (popularity desc, pattern_id asc)
        for pair in hits.windows(2) {
            assert!(
                pair[0].popularity > pair[1].popularity
                    || (pair[0].popularity == pair[1].popularity
                        && pair[0].pattern_id < pair[1].pattern_id)
            );
        }

        let none = store
            .query_clips(&ClipQuery {
                role: Some(Role::Drums),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());

        let by_artist = store
            .query_clips(&ClipQuery {
                artist: Some("Test Artist".into()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_artist.len(), hits.len());

        let by_genre = store
            .query_clips(&ClipQuery {
                genre: Some("house".into()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_genre.len(), hits.len());

        let wrong_genre = store
            .query_clips(&ClipQuery {
                genre: Some("jazz".into()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(wrong_genre.is_empty());
    }

    #[test]
    fn replace_corpus_rewrites_atomically() {
        let store = Store::open_in_memory().unwrap();
        let song = sample_song(b"songa");
        store.upsert_song(&song, Some(&key()), AnalysisStatus::Ok).unwrap();

        let (patterns, instances) = mined(&song);
        for p in &patterns {
            store.upsert_pattern(p).unwrap();
        }
        for i in &instances {
            store.upsert_instance(i).unwrap();
        }

        // Rewrite with only the first pattern and its instances
        let kept = vec![patterns[0].clone()];
        let kept_instances: Vec<PatternInstance> = instances
            .iter()
            .filter(|i| i.pattern_id == patterns[0].pattern_id)
            .cloned()
            .collect();
        store.replace_corpus(&kept, &kept_instances).unwrap();

        let (loaded_patterns, loaded_instances) = store.load_corpus().unwrap();
        assert_eq!(loaded_patterns.len(), 1);
        assert_eq!(loaded_instances.len(), kept_instances.len());
    }

    #[test]
    fn reopening_database_preserves_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("corpus.db");
        let song = sample_song(b"songa");

        {
            let store = Store::open(&db_path).unwrap();
            store.upsert_song(&song, Some(&key()), AnalysisStatus::Ok).unwrap();
            let (patterns, instances) = mined(&song);
            for p in &patterns {
                store.upsert_pattern(p).unwrap();
            }
            for i in &instances {
                store.upsert_instance(i).unwrap();
            }
        }

        let store = Store::open(&db_path).unwrap();
        assert_eq!(
            store.song_status(&song.song_id.to_hex()).unwrap(),
            Some(AnalysisStatus::Ok)
        );
        let (patterns, _) = store.load_corpus().unwrap();
        assert!(!patterns.is_empty());
    }

    #[test]
    fn checkpoints_record_stage_completion() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.stage_done("batch1", "songa", "normalize").unwrap());
        store.mark_stage_done("batch1", "songa", "normalize").unwrap();
        assert!(store.stage_done("batch1", "songa", "normalize").unwrap());
        // Different batch is independent
        assert!(!store.stage_done("batch2", "songa", "normalize").unwrap());
    }
}
