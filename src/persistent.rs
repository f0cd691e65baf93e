//!
//! src/persistent.rs
//!
//! Persistence adapter over sqlite: the upstream-owned tracks table
//! (read here, flag-updated on completion), the lyrics_records table
//! (one row per track, upserted), and the append-only processing_log.
//! A whole batch commits in one transaction: either every accumulated
//! write lands or none of them do.
//!

use std::collections::HashSet;
use std::str::FromStr;

use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Pool, Row, Sqlite};

use crate::errors::PipelineError;
use crate::fetch::LanguageData;

#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_sec: Option<i64>,
}

/// Provenance label persisted on a lyrics record. A cleaned single
/// source keeps that provider's label; a merged dual source is
/// `reconciled`; `needs_review` rows never carry authoritative text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    Primary,
    Secondary,
    Reconciled,
    NeedsReview,
}

impl RecordSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordSource::Primary => "primary",
            RecordSource::Secondary => "secondary",
            RecordSource::Reconciled => "reconciled",
            RecordSource::NeedsReview => "needs_review",
        }
    }
    pub fn parse(s: &str) -> Option<RecordSource> {
        match s {
            "primary" => Some(RecordSource::Primary),
            "secondary" => Some(RecordSource::Secondary),
            "reconciled" => Some(RecordSource::Reconciled),
            "needs_review" => Some(RecordSource::NeedsReview),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LyricsRecord {
    pub track_id: String,
    pub primary_text: Option<String>,
    pub secondary_text: Option<String>,
    pub reconciled_text: Option<String>,
    pub source: RecordSource,
    pub normalized_by: String,
    pub confidence: Option<f64>,
    pub language: Option<LanguageData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Success,
    Skipped,
    Failed,
}

impl LogOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LogOutcome::Success => "success",
            LogOutcome::Skipped => "skipped",
            LogOutcome::Failed => "failed",
        }
    }
    pub fn parse(s: &str) -> Option<LogOutcome> {
        match s {
            "success" => Some(LogOutcome::Success),
            "skipped" => Some(LogOutcome::Skipped),
            "failed" => Some(LogOutcome::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub track_id: String,
    pub batch_id: String,
    pub stage: String,
    pub outcome: LogOutcome,
    pub message: String,
    pub meta: serde_json::Value,
}

/// One track's accumulated result, queued until the batch commits.
#[derive(Debug, Clone)]
pub struct TrackWrite {
    pub track_id: String,
    pub record: Option<LyricsRecord>,
    pub log: LogEntry,
    pub mark_ok: bool,
    pub mark_failed: bool,
}

pub struct Persistent {
    pool: Pool<Sqlite>,
}

impl Persistent {
    async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), PipelineError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tracks (
              id             TEXT PRIMARY KEY,
              title          TEXT NOT NULL,
              artist         TEXT NOT NULL,
              album          TEXT,
              duration_sec   INTEGER,
              lyrics_ready   INTEGER NOT NULL DEFAULT 0,
              lyrics_ok      INTEGER NOT NULL DEFAULT 0,
              lyrics_failed  INTEGER NOT NULL DEFAULT 0,
              created_at     INTEGER NOT NULL,
              updated_at     INTEGER NOT NULL
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS lyrics_records (
              track_id        TEXT PRIMARY KEY,
              primary_text    TEXT,
              secondary_text  TEXT,
              reconciled_text TEXT,
              source          TEXT NOT NULL CHECK (source IN (
                  'primary','secondary',
                  'reconciled','needs_review')),
              normalized_by   TEXT NOT NULL DEFAULT '',
              confidence      REAL,
              language        TEXT,
              created_at      INTEGER NOT NULL,
              updated_at      INTEGER NOT NULL,
              FOREIGN KEY(track_id) REFERENCES tracks(id) ON DELETE CASCADE
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS processing_log (
              id          INTEGER PRIMARY KEY AUTOINCREMENT,
              track_id    TEXT NOT NULL,
              batch_id    TEXT NOT NULL,
              stage       TEXT NOT NULL,
              outcome     TEXT NOT NULL CHECK (outcome IN (
                  'success','skipped','failed')),
              message     TEXT NOT NULL,
              meta        TEXT,
              created_at  INTEGER NOT NULL
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tracks_pending
               ON tracks(lyrics_ready, lyrics_ok, lyrics_failed);"
        ).execute(pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_log_track ON processing_log(track_id);"
        ).execute(pool).await?;

        Ok(())
    }

    pub async fn init(database_url: &str) -> Result<Self, PipelineError> {
        let is_memory = database_url == "sqlite::memory:";

        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true);

        // WAL is file-only; don't set it for in-memory
        if !is_memory {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                       .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if is_memory { 1 } else { 8 })
            .connect_with(opts)
            .await?;

        Self::ensure_schema(&pool).await?;

        Ok(Self { pool })
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Inserts a track row. Tracks are normally ingested by the
    /// surrounding application; this is the seeding path for tests and
    /// local runs.
    pub async fn insert_track(&self, track: &Track, ready: bool)
        -> Result<(), PipelineError> {
        sqlx::query(
            r"
            INSERT OR IGNORE INTO tracks (
                id, title, artist, album, duration_sec,
                lyrics_ready, lyrics_ok, lyrics_failed, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?7);
            "
        )
        .bind(&track.id)
        .bind(&track.title)
        .bind(&track.artist)
        .bind(track.album.as_ref())
        .bind(track.duration_sec)
        .bind(i32::from(ready))
        .bind(Self::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Tracks flagged ready upstream that still lack a usable lyrics
    /// record, ordered by id so reruns are deterministic. `include_failed`
    /// widens the selection for operator-forced reruns.
    pub async fn pending_tracks(&self, limit: usize, include_failed: bool)
        -> Result<Vec<Track>, PipelineError> {
        let rows = sqlx::query(
            r"
            SELECT id, title, artist, album, duration_sec
              FROM tracks
             WHERE lyrics_ready = 1
               AND lyrics_ok = 0
               AND (lyrics_failed = 0 OR ?1)
             ORDER BY id ASC
             LIMIT ?2;
            "
        )
        .bind(i32::from(include_failed))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| Track {
            id: r.get("id"),
            title: r.get("title"),
            artist: r.get("artist"),
            album: r.try_get("album").ok(),
            duration_sec: r.try_get("duration_sec").ok(),
        }).collect())
    }

    /// Track ids among `ids` that already own a lyrics record. Presence
    /// alone counts: a needs_review record is still a cache hit, the
    /// cache exists to avoid repeat fetch cost, not to resolve review.
    pub async fn cached_track_ids(&self, ids: &[String])
        -> Result<HashSet<String>, PipelineError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT track_id FROM lyrics_records WHERE track_id IN ({placeholders});"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("track_id")).collect())
    }

    pub async fn get_record(&self, track_id: &str)
        -> Result<Option<LyricsRecord>, PipelineError> {
        let row = sqlx::query(
            r"
            SELECT track_id, primary_text, secondary_text, reconciled_text,
                   source, normalized_by, confidence, language
              FROM lyrics_records
             WHERE track_id = ?1;
            "
        )
        .bind(track_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let source = RecordSource::parse(&row.get::<String, _>("source"))
            .ok_or_else(|| PipelineError::Parse("bad source in DB".to_string()))?;
        let language = row.try_get::<Option<String>, _>("language")
            .ok()
            .flatten()
            .and_then(|s| serde_json::from_str::<LanguageData>(&s).ok());

        Ok(Some(LyricsRecord {
            track_id: row.get("track_id"),
            primary_text: row.try_get("primary_text").ok().flatten(),
            secondary_text: row.try_get("secondary_text").ok().flatten(),
            reconciled_text: row.try_get("reconciled_text").ok().flatten(),
            source,
            normalized_by: row.get("normalized_by"),
            confidence: row.try_get("confidence").ok().flatten(),
            language,
        }))
    }

    pub async fn log_entries(&self, track_id: &str)
        -> Result<Vec<LogEntry>, PipelineError> {
        let rows = sqlx::query(
            r"
            SELECT track_id, batch_id, stage, outcome, message, meta
              FROM processing_log
             WHERE track_id = ?1
             ORDER BY id ASC;
            "
        )
        .bind(track_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| {
            let outcome = LogOutcome::parse(&r.get::<String, _>("outcome"))
                .ok_or_else(|| PipelineError::Parse("bad outcome in DB".to_string()))?;
            let meta = r.try_get::<Option<String>, _>("meta")
                .ok()
                .flatten()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null);
            Ok(LogEntry {
                track_id: r.get("track_id"),
                batch_id: r.get("batch_id"),
                stage: r.get("stage"),
                outcome,
                message: r.get("message"),
                meta,
            })
        }).collect()
    }

    pub async fn track_flags(&self, track_id: &str)
        -> Result<(bool, bool), PipelineError> {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT lyrics_ok, lyrics_failed FROM tracks WHERE id = ?1;"
        )
        .bind(track_id)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or((0, 0));
        Ok((row.0 == 1, row.1 == 1))
    }

    /// Commits every queued write from one batch in a single
    /// transaction: record upserts, log appends, and track flag flips.
    /// A failure here rolls everything back and is fatal to the batch.
    pub async fn commit_batch(&self, writes: &[TrackWrite])
        -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;
        let now = Self::now();

        for write in writes {
            if let Some(record) = &write.record {
                let language = record.language.as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                sqlx::query(
                    r"
                    INSERT INTO lyrics_records (
                        track_id, primary_text, secondary_text, reconciled_text,
                        source, normalized_by, confidence, language,
                        created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                    ON CONFLICT(track_id) DO UPDATE SET
                        primary_text = excluded.primary_text,
                        secondary_text = excluded.secondary_text,
                        reconciled_text = excluded.reconciled_text,
                        source = excluded.source,
                        normalized_by = excluded.normalized_by,
                        confidence = excluded.confidence,
                        language = excluded.language,
                        updated_at = excluded.updated_at;
                    "
                )
                .bind(&record.track_id)
                .bind(record.primary_text.as_ref())
                .bind(record.secondary_text.as_ref())
                .bind(record.reconciled_text.as_ref())
                .bind(record.source.as_str())
                .bind(&record.normalized_by)
                .bind(record.confidence)
                .bind(language)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(
                r"
                INSERT INTO processing_log (
                    track_id, batch_id, stage, outcome, message, meta, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);
                "
            )
            .bind(&write.log.track_id)
            .bind(&write.log.batch_id)
            .bind(&write.log.stage)
            .bind(write.log.outcome.as_str())
            .bind(&write.log.message)
            .bind(serde_json::to_string(&write.log.meta)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if write.mark_ok {
                sqlx::query(
                    "UPDATE tracks SET lyrics_ok = 1, lyrics_failed = 0,
                        updated_at = ?1 WHERE id = ?2;"
                )
                .bind(now)
                .bind(&write.track_id)
                .execute(&mut *tx)
                .await?;
            } else if write.mark_failed {
                sqlx::query(
                    "UPDATE tracks SET lyrics_failed = 1, updated_at = ?1
                        WHERE id = ?2;"
                )
                .bind(now)
                .bind(&write.track_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
