//!
//! src/pipeline.rs
//!
//! Batch controller: pulls a bounded slice of pending tracks, skips
//! anything the lyrics store already holds, short-circuits likely
//! instrumentals before any fetch budget is spent, walks the rest
//! strictly sequentially behind a rate gate, and commits every queued
//! write in one transaction at the end of the batch.
//!

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify;
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::persistent::{LogEntry, LogOutcome, LyricsRecord, Persistent, TrackWrite};
use crate::reconcile::{Reconciler, Resolution};

#[derive(Debug)]
struct RateGate {
    min_interval: Duration,
    state: tokio::sync::Mutex<Instant>,
}

impl RateGate {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: tokio::sync::Mutex::new(Instant::now() - min_interval),
        }
    }
    async fn wait(&self) {
        let mut last = self.state.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            sleep(self.min_interval - elapsed).await;
        }
        *last = Instant::now();
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub batch_id: String,
    pub requested: usize,
    pub selected: usize,
    pub cached: usize,
    pub completed: usize,
    pub needs_review: usize,
    pub failed: usize,
}

pub struct Pipeline {
    db: Arc<Persistent>,
    reconciler: Reconciler,
    rate: RateGate,
    batch_size: usize,
    queue_poll: Duration,
    corroboration_threshold: f64,
    force: bool,
}

impl Pipeline {
    pub fn new(db: Arc<Persistent>, reconciler: Reconciler, cfg: &PipelineConfig) -> Self {
        Self {
            db,
            reconciler,
            rate: RateGate::new(Duration::from_millis(cfg.track_delay_ms)),
            batch_size: cfg.batch_size,
            queue_poll: Duration::from_millis(cfg.queue_poll_ms),
            corroboration_threshold: cfg.corroboration_threshold,
            force: cfg.force,
        }
    }

    /// Processes one batch to completion and commits it. The commit is
    /// all-or-nothing: a persistence failure here rolls back every
    /// queued write and propagates as a fatal batch failure.
    pub async fn run_batch(&self) -> Result<BatchSummary, PipelineError> {
        let batch_id = Uuid::new_v4().to_string();
        let mut summary = BatchSummary {
            batch_id: batch_id.clone(),
            requested: self.batch_size,
            ..BatchSummary::default()
        };

        let tracks = self.db.pending_tracks(self.batch_size, self.force).await?;
        summary.selected = tracks.len();
        info!(batch = %batch_id, selected = tracks.len(), force = self.force,
            "batch.start");
        if tracks.is_empty() {
            return Ok(summary);
        }

        let ids: Vec<String> = tracks.iter().map(|t| t.id.clone()).collect();
        let cached = if self.force {
            Default::default()
        } else {
            self.db.cached_track_ids(&ids).await?
        };

        let mut writes: Vec<TrackWrite> = Vec::with_capacity(tracks.len());

        // cache hits and the instrumental pre-filter never reach the
        // fetchers; both are decided before any budget is spent
        let mut work = Vec::new();
        for track in tracks {
            if cached.contains(&track.id) {
                debug!(batch = %batch_id, track = %track.id, "track.cached");
                summary.cached += 1;
                writes.push(TrackWrite {
                    track_id: track.id.clone(),
                    record: None,
                    log: LogEntry {
                        track_id: track.id.clone(),
                        batch_id: batch_id.clone(),
                        stage: "cache".to_string(),
                        outcome: LogOutcome::Success,
                        message: "completed (cached)".to_string(),
                        meta: json!({ "cached": true }),
                    },
                    mark_ok: false,
                    mark_failed: false,
                });
                continue;
            }
            if classify::is_likely_instrumental(&track.title, &track.artist) {
                debug!(batch = %batch_id, track = %track.id, "track.instrumental");
                summary.failed += 1;
                writes.push(Self::failed_write(
                    &batch_id,
                    &track.id,
                    "classify",
                    "likely instrumental: matched marker vocabulary, skipped before fetch",
                ));
                continue;
            }
            work.push(track);
        }

        for track in &work {
            self.rate.wait().await;
            debug!(batch = %batch_id, track = %track.id, "track.process");

            match self.reconciler.reconcile(track).await {
                Resolution::Completed(record) => {
                    summary.completed += 1;
                    info!(batch = %batch_id, track = %track.id,
                        source = record.source.as_str(), "track.done");
                    writes.push(self.record_write(&batch_id, record, true));
                }
                Resolution::NeedsReview(record) => {
                    summary.needs_review += 1;
                    info!(batch = %batch_id, track = %track.id,
                        confidence = ?record.confidence, "track.review");
                    writes.push(self.record_write(&batch_id, record, false));
                }
                Resolution::Failed { reason } => {
                    summary.failed += 1;
                    warn!(batch = %batch_id, track = %track.id, reason = %reason,
                        "track.failed");
                    writes.push(Self::failed_write(
                        &batch_id, &track.id, "reconcile", &reason,
                    ));
                }
            }
        }

        self.db.commit_batch(&writes).await?;
        info!(batch = %batch_id, cached = summary.cached,
            completed = summary.completed, needs_review = summary.needs_review,
            failed = summary.failed, "batch.commit");
        Ok(summary)
    }

    /// Daemon loop: batches run back to back, one at a time; shutdown
    /// is only observed between batches, never mid-batch.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        info!("pipeline.start");
        while !shutdown.is_cancelled() {
            let summary = self.run_batch().await?;
            if summary.selected == 0 || summary.selected == summary.cached {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = sleep(self.queue_poll) => {}
                }
            }
        }
        info!("pipeline.exit");
        Ok(())
    }

    fn record_write(&self, batch_id: &str, record: LyricsRecord, usable: bool)
        -> TrackWrite {
        // corroboration reflects agreement, not usability: a merge that
        // failed after a passing score still corroborated
        let corroborated = record.confidence
            .map(|score| score >= self.corroboration_threshold)
            .unwrap_or(false);
        let meta = json!({
            "source": record.source.as_str(),
            "corroborated": corroborated,
            "confidence": record.confidence,
            "needs_review": !usable,
            "language": record.language.as_ref().map(|l| l.primary.clone()),
        });
        let (outcome, message) = if usable {
            (LogOutcome::Success, "completed (fetched)".to_string())
        } else {
            (LogOutcome::Success, "needs review: no authoritative text".to_string())
        };
        TrackWrite {
            track_id: record.track_id.clone(),
            log: LogEntry {
                track_id: record.track_id.clone(),
                batch_id: batch_id.to_string(),
                stage: "reconcile".to_string(),
                outcome,
                message,
                meta,
            },
            record: Some(record),
            mark_ok: usable,
            mark_failed: false,
        }
    }

    fn failed_write(batch_id: &str, track_id: &str, stage: &str, reason: &str)
        -> TrackWrite {
        TrackWrite {
            track_id: track_id.to_string(),
            record: None,
            log: LogEntry {
                track_id: track_id.to_string(),
                batch_id: batch_id.to_string(),
                stage: stage.to_string(),
                outcome: LogOutcome::Failed,
                message: reason.to_string(),
                meta: json!({ "needs_review": false }),
            },
            mark_ok: false,
            mark_failed: true,
        }
    }
}
