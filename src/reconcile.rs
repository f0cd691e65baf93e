//!
//! src/reconcile.rs
//!
//! Per-track reconciliation: fetch both providers, classify what came
//! back, corroborate dual sources against the trust threshold, and
//! invoke the paid cleanup/merge and language capabilities only when
//! the outcome justifies them. The decision logic is an explicit
//! tagged state machine (source count and resolution are variants,
//! not nested branches) so the corroboration contract stays
//! independently testable.
//!

use std::sync::Arc;

use tracing::{debug, warn};

use crate::classify;
use crate::errors::PipelineError;
use crate::fetch::{
    FetchedLyrics, LanguageData, LanguageDetector, LyricsQuery, LyricsSource,
    SourceKind, TextNormalizer,
};
use crate::normalize::normalize_title;
use crate::persistent::{LyricsRecord, RecordSource, Track};
use crate::similarity;
use crate::sink::RawSink;

/// What the two fetchers produced for one track, after the post-fetch
/// instrumental floor has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    /// Neither provider knew the track.
    NoSource,
    /// Providers answered, but every body was under the word floor.
    Instrumental,
    Single {
        kind: SourceKind,
        text: String,
    },
    Dual {
        primary: String,
        secondary: String,
        score: f64,
    },
}

/// Terminal state of one track's reconciliation.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Usable reconciled text exists.
    Completed(LyricsRecord),
    /// Record persisted without authoritative text, awaiting a human.
    NeedsReview(LyricsRecord),
    Failed {
        reason: String,
    },
}

pub struct Reconciler {
    primary: Arc<dyn LyricsSource>,
    secondary: Arc<dyn LyricsSource>,
    normalizer: Arc<dyn TextNormalizer>,
    detector: Arc<dyn LanguageDetector>,
    sink: Option<Arc<RawSink>>,
    corroboration_threshold: f64,
    word_floor: usize,
}

impl Reconciler {
    pub fn new(
        primary: Arc<dyn LyricsSource>,
        secondary: Arc<dyn LyricsSource>,
        normalizer: Arc<dyn TextNormalizer>,
        detector: Arc<dyn LanguageDetector>,
        sink: Option<Arc<RawSink>>,
        corroboration_threshold: f64,
        word_floor: usize,
    ) -> Self {
        Self {
            primary,
            secondary,
            normalizer,
            detector,
            sink,
            corroboration_threshold,
            word_floor,
        }
    }

    /// Runs one track to a terminal state. Never returns an error: any
    /// failure inside fetch/normalize/detect resolves to `Failed` so
    /// the batch carries on with the next track.
    pub async fn reconcile(&self, track: &Track) -> Resolution {
        match self.run(track).await {
            Ok(resolution) => resolution,
            Err(e) => Resolution::Failed { reason: e.to_string() },
        }
    }

    async fn run(&self, track: &Track) -> Result<Resolution, PipelineError> {
        let (clean_title, title_modified) = normalize_title(&track.title);
        if title_modified {
            debug!(track = %track.id, raw = %track.title, clean = %clean_title,
                "title.normalized");
        }

        let query = LyricsQuery {
            title: clean_title,
            artist: track.artist.clone(),
            album: track.album.clone(),
            duration_sec: track.duration_sec,
            duration_trusted: !title_modified,
        };

        let primary = self.fetch_one(self.primary.as_ref(), track, &query).await?;
        let secondary = self.fetch_one(self.secondary.as_ref(), track, &query).await?;

        let outcome = self.classify_outcome(
            primary.map(|f| f.body),
            secondary.map(|f| f.body),
        );

        match outcome {
            SourceOutcome::NoSource => Ok(Resolution::Failed {
                reason: "no lyrics found in any source".to_string(),
            }),
            SourceOutcome::Instrumental => Ok(Resolution::Failed {
                reason: format!(
                    "instrumental: lyric body under {} words", self.word_floor
                ),
            }),
            SourceOutcome::Single { kind, text } =>
                Ok(self.resolve_single(track, &query, kind, text).await),
            SourceOutcome::Dual { primary, secondary, score } =>
                Ok(self.resolve_dual(track, &query, primary, secondary, score).await),
        }
    }

    async fn fetch_one(
        &self,
        source: &dyn LyricsSource,
        track: &Track,
        query: &LyricsQuery,
    ) -> Result<Option<FetchedLyrics>, PipelineError> {
        let fetched = source.search(query).await?;
        if let (Some(fetched), Some(sink)) = (&fetched, &self.sink) {
            // archive failures must never sink a track
            if let Err(e) = sink.write_json(source.kind(), &track.id, &fetched.raw) {
                warn!(track = %track.id, source = source.kind().as_str(),
                    error = %e, "raw.archive");
            }
        }
        Ok(fetched)
    }

    /// Buckets fetch results into the source-count states. A body under
    /// the word floor is non-lyrical and dropped; when that leaves
    /// nothing from providers that did answer, the track is instrumental.
    fn classify_outcome(
        &self,
        primary: Option<String>,
        secondary: Option<String>,
    ) -> SourceOutcome {
        let fetched_any = primary.is_some() || secondary.is_some();
        let primary = primary
            .filter(|t| !classify::below_word_floor(t, self.word_floor));
        let secondary = secondary
            .filter(|t| !classify::below_word_floor(t, self.word_floor));

        match (primary, secondary) {
            (None, None) if fetched_any => SourceOutcome::Instrumental,
            (None, None) => SourceOutcome::NoSource,
            (Some(text), None) => SourceOutcome::Single {
                kind: SourceKind::Primary,
                text,
            },
            (None, Some(text)) => SourceOutcome::Single {
                kind: SourceKind::Secondary,
                text,
            },
            (Some(primary), Some(secondary)) => {
                let score = similarity::combined_score(&primary, &secondary);
                SourceOutcome::Dual { primary, secondary, score }
            }
        }
    }

    /// A lone source is never surfaced raw: cleanup either succeeds and
    /// the record keeps that provider's label, or the record is parked
    /// for review with no authoritative text.
    async fn resolve_single(
        &self,
        track: &Track,
        query: &LyricsQuery,
        kind: SourceKind,
        text: String,
    ) -> Resolution {
        let (primary_text, secondary_text) = match kind {
            SourceKind::Primary => (Some(text.clone()), None),
            SourceKind::Secondary => (None, Some(text.clone())),
        };

        match self.normalizer.clean(&text, &query.title, &query.artist).await {
            Ok(cleaned) => {
                let language = self.detect_language(track, query, &cleaned).await;
                Resolution::Completed(LyricsRecord {
                    track_id: track.id.clone(),
                    primary_text,
                    secondary_text,
                    reconciled_text: Some(cleaned),
                    source: match kind {
                        SourceKind::Primary => RecordSource::Primary,
                        SourceKind::Secondary => RecordSource::Secondary,
                    },
                    normalized_by: self.normalizer.id().to_string(),
                    confidence: None,
                    language,
                })
            }
            Err(e) => {
                warn!(track = %track.id, error = %e, "normalize.clean");
                Resolution::NeedsReview(LyricsRecord {
                    track_id: track.id.clone(),
                    primary_text,
                    secondary_text,
                    reconciled_text: None,
                    source: RecordSource::NeedsReview,
                    normalized_by: String::new(),
                    confidence: None,
                    language: None,
                })
            }
        }
    }

    /// Dual sources corroborate at or above the threshold; anything
    /// below is itself a review signal no automated merge may paper
    /// over. The score persists either way.
    async fn resolve_dual(
        &self,
        track: &Track,
        query: &LyricsQuery,
        primary: String,
        secondary: String,
        score: f64,
    ) -> Resolution {
        if !similarity::is_corroborated(score, self.corroboration_threshold) {
            debug!(track = %track.id, score, "corroboration.low");
            return Resolution::NeedsReview(LyricsRecord {
                track_id: track.id.clone(),
                primary_text: Some(primary),
                secondary_text: Some(secondary),
                reconciled_text: None,
                source: RecordSource::NeedsReview,
                normalized_by: String::new(),
                confidence: Some(score),
                language: None,
            });
        }

        match self.normalizer
            .merge(&primary, &secondary, &query.title, &query.artist)
            .await
        {
            Ok(merged) => {
                let language = self.detect_language(track, query, &merged).await;
                Resolution::Completed(LyricsRecord {
                    track_id: track.id.clone(),
                    primary_text: Some(primary),
                    secondary_text: Some(secondary),
                    reconciled_text: Some(merged),
                    source: RecordSource::Reconciled,
                    normalized_by: self.normalizer.id().to_string(),
                    confidence: Some(score),
                    language,
                })
            }
            Err(e) => {
                warn!(track = %track.id, score, error = %e, "normalize.merge");
                Resolution::NeedsReview(LyricsRecord {
                    track_id: track.id.clone(),
                    primary_text: Some(primary),
                    secondary_text: Some(secondary),
                    reconciled_text: None,
                    source: RecordSource::NeedsReview,
                    normalized_by: String::new(),
                    confidence: Some(score),
                    language: None,
                })
            }
        }
    }

    /// Detector failures degrade the record, never fail it: a missing
    /// language tag is logged and swallowed.
    async fn detect_language(
        &self,
        track: &Track,
        query: &LyricsQuery,
        text: &str,
    ) -> Option<LanguageData> {
        match self.detector.detect(text, &query.title, &query.artist).await {
            Ok(language) => Some(language),
            Err(e) => {
                warn!(track = %track.id, error = %e, "language.detect");
                None
            }
        }
    }
}
