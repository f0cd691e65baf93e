//!
//! src/main.rs
//!
//! Wires config, logging, store, and clients together and runs the
//! batch daemon (or a single forced batch). Integration tests for the
//! pipeline's contract live here, against an in-memory store and
//! scripted providers; live testbenches are gated behind LIVE_HTTP=1.
//!

mod classify;
mod config;
mod errors;
mod fetch;
mod logging;
mod normalize;
mod persistent;
mod pipeline;
mod reconcile;
mod similarity;
mod sink;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::PipelineError;

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let cfg = config::load_config()?;
    let _logger = logging::init_logging(&cfg.logging)?;

    info!(
        service = "lyrics-reconciler",
        version = %env!("CARGO_PKG_VERSION"),
        "starting"
    );

    let db = Arc::new(persistent::Persistent::init(&cfg.persistence.db_url).await?);

    let primary = fetch::LrcLibClient::new(&cfg.http, &cfg.primary)?;
    let secondary = fetch::LyricsOvhClient::new(&cfg.http, &cfg.secondary)?;
    let normalizer = fetch::NormalizerClient::new(&cfg.http, &cfg.normalizer)?;
    let detector = fetch::DetectorClient::new(&cfg.http, &cfg.detector)?;
    let raw_sink = sink::RawSink::new(
        &cfg.persistence.raw_store_root,
        cfg.persistence.zstd_level,
    );

    let reconciler = reconcile::Reconciler::new(
        Arc::new(primary),
        Arc::new(secondary),
        Arc::new(normalizer),
        Arc::new(detector),
        Some(Arc::new(raw_sink)),
        cfg.pipeline.corroboration_threshold,
        cfg.pipeline.instrumental_word_floor,
    );
    let pipeline = pipeline::Pipeline::new(db, reconciler, &cfg.pipeline);

    if cfg.pipeline.force {
        // operator-triggered rerun: one overwriting batch, then exit
        let summary = pipeline.run_batch().await?;
        info!(
            selected = summary.selected,
            completed = summary.completed,
            needs_review = summary.needs_review,
            failed = summary.failed,
            "forced batch finished"
        );
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(msg = "shutting pipeline down", "pipeline.signal");
                shutdown.cancel();
            }
        });
    }

    pipeline.run(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::config::PipelineConfig;
    use crate::fetch::{
        FetchedLyrics, LanguageData, LanguageDetector, LanguageShare, LyricsQuery,
        LyricsSource, SourceKind, TextNormalizer,
    };
    use crate::persistent::{LogOutcome, Persistent, RecordSource, Track};
    use crate::pipeline::Pipeline;
    use crate::reconcile::Reconciler;

    /// Provider fake keyed by (cleaned) title; counts every search so
    /// tests can prove budget properties.
    struct ScriptedSource {
        kind: SourceKind,
        bodies: HashMap<String, String>,
        error_titles: Vec<String>,
        calls: AtomicUsize,
        queries: Mutex<Vec<LyricsQuery>>,
    }

    impl ScriptedSource {
        fn new(kind: SourceKind, bodies: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                kind,
                bodies: bodies.iter()
                    .map(|(t, b)| (t.to_string(), b.to_string()))
                    .collect(),
                error_titles: Vec::new(),
                calls: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn with_errors(kind: SourceKind, bodies: &[(&str, &str)], errors: &[&str])
            -> Arc<Self> {
            Arc::new(Self {
                kind,
                bodies: bodies.iter()
                    .map(|(t, b)| (t.to_string(), b.to_string()))
                    .collect(),
                error_titles: errors.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LyricsSource for ScriptedSource {
        fn kind(&self) -> SourceKind { self.kind }
        async fn search(&self, query: &LyricsQuery)
            -> Result<Option<FetchedLyrics>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.clone());
            if self.error_titles.iter().any(|t| t == &query.title) {
                return Err(PipelineError::Http("provider exploded".to_string()));
            }
            Ok(self.bodies.get(&query.title).map(|body| FetchedLyrics {
                body: body.clone(),
                raw: json!({ "title": query.title }),
            }))
        }
    }

    struct EchoNormalizer;

    #[async_trait]
    impl TextNormalizer for EchoNormalizer {
        fn id(&self) -> &str { "normalizer:test" }
        async fn clean(&self, text: &str, _title: &str, _artist: &str)
            -> Result<String, PipelineError> {
            Ok(text.to_string())
        }
        async fn merge(&self, primary: &str, _secondary: &str, _t: &str, _a: &str)
            -> Result<String, PipelineError> {
            Ok(primary.to_string())
        }
    }

    struct EnglishDetector;

    #[async_trait]
    impl LanguageDetector for EnglishDetector {
        async fn detect(&self, _text: &str, _title: &str, _artist: &str)
            -> Result<LanguageData, PipelineError> {
            Ok(LanguageData {
                primary: "en".to_string(),
                breakdown: vec![LanguageShare {
                    language: "en".to_string(),
                    percentage: 100.0,
                }],
                confidence: 0.99,
            })
        }
    }

    fn test_cfg(batch_size: usize) -> PipelineConfig {
        PipelineConfig {
            batch_size,
            // the clamp to 200ms lives in config parsing; tests pace fast
            track_delay_ms: 1,
            corroboration_threshold: 0.80,
            instrumental_word_floor: 30,
            queue_poll_ms: 10,
            force: false,
        }
    }

    fn build_pipeline(
        db: Arc<Persistent>,
        primary: Arc<ScriptedSource>,
        secondary: Arc<ScriptedSource>,
        cfg: PipelineConfig,
    ) -> Pipeline {
        let reconciler = Reconciler::new(
            primary,
            secondary,
            Arc::new(EchoNormalizer),
            Arc::new(EnglishDetector),
            None,
            cfg.corroboration_threshold,
            cfg.instrumental_word_floor,
        );
        Pipeline::new(db, reconciler, &cfg)
    }

    fn track(id: &str, title: &str, artist: &str) -> Track {
        Track {
            id: id.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            album: None,
            duration_sec: Some(200),
        }
    }

    fn words(n: usize, seed: &str) -> String {
        (0..n).map(|i| format!("{seed}{i}")).collect::<Vec<_>>().join(" ")
    }

    #[tokio::test]
    async fn instrumental_title_never_reaches_a_fetcher() {
        let db = Arc::new(Persistent::init("sqlite::memory:").await.unwrap());
        db.insert_track(&track("t1", "Toxic (Karaoke Version)", "Backing Tracks Inc"), true)
            .await.unwrap();

        let primary = ScriptedSource::new(SourceKind::Primary, &[]);
        let secondary = ScriptedSource::new(SourceKind::Secondary, &[]);
        let pipeline = build_pipeline(
            db.clone(), primary.clone(), secondary.clone(), test_cfg(10),
        );

        let summary = pipeline.run_batch().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(primary.calls(), 0);
        assert_eq!(secondary.calls(), 0);

        let (ok, failed) = db.track_flags("t1").await.unwrap();
        assert!(!ok);
        assert!(failed);

        let log = db.log_entries("t1").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, LogOutcome::Failed);
        assert_eq!(log[0].stage, "classify");
    }

    #[tokio::test]
    async fn second_run_is_all_cache_hits_with_no_provider_calls() {
        let db = Arc::new(Persistent::init("sqlite::memory:").await.unwrap());
        db.insert_track(&track("t1", "Gravity", "Artist A"), true).await.unwrap();

        // low agreement so the record parks as needs_review: it stays
        // selectable, which is exactly where the cache has to protect
        // the fetch budget
        let a = words(40, "alpha");
        let b = words(40, "omega");
        let primary = ScriptedSource::new(SourceKind::Primary, &[("Gravity", &a)]);
        let secondary = ScriptedSource::new(SourceKind::Secondary, &[("Gravity", &b)]);
        let pipeline = build_pipeline(
            db.clone(), primary.clone(), secondary.clone(), test_cfg(10),
        );

        let first = pipeline.run_batch().await.unwrap();
        assert_eq!(first.needs_review, 1);
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
        let record_before = db.get_record("t1").await.unwrap().unwrap();

        let second = pipeline.run_batch().await.unwrap();
        assert_eq!(second.cached, 1);
        assert_eq!(second.completed + second.needs_review + second.failed, 0);
        assert_eq!(primary.calls(), 1, "cache hit must not re-fetch");
        assert_eq!(secondary.calls(), 1);

        let record_after = db.get_record("t1").await.unwrap().unwrap();
        assert_eq!(record_before, record_after);
    }

    #[tokio::test]
    async fn one_exploding_track_does_not_abort_the_batch() {
        let db = Arc::new(Persistent::init("sqlite::memory:").await.unwrap());
        let body = words(40, "w");
        let mut bodies: Vec<(String, String)> = Vec::new();
        for i in 1..=10 {
            let title = format!("Song {i:02}");
            db.insert_track(&track(&format!("t{i:02}"), &title, "Artist"), true)
                .await.unwrap();
            bodies.push((title, body.clone()));
        }
        let bodies: Vec<(&str, &str)> = bodies.iter()
            .map(|(t, b)| (t.as_str(), b.as_str()))
            .collect();

        let primary = ScriptedSource::with_errors(
            SourceKind::Primary, &bodies, &["Song 03"],
        );
        let secondary = ScriptedSource::new(SourceKind::Secondary, &bodies);
        let pipeline = build_pipeline(
            db.clone(), primary.clone(), secondary.clone(), test_cfg(10),
        );

        let summary = pipeline.run_batch().await.unwrap();
        assert_eq!(summary.selected, 10);
        assert_eq!(summary.completed, 9);
        assert_eq!(summary.failed, 1);

        assert!(db.get_record("t03").await.unwrap().is_none());
        let (_, failed) = db.track_flags("t03").await.unwrap();
        assert!(failed);
        for i in [1, 2, 4, 5, 6, 7, 8, 9, 10] {
            let id = format!("t{i:02}");
            assert!(
                db.get_record(&id).await.unwrap().is_some(),
                "record missing for {id}"
            );
        }
    }

    #[tokio::test]
    async fn single_source_never_surfaces_raw_text_unlabeled() {
        let db = Arc::new(Persistent::init("sqlite::memory:").await.unwrap());
        db.insert_track(&track("t1", "Alone", "Artist A"), true).await.unwrap();

        let body = words(45, "lyric");
        let primary = ScriptedSource::new(SourceKind::Primary, &[("Alone", &body)]);
        let secondary = ScriptedSource::new(SourceKind::Secondary, &[]);
        let pipeline = build_pipeline(
            db.clone(), primary, secondary, test_cfg(10),
        );

        pipeline.run_batch().await.unwrap();
        let record = db.get_record("t1").await.unwrap().unwrap();
        assert_eq!(record.source, RecordSource::Primary);
        assert!(record.reconciled_text.is_some());
        assert_eq!(record.normalized_by, "normalizer:test");
        assert_eq!(record.confidence, None);

        let (ok, _) = db.track_flags("t1").await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn slowed_reverb_title_reconciles_end_to_end() {
        let db = Arc::new(Persistent::init("sqlite::memory:").await.unwrap());
        db.insert_track(
            &track("t1", "Toxic - Slowed + Reverb", "Britney Spears"), true,
        ).await.unwrap();

        // near-identical 40- and 38-word bodies: high corroboration
        let a = words(40, "line");
        let b = words(38, "line");
        let primary = ScriptedSource::new(SourceKind::Primary, &[("Toxic", &a)]);
        let secondary = ScriptedSource::new(SourceKind::Secondary, &[("Toxic", &b)]);
        let pipeline = build_pipeline(
            db.clone(), primary.clone(), secondary.clone(), test_cfg(10),
        );

        let summary = pipeline.run_batch().await.unwrap();
        assert_eq!(summary.completed, 1);

        // providers saw the cleaned title with duration matching disabled
        let queries = primary.queries.lock().unwrap().clone();
        assert_eq!(queries[0].title, "Toxic");
        assert!(!queries[0].duration_trusted);

        let record = db.get_record("t1").await.unwrap().unwrap();
        assert_eq!(record.source, RecordSource::Reconciled);
        let confidence = record.confidence.unwrap();
        assert!(confidence >= 0.80, "confidence {confidence} below threshold");
        assert_eq!(record.language.unwrap().primary, "en");
        assert!(record.reconciled_text.is_some());
        assert!(record.primary_text.is_some());
        assert!(record.secondary_text.is_some());

        let log = db.log_entries("t1").await.unwrap();
        assert_eq!(log[0].outcome, LogOutcome::Success);
        assert_eq!(log[0].meta["corroborated"], json!(true));
        assert_eq!(log[0].meta["language"], json!("en"));
    }

    #[tokio::test]
    async fn low_agreement_parks_for_review_with_score() {
        let db = Arc::new(Persistent::init("sqlite::memory:").await.unwrap());
        db.insert_track(&track("t1", "Mirrors", "Artist A"), true).await.unwrap();

        let a = words(40, "alpha");
        let b = words(40, "omega");
        let primary = ScriptedSource::new(SourceKind::Primary, &[("Mirrors", &a)]);
        let secondary = ScriptedSource::new(SourceKind::Secondary, &[("Mirrors", &b)]);
        let pipeline = build_pipeline(db.clone(), primary, secondary, test_cfg(10));

        let summary = pipeline.run_batch().await.unwrap();
        assert_eq!(summary.needs_review, 1);

        let record = db.get_record("t1").await.unwrap().unwrap();
        assert_eq!(record.source, RecordSource::NeedsReview);
        assert_eq!(record.reconciled_text, None);
        let confidence = record.confidence.unwrap();
        assert!(confidence < 0.80);
        assert!(record.primary_text.is_some());
        assert!(record.secondary_text.is_some());

        let (ok, failed) = db.track_flags("t1").await.unwrap();
        assert!(!ok);
        assert!(!failed);

        let log = db.log_entries("t1").await.unwrap();
        assert_eq!(log[0].meta["needs_review"], json!(true));
        assert_eq!(log[0].meta["corroborated"], json!(false));
    }

    #[tokio::test]
    async fn no_source_tracks_fail_and_wait_for_operator() {
        let db = Arc::new(Persistent::init("sqlite::memory:").await.unwrap());
        db.insert_track(&track("t1", "Obscure B-Side", "Artist A"), true)
            .await.unwrap();

        let primary = ScriptedSource::new(SourceKind::Primary, &[]);
        let secondary = ScriptedSource::new(SourceKind::Secondary, &[]);
        let pipeline = build_pipeline(
            db.clone(), primary.clone(), secondary.clone(), test_cfg(10),
        );

        let summary = pipeline.run_batch().await.unwrap();
        assert_eq!(summary.failed, 1);

        // failed is terminal for plain runs: nothing selected, nothing fetched
        let summary = pipeline.run_batch().await.unwrap();
        assert_eq!(summary.selected, 0);
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
    }

    #[tokio::test]
    async fn forced_rerun_reprocesses_and_overwrites() {
        let db = Arc::new(Persistent::init("sqlite::memory:").await.unwrap());
        db.insert_track(&track("t1", "Gravity", "Artist A"), true).await.unwrap();

        let a = words(40, "alpha");
        let b = words(40, "omega");
        let primary = ScriptedSource::new(SourceKind::Primary, &[("Gravity", &a)]);
        let secondary = ScriptedSource::new(SourceKind::Secondary, &[("Gravity", &b)]);
        let pipeline = build_pipeline(
            db.clone(), primary.clone(), secondary.clone(), test_cfg(10),
        );
        pipeline.run_batch().await.unwrap();
        assert_eq!(db.get_record("t1").await.unwrap().unwrap().source,
            RecordSource::NeedsReview);

        // the secondary provider now agrees with the primary
        let secondary_fixed =
            ScriptedSource::new(SourceKind::Secondary, &[("Gravity", &a)]);
        let mut cfg = test_cfg(10);
        cfg.force = true;
        let forced = build_pipeline(
            db.clone(), primary.clone(), secondary_fixed, cfg,
        );

        let summary = forced.run_batch().await.unwrap();
        assert_eq!(summary.cached, 0, "force skips the cache");
        assert_eq!(summary.completed, 1);

        let record = db.get_record("t1").await.unwrap().unwrap();
        assert_eq!(record.source, RecordSource::Reconciled);
        assert!(record.reconciled_text.is_some());

        // overwrite appended a second log entry, never rewrote the first
        assert_eq!(db.log_entries("t1").await.unwrap().len(), 2);
    }

    /// Live testbench against the real primary provider.
    /// Set LIVE_HTTP=1 to run.
    mod live {
        use super::*;
        use crate::config::{HttpConfig, PrimaryConfig};
        use crate::fetch::LrcLibClient;

        fn live() -> bool {
            std::env::var("LIVE_HTTP").ok().as_deref() == Some("1")
        }

        #[tokio::test]
        async fn lrclib_client_testbench() -> Result<(), PipelineError> {
            dotenvy::dotenv().ok();
            if !live() {
                eprintln!("Set LIVE_HTTP=1 to run");
                return Ok(());
            }

            let cfg = PrimaryConfig {
                base_url: url::Url::parse("https://lrclib.net/api/").unwrap(),
                user_agent: crate::config::DEFAULT_USER_AGENT.to_string(),
            };
            let client = LrcLibClient::new(&HttpConfig::default(), &cfg)?;

            let query = LyricsQuery {
                title: "Toxic".to_string(),
                artist: "Britney Spears".to_string(),
                album: None,
                duration_sec: None,
                duration_trusted: false,
            };
            let hit = client.search(&query).await?;
            let hit = hit.expect("lrclib should know Toxic");
            assert!(!hit.body.is_empty());
            println!("body:\n{}", hit.body);

            let miss = LyricsQuery {
                title: "zzz definitely not a real track zzz".to_string(),
                artist: "nobody at all".to_string(),
                album: None,
                duration_sec: None,
                duration_trusted: false,
            };
            assert!(client.search(&miss).await?.is_none());

            Ok(())
        }
    }
}
