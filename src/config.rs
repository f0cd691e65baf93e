//!
//! src/config.rs
//!
//! Environment-driven configuration for every external service the
//! pipeline talks to, plus the numeric tunables of the reconciliation
//! contract (corroboration threshold, instrumental word floor, batch
//! pacing). Operators recalibrate these through env vars, never by
//! editing source.
//!

use std::time;

use url::Url;

use crate::errors::PipelineError;

/// Constants for HTTP config
pub const HTTP_TIMEOUT: u64 = 8000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90_000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;
pub const HTTP_MAX_RETRIES: usize = 3;
pub const HTTP_BACKOFF_MS: u64 = 500;

/// Defaults for the reconciliation contract
pub const CORROBORATION_THRESHOLD: f64 = 0.80;
pub const INSTRUMENTAL_WORD_FLOOR: usize = 30;
pub const BATCH_SIZE: usize = 25;
pub const TRACK_DELAY_MS: u64 = 250;
/// Hard lower bound on inter-track spacing, provider rate limits assume it
pub const MIN_TRACK_DELAY_MS: u64 = 200;
pub const QUEUE_POLL_MS: u64 = 5000;

pub const DEFAULT_USER_AGENT: &str = "lyrics-reconciler/0.1 (track enrichment)";

/// Wrapper over env::var to return an invalid environment var error
fn env_check(s: &str) -> Result<String, PipelineError> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(PipelineError::Config(format!("{s} was not set"))),
    }
}

fn env_or(s: &str, default: &str) -> String {
    std::env::var(s).ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_to_u64(s: &str, default: u64) -> u64 {
    std::env::var(s).ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_to_usize(s: &str, default: usize) -> usize {
    std::env::var(s).ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_to_f64(s: &str, default: f64) -> f64 {
    std::env::var(s).ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_host(url: &Url, expected_host: &str) -> Result<(), String> {
    match url.host_str() {
        Some(h) if h.eq_ignore_ascii_case(expected_host) => Ok(()),
        Some(h) => Err(
            format!("Unexpected host for {url} (got {h}, expected {expected_host})")
        ),
        None => Err(format!("URL missing host: {url}"))
    }
}

/// Parses a base URL, validates the scheme and, when pinned, the host,
/// and guarantees a trailing slash so joins work.
fn parse_base_url(
    var: &str,
    raw: &str,
    expected_host: Option<&str>
) -> Result<Url, PipelineError> {
    let mut url = Url::parse(raw)
        .map_err(|e| PipelineError::Config(format!("{var} invalid: {e}")))?;

    ensure_https(&url).map_err(PipelineError::Config)?;
    if let Some(host) = expected_host {
        ensure_host(&url, host).map_err(PipelineError::Config)?;
    }

    if !url.path().ends_with('/') {
        let mut path = url.path().to_string();
        path.push('/');
        url.set_path(&path);
    }
    Ok(url)
}

///
/// Configuration for Http timeouts, retries, etc.
///
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
    pub max_retries: usize,
    pub backoff_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
            max_retries: HTTP_MAX_RETRIES,
            backoff_ms: HTTP_BACKOFF_MS,
        }
    }
}

///
/// Configuration for the primary (time-synced) lyrics provider
///
#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    pub base_url: Url,
    pub user_agent: String,
}

fn build_primary() -> Result<PrimaryConfig, PipelineError> {
    let raw = env_or("LRCLIB_BASE_URL", "https://lrclib.net/api/");
    let base_url = parse_base_url("LRCLIB_BASE_URL", &raw, Some("lrclib.net"))?;
    let user_agent = env_or("LYRICS_USER_AGENT", DEFAULT_USER_AGENT);
    Ok(PrimaryConfig { base_url, user_agent })
}

///
/// Configuration for the secondary (plain text) lyrics provider
///
#[derive(Debug, Clone)]
pub struct SecondaryConfig {
    pub base_url: Url,
}

fn build_secondary() -> Result<SecondaryConfig, PipelineError> {
    let raw = env_or("LYRICS_OVH_BASE_URL", "https://api.lyrics.ovh/v1/");
    let base_url = parse_base_url("LYRICS_OVH_BASE_URL", &raw, Some("api.lyrics.ovh"))?;
    Ok(SecondaryConfig { base_url })
}

///
/// Configuration for the text cleanup/merge capability
///
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub base_url: Url,
    pub api_key: String,
    pub model: String,
}

fn build_normalizer() -> Result<NormalizerConfig, PipelineError> {
    let api_key = env_check("NORMALIZER_API_KEY")?;
    let raw = env_check("NORMALIZER_BASE_URL")?;
    let base_url = parse_base_url("NORMALIZER_BASE_URL", &raw, None)?;
    let model = env_or("NORMALIZER_MODEL", "lyrics-cleanup-v1");
    Ok(NormalizerConfig { base_url, api_key, model })
}

///
/// Configuration for the language detection capability
///
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub base_url: Url,
    pub api_key: String,
}

fn build_detector() -> Result<DetectorConfig, PipelineError> {
    let api_key = env_check("DETECTOR_API_KEY")?;
    let raw = env_check("DETECTOR_BASE_URL")?;
    let base_url = parse_base_url("DETECTOR_BASE_URL", &raw, None)?;
    Ok(DetectorConfig { base_url, api_key })
}

///
/// Configuration for persistent storage: sqlite db plus a raw payload
/// archive on disk (written in src/sink.rs)
///
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub db_url: String,
    pub raw_store_root: String,
    pub zstd_level: i32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:./data/lyrics.db".to_string(),
            raw_store_root: "./data/raw".to_string(),
            zstd_level: 3,
        }
    }
}

fn build_persistence() -> PersistenceConfig {
    let defaults = PersistenceConfig::default();
    PersistenceConfig {
        db_url: env_or("DATABASE_URL", &defaults.db_url),
        raw_store_root: env_or("RAW_STORE_ROOT", &defaults.raw_store_root),
        zstd_level: env_to_u64("RAW_ZSTD_LEVEL", defaults.zstd_level as u64) as i32,
    }
}

///
/// Tunables of the reconciliation contract itself. The threshold and
/// word floor are the two numbers operators recalibrate against observed
/// false positive/negative rates.
///
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub track_delay_ms: u64,
    pub corroboration_threshold: f64,
    pub instrumental_word_floor: usize,
    pub queue_poll_ms: u64,
    pub force: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            track_delay_ms: TRACK_DELAY_MS,
            corroboration_threshold: CORROBORATION_THRESHOLD,
            instrumental_word_floor: INSTRUMENTAL_WORD_FLOOR,
            queue_poll_ms: QUEUE_POLL_MS,
            force: false,
        }
    }
}

fn build_pipeline() -> PipelineConfig {
    PipelineConfig {
        batch_size: env_to_usize("LYRICS_BATCH_SIZE", BATCH_SIZE),
        track_delay_ms: env_to_u64("LYRICS_TRACK_DELAY_MS", TRACK_DELAY_MS)
            .max(MIN_TRACK_DELAY_MS),
        corroboration_threshold:
            env_to_f64("LYRICS_CORROBORATION_THRESHOLD", CORROBORATION_THRESHOLD)
                .clamp(0.0, 1.0),
        instrumental_word_floor:
            env_to_usize("LYRICS_INSTRUMENTAL_WORD_FLOOR", INSTRUMENTAL_WORD_FLOOR),
        queue_poll_ms: env_to_u64("LYRICS_QUEUE_POLL_MS", QUEUE_POLL_MS),
        force: std::env::var("LYRICS_FORCE").ok().as_deref() == Some("1"),
    }
}

///
/// Configuration for logger
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub include_file_line: bool,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,lyrics_reconciler=debug,reqwest=warn".to_string(),
            format: LogFormat::Json,
            include_file_line: true,
            include_target: true,
        }
    }
}

fn build_logging() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    let format = match env_or("LOG_FORMAT", "json").to_lowercase().as_str() {
        "pretty" => LogFormat::Pretty,
        _ => LogFormat::Json,
    };
    LoggingConfig {
        filter_directives: env_or("LOG_FILTER", &defaults.filter_directives),
        format,
        include_file_line: defaults.include_file_line,
        include_target: defaults.include_target,
    }
}

///
/// AppConfig which holds everything the pipeline needs at start
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub primary: PrimaryConfig,
    pub secondary: SecondaryConfig,
    pub normalizer: NormalizerConfig,
    pub detector: DetectorConfig,
    pub persistence: PersistenceConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, PipelineError> {
    dotenvy::dotenv().ok();

    let http        = HttpConfig::default();
    let primary     = build_primary()?;
    let secondary   = build_secondary()?;
    let normalizer  = build_normalizer()?;
    let detector    = build_detector()?;
    let persistence = build_persistence();
    let pipeline    = build_pipeline();
    let logging     = build_logging();

    Ok(AppConfig {
        http, primary, secondary, normalizer, detector,
        persistence, pipeline, logging,
    })
}
