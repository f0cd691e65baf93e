//!
//! src/fetch.rs
//!
//! Contracts and concrete clients for every external service the
//! pipeline consumes: the two lyric providers, the text cleanup/merge
//! capability, and the language detector. "Not found" is a normal,
//! non-exceptional outcome for the providers; only transport failures
//! and unexpected statuses surface as errors.
//!

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use regex::Regex;
use reqwest::{header, redirect, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::sleep;
use tracing::warn;
use url::Url;

use crate::config::{
    DetectorConfig, HttpConfig, NormalizerConfig, PrimaryConfig, SecondaryConfig,
};
use crate::errors::PipelineError;

/// Which provider a lyric body came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Primary,
    Secondary,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Primary => "primary",
            SourceKind::Secondary => "secondary",
        }
    }
}

/// Provider query. `duration_trusted` is false when the title carried a
/// cosmetic modifier: the re-uploaded audio's runtime no longer matches
/// the canonical duration, so duration matching must be disabled.
#[derive(Debug, Clone, PartialEq)]
pub struct LyricsQuery {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_sec: Option<i64>,
    pub duration_trusted: bool,
}

/// A provider hit: the plain lyric body plus the raw payload kept for
/// the audit archive.
#[derive(Debug, Clone)]
pub struct FetchedLyrics {
    pub body: String,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait LyricsSource: Send + Sync {
    fn kind(&self) -> SourceKind;
    async fn search(&self, query: &LyricsQuery)
        -> Result<Option<FetchedLyrics>, PipelineError>;
}

#[async_trait]
pub trait TextNormalizer: Send + Sync {
    /// Identifier recorded on records this capability cleaned or merged.
    fn id(&self) -> &str;
    async fn clean(&self, text: &str, title: &str, artist: &str)
        -> Result<String, PipelineError>;
    async fn merge(&self, primary: &str, secondary: &str, title: &str, artist: &str)
        -> Result<String, PipelineError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageShare {
    pub language: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageData {
    pub primary: String,
    #[serde(default)]
    pub breakdown: Vec<LanguageShare>,
    #[serde(default)]
    pub confidence: f64,
}

#[async_trait]
pub trait LanguageDetector: Send + Sync {
    async fn detect(&self, text: &str, title: &str, artist: &str)
        -> Result<LanguageData, PipelineError>;
}

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

fn client_with_headers(http: &HttpConfig, headers: header::HeaderMap)
    -> Result<Client, PipelineError> {
    client_helper(http)
        .default_headers(headers)
        .build()
        .map_err(|e| PipelineError::Http(format!("build client: {e}")))
}

fn json_client(http: &HttpConfig) -> Result<Client, PipelineError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_with_headers(http, h)
}

/// Simple function to generate random wait for request_json
fn generate_backoff(ms: u64, attempt: usize, rng: &mut SmallRng) -> Duration {
    let exp = (1_u64 << attempt.min(6)) * ms;
    let jitter: u64 = rng.gen_range(50..=200);
    Duration::from_millis(exp + jitter)
}

/// Sends a request with bounded retries. 404 maps to Ok(None): an
/// expected miss, never retried. 429 and 5xx back off and retry;
/// anything else non-success fails.
async fn request_json(
    request: RequestBuilder,
    max_retries: usize,
    backoff_ms: u64,
) -> Result<Option<serde_json::Value>, PipelineError> {
    let mut rng = SmallRng::from_entropy();
    let mut attempt = 0_usize;
    loop {
        let response = request.try_clone()
            .ok_or_else(|| PipelineError::Http("non-cloneable request".to_string()))?
            .send()
            .await;
        match response {
            Ok(resp) => {
                if resp.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if resp.status().is_success() {
                    let v = resp.json::<serde_json::Value>().await?;
                    return Ok(Some(v));
                }
                let status = resp.status();
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if !retryable || attempt >= max_retries {
                    return Err(PipelineError::Http(
                        format!("status {status} after {attempt} attempts")
                    ));
                }
                let backoff = generate_backoff(backoff_ms, attempt, &mut rng);
                warn!(status = %status, backoff_ms = backoff.as_millis() as u64,
                    "http.retry");
                sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt >= max_retries {
                    return Err(e.into());
                }
                let backoff = generate_backoff(backoff_ms, attempt, &mut rng);
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64,
                    "http.retry.error");
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Inline LRC tags like "[00:12.34]" or "[offset:+200]"
static LRC_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[^\]\n]*\]").unwrap());

/// Strip timestamp/metadata tags out of an LRC body, leaving plain lines.
fn strip_lrc_tags(synced: &str) -> String {
    LRC_TAG.replace_all(synced, "")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pull a usable plain-text body out of an LRCLIB payload: prefer
/// plainLyrics, fall back to the de-tagged synced body. Payloads marked
/// instrumental carry no usable body.
fn extract_primary_body(value: &serde_json::Value) -> Option<String> {
    if value.get("instrumental").and_then(|v| v.as_bool()).unwrap_or(false) {
        return None;
    }
    let plain = value.get("plainLyrics")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(plain) = plain {
        return Some(plain.to_string());
    }
    value.get("syncedLyrics")
        .and_then(|v| v.as_str())
        .map(strip_lrc_tags)
        .filter(|s| !s.is_empty())
}

///
/// Primary provider: time-synced lyrics keyed by track/artist/album/duration
///
#[derive(Debug, Clone)]
pub struct LrcLibClient {
    http: Client,
    base: Url,
    max_retries: usize,
    backoff_ms: u64,
}

impl LrcLibClient {
    pub fn new(http_cfg: &HttpConfig, cfg: &PrimaryConfig) -> Result<Self, PipelineError> {
        let mut h = header::HeaderMap::new();
        h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        h.insert(
            header::USER_AGENT,
            header::HeaderValue::from_str(&cfg.user_agent)
                .map_err(|e| PipelineError::Config(format!("invalid user-agent: {e}")))?
        );
        let http = client_with_headers(http_cfg, h)?;
        Ok(Self {
            http,
            base: cfg.base_url.clone(),
            max_retries: http_cfg.max_retries,
            backoff_ms: http_cfg.backoff_ms,
        })
    }

    /// GET {base}/get?artist_name=...&track_name=...[&album_name=&duration=]
    fn get_request(&self, query: &LyricsQuery) -> RequestBuilder {
        let url = self.base.join("get").unwrap();
        let mut req = self.http.get(url).query(&[
            ("artist_name", query.artist.as_str()),
            ("track_name", query.title.as_str()),
        ]);
        if let Some(album) = query.album.as_deref() {
            req = req.query(&[("album_name", album)]);
        }
        if query.duration_trusted {
            if let Some(duration) = query.duration_sec {
                req = req.query(&[("duration", duration.to_string().as_str())]);
            }
        }
        req
    }
}

#[async_trait]
impl LyricsSource for LrcLibClient {
    fn kind(&self) -> SourceKind { SourceKind::Primary }

    async fn search(&self, query: &LyricsQuery)
        -> Result<Option<FetchedLyrics>, PipelineError> {
        let Some(raw) = request_json(
            self.get_request(query), self.max_retries, self.backoff_ms
        ).await? else {
            return Ok(None);
        };
        Ok(extract_primary_body(&raw).map(|body| FetchedLyrics { body, raw }))
    }
}

///
/// Secondary provider: plain-text lyrics keyed by artist/title only
///
#[derive(Debug, Clone)]
pub struct LyricsOvhClient {
    http: Client,
    base: Url,
    max_retries: usize,
    backoff_ms: u64,
}

impl LyricsOvhClient {
    pub fn new(http_cfg: &HttpConfig, cfg: &SecondaryConfig)
        -> Result<Self, PipelineError> {
        let http = json_client(http_cfg)?;
        Ok(Self {
            http,
            base: cfg.base_url.clone(),
            max_retries: http_cfg.max_retries,
            backoff_ms: http_cfg.backoff_ms,
        })
    }

    /// GET {base}/{artist}/{title}
    fn get_request(&self, query: &LyricsQuery) -> RequestBuilder {
        let path = format!(
            "{}/{}",
            urlencoding::encode(&query.artist),
            urlencoding::encode(&query.title)
        );
        let url = self.base.join(&path).unwrap();
        self.http.get(url)
    }
}

#[async_trait]
impl LyricsSource for LyricsOvhClient {
    fn kind(&self) -> SourceKind { SourceKind::Secondary }

    async fn search(&self, query: &LyricsQuery)
        -> Result<Option<FetchedLyrics>, PipelineError> {
        let Some(raw) = request_json(
            self.get_request(query), self.max_retries, self.backoff_ms
        ).await? else {
            return Ok(None);
        };
        let body = raw.get("lyrics")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(body.map(|body| FetchedLyrics { body, raw }))
    }
}

///
/// Text cleanup/merge capability. Any transport or API error is a
/// capability failure the orchestrator downgrades on; any returned body
/// counts as success, output quality is not judged here.
///
#[derive(Debug, Clone)]
pub struct NormalizerClient {
    http: Client,
    base: Url,
    api_key: String,
    model: String,
    id: String,
    max_retries: usize,
    backoff_ms: u64,
}

impl NormalizerClient {
    pub fn new(http_cfg: &HttpConfig, cfg: &NormalizerConfig)
        -> Result<Self, PipelineError> {
        let http = json_client(http_cfg)?;
        Ok(Self {
            http,
            base: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            id: format!("normalizer:{}", cfg.model),
            model: cfg.model.clone(),
            max_retries: http_cfg.max_retries,
            backoff_ms: http_cfg.backoff_ms,
        })
    }

    async fn post_text(&self, op: &str, body: serde_json::Value)
        -> Result<String, PipelineError> {
        let url = self.base.join(op).unwrap();
        let req = self.http.post(url)
            .bearer_auth(&self.api_key)
            .json(&body);
        let value = request_json(req, self.max_retries, self.backoff_ms)
            .await
            .map_err(|e| PipelineError::Capability(format!("normalizer {op}: {e}")))?
            .ok_or_else(|| PipelineError::Capability(
                format!("normalizer {op}: endpoint not found")
            ))?;
        value.get("text")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Capability(
                format!("normalizer {op}: empty response body")
            ))
    }
}

#[async_trait]
impl TextNormalizer for NormalizerClient {
    fn id(&self) -> &str { &self.id }

    /// POST {base}/v1/clean
    async fn clean(&self, text: &str, title: &str, artist: &str)
        -> Result<String, PipelineError> {
        self.post_text("v1/clean", json!({
            "model": self.model,
            "text": text,
            "title": title,
            "artist": artist,
        })).await
    }

    /// POST {base}/v1/merge
    async fn merge(&self, primary: &str, secondary: &str, title: &str, artist: &str)
        -> Result<String, PipelineError> {
        self.post_text("v1/merge", json!({
            "model": self.model,
            "primary": primary,
            "secondary": secondary,
            "title": title,
            "artist": artist,
        })).await
    }
}

///
/// Language detection capability
///
#[derive(Debug, Clone)]
pub struct DetectorClient {
    http: Client,
    base: Url,
    api_key: String,
    max_retries: usize,
    backoff_ms: u64,
}

impl DetectorClient {
    pub fn new(http_cfg: &HttpConfig, cfg: &DetectorConfig)
        -> Result<Self, PipelineError> {
        let http = json_client(http_cfg)?;
        Ok(Self {
            http,
            base: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            max_retries: http_cfg.max_retries,
            backoff_ms: http_cfg.backoff_ms,
        })
    }
}

#[async_trait]
impl LanguageDetector for DetectorClient {
    /// POST {base}/v1/detect
    async fn detect(&self, text: &str, title: &str, artist: &str)
        -> Result<LanguageData, PipelineError> {
        let url = self.base.join("v1/detect").unwrap();
        let req = self.http.post(url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "text": text,
                "title": title,
                "artist": artist,
            }));
        let value = request_json(req, self.max_retries, self.backoff_ms)
            .await
            .map_err(|e| PipelineError::Capability(format!("detector: {e}")))?
            .ok_or_else(|| PipelineError::Capability(
                "detector: endpoint not found".to_string()
            ))?;
        serde_json::from_value::<LanguageData>(value)
            .map_err(|e| PipelineError::Capability(format!("detector payload: {e}")))
    }
}
