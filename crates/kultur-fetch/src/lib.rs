//! HTTP fetch layer and immutable raw-page archive.
//!
//! Every byte pulled from a source is archived before parsing, so a broken
//! selector can be replayed against the exact page that produced it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kultur-fetch";

/// Receipt for one archived page.
#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// True when identical bytes were already on disk.
    pub already_archived: bool,
}

/// Content-addressed archive of raw fetched pages, laid out as
/// `<YYYY-MM-DD>/<source_id>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn page_relative_path(
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y-%m-%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(day)
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Archive a page under its content hash. Writes go through a temp file
    /// and an atomic rename; identical bytes short-circuit to a no-op.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            Self::page_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                already_archived: true,
            });
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has a parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                already_archived: false,
            }),
            // Lost the rename race to a concurrent archiver with the same bytes.
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    already_archived: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Upper bound on a server-supplied Retry-After wait. A hostile or
/// misconfigured header must not stall the whole run.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(60);

/// Delta-seconds form of the Retry-After header. Ticketing APIs send this
/// with 429 responses; the HTTP-date form falls back to backoff.
fn retry_after_hint(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Politeness throttle shared across all requests to municipal sites.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct RequestThrottle {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<ThrottleState>,
}

#[derive(Debug, Clone, Copy)]
struct ThrottleState {
    tokens: u32,
    last_refill: Instant,
}

impl RequestThrottle {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(ThrottleState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
            }
            tokio::time::sleep(self.refill_every).await;
        }
    }

    fn refill(&self, state: &mut ThrottleState) {
        if self.refill_every.is_zero() {
            return;
        }
        let refills = (state.last_refill.elapsed().as_millis() / self.refill_every.as_millis()) as u32;
        if refills > 0 {
            state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
            // Advance by whole intervals so partial elapsed time is not lost.
            state.last_refill += self.refill_every * refills;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub retry: RetryPolicy,
    pub throttle: Option<ThrottleConfig>,
}

impl Default for FetchClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            retry: RetryPolicy::default(),
            throttle: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    /// Archive file extension derived from the response content type.
    pub fn extension(&self) -> &'static str {
        match self.content_type.as_deref() {
            Some(ct) if ct.contains("html") => "html",
            Some(ct) if ct.contains("json") => "json",
            Some(ct) if ct.contains("xml") || ct.contains("rss") => "xml",
            _ => "bin",
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrying HTTP client with global and per-source concurrency caps.
#[derive(Debug)]
pub struct FetchClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    throttle: Option<Arc<RequestThrottle>>,
    retry: RetryPolicy,
}

impl FetchClient {
    pub fn new(config: FetchClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let throttle = config
            .throttle
            .map(|c| Arc::new(RequestThrottle::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            throttle,
            retry: config.retry,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        if let Some(throttle) = &self.throttle {
            throttle.take().await;
        }

        let span = info_span!("fetch", %run_id, source_id, url);
        self.request_with_retry(url).instrument(span).await
    }

    async fn request_with_retry(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0usize;
        loop {
            let wait = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedPage {
                        status,
                        final_url,
                        content_type,
                        body,
                        fetched_at: Utc::now(),
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.retry.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    // 429 responses usually carry the wait the server wants.
                    retry_after_hint(resp.headers())
                        .unwrap_or_else(|| self.retry.delay_for_attempt(attempt))
                        .min(RETRY_AFTER_CAP)
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.retry.max_retries
                    {
                        return Err(FetchError::Transport(err));
                    }
                    self.retry.delay_for_attempt(attempt)
                }
            };

            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}
