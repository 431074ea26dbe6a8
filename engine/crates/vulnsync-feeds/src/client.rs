//! Rate-limited HTTP client for feed artifacts

use crate::limiter::{FetchLimiter, WaitClock};
use governor::clock::DefaultClock;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use vulnsync_common::FetchConfig;
use vulnsync_core::{CancellationToken, Error, Result};

/// How a response body is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMode {
    /// Hold the body in memory
    Buffered,
    /// Write the body to this file as it arrives
    Streaming(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchBody {
    Bytes(Vec<u8>),
    File { path: PathBuf, bytes: u64 },
}

/// A successful (200) response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: FetchBody,
}

impl FetchResponse {
    /// Buffered body as UTF-8 text
    pub fn text(&self) -> Result<String> {
        match &self.body {
            FetchBody::Bytes(bytes) => String::from_utf8(bytes.clone())
                .map_err(|e| Error::Parse(format!("Response body is not UTF-8: {}", e))),
            FetchBody::File { path, .. } => Err(Error::Internal(format!(
                "Response was streamed to {}",
                path.display()
            ))),
        }
    }
}

/// When a failed attempt is worth repeating
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_terminal_statuses: bool,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_terminal_statuses: config.retry_terminal_statuses,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Whether a failed attempt ending in `err` may be repeated
    pub fn should_retry(&self, err: &Error) -> bool {
        match err {
            Error::Fetch {
                last_status: Some(_),
                ..
            } if self.retry_terminal_statuses => true,
            _ => err.is_retryable(),
        }
    }

    /// Wait before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Outcome of a single request attempt
enum Attempt {
    Done(FetchResponse),
    Failed { status: Option<u16>, message: String },
}

/// HTTP client used by every feed download
///
/// All requests share one [`FetchLimiter`], so the configured call budget
/// holds across feeds and partitions.
pub struct FeedClient<C: WaitClock = DefaultClock> {
    http: Client,
    limiter: FetchLimiter<C>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl FeedClient<DefaultClock> {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let limiter = FetchLimiter::new(config.max_calls, config.period())?;
        Self::with_limiter(config, limiter)
    }
}

impl<C: WaitClock> FeedClient<C> {
    pub fn with_limiter(config: &FetchConfig, limiter: FetchLimiter<C>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            limiter,
            policy: RetryPolicy::from_config(config),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// GET `url`, retrying per the client's policy
    ///
    /// Only a 200 counts as success. After the last failed attempt the error
    /// carries the last HTTP status seen, if any.
    pub async fn fetch(&self, url: &str, mode: FetchMode) -> Result<FetchResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.cancel.check(&format!("fetch {}", url))?;
            self.limiter.acquire().await;

            debug!(url = %url, attempt, "Fetching");
            let (status, message) = match self.attempt(url, &mode).await? {
                Attempt::Done(response) => return Ok(response),
                Attempt::Failed { status, message } => (status, message),
            };

            let message = format!("{} (after {} attempt(s))", message, attempt);
            let err = Error::fetch(url, status, message.clone());
            if attempt >= self.policy.max_attempts || !self.policy.should_retry(&err) {
                return Err(err);
            }

            let backoff = self.policy.backoff(attempt);
            warn!(
                url = %url,
                attempt,
                status = ?status,
                backoff_ms = backoff.as_millis() as u64,
                "Fetch attempt failed: {}",
                message
            );
            self.limiter.sleep(backoff).await;
        }
    }

    /// GET `url` and return the body as text
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        self.fetch(url, FetchMode::Buffered).await?.text()
    }

    async fn attempt(&self, url: &str, mode: &FetchMode) -> Result<Attempt> {
        let mut response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(Attempt::Failed {
                    status: e.status().map(|s| s.as_u16()),
                    message: format!("request failed: {}", e),
                })
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            return Ok(Attempt::Failed {
                status: Some(status.as_u16()),
                message: format!("unexpected status {}", status),
            });
        }

        let body = match mode {
            FetchMode::Buffered => match response.bytes().await {
                Ok(bytes) => FetchBody::Bytes(bytes.to_vec()),
                Err(e) => {
                    return Ok(Attempt::Failed {
                        status: None,
                        message: format!("body read failed: {}", e),
                    })
                }
            },
            FetchMode::Streaming(path) => match stream_to_file(&mut response, path).await {
                Ok(bytes) => FetchBody::File {
                    path: path.clone(),
                    bytes,
                },
                // Local disk failures are not worth retrying.
                Err(StreamError::Io(e)) => return Err(Error::Io(e)),
                Err(StreamError::Http(e)) => {
                    return Ok(Attempt::Failed {
                        status: None,
                        message: format!("body stream failed: {}", e),
                    })
                }
            },
        };

        Ok(Attempt::Done(FetchResponse {
            status: status.as_u16(),
            body,
        }))
    }
}

enum StreamError {
    Io(std::io::Error),
    Http(reqwest::Error),
}

async fn stream_to_file(
    response: &mut reqwest::Response,
    path: &Path,
) -> std::result::Result<u64, StreamError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(StreamError::Io)?;
    }
    let mut file = tokio::fs::File::create(path).await.map_err(StreamError::Io)?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(StreamError::Http)? {
        file.write_all(&chunk).await.map_err(StreamError::Io)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(StreamError::Io)?;
    Ok(written)
}
