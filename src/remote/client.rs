use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, Response};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::RemoteError;
use crate::cache::{CacheKey, CacheManager, CacheTier};
use crate::error::{PipelineError, PipelineResult};

const ARTIFACT_NAMESPACE: &str = "artifact";
/// Upper bound on any single wait between attempts, whatever `retry-after` says.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Spaces out requests to one remote source.
///
/// Callers are serialized on the lock, so concurrent jobs sharing a fetcher
/// still respect the minimum interval.
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

pub struct HttpFetcher {
    client: Client,
    base_url: String,
    limiter: RateLimiter,
    max_retries: u32,
    base_delay: Duration,
}

impl HttpFetcher {
    /// A fetcher that gives up on the first failure; see
    /// [`with_retries`](Self::with_retries).
    pub fn new(base_url: impl Into<String>, min_interval: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(min_interval),
            max_retries: 0,
            base_delay: Duration::from_millis(500),
        })
    }

    /// Retries transient failures up to `max_retries` times. Waits honour
    /// `retry-after` on 429, otherwise back off as `base_delay * 2^(n-1)`.
    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn delay_for(&self, attempt: u32, err: &RemoteError) -> Duration {
        let delay = match err {
            RemoteError::RateLimited { retry_after_ms } => Duration::from_millis(*retry_after_ms),
            _ => self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1)),
        };
        delay.min(MAX_RETRY_DELAY)
    }

    async fn send(&self, path: &str) -> Result<Response, RemoteError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;
            debug!(%url, attempt, "remote fetch");
            let result = match self.client.get(&url).send().await {
                Ok(response) => check_status(response).await,
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt, &err);
                    warn!(
                        %url,
                        attempt,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient remote failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let response = self.send(path).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Streams the response body into `dest` chunk by chunk. Returns the
    /// number of bytes written.
    pub async fn download_to(&self, path: &str, dest: &Path) -> PipelineResult<u64> {
        let mut response = self.send(path).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(RemoteError::from)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        debug!(path, bytes = written, "remote download finished");
        Ok(written)
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(1000);
        return Err(RemoteError::RateLimited {
            retry_after_ms: retry_after,
        });
    }

    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(RemoteError::ApiError {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response)
}

/// Resolves a named artifact (model weights, language metadata) to a file:
/// the disk tier, then the curated dataset, then a streamed download into
/// the disk tier. Artifacts never pass through the memory tier.
pub async fn cached_artifact(
    cache: &CacheManager,
    remote: Option<&HttpFetcher>,
    name: &str,
    ttl: Duration,
) -> PipelineResult<PathBuf> {
    let key = CacheKey::derive(name, ARTIFACT_NAMESPACE, &Default::default())?;
    let found = cache
        .get_or_fetch_file(CacheTier::Model, &key, ttl, |staging| async move {
            match remote {
                Some(remote) => remote.download_to(name, &staging).await.map(|_| ()),
                None => Err(PipelineError::Config(format!(
                    "artifact `{name}` is not cached and remote.base_url is not set"
                ))),
            }
        })
        .await?;
    Ok(found.path)
}
