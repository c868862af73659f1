//! HTTP blob fetcher.
//!
//! Pulls archives from an HTTP(S) object store with exponential backoff and
//! full jitter on transient failures. Auth and not-found responses fail
//! fast; the hash check happens as the body streams.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::{BlobFetcher, FetchedBlob, HashingSink};

/// Default request timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff.
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Configuration for [`HttpBlobFetcher`].
#[derive(Debug, Clone)]
pub struct HttpBlobConfig {
    /// Base URL package paths resolve against
    pub base_url: String,
    /// Optional bearer token presented to the object store
    pub token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt with full jitter
    pub retry_delay: Duration,
    /// Directory temp spool files land in
    pub spool_dir: PathBuf,
}

impl HttpBlobConfig {
    /// Config with defaults for everything but the addressing fields.
    pub fn new(base_url: impl Into<String>, spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            spool_dir: spool_dir.into(),
        }
    }

    /// Set the bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Streams archives over HTTP with retry.
pub struct HttpBlobFetcher {
    client: Client,
    config: HttpBlobConfig,
}

impl HttpBlobFetcher {
    /// Build the fetcher and its connection pool.
    pub fn new(config: HttpBlobConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(format!("runlet/{}", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build blob HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url_for(&self, package_path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            package_path.trim_start_matches('/')
        )
    }

    /// Full-jitter backoff: random delay in [0, base * 2^attempt].
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let ceiling = self
            .config
            .retry_delay
            .as_millis()
            .saturating_mul(1u128 << attempt.min(8)) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling.max(1)))
    }

    async fn attempt(&self, url: &str, package_path: &str) -> Result<HashingSink> {
        let mut request = self.client.get(url);
        if let Some(ref token) = self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::blob_transport(package_path, e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(Error::BlobNotFound(package_path.to_string()));
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Error::Forbidden(format!(
                    "blob storage rejected credentials for '{}'",
                    package_path
                )));
            }
            status if !status.is_success() => {
                return Err(Error::blob_transport(
                    package_path,
                    format!("unexpected status {}", status),
                ));
            }
            _ => {}
        }

        let mut sink = HashingSink::new(&self.config.spool_dir)?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::blob_transport(package_path, e.to_string()))?;
            sink.write_chunk(&chunk)?;
        }
        Ok(sink)
    }
}

#[async_trait]
impl BlobFetcher for HttpBlobFetcher {
    async fn fetch(
        &self,
        package_path: &str,
        expected_hash: &str,
        expected_size: u64,
    ) -> Result<FetchedBlob> {
        let url = self.url_for(package_path);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt - 1);
                debug!(
                    package_path,
                    attempt,
                    max = self.config.max_retries,
                    "retrying blob fetch after {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.attempt(&url, package_path).await {
                Ok(sink) => return sink.finish(package_path, expected_hash, expected_size),
                Err(e) if e.is_transient() => {
                    warn!(package_path, error = %e, "transient blob fetch failure");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::blob_transport(package_path, "retries exhausted")))
    }
}
