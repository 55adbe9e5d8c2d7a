use std::time::Duration;

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

use pdpe_core::CollectionError;

/// Retry schedule for upstream APIs. Waits double per retry up to `wait_cap`;
/// a `Retry-After` from a rate-limited API replaces the doubled wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_wait: Duration,
    pub wait_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_wait: Duration::from_millis(500),
            wait_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn wait_before(&self, retry: usize, retry_after: Option<Duration>) -> Duration {
        let doubled = self
            .initial_wait
            .saturating_mul(2u32.saturating_pow(u32::try_from(retry).unwrap_or(u32::MAX)));
        retry_after.unwrap_or(doubled).min(self.wait_cap)
    }
}

/// Rate limits, upstream request timeouts and gateway failures.
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(status, StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT) || status.is_server_error()
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let secs = resp.headers().get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[source] reqwest::Error),
    #[error("request to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<FetchError> for CollectionError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout { after, .. } => CollectionError::Timeout(after),
            FetchError::Decode { .. } => CollectionError::Validation(err.to_string()),
            other => CollectionError::Network(other.to_string()),
        }
    }
}

/// One request at a time with a fixed timeout and bounded retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
            retry: config.retry,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn fetch_bytes(&self, source_name: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", source_name, url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry = 0usize;
        loop {
            let wait = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.bytes().await.map_err(|err| self.request_error(url, err))?;
                    debug!(bytes = body.len(), retry, "fetched upstream feed");
                    return Ok(body.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !is_transient_status(status) || retry >= self.retry.max_retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    self.retry.wait_before(retry, retry_after(&resp))
                }
                Err(err) => {
                    if !is_transient_error(&err) || retry >= self.retry.max_retries {
                        return Err(self.request_error(url, err));
                    }
                    self.retry.wait_before(retry, None)
                }
            };
            warn!(retry, wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX), "transient upstream failure");
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, source_name: &str, url: &str) -> Result<T, FetchError> {
        let body = self.fetch_bytes(source_name, url).await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    fn request_error(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                after: self.timeout,
            }
        } else {
            FetchError::Request(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_double_until_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_wait: Duration::from_millis(100),
            wait_cap: Duration::from_millis(350),
        };

        assert_eq!(policy.wait_before(0, None), Duration::from_millis(100));
        assert_eq!(policy.wait_before(1, None), Duration::from_millis(200));
        assert_eq!(policy.wait_before(2, None), Duration::from_millis(350));
        assert_eq!(policy.wait_before(40, None), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_replaces_doubling_but_respects_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.wait_before(0, Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(policy.wait_before(0, Some(Duration::from_secs(60))), Duration::from_secs(5));
    }

    #[test]
    fn rate_limits_and_gateway_failures_are_transient() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn fetch_errors_map_onto_collection_failures() {
        let timeout: CollectionError = FetchError::Timeout {
            url: "https://api.example.test/weather".into(),
            after: Duration::from_secs(15),
        }
        .into();
        assert_eq!(timeout, CollectionError::Timeout(Duration::from_secs(15)));

        let status: CollectionError = FetchError::HttpStatus {
            status: 503,
            url: "https://api.example.test/places".into(),
        }
        .into();
        assert!(matches!(status, CollectionError::Network(msg) if msg.contains("503")));
    }

    #[test]
    fn default_client_uses_api_timeout_band() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        assert!(fetcher.timeout() >= Duration::from_secs(10));
        assert!(fetcher.timeout() <= Duration::from_secs(15));
    }
}
