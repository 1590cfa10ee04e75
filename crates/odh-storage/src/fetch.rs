//! HTTP access for catalog paging and distribution checks.
//!
//! Every request goes through the same gate: a global permit, a permit for the
//! target host, then the optional pacing interval. Page fetches retry transient
//! failures; reachability checks never retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// 5xx, 408 and 429 are worth another attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Doubling delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_before(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A server-provided `Retry-After` (seconds) wins over the computed delay, within `max_delay`.
    fn delay_for(&self, retry: u32, response: Option<&Response>) -> Duration {
        let hinted = response
            .and_then(|r| r.headers().get(RETRY_AFTER))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        hinted.unwrap_or_else(|| self.delay_before(retry)).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_host: usize,
    pub retry: RetryPolicy,
    /// Minimum spacing between request starts across the whole fetcher.
    pub min_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_host: 4,
            retry: RetryPolicy::default(),
            min_interval: None,
        }
    }
}

/// Hands out request start times at least `interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

struct Permits {
    _global: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

fn host_key(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_default()
}

/// Shared client for one harvest process.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_host_limit: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().map_err(FetchError::Client)?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_host_limit: config.max_in_flight_per_host.max(1),
            hosts: Mutex::new(HashMap::new()),
            pacer: config.min_interval.map(RequestPacer::new),
            retry: config.retry,
        })
    }

    async fn admit(&self, url: &str) -> Result<Permits, FetchError> {
        let host = {
            let mut hosts = self.hosts.lock().await;
            hosts
                .entry(host_key(url))
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
                .clone()
        };
        let global = self.in_flight.clone().acquire_owned().await.map_err(|_| FetchError::Closed)?;
        let host = host.acquire_owned().await.map_err(|_| FetchError::Closed)?;
        if let Some(pacer) = &self.pacer {
            pacer.wait_turn().await;
        }
        Ok(Permits {
            _global: global,
            _host: host,
        })
    }

    /// GET with retries on transient failures. Non-2xx answers end as `HttpStatus`.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _permits = self.admit(url).await?;
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let response = self.send_with_retry(|| self.client.get(url)).await?;
            let status = response.status();
            let final_url = response.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = response.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// Returns the last response seen; only transport errors surface as `Err`.
    async fn send_with_retry(&self, request: impl Fn() -> RequestBuilder) -> Result<Response, FetchError> {
        let mut retry = 0;
        loop {
            let outcome = request().send().await;
            let exhausted = retry >= self.retry.retries;
            match outcome {
                Ok(response) if !is_transient_status(response.status()) || exhausted => return Ok(response),
                Ok(response) => {
                    let delay = self.retry.delay_for(retry, Some(&response));
                    warn!(status = %response.status(), retry, ?delay, "transient status, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) if !is_transient_error(&err) || exhausted => return Err(err.into()),
                Err(err) => {
                    let delay = self.retry.delay_for(retry, None);
                    warn!(error = %err, retry, ?delay, "transient request error, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
            retry += 1;
        }
    }

    /// One HEAD request, falling back to GET when the server refuses HEAD.
    pub async fn head_status(&self, url: &str) -> Result<StatusCode, FetchError> {
        let _permits = self.admit(url).await?;
        let status = self.client.head(url).send().await?.status();
        if matches!(status, StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED) {
            return Ok(self.client.get(url).send().await?.status());
        }
        Ok(status)
    }
}

/// Distribution reachability, remembered per URL for the lifetime of the checker.
#[derive(Debug)]
pub struct ReachabilityChecker {
    fetcher: Arc<HttpFetcher>,
    timeout: Duration,
    seen: Mutex<HashMap<String, bool>>,
}

impl ReachabilityChecker {
    pub fn new(fetcher: Arc<HttpFetcher>, timeout: Duration) -> Self {
        Self {
            fetcher,
            timeout,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// 2xx and 3xx count as reachable; errors and timeouts do not.
    pub async fn is_reachable(&self, source_id: &str, url: &str) -> bool {
        if let Some(known) = self.seen.lock().await.get(url).copied() {
            return known;
        }

        let reachable = match tokio::time::timeout(self.timeout, self.fetcher.head_status(url)).await {
            Ok(Ok(status)) => status.is_success() || status.is_redirection(),
            Ok(Err(err)) => {
                debug!(source_id, url, error = %err, "distribution check failed");
                false
            }
            Err(_) => {
                debug!(source_id, url, timeout = ?self.timeout, "distribution check timed out");
                false
            }
        };
        self.seen.lock().await.insert(url.to_string(), reachable);
        reachable
    }

    pub async fn cached_len(&self) -> usize {
        self.seen.lock().await.len()
    }
}
