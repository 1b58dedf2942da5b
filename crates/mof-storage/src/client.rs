//! CKAN datastore client with backoff and a jittered courtesy delay.
//!
//! Year slices go through `datastore_search_sql`; `datastore_search` paging is
//! the fallback when a resource rejects SQL.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
pub use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// One datastore row, keyed by column name.
pub type Record = Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("transient upstream failure ({}): {reason}", status_label(.status))]
    Transient { status: Option<u16>, reason: String },
    #[error("upstream failure ({}): {reason}", status_label(.status))]
    Permanent { status: Option<u16>, reason: String },
}

fn status_label(status: &Option<u16>) -> String {
    status.map_or_else(|| "no status".to_string(), |s| format!("http {s}"))
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceError::Transient { status, .. } | ServiceError::Permanent { status, .. } => *status,
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

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    /// Sleep before retry number `attempt_index + 1`.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct QueryClientConfig {
    /// API root, e.g. `https://donnees.montreal.ca/api/3/action`.
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub courtesy_delay: Duration,
    /// Upper bound of the random extra wait added to each courtesy delay.
    pub courtesy_jitter: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://donnees.montreal.ca/api/3/action".to_string(),
            timeout: Duration::from_secs(120),
            user_agent: format!(
                "mof/{} (municipal open-data forensics; batch loader)",
                env!("CARGO_PKG_VERSION")
            ),
            courtesy_delay: Duration::from_secs(1),
            courtesy_jitter: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport timeout or connection failure: {0}")]
    Transient(String),
    #[error("transport failure: {0}")]
    Permanent(String),
}

/// The HTTP exchanges the client needs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs one SQL statement through `datastore_search_sql`.
    async fn get_sql(&self, sql: &str) -> Result<TransportResponse, TransportError>;

    /// One `datastore_search` page of `resource_id`.
    async fn get_page(
        &self,
        resource_id: &str,
        _limit: u32,
        _offset: u64,
    ) -> Result<TransportResponse, TransportError> {
        Err(TransportError::Permanent(format!(
            "datastore_search paging unavailable for {resource_id}"
        )))
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    sql_endpoint: String,
    search_endpoint: String,
}

impl ReqwestTransport {
    pub fn new(config: &QueryClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        let base = config.base_url.trim_end_matches('/');
        Ok(Self {
            client,
            sql_endpoint: format!("{base}/datastore_search_sql"),
            search_endpoint: format!("{base}/datastore_search"),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<TransportResponse, TransportError> {
        let resp = request.send().await.map_err(transport_error)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(transport_error)?.to_vec();
        Ok(TransportResponse { status, body })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get_sql(&self, sql: &str) -> Result<TransportResponse, TransportError> {
        self.send(self.client.get(&self.sql_endpoint).query(&[("sql", sql)])).await
    }

    async fn get_page(&self, resource_id: &str, limit: u32, offset: u64) -> Result<TransportResponse, TransportError> {
        let request = self.client.get(&self.search_endpoint).query(&[
            ("resource_id", resource_id.to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ]);
        self.send(request).await
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    match classify_reqwest_error(&err) {
        RetryDisposition::Retryable => TransportError::Transient(err.to_string()),
        RetryDisposition::NonRetryable => TransportError::Permanent(err.to_string()),
    }
}

/// Decoded rows plus the exact bytes they came from.
#[derive(Debug, Clone)]
pub struct FetchedRows {
    pub records: Vec<Record>,
    pub body: Vec<u8>,
    pub attempts: u32,
    /// Row count of the whole resource, reported by `datastore_search` only.
    pub total: Option<u64>,
}

/// Every page of one resource, concatenated.
#[derive(Debug, Clone, Default)]
pub struct PagedRows {
    pub records: Vec<Record>,
    pub pages: u32,
    pub attempts: u32,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    result: Option<EnvelopeResult>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeResult {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    total: Option<u64>,
}

pub fn decode_envelope(body: &[u8]) -> Result<Vec<Record>, ServiceError> {
    decode_result(body).map(|result| result.records)
}

/// A successful envelope around `records`, the shape `decode_envelope` reads.
pub fn encode_envelope(records: &[Record]) -> Vec<u8> {
    serde_json::json!({ "success": true, "result": { "records": records } }).to_string().into_bytes()
}

fn decode_result(body: &[u8]) -> Result<EnvelopeResult, ServiceError> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(|err| ServiceError::Permanent {
        status: None,
        reason: format!("malformed response body: {err}"),
    })?;
    if !envelope.success {
        let detail = envelope
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no error detail".to_string());
        return Err(ServiceError::Permanent {
            status: None,
            reason: format!("upstream reported failure: {detail}"),
        });
    }
    Ok(envelope.result.unwrap_or_default())
}

#[derive(Debug, Clone, Copy)]
enum Call<'a> {
    Sql(&'a str),
    Page { resource_id: &'a str, limit: u32, offset: u64 },
}

/// Issues one query at a time. Retries back off exponentially; independent
/// queries are spaced by the courtesy delay plus a random jitter.
#[derive(Debug)]
pub struct QueryClient<T = ReqwestTransport> {
    transport: T,
    retry: RetryPolicy,
    courtesy_delay: Duration,
    courtesy_jitter: Duration,
    last_finished: Mutex<Option<Instant>>,
}

impl QueryClient<ReqwestTransport> {
    pub fn from_config(config: &QueryClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::new(transport, config.retry, config.courtesy_delay).with_courtesy_jitter(config.courtesy_jitter))
    }
}

impl<T: Transport> QueryClient<T> {
    pub fn new(transport: T, retry: RetryPolicy, courtesy_delay: Duration) -> Self {
        Self {
            transport,
            retry,
            courtesy_delay,
            courtesy_jitter: Duration::ZERO,
            last_finished: Mutex::new(None),
        }
    }

    pub fn with_courtesy_jitter(mut self, jitter: Duration) -> Self {
        self.courtesy_jitter = jitter;
        self
    }

    /// Uniform in `0..=courtesy_jitter`, millisecond resolution.
    fn jitter(&self) -> Duration {
        let max_ms = self.courtesy_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::random_range(0..=max_ms))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn query(&self, sql: &str) -> Result<Vec<Record>, ServiceError> {
        self.query_with(sql, &self.retry).await
    }

    pub async fn query_with(&self, sql: &str, policy: &RetryPolicy) -> Result<Vec<Record>, ServiceError> {
        self.fetch(sql, policy).await.map(|rows| rows.records)
    }

    pub async fn fetch(&self, sql: &str, policy: &RetryPolicy) -> Result<FetchedRows, ServiceError> {
        self.spaced(Call::Sql(sql), policy).await
    }

    /// One `datastore_search` page, spaced and retried like a SQL query.
    pub async fn fetch_page(
        &self,
        resource_id: &str,
        limit: u32,
        offset: u64,
        policy: &RetryPolicy,
    ) -> Result<FetchedRows, ServiceError> {
        self.spaced(Call::Page { resource_id, limit, offset }, policy).await
    }

    /// Pages through a whole resource until a page comes back empty or the
    /// reported total is reached.
    pub async fn fetch_all_pages(
        &self,
        resource_id: &str,
        page_size: u32,
        policy: &RetryPolicy,
    ) -> Result<PagedRows, ServiceError> {
        let page_size = page_size.max(1);
        let mut paged = PagedRows::default();
        let mut offset = 0u64;
        loop {
            let page = self.fetch_page(resource_id, page_size, offset, policy).await?;
            let count = page.records.len() as u64;
            paged.pages += 1;
            paged.attempts += page.attempts;
            paged.records.extend(page.records);
            offset += count;
            debug!(resource_id, offset, total = ?page.total, "datastore_search page");
            let done = match page.total {
                Some(total) => offset >= total,
                None => count < u64::from(page_size),
            };
            if count == 0 || done {
                return Ok(paged);
            }
        }
    }

    async fn spaced(&self, call: Call<'_>, policy: &RetryPolicy) -> Result<FetchedRows, ServiceError> {
        let mut last_finished = self.last_finished.lock().await;
        if let Some(finished) = *last_finished {
            let ready_at = finished + self.courtesy_delay + self.jitter();
            if Instant::now() < ready_at {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "courtesy delay");
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let span = info_span!("ckan_query", max_attempts = policy.max_attempts);
        let result = self.attempt_loop(call, policy).instrument(span).await;
        *last_finished = Some(Instant::now());
        result
    }

    async fn send(&self, call: Call<'_>) -> Result<TransportResponse, TransportError> {
        match call {
            Call::Sql(sql) => self.transport.get_sql(sql).await,
            Call::Page { resource_id, limit, offset } => self.transport.get_page(resource_id, limit, offset).await,
        }
    }

    async fn attempt_loop(&self, call: Call<'_>, policy: &RetryPolicy) -> Result<FetchedRows, ServiceError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let failure = match self.send(call).await {
                Ok(resp) if resp.status.is_success() => {
                    let result = decode_result(&resp.body)?;
                    return Ok(FetchedRows {
                        records: result.records,
                        body: resp.body,
                        attempts: attempt,
                        total: result.total,
                    });
                }
                Ok(resp) => {
                    let status = Some(resp.status.as_u16());
                    let reason = resp
                        .status
                        .canonical_reason()
                        .unwrap_or("unexpected status")
                        .to_string();
                    match classify_status(resp.status) {
                        RetryDisposition::Retryable => ServiceError::Transient { status, reason },
                        RetryDisposition::NonRetryable => {
                            return Err(ServiceError::Permanent { status, reason });
                        }
                    }
                }
                Err(TransportError::Transient(reason)) => ServiceError::Transient { status: None, reason },
                Err(TransportError::Permanent(reason)) => {
                    return Err(ServiceError::Permanent { status: None, reason });
                }
            };

            if attempt >= max_attempts {
                return Err(ServiceError::Permanent {
                    status: failure.status(),
                    reason: format!("retries exhausted after {attempt} attempts: {failure}"),
                });
            }

            let delay = policy.delay_for_attempt(attempt - 1);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %failure, "retrying upstream query");
            tokio::time::sleep(delay).await;
        }
    }
}
