//! Remote gateway contract + HTTP implementation for Quill sync.
//!
//! The gateway is the only component that talks to the network. Records it
//! returns are transient inputs to the merge engine and are never retained
//! here.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use quill_core::{QuoteDraft, QuoteRecord};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "quill-remote";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed remote payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("remote returned an unusable record: {0}")]
    InvalidRecord(#[from] quill_core::CoreError),
}

/// The remote collaborator: read a full snapshot, or publish one local
/// record to acquire a remote identity. Replaceable with [`StubGateway`]
/// in tests.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn fetch_quotes(&self) -> Result<Vec<QuoteRecord>, GatewayError>;

    /// Publish a locally-created record. The returned copy carries the
    /// remote-assigned id and a fresh timestamp.
    async fn publish_quote(&self, record: &QuoteRecord) -> Result<QuoteRecord, GatewayError>;
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP-backed gateway against the mock quote endpoint.
#[derive(Debug)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> anyhow::Result<Self> {
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
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    fn quotes_url(&self) -> String {
        format!("{}/quotes", self.base_url)
    }

    /// Send `build_request` with exponential capped backoff on retryable
    /// statuses and transport errors, returning the successful body bytes.
    async fn send_with_retry(
        &self,
        build_request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Vec<u8>, GatewayError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build_request().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(GatewayError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(GatewayError::Request(err));
                }
            }
        }

        Err(GatewayError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn fetch_quotes(&self) -> Result<Vec<QuoteRecord>, GatewayError> {
        let url = self.quotes_url();
        let span = info_span!("remote_fetch", url = %url);
        async {
            let body = self.send_with_retry(|| self.client.get(&url)).await?;
            let drafts: Vec<QuoteDraft> = serde_json::from_slice(&body)?;

            let now = Utc::now();
            let mut records = Vec::with_capacity(drafts.len());
            for draft in drafts {
                match draft.normalize(now) {
                    Ok(record) => records.push(record),
                    Err(err) => warn!(error = %err, "skipping malformed remote quote"),
                }
            }
            Ok(records)
        }
        .instrument(span)
        .await
    }

    async fn publish_quote(&self, record: &QuoteRecord) -> Result<QuoteRecord, GatewayError> {
        let url = self.quotes_url();
        let span = info_span!("remote_publish", url = %url);

        // Synthetic ids are a local bookkeeping detail; the remote assigns
        // its own identity.
        let payload = QuoteDraft {
            id: None,
            text: record.text.clone(),
            author: Some(record.author.clone()),
            category: Some(record.category.clone()),
            updated_at: Some(record.updated_at),
        };

        async {
            let body = self
                .send_with_retry(|| self.client.post(&url).json(&payload))
                .await?;
            let stored: QuoteDraft = serde_json::from_slice(&body)?;
            Ok(stored.normalize(Utc::now())?)
        }
        .instrument(span)
        .await
    }
}

/// Scripted publish results for [`StubGateway`].
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    /// Return a copy of the record with this remote-assigned id.
    Assign(String),
    /// Fail with an HTTP 500.
    Fail,
}

/// In-memory gateway double: a canned remote snapshot plus a queue of
/// publish outcomes consumed in order.
#[derive(Debug, Default)]
pub struct StubGateway {
    remote: Vec<QuoteRecord>,
    fail_fetch: bool,
    outcomes: Mutex<VecDeque<PublishOutcome>>,
    published: Mutex<Vec<QuoteRecord>>,
    fetch_gate: Option<tokio::sync::Semaphore>,
}

impl StubGateway {
    pub fn with_remote(remote: Vec<QuoteRecord>) -> Self {
        Self {
            remote,
            ..Self::default()
        }
    }

    pub fn failing_fetch() -> Self {
        Self {
            fail_fetch: true,
            ..Self::default()
        }
    }

    /// Make `fetch_quotes` park until [`StubGateway::release_fetch`] grants a
    /// permit, so tests can hold a sync cycle open deterministically.
    pub fn gated(mut self) -> Self {
        self.fetch_gate = Some(tokio::sync::Semaphore::new(0));
        self
    }

    pub fn release_fetch(&self) {
        if let Some(gate) = &self.fetch_gate {
            gate.add_permits(1);
        }
    }

    pub fn script_publish(&self, outcome: PublishOutcome) {
        self.outcomes
            .lock()
            .expect("outcomes lock poisoned")
            .push_back(outcome);
    }

    /// Records the stub accepted via `publish_quote`, in call order.
    pub fn published(&self) -> Vec<QuoteRecord> {
        self.published
            .lock()
            .expect("published lock poisoned")
            .clone()
    }
}

#[async_trait]
impl RemoteGateway for StubGateway {
    async fn fetch_quotes(&self) -> Result<Vec<QuoteRecord>, GatewayError> {
        if let Some(gate) = &self.fetch_gate {
            let permit = gate.acquire().await.expect("gate not closed");
            permit.forget();
        }
        if self.fail_fetch {
            return Err(GatewayError::HttpStatus {
                status: 503,
                url: "stub://quotes".to_string(),
            });
        }
        Ok(self.remote.clone())
    }

    async fn publish_quote(&self, record: &QuoteRecord) -> Result<QuoteRecord, GatewayError> {
        let outcome = self
            .outcomes
            .lock()
            .expect("outcomes lock poisoned")
            .pop_front()
            .unwrap_or_else(|| PublishOutcome::Assign(format!("remote-{}", record.text.len())));

        match outcome {
            PublishOutcome::Assign(id) => {
                let stored = QuoteRecord {
                    id,
                    updated_at: Utc::now(),
                    ..record.clone()
                };
                self.published
                    .lock()
                    .expect("published lock poisoned")
                    .push(stored.clone());
                Ok(stored)
            }
            PublishOutcome::Fail => Err(GatewayError::HttpStatus {
                status: 500,
                url: "stub://quotes".to_string(),
            }),
        }
    }
}
