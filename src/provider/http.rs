//! Generic HTTP/JSON provider: drives any upstream that returns a JSON
//! array of OHLCV rows, without committing to one vendor's wire format.
//!
//! Retry/backoff is grounded directly on
//! `scrapers/polymarket_api.rs::execute_with_retry` (timeout per attempt,
//! exponential backoff capped at 30s, explicit 429 branch), generalized to
//! accept the provider's own [`RateLimitConfig`] and to classify 401/403 as
//! authentication failures per spec.md §4.3/§7.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{DomainError, ErrorCode};
use crate::model::point::DataPoint;
use crate::model::provider::{AuthConfig, ProviderCapability, RateLimitConfig};
use crate::model::query::Query;

use super::{Provider, ProviderResponse, ProviderRuntime};

const INITIAL_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 30_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One row of the JSON array a conformant upstream returns.
#[derive(Debug, Clone, Deserialize)]
struct WireRow {
    symbol: String,
    market: String,
    timestamp: DateTime<Utc>,
    open: Option<Decimal>,
    high: Option<Decimal>,
    low: Option<Decimal>,
    close: Option<Decimal>,
    volume: Option<Decimal>,
}

pub struct HttpJsonProvider {
    name: String,
    base_url: String,
    client: Client,
    runtime: ProviderRuntime,
    capability: ProviderCapability,
}

impl HttpJsonProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        auth: AuthConfig,
        rate_limit: RateLimitConfig,
        capability: ProviderCapability,
    ) -> Result<Self, DomainError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| {
                DomainError::new(ErrorCode::System, "provider", format!("failed to build HTTP client: {err}"))
            })?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            client,
            runtime: ProviderRuntime::new(auth, rate_limit),
            capability,
        })
    }

    fn headers(&self) -> BTreeMap<String, String> {
        self.runtime.auth.headers()
    }

    async fn execute_with_retry(&self, query: &Query) -> Result<reqwest::Response, DomainError> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let max_retries = self.runtime.rate_limit.max_retries;
        let mut last_error = String::new();

        for attempt in 0..=max_retries {
            let now = Utc::now();
            self.runtime.check_rate_limit(now)?;

            let mut request = self.client.get(&self.base_url).query(&[
                ("asset", query.asset.as_str().to_string()),
                (
                    "symbols",
                    query.effective_symbols().join(","),
                ),
            ]);
            for (key, value) in self.headers() {
                request = request.header(key, value);
            }

            match tokio::time::timeout(REQUEST_TIMEOUT, request.send()).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        self.runtime.record_request(now);
                        return Ok(response);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(DomainError::new(
                            ErrorCode::Authentication,
                            "provider",
                            format!("authentication failed with status {status}"),
                        )
                        .with_context("provider", self.name.clone()));
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        last_error = format!("rate limited (status {status})");
                        if attempt < max_retries {
                            tokio::time::sleep(Duration::from_millis(backoff)).await;
                            backoff = (backoff * 2).min(MAX_BACKOFF_MS);
                            continue;
                        }
                        return Err(DomainError::new(ErrorCode::RateLimit, "provider", last_error)
                            .retryable(false));
                    }
                    last_error = format!("upstream returned status {status}");
                }
                Ok(Err(err)) => {
                    last_error = format!("request failed: {err}");
                }
                Err(_) => {
                    last_error = "request timed out".to_string();
                }
            }

            if attempt < max_retries {
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        }

        Err(DomainError::new(ErrorCode::Provider, "provider", last_error)
            .retryable(true)
            .with_context("provider", self.name.clone()))
    }
}

#[async_trait]
impl Provider for HttpJsonProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> &ProviderCapability {
        &self.capability
    }

    async fn get_data(&self, query: &Query) -> Result<ProviderResponse, DomainError> {
        let response = self.execute_with_retry(query).await?;
        let rows: Vec<WireRow> = response.json().await.map_err(|err| {
            DomainError::new(
                ErrorCode::Provider,
                "provider",
                format!("failed to parse response from {}: {err}", self.name),
            )
        })?;

        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            let point = DataPoint::new(
                row.symbol,
                row.market,
                row.timestamp,
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume,
            )?
            .with_provider(self.name.clone());
            points.push(point);
        }

        Ok(ProviderResponse {
            points,
            provider_name: self.name.clone(),
        })
    }

    async fn stream_data(
        &self,
        _query: &Query,
    ) -> Result<BoxStream<'static, Result<DataPoint, DomainError>>, DomainError> {
        Err(DomainError::new(
            ErrorCode::Provider,
            "provider",
            format!("streaming not supported by {}", self.name),
        ))
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(&self.base_url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().is_success() || r.status() == StatusCode::NOT_FOUND)
            .unwrap_or(false)
    }

    async fn authenticate(&self) -> bool {
        self.runtime.auth.is_valid()
    }
}
