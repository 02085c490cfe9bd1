//! Provider contract and the shared runtime (request log + concurrency
//! semaphore) every concrete provider embeds.
//!
//! Grounded on `original_source/vprism/core/provider_abstraction.py`'s
//! `EnhancedDataProvider`/`ProviderCapability.matches_query`, reshaped as an
//! `#[async_trait]` trait the way `scrapers/polymarket_api.rs` structures
//! its async fetch methods, with the rate-limit/request-log bookkeeping
//! grounded on that same file's `RateLimiter`.

pub mod http;
pub mod native;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::DomainError;
use crate::model::point::DataPoint;
use crate::model::provider::{AuthConfig, ProviderCapability, RateLimitConfig};
use crate::model::query::{within_history, Query};

/// A non-streaming response from a provider: the points plus which provider
/// produced them (used by the data service to stamp `data_source`).
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub points: Vec<DataPoint>,
    pub provider_name: String,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used as the registry key.
    fn name(&self) -> &str;

    /// Lazily-computed, cached capability descriptor.
    fn capability(&self) -> &ProviderCapability;

    async fn get_data(&self, query: &Query) -> Result<ProviderResponse, DomainError>;

    /// Streams data points. Providers with no real-time feed fail with a
    /// `PROVIDER` error carrying `retryable=false`; callers should check
    /// `capability().supports_real_time` before calling.
    async fn stream_data(
        &self,
        query: &Query,
    ) -> Result<BoxStream<'static, Result<DataPoint, DomainError>>, DomainError>;

    async fn health_check(&self) -> bool;

    async fn authenticate(&self) -> bool;

    /// Delegates to `capability().matches_query` plus the rate-limit check;
    /// see [`ProviderCapability::matches_query`].
    fn can_handle_query(&self, query: &Query) -> bool {
        self.capability().matches_query(query)
    }
}

impl ProviderCapability {
    /// Requires asset match, market match (if query pins one), timeframe
    /// match (if pinned), symbol count within `max_symbols_per_request`,
    /// and — for historical requests — `supports_historical` plus
    /// `max_history_days` respected from "now".
    pub fn matches_query(&self, query: &Query) -> bool {
        if !self.assets.contains(&query.asset) {
            return false;
        }
        if let Some(market) = query.market {
            if !self.markets.contains(&market) {
                return false;
            }
        }
        if let Some(timeframe) = query.timeframe {
            if !self.timeframes.contains(&timeframe) {
                return false;
            }
        }
        let symbol_count = query.effective_symbols().len();
        if symbol_count > 0 && symbol_count > self.max_symbols_per_request {
            return false;
        }
        if query.start.is_some() || query.end.is_some() {
            if !self.supports_historical {
                return false;
            }
            if !within_history(query.start, self.max_history_days, Utc::now()) {
                return false;
            }
        }
        true
    }
}

/// Embedded by value in every concrete provider: owns the per-provider
/// concurrency semaphore and the rolling request-timestamp log used for
/// the rate-limit check in spec.md §4.3.
pub struct ProviderRuntime {
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    semaphore: Semaphore,
    request_log: Mutex<VecDeque<DateTime<Utc>>>,
}

impl ProviderRuntime {
    pub fn new(auth: AuthConfig, rate_limit: RateLimitConfig) -> Self {
        let permits = rate_limit.concurrent_requests;
        Self {
            auth,
            rate_limit,
            semaphore: Semaphore::new(permits),
            request_log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    /// Prunes the timestamp log to the trailing hour, then checks whether
    /// issuing one more request would meet or exceed the per-minute or
    /// per-hour limit (strict `>=`, per spec.md §4.3).
    pub fn check_rate_limit(&self, now: DateTime<Utc>) -> Result<(), DomainError> {
        let mut log = self.request_log.lock();
        let hour_ago = now - chrono::Duration::hours(1);
        log.retain(|ts| *ts > hour_ago);

        let minute_ago = now - chrono::Duration::minutes(1);
        let minute_count = log.iter().filter(|ts| **ts > minute_ago).count() as u32;
        if minute_count >= self.rate_limit.requests_per_minute {
            return Err(DomainError::new(
                crate::error::ErrorCode::RateLimit,
                "provider",
                "requests_per_minute limit reached",
            )
            .retryable(true));
        }
        if log.len() as u32 >= self.rate_limit.requests_per_hour {
            return Err(DomainError::new(
                crate::error::ErrorCode::RateLimit,
                "provider",
                "requests_per_hour limit reached",
            )
            .retryable(true));
        }
        Ok(())
    }

    pub fn record_request(&self, now: DateTime<Utc>) {
        self.request_log.lock().push_back(now);
    }
}

pub type DynProvider = Arc<dyn Provider>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::query::{AssetKind, Market, Timeframe};

    fn capability() -> ProviderCapability {
        ProviderCapability {
            assets: vec![AssetKind::Stock],
            markets: vec![Market::Cn],
            timeframes: vec![Timeframe::D1],
            max_symbols_per_request: 10,
            supports_real_time: false,
            supports_historical: true,
            data_delay_seconds: 0,
            max_history_days: Some(30),
        }
    }

    fn query() -> Query {
        Query {
            asset: AssetKind::Stock,
            market: Some(Market::Cn),
            provider: None,
            timeframe: Some(Timeframe::D1),
            start: None,
            end: None,
            raw_symbols: vec!["SH600000".into()],
            canonical_symbols: vec![],
            adjustment: crate::model::query::AdjustmentModeParam::None,
        }
    }

    #[test]
    fn matches_when_within_scope() {
        assert!(capability().matches_query(&query()));
    }

    #[test]
    fn rejects_unsupported_market() {
        let mut q = query();
        q.market = Some(Market::Us);
        assert!(!capability().matches_query(&q));
    }

    #[test]
    fn rejects_too_many_symbols() {
        let mut q = query();
        q.raw_symbols = (0..20).map(|i| format!("S{i}")).collect();
        assert!(!capability().matches_query(&q));
    }

    #[test]
    fn rate_limit_triggers_at_threshold() {
        let runtime = ProviderRuntime::new(
            AuthConfig::None,
            RateLimitConfig {
                requests_per_minute: 2,
                requests_per_hour: 100,
                concurrent_requests: 1,
                backoff_factor: 2.0,
                max_retries: 3,
            },
        );
        let now = Utc::now();
        runtime.record_request(now);
        runtime.record_request(now);
        assert!(runtime.check_rate_limit(now).is_err());
    }
}
