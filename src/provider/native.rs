//! Deterministic in-process provider used as the crate's zero-network
//! default: demo data, doctests, and CLI examples all run against this
//! provider rather than a real upstream.
//!
//! Grounded on `original_source/vprism/core/providers/vprism_native_provider.py`
//! (the "native" provider is the teacher's own highest-priority, zero-config
//! backend) reshaped onto [`Provider`].

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use futures_util::stream::BoxStream;
use rust_decimal::Decimal;

use crate::error::DomainError;
use crate::model::point::DataPoint;
use crate::model::provider::{AuthConfig, ProviderCapability, RateLimitConfig};
use crate::model::query::{AssetKind, Market, Query, Timeframe};

use super::{Provider, ProviderResponse, ProviderRuntime};

/// Generates a deterministic, gently-trending OHLCV series per symbol so
/// tests and demos have reproducible data with no network dependency.
pub struct NativeProvider {
    runtime: ProviderRuntime,
    capability: ProviderCapability,
}

impl NativeProvider {
    pub fn new() -> Self {
        Self {
            runtime: ProviderRuntime::new(AuthConfig::None, RateLimitConfig::default()),
            capability: ProviderCapability {
                assets: vec![
                    AssetKind::Stock,
                    AssetKind::Etf,
                    AssetKind::Fund,
                    AssetKind::Index,
                ],
                markets: vec![
                    Market::Cn,
                    Market::Us,
                    Market::Hk,
                    Market::Eu,
                    Market::Jp,
                    Market::Uk,
                    Market::Au,
                    Market::Global,
                ],
                timeframes: vec![Timeframe::D1, Timeframe::W1, Timeframe::Mo1],
                max_symbols_per_request: 50,
                supports_real_time: false,
                supports_historical: true,
                data_delay_seconds: 0,
                max_history_days: Some(3650),
            },
        }
    }

    fn synthesize(symbol: &str, market: Market, start: NaiveDate, end: NaiveDate) -> Vec<DataPoint> {
        let seed: u64 = symbol.bytes().map(u64::from).sum::<u64>() + 17;
        let base = Decimal::from(10 + (seed % 90));
        let mut points = Vec::new();
        let mut day = start;
        let mut step: i64 = 0;
        while day <= end {
            let drift = Decimal::from((seed as i64 + step) % 7 - 3);
            let close = (base + drift * Decimal::new(1, 1)).max(Decimal::new(1, 2));
            let open = close - Decimal::new(5, 2);
            let high = close.max(open) + Decimal::new(10, 2);
            let low = close.min(open) - Decimal::new(10, 2);
            let volume = Decimal::from(1000 + (seed as i64 + step).unsigned_abs() % 5000);
            let timestamp = Utc
                .from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap());
            if let Ok(point) = DataPoint::new(
                symbol,
                market.as_str(),
                timestamp,
                Some(open),
                Some(high),
                Some(low),
                Some(close),
                Some(volume),
            ) {
                points.push(point.with_provider("vprism_native"));
            }
            day += Duration::days(1);
            step += 1;
        }
        points
    }
}

impl Default for NativeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for NativeProvider {
    fn name(&self) -> &str {
        "vprism_native"
    }

    fn capability(&self) -> &ProviderCapability {
        &self.capability
    }

    async fn get_data(&self, query: &Query) -> Result<ProviderResponse, DomainError> {
        let now = Utc::now();
        self.runtime.check_rate_limit(now)?;
        let _permit = self
            .runtime
            .semaphore()
            .acquire()
            .await
            .map_err(|_| DomainError::new(crate::error::ErrorCode::System, "provider", "semaphore closed"))?;

        let end = query.end.unwrap_or_else(|| now.date_naive());
        let start = query.start.unwrap_or(end - Duration::days(30));
        let market = query.market.unwrap_or(Market::Global);

        let mut points = Vec::new();
        for symbol in query.effective_symbols() {
            points.extend(Self::synthesize(symbol, market, start, end));
        }

        self.runtime.record_request(now);
        Ok(ProviderResponse {
            points,
            provider_name: self.name().to_string(),
        })
    }

    async fn stream_data(
        &self,
        _query: &Query,
    ) -> Result<BoxStream<'static, Result<DataPoint, DomainError>>, DomainError> {
        Err(DomainError::new(
            crate::error::ErrorCode::Provider,
            "provider",
            "streaming not supported by vprism_native",
        ))
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn authenticate(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::query::AdjustmentModeParam;

    #[tokio::test]
    async fn generates_points_for_each_symbol_in_window() {
        let provider = NativeProvider::new();
        let query = Query {
            asset: AssetKind::Stock,
            market: Some(Market::Cn),
            provider: None,
            timeframe: Some(Timeframe::D1),
            start: NaiveDate::from_ymd_opt(2024, 1, 1),
            end: NaiveDate::from_ymd_opt(2024, 1, 5),
            raw_symbols: vec!["SH600000".into(), "SZ000001".into()],
            canonical_symbols: vec![],
            adjustment: AdjustmentModeParam::None,
        };
        let response = provider.get_data(&query).await.unwrap();
        assert_eq!(response.points.len(), 10);
        assert_eq!(response.provider_name, "vprism_native");
    }

    #[tokio::test]
    async fn streaming_is_unsupported() {
        let provider = NativeProvider::new();
        let query = Query {
            asset: AssetKind::Stock,
            market: None,
            provider: None,
            timeframe: None,
            start: None,
            end: None,
            raw_symbols: vec!["SH600000".into()],
            canonical_symbols: vec![],
            adjustment: AdjustmentModeParam::None,
        };
        assert!(provider.stream_data(&query).await.is_err());
    }
}
