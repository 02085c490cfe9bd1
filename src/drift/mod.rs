//! Drift detector: flags a symbol whose latest close/volume diverges from
//! its recent baseline. Algorithm and thresholds are unchanged from spec.md
//! §4.8; the injected [`Clock`]/[`RunIdFactory`] pair follows the same
//! collaborator-injection shape used throughout `route_quality/mitigation.rs`
//! for testable time-dependent state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{DomainError, ErrorCode};
use crate::model::drift::{DriftMetric, DriftResult, DriftStatus};
use crate::model::point::DataPoint;
use crate::model::query::Market;
use crate::support::clock::Clock;
use crate::support::decimal::{mean, sample_stddev};
use crate::support::ids::RunIdFactory;

pub const DEFAULT_WARN_THRESHOLD: &str = "2";
pub const DEFAULT_FAIL_THRESHOLD: &str = "3";

/// Persists one row per emitted metric (spec.md §4.8 step 7 / §4.7's
/// `drift_metrics` table).
pub trait DriftMetricWriter: Send + Sync {
    fn write_metric(
        &self,
        date: chrono::NaiveDate,
        market: Market,
        symbol: &str,
        metric: &DriftMetric,
        window: usize,
        run_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<(), DomainError>;
}

#[derive(Debug, Clone, Copy)]
pub struct DriftThresholds {
    pub warn: Decimal,
    pub fail: Decimal,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            warn: DEFAULT_WARN_THRESHOLD.parse().unwrap(),
            fail: DEFAULT_FAIL_THRESHOLD.parse().unwrap(),
        }
    }
}

pub struct DriftDetector {
    clock: Arc<dyn Clock>,
    run_ids: Arc<dyn RunIdFactory>,
    thresholds: DriftThresholds,
    writer: Option<Arc<dyn DriftMetricWriter>>,
}

impl DriftDetector {
    pub fn new(clock: Arc<dyn Clock>, run_ids: Arc<dyn RunIdFactory>) -> Self {
        Self {
            clock,
            run_ids,
            thresholds: DriftThresholds::default(),
            writer: None,
        }
    }

    pub fn with_thresholds(mut self, thresholds: DriftThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn DriftMetricWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// `points` must contain at least `window + 1` observations; only the
    /// trailing `window + 1` are used (spec.md §4.8 steps 1-3).
    pub fn detect(
        &self,
        symbol: &str,
        market: Market,
        window: usize,
        points: Vec<DataPoint>,
    ) -> Result<DriftResult, DomainError> {
        if window < 2 {
            return Err(DomainError::validation("drift", "window must be >= 2"));
        }
        if points.len() < window + 1 {
            return Err(DomainError::new(
                ErrorCode::DataQuality,
                "drift",
                format!(
                    "need at least {} points for window {window}, received {}",
                    window + 1,
                    points.len()
                ),
            )
            .with_context("window", window)
            .with_context("received", points.len()));
        }

        let mut sorted = points;
        sorted.sort_by_key(|p| p.timestamp);
        let tail = &sorted[sorted.len() - (window + 1)..];
        let (baseline, latest) = tail.split_at(window);
        let latest = &latest[0];

        let mut baseline_close = Vec::with_capacity(window);
        let mut baseline_volume = Vec::with_capacity(window);
        for point in baseline {
            let close = point.close.ok_or_else(|| {
                DomainError::new(
                    ErrorCode::DataQuality,
                    "drift",
                    format!("baseline point for {symbol} missing close"),
                )
            })?;
            let volume = point.volume.ok_or_else(|| {
                DomainError::new(
                    ErrorCode::DataQuality,
                    "drift",
                    format!("baseline point for {symbol} missing volume"),
                )
            })?;
            baseline_close.push(close);
            baseline_volume.push(volume);
        }
        let latest_close = latest.close.ok_or_else(|| {
            DomainError::new(ErrorCode::DataQuality, "drift", format!("latest point for {symbol} missing close"))
        })?;
        let latest_volume = latest.volume.ok_or_else(|| {
            DomainError::new(ErrorCode::DataQuality, "drift", format!("latest point for {symbol} missing volume"))
        })?;

        let close_mean = mean(&baseline_close);
        let close_std = sample_stddev(&baseline_close);
        let volume_mean = mean(&baseline_volume);
        let volume_std = sample_stddev(&baseline_volume);

        let z_close = zscore(latest_close, close_mean, close_std);
        let z_volume = zscore(latest_volume, volume_mean, volume_std);

        let run_id = self.run_ids.next();
        let created_at = self.clock.now();
        let latest_timestamp = latest.timestamp;

        let metrics = vec![
            DriftMetric { name: "close_mean".into(), value: close_mean, status: DriftStatus::Ok },
            DriftMetric { name: "close_std".into(), value: close_std, status: DriftStatus::Ok },
            DriftMetric { name: "volume_mean".into(), value: volume_mean, status: DriftStatus::Ok },
            DriftMetric { name: "volume_std".into(), value: volume_std, status: DriftStatus::Ok },
            DriftMetric {
                name: "zscore_latest_close".into(),
                value: z_close,
                status: DriftStatus::classify_zscore(z_close, self.thresholds.warn, self.thresholds.fail),
            },
            DriftMetric {
                name: "zscore_latest_volume".into(),
                value: z_volume,
                status: DriftStatus::classify_zscore(z_volume, self.thresholds.warn, self.thresholds.fail),
            },
        ];

        if let Some(writer) = &self.writer {
            let date = latest_timestamp.date_naive();
            for metric in &metrics {
                writer.write_metric(date, market, symbol, metric, window, run_id, created_at)?;
            }
        }

        Ok(DriftResult {
            symbol: symbol.to_string(),
            market,
            window,
            metrics,
            latest_timestamp,
            run_id,
        })
    }
}

fn zscore(latest: Decimal, mean: Decimal, std: Decimal) -> Decimal {
    if std == Decimal::ZERO {
        Decimal::ZERO
    } else {
        (latest - mean) / std
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::clock::FixedClock;
    use crate::support::ids::FixedRunIdFactory;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn point(day: u32, close: Decimal, volume: Decimal) -> DataPoint {
        let ts = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        DataPoint::new("X", "cn", ts, None, None, None, Some(close), Some(volume)).unwrap()
    }

    fn detector() -> DriftDetector {
        DriftDetector::new(
            Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap())),
            Arc::new(FixedRunIdFactory(Uuid::nil())),
        )
    }

    #[test]
    fn warn_classification_matches_spec_worked_example() {
        let points = vec![
            point(1, dec!(10), dec!(100)),
            point(2, dec!(11), dec!(100)),
            point(3, dec!(12), dec!(100)),
            point(4, dec!(13), dec!(100)),
        ];
        let result = detector().detect("X", Market::Us, 3, points).unwrap();
        assert_eq!(result.metric("close_mean").unwrap().value, dec!(11));
        assert_eq!(result.metric("close_std").unwrap().value, dec!(1));
        assert_eq!(result.metric("zscore_latest_close").unwrap().value, dec!(2));
        assert_eq!(result.metric("zscore_latest_close").unwrap().status, DriftStatus::Warn);
        assert_eq!(result.metric("zscore_latest_volume").unwrap().status, DriftStatus::Ok);
    }

    #[test]
    fn constant_baseline_yields_zero_zscore_and_ok() {
        let points = vec![
            point(1, dec!(10), dec!(100)),
            point(2, dec!(10), dec!(100)),
            point(3, dec!(10), dec!(100)),
            point(4, dec!(999), dec!(1)),
        ];
        let result = detector().detect("X", Market::Us, 3, points).unwrap();
        assert_eq!(result.metric("zscore_latest_close").unwrap().value, Decimal::ZERO);
        assert_eq!(result.metric("zscore_latest_close").unwrap().status, DriftStatus::Ok);
    }

    #[test]
    fn too_few_points_is_data_quality_error() {
        let points = vec![point(1, dec!(10), dec!(100)), point(2, dec!(11), dec!(100))];
        let err = detector().detect("X", Market::Us, 3, points).unwrap_err();
        assert_eq!(err.code, ErrorCode::DataQuality);
        assert_eq!(err.context.get("window").and_then(|v| v.as_u64()), Some(3));
    }
}
