//! Two-provider reconciliation sampler: compares same-symbol series from
//! two independent sources and classifies each date's divergence.
//! Algorithm, thresholds, and the p95-by-linear-interpolation convention are
//! unchanged from spec.md §4.9; RNG/clock/run-id injection follows the same
//! pattern as [`crate::drift`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rand::seq::SliceRandom;
use rand::RngCore;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{DomainError, ErrorCode};
use crate::model::point::DataPoint;
use crate::model::reconcile::{
    ReconcileStatus, ReconciliationResult, ReconciliationSample, ReconciliationSummary,
};
use crate::support::clock::Clock;
use crate::support::ids::RunIdFactory;

pub const DEFAULT_SAMPLE_SIZE: usize = 50;
pub const DEFAULT_CLOSE_WARN_BP: &str = "5";
pub const DEFAULT_CLOSE_FAIL_BP: &str = "10";
pub const DEFAULT_VOLUME_WARN: &str = "1.2";
pub const DEFAULT_VOLUME_FAIL: &str = "1.5";
const BP_SCALE: i64 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileThresholds {
    pub close_warn_bp: Decimal,
    pub close_fail_bp: Decimal,
    pub volume_warn: Decimal,
    pub volume_fail: Decimal,
}

impl Default for ReconcileThresholds {
    fn default() -> Self {
        Self {
            close_warn_bp: DEFAULT_CLOSE_WARN_BP.parse().unwrap(),
            close_fail_bp: DEFAULT_CLOSE_FAIL_BP.parse().unwrap(),
            volume_warn: DEFAULT_VOLUME_WARN.parse().unwrap(),
            volume_fail: DEFAULT_VOLUME_FAIL.parse().unwrap(),
        }
    }
}

/// Loads one symbol's series for `[start, end]` from one of the two
/// providers under comparison.
pub trait SeriesLoader: Send + Sync {
    fn load(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DataPoint>, DomainError>;
}

pub trait ReconciliationRunWriter: Send + Sync {
    fn write_run(
        &self,
        run_id: Uuid,
        created_at: DateTime<Utc>,
        summary: &ReconciliationSummary,
        sampled_symbols: &[String],
    ) -> Result<(), DomainError>;
}

pub trait ReconciliationDiffWriter: Send + Sync {
    fn write_diff(&self, run_id: Uuid, sample: &ReconciliationSample) -> Result<(), DomainError>;
}

pub struct ReconciliationSampler {
    clock: Arc<dyn Clock>,
    run_ids: Arc<dyn RunIdFactory>,
    thresholds: ReconcileThresholds,
    run_writer: Option<Arc<dyn ReconciliationRunWriter>>,
    diff_writer: Option<Arc<dyn ReconciliationDiffWriter>>,
}

impl ReconciliationSampler {
    pub fn new(clock: Arc<dyn Clock>, run_ids: Arc<dyn RunIdFactory>) -> Self {
        Self {
            clock,
            run_ids,
            thresholds: ReconcileThresholds::default(),
            run_writer: None,
            diff_writer: None,
        }
    }

    pub fn with_thresholds(mut self, thresholds: ReconcileThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_run_writer(mut self, writer: Arc<dyn ReconciliationRunWriter>) -> Self {
        self.run_writer = Some(writer);
        self
    }

    pub fn with_diff_writer(mut self, writer: Arc<dyn ReconciliationDiffWriter>) -> Self {
        self.diff_writer = Some(writer);
        self
    }

    /// Runs the full sample-compare-classify-aggregate pipeline of spec.md
    /// §4.9. `rng` is injected so tests (and only tests) can pin sampling.
    pub fn run(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        sample_size: Option<usize>,
        loader_a: &dyn SeriesLoader,
        loader_b: &dyn SeriesLoader,
        rng: &mut dyn RngCore,
    ) -> Result<ReconciliationResult, DomainError> {
        if symbols.is_empty() {
            return Err(DomainError::validation("reconcile", "symbols must not be empty"));
        }
        if start > end {
            return Err(DomainError::validation("reconcile", format!("start {start} is after end {end}")));
        }
        let sample_size = sample_size.unwrap_or(DEFAULT_SAMPLE_SIZE);
        if sample_size == 0 {
            return Err(DomainError::validation("reconcile", "sample_size must be > 0"));
        }

        let mut seen = std::collections::HashSet::new();
        let mut unique: Vec<String> = Vec::new();
        for symbol in symbols {
            if seen.insert(symbol.clone()) {
                unique.push(symbol.clone());
            }
        }

        let sampled_symbols = if unique.len() <= sample_size {
            unique
        } else {
            let mut shuffled = unique;
            shuffled.shuffle(rng);
            shuffled.truncate(sample_size);
            shuffled
        };

        let mut samples = Vec::new();
        for symbol in &sampled_symbols {
            let series_a = loader_a.load(symbol, start, end)?;
            let series_b = loader_b.load(symbol, start, end)?;
            let by_date_a = index_by_date(&series_a);
            let by_date_b = index_by_date(&series_b);

            let mut dates: Vec<NaiveDate> = by_date_a.keys().chain(by_date_b.keys()).copied().collect();
            dates.sort();
            dates.dedup();

            for date in dates {
                let a = by_date_a.get(&date);
                let b = by_date_b.get(&date);
                samples.push(classify_sample(symbol, date, a, b, &self.thresholds));
            }
        }

        let summary = aggregate(&samples);
        let run_id = self.run_ids.next();
        let created_at = self.clock.now();

        if let Some(writer) = &self.run_writer {
            writer.write_run(run_id, created_at, &summary, &sampled_symbols)?;
        }
        if let Some(writer) = &self.diff_writer {
            for sample in &samples {
                writer.write_diff(run_id, sample)?;
            }
        }

        Ok(ReconciliationResult {
            run_id,
            created_at,
            summary,
            sampled_symbols,
            samples,
        })
    }
}

fn index_by_date(points: &[DataPoint]) -> BTreeMap<NaiveDate, &DataPoint> {
    points.iter().map(|p| (p.timestamp.date_naive(), p)).collect()
}

fn classify_sample(
    symbol: &str,
    date: NaiveDate,
    a: Option<&&DataPoint>,
    b: Option<&&DataPoint>,
    thresholds: &ReconcileThresholds,
) -> ReconciliationSample {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (Some(*a), Some(*b)),
        (Some(a), None) => (Some(*a), None),
        (None, Some(b)) => (None, Some(*b)),
        (None, None) => (None, None),
    };

    if a.is_none() || b.is_none() {
        return ReconciliationSample {
            symbol: symbol.to_string(),
            date,
            close_a: a.and_then(|p| p.close),
            close_b: b.and_then(|p| p.close),
            close_bp_diff: None,
            volume_a: a.and_then(|p| p.volume),
            volume_b: b.and_then(|p| p.volume),
            volume_ratio: None,
            status: ReconcileStatus::Fail,
        };
    }
    let a = a.unwrap();
    let b = b.unwrap();

    let close_bp_diff = match (a.close, b.close) {
        (Some(ca), Some(cb)) if cb != Decimal::ZERO => Some((ca - cb) / cb * Decimal::from(BP_SCALE)),
        _ => None,
    };
    let close_status = match close_bp_diff {
        None => ReconcileStatus::Fail,
        Some(diff) if diff.abs() >= thresholds.close_fail_bp => ReconcileStatus::Fail,
        Some(diff) if diff.abs() >= thresholds.close_warn_bp => ReconcileStatus::Warn,
        Some(_) => ReconcileStatus::Pass,
    };

    let volume_ratio = match (a.volume, b.volume) {
        (Some(va), Some(vb)) if vb > Decimal::ZERO => Some(va / vb),
        _ => None,
    };
    let volume_status = match volume_ratio {
        None => ReconcileStatus::Fail,
        Some(ratio) if ratio <= Decimal::ZERO => ReconcileStatus::Fail,
        Some(ratio) => {
            let deviation = ratio.max(Decimal::ONE / ratio);
            if deviation >= thresholds.volume_fail {
                ReconcileStatus::Fail
            } else if deviation >= thresholds.volume_warn {
                ReconcileStatus::Warn
            } else {
                ReconcileStatus::Pass
            }
        }
    };

    ReconciliationSample {
        symbol: symbol.to_string(),
        date,
        close_a: a.close,
        close_b: b.close,
        close_bp_diff,
        volume_a: a.volume,
        volume_b: b.volume,
        volume_ratio,
        status: close_status.worse(volume_status),
    }
}

fn aggregate(samples: &[ReconciliationSample]) -> ReconciliationSummary {
    let mut pass_count = 0;
    let mut warn_count = 0;
    let mut fail_count = 0;
    let mut abs_diffs: Vec<Decimal> = Vec::new();

    for sample in samples {
        match sample.status {
            ReconcileStatus::Pass => pass_count += 1,
            ReconcileStatus::Warn => warn_count += 1,
            ReconcileStatus::Fail => fail_count += 1,
        }
        if let Some(diff) = sample.close_bp_diff {
            abs_diffs.push(diff.abs());
        }
    }

    ReconciliationSummary {
        pass_count,
        warn_count,
        fail_count,
        p95_close_bp_diff: percentile_95(&mut abs_diffs),
    }
}

/// p95 via linear interpolation at `rank = 0.95 * (n - 1)` (spec.md §4.9
/// step 4 / §9 Open Question, pinned to linear interpolation).
fn percentile_95(values: &mut [Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.sort();
    if values.len() == 1 {
        return values[0];
    }
    let n = values.len();
    let rank = Decimal::new(95, 2) * Decimal::from(n - 1);
    let lower_idx = rank.trunc().to_usize().unwrap_or(0).min(n - 1);
    let frac = rank - rank.trunc();
    if lower_idx + 1 >= n || frac == Decimal::ZERO {
        values[lower_idx]
    } else {
        values[lower_idx] + frac * (values[lower_idx + 1] - values[lower_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::clock::FixedClock;
    use crate::support::ids::FixedRunIdFactory;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rust_decimal_macros::dec;

    struct StaticLoader(Vec<DataPoint>);
    impl SeriesLoader for StaticLoader {
        fn load(&self, _symbol: &str, _start: NaiveDate, _end: NaiveDate) -> Result<Vec<DataPoint>, DomainError> {
            Ok(self.0.clone())
        }
    }

    fn point(day: u32, close: Decimal, volume: Decimal) -> DataPoint {
        let ts = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        DataPoint::new("X", "cn", ts, None, None, None, Some(close), Some(volume)).unwrap()
    }

    fn sampler() -> ReconciliationSampler {
        ReconciliationSampler::new(
            Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap())),
            Arc::new(FixedRunIdFactory(Uuid::nil())),
        )
    }

    #[test]
    fn identical_series_all_pass_with_zero_p95() {
        let series = vec![point(1, dec!(10), dec!(100)), point(2, dec!(11), dec!(100))];
        let a = StaticLoader(series.clone());
        let b = StaticLoader(series);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let result = sampler()
            .run(
                &["X".to_string()],
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                None,
                &a,
                &b,
                &mut rng,
            )
            .unwrap();
        assert_eq!(result.summary.fail_count, 0);
        assert_eq!(result.summary.warn_count, 0);
        assert_eq!(result.summary.p95_close_bp_diff, Decimal::ZERO);
    }

    #[test]
    fn missing_date_in_one_series_fails() {
        let a = StaticLoader(vec![point(1, dec!(10), dec!(100)), point(2, dec!(11), dec!(100))]);
        let b = StaticLoader(vec![point(1, dec!(10), dec!(100))]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = sampler()
            .run(
                &["X".to_string()],
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                None,
                &a,
                &b,
                &mut rng,
            )
            .unwrap();
        assert_eq!(result.summary.fail_count, 1);
    }

    #[test]
    fn duplicate_symbols_are_deduplicated_before_sampling() {
        let a = StaticLoader(vec![point(1, dec!(10), dec!(100))]);
        let b = StaticLoader(vec![point(1, dec!(10), dec!(100))]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let result = sampler()
            .run(
                &["X".to_string(), "X".to_string()],
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                None,
                &a,
                &b,
                &mut rng,
            )
            .unwrap();
        assert_eq!(result.sampled_symbols, vec!["X".to_string()]);
    }
}
