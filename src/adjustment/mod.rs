//! Corporate-action adjustment engine: derives forward (`qfq`) and backward
//! (`hfq`) price-adjustment factors from a merged dividend/split set and
//! applies them to a close-price series.
//!
//! The factor recurrence itself has no counterpart in
//! `original_source/vprism/core/models/corporate_actions.py`'s
//! `compute_corporate_action_factors` (a non-functional placeholder there);
//! it is built directly from spec.md §4.6's prose. The surrounding shape —
//! memoized-by-fingerprint, writer-optional, clock-injected — follows the
//! same collaborator-injection pattern as [`crate::drift`] and
//! [`crate::reconcile`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::error::DomainError;
use crate::model::adjustment::{AdjustmentFactor, AdjustmentMode, AdjustmentResult, AdjustmentRow};
use crate::model::corporate_action::{merge_corporate_action_set, CorporateActionSet};
use crate::model::point::DataPoint;
use crate::model::query::Market;
use crate::support::clock::Clock;
use crate::support::decimal::normalize_decimal_string;

pub const ALGORITHM_VERSION: &str = "adj-v1";

/// Persists one computed factor row, keyed by `(market, supplier_symbol,
/// date)` with replace-on-key semantics (spec.md §4.6 step 7 / §4.7).
pub trait AdjustmentFactorWriter: Send + Sync {
    fn write_factor(
        &self,
        market: Market,
        supplier_symbol: &str,
        factor: &AdjustmentFactor,
        version: &str,
        source_events_hash: &str,
        build_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), DomainError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AdjustmentCacheKey {
    symbol: String,
    market: String,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    mode: u8,
    algorithm_version: String,
    price_count: usize,
    price_fingerprint: String,
    events_hash: String,
}

fn mode_discriminant(mode: AdjustmentMode) -> u8 {
    match mode {
        AdjustmentMode::None => 0,
        AdjustmentMode::Forward => 1,
        AdjustmentMode::Backward => 2,
    }
}

pub struct AdjustmentEngine {
    writer: Option<Arc<dyn AdjustmentFactorWriter>>,
    clock: Arc<dyn Clock>,
    memo: Mutex<HashMap<AdjustmentCacheKey, Arc<AdjustmentResult>>>,
}

impl AdjustmentEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            writer: None,
            clock,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_writer(mut self, writer: Arc<dyn AdjustmentFactorWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Computes (or returns the memoized) adjustment result for `prices`
    /// under `actions`, per spec.md §4.6's seven-step algorithm.
    pub fn compute(
        &self,
        symbol: &str,
        market: Market,
        mode: AdjustmentMode,
        prices: Vec<DataPoint>,
        actions: CorporateActionSet,
    ) -> Result<Arc<AdjustmentResult>, DomainError> {
        if prices.is_empty() {
            return Err(DomainError::validation(
                "adjustment",
                format!("no prices supplied for {symbol}"),
            ));
        }

        let mut prices = prices;
        prices.sort_by_key(|p| p.timestamp);

        let merged = merge_corporate_action_set(actions);
        let price_fingerprint = fingerprint_prices(&prices);
        let events_hash = hash_events(&merged);

        let start = prices.first().map(|p| p.timestamp.date_naive());
        let end = prices.last().map(|p| p.timestamp.date_naive());
        let key = AdjustmentCacheKey {
            symbol: symbol.to_string(),
            market: market.as_str().to_string(),
            start,
            end,
            mode: mode_discriminant(mode),
            algorithm_version: ALGORITHM_VERSION.to_string(),
            price_count: prices.len(),
            price_fingerprint,
            events_hash: events_hash.clone(),
        };

        if let Some(cached) = self.memo.lock().get(&key) {
            return Ok(cached.clone());
        }

        let (factors, action_gap_flag) = compute_factors(&prices, &merged);

        let rows: Vec<AdjustmentRow> = prices
            .iter()
            .zip(factors.iter())
            .map(|(point, factor)| AdjustmentRow {
                date: point.timestamp.date_naive(),
                close_raw: point.close,
                close_qfq: point.close.map(|c| c * factor.adj_factor_qfq),
                close_hfq: point.close.map(|c| c * factor.adj_factor_hfq),
                adj_factor_qfq: factor.adj_factor_qfq,
                adj_factor_hfq: factor.adj_factor_hfq,
            })
            .collect();

        let version = format!("{ALGORITHM_VERSION}:{}", &events_hash[..12.min(events_hash.len())]);

        let result = Arc::new(AdjustmentResult {
            symbol: symbol.to_string(),
            market,
            mode,
            rows,
            factors: factors.clone(),
            source_events_hash: events_hash.clone(),
            version: version.clone(),
            action_gap_flag,
        });

        if let Some(writer) = &self.writer {
            let build_time = self.clock.now();
            for factor in &factors {
                writer.write_factor(market, symbol, factor, &version, &events_hash, build_time)?;
            }
        }

        self.memo.lock().insert(key, result.clone());
        Ok(result)
    }
}

/// `hfq` walks dates ascending, multiplying by `prev_close/(prev_close -
/// total_cash)` on a dividend date and by the split ratio on a split date;
/// `qfq[d] = hfq[d] / hfq[last]` so the last date's forward factor is
/// exactly 1.
fn compute_factors(
    prices: &[DataPoint],
    actions: &CorporateActionSet,
) -> (Vec<AdjustmentFactor>, bool) {
    let mut dividends_by_date: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
    for event in &actions.dividends {
        *dividends_by_date.entry(event.ex_date).or_insert(Decimal::ZERO) += event.cash_amount;
    }
    let mut splits_by_date: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
    for event in &actions.splits {
        let entry = splits_by_date.entry(event.ex_date).or_insert(Decimal::ONE);
        *entry *= event.ratio();
    }

    let mut hfq = Vec::with_capacity(prices.len());
    let mut running = Decimal::ONE;
    let mut prev_close: Option<Decimal> = None;
    let mut action_gap_flag = false;

    for point in prices {
        let date = point.timestamp.date_naive();
        if let Some(total_cash) = dividends_by_date.get(&date) {
            match prev_close {
                Some(prev) if prev - *total_cash != Decimal::ZERO => {
                    running *= prev / (prev - *total_cash);
                }
                _ => {
                    action_gap_flag = true;
                }
            }
        }
        if let Some(ratio) = splits_by_date.get(&date) {
            running *= *ratio;
        }
        hfq.push(running);
        prev_close = point.close;
    }

    let last_hfq = hfq.last().copied().unwrap_or(Decimal::ONE);
    let factors: Vec<AdjustmentFactor> = prices
        .iter()
        .zip(hfq.iter())
        .map(|(point, hfq_factor)| AdjustmentFactor {
            date: point.timestamp.date_naive(),
            adj_factor_hfq: *hfq_factor,
            adj_factor_qfq: if last_hfq == Decimal::ZERO {
                Decimal::ZERO
            } else {
                *hfq_factor / last_hfq
            },
        })
        .collect();

    (factors, action_gap_flag)
}

fn fingerprint_prices(prices: &[DataPoint]) -> String {
    let mut hasher = Sha256::new();
    for point in prices {
        hasher.update(point.timestamp.to_rfc3339().as_bytes());
        hasher.update(b"|");
        let close = point.close.map(normalize_decimal_string).unwrap_or_default();
        hasher.update(close.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

fn hash_events(actions: &CorporateActionSet) -> String {
    let mut hasher = Sha256::new();

    let mut dividends = actions.dividends.clone();
    dividends.sort_by(|a, b| {
        a.ex_date
            .cmp(&b.ex_date)
            .then(a.cash_amount.cmp(&b.cash_amount))
            .then(a.currency.cmp(&b.currency))
            .then(a.source.cmp(&b.source))
    });
    for event in &dividends {
        hasher.update(event.ex_date.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(normalize_decimal_string(event.cash_amount).as_bytes());
        hasher.update(b"|");
        hasher.update(event.currency.clone().unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(event.source.clone().unwrap_or_default().as_bytes());
        hasher.update(b";");
    }

    let mut splits = actions.splits.clone();
    splits.sort_by(|a, b| {
        a.ex_date
            .cmp(&b.ex_date)
            .then(a.numerator.cmp(&b.numerator))
            .then(a.denominator.cmp(&b.denominator))
            .then(a.source.cmp(&b.source))
    });
    for event in &splits {
        hasher.update(event.ex_date.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(event.numerator.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(event.denominator.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(event.source.clone().unwrap_or_default().as_bytes());
        hasher.update(b";");
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::corporate_action::{DividendEvent, SplitEvent};
    use crate::support::clock::SystemClock;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap as Map;

    fn point(date: NaiveDate, close: Decimal) -> DataPoint {
        let ts = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
        DataPoint::new("SH600000", "cn", ts, None, None, None, Some(close), None).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn dividend_and_split_scenario_matches_spec_worked_example() {
        let engine = AdjustmentEngine::new(Arc::new(SystemClock));
        let prices = vec![
            point(date(2024, 1, 1), dec!(100)),
            point(date(2024, 1, 2), dec!(98)),
            point(date(2024, 1, 3), dec!(49)),
        ];
        let actions = CorporateActionSet::new(
            vec![DividendEvent {
                symbol: "SH600000".into(),
                market: Market::Cn,
                ex_date: date(2024, 1, 2),
                pay_date: None,
                cash_amount: dec!(2),
                currency: None,
                source: None,
                metadata: Map::new(),
            }],
            vec![SplitEvent {
                symbol: "SH600000".into(),
                market: Market::Cn,
                ex_date: date(2024, 1, 3),
                numerator: 2,
                denominator: 1,
                source: None,
                metadata: Map::new(),
            }],
        );

        let result = engine
            .compute("SH600000", Market::Cn, AdjustmentMode::Forward, prices, actions)
            .unwrap();

        let hfq: Vec<Decimal> = result.factors.iter().map(|f| f.adj_factor_hfq.round_dp(4)).collect();
        let qfq: Vec<Decimal> = result.factors.iter().map(|f| f.adj_factor_qfq.round_dp(4)).collect();
        assert_eq!(hfq, vec![dec!(1.0000), dec!(1.0204), dec!(2.0408)]);
        assert_eq!(qfq, vec![dec!(0.4900), dec!(0.5000), dec!(1.0000)]);

        let close_hfq: Vec<Decimal> = result
            .rows
            .iter()
            .map(|r| r.close_hfq.unwrap().round_dp(4))
            .collect();
        let close_qfq: Vec<Decimal> = result
            .rows
            .iter()
            .map(|r| r.close_qfq.unwrap().round_dp(4))
            .collect();
        assert_eq!(close_hfq, vec![dec!(100.0000); 3]);
        assert_eq!(close_qfq, vec![dec!(49.0000); 3]);
        assert!(!result.action_gap_flag);
    }

    #[test]
    fn qfq_last_date_is_always_one() {
        let engine = AdjustmentEngine::new(Arc::new(SystemClock));
        let prices = vec![
            point(date(2024, 1, 1), dec!(10)),
            point(date(2024, 1, 2), dec!(11)),
        ];
        let result = engine
            .compute(
                "X",
                Market::Us,
                AdjustmentMode::Forward,
                prices,
                CorporateActionSet::default(),
            )
            .unwrap();
        assert_eq!(result.factors.last().unwrap().adj_factor_qfq, Decimal::ONE);
    }

    #[test]
    fn dividend_with_no_prior_close_sets_gap_flag() {
        let engine = AdjustmentEngine::new(Arc::new(SystemClock));
        let prices = vec![point(date(2024, 1, 1), dec!(100))];
        let actions = CorporateActionSet::new(
            vec![DividendEvent {
                symbol: "X".into(),
                market: Market::Us,
                ex_date: date(2024, 1, 1),
                pay_date: None,
                cash_amount: dec!(1),
                currency: None,
                source: None,
                metadata: Map::new(),
            }],
            vec![],
        );
        let result = engine
            .compute("X", Market::Us, AdjustmentMode::Backward, prices, actions)
            .unwrap();
        assert!(result.action_gap_flag);
    }

    #[test]
    fn empty_prices_is_an_error() {
        let engine = AdjustmentEngine::new(Arc::new(SystemClock));
        let err = engine
            .compute("X", Market::Us, AdjustmentMode::None, vec![], CorporateActionSet::default())
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Validation);
    }

    #[test]
    fn repeated_calls_with_identical_input_are_byte_identical() {
        let engine = AdjustmentEngine::new(Arc::new(SystemClock));
        let prices = || {
            vec![
                point(date(2024, 1, 1), dec!(10)),
                point(date(2024, 1, 2), dec!(11)),
            ]
        };
        let a = engine
            .compute("X", Market::Us, AdjustmentMode::Forward, prices(), CorporateActionSet::default())
            .unwrap();
        let b = engine
            .compute("X", Market::Us, AdjustmentMode::Forward, prices(), CorporateActionSet::default())
            .unwrap();
        assert_eq!(a.version, b.version);
        assert_eq!(a.factors, b.factors);
    }
}
