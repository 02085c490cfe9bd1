//! Composite provider scoring: spec.md §4.3's
//! `0.7*priority_score + 0.3*performance_score + 0.1*capability_bonus`.
//!
//! Grounded on `route_quality/mitigation.rs`'s endpoint-scoring helpers,
//! generalized from "endpoint latency percentile" to "registry score plus
//! configured provider priority".

use std::collections::HashMap;

use crate::model::provider::ProviderCapability;
use crate::model::query::Query;
use crate::registry::ProviderStatus;

const PRIORITY_WEIGHT: f64 = 0.7;
const PERFORMANCE_WEIGHT: f64 = 0.3;
const CAPABILITY_WEIGHT: f64 = 0.1;

/// Lower is better, 1..=4; unconfigured providers default to the lowest
/// priority tier rather than erroring (unknown providers rank last, never
/// rejected outright).
pub const DEFAULT_PRIORITY: u8 = 4;

#[derive(Debug, Clone, Default)]
pub struct PriorityTable {
    priorities: HashMap<String, u8>,
}

impl PriorityTable {
    pub fn new(priorities: HashMap<String, u8>) -> Self {
        Self { priorities }
    }

    /// `vprism_native=1, yfinance=2, alpha_vantage=2, akshare=3`, everything
    /// else defaults to [`DEFAULT_PRIORITY`].
    pub fn defaults() -> Self {
        let mut priorities = HashMap::new();
        priorities.insert("vprism_native".to_string(), 1);
        priorities.insert("yfinance".to_string(), 2);
        priorities.insert("alpha_vantage".to_string(), 2);
        priorities.insert("akshare".to_string(), 3);
        Self { priorities }
    }

    pub fn priority_of(&self, provider_name: &str) -> u8 {
        self.priorities
            .get(provider_name)
            .copied()
            .unwrap_or(DEFAULT_PRIORITY)
    }

    /// `(5 - priority) / 4`, so priority 1 scores 1.0 and priority 4 scores
    /// 0.25.
    pub fn priority_score(&self, provider_name: &str) -> f64 {
        let priority = self.priority_of(provider_name).clamp(1, 4) as f64;
        (5.0 - priority) / 4.0
    }
}

/// `success_rate * (1 - min(avg_latency_ms/5000, 0.5))` (spec.md §4.3).
/// Providers with no recorded requests yet use the neutral 0.5 the spec
/// calls for.
fn performance_score(status: &ProviderStatus, has_recorded_requests: bool) -> f64 {
    if !has_recorded_requests {
        return 0.5;
    }
    status.success_rate * (1.0 - (status.avg_latency_ms / 5000.0).min(0.5))
}

/// spec.md §4.3 step 3: +0.2 if real-time is supported and the query
/// carries no time bounds, +0.3 if `data_delay_seconds == 0` else +0.1 if
/// under 300s, +0.2 if the query's symbol count is at most half
/// `max_symbols_per_request` (+0.1 if at most 80%), capped at 1.0.
fn capability_bonus(capability: &ProviderCapability, query: &Query) -> f64 {
    let mut bonus = 0.0;

    if capability.supports_real_time && query.start.is_none() && query.end.is_none() {
        bonus += 0.2;
    }

    if capability.data_delay_seconds == 0 {
        bonus += 0.3;
    } else if capability.data_delay_seconds < 300 {
        bonus += 0.1;
    }

    if capability.max_symbols_per_request > 0 {
        let ratio = query.effective_symbols().len() as f64 / capability.max_symbols_per_request as f64;
        if ratio <= 0.5 {
            bonus += 0.2;
        } else if ratio <= 0.8 {
            bonus += 0.1;
        }
    }

    bonus.min(1.0)
}

pub fn composite_score(
    table: &PriorityTable,
    provider_name: &str,
    status: &ProviderStatus,
    capability: &ProviderCapability,
    query: &Query,
    has_recorded_requests: bool,
) -> f64 {
    PRIORITY_WEIGHT * table.priority_score(provider_name)
        + PERFORMANCE_WEIGHT * performance_score(status, has_recorded_requests)
        + CAPABILITY_WEIGHT * capability_bonus(capability, query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::query::{AdjustmentModeParam, AssetKind, Market, Timeframe};

    fn query() -> Query {
        Query {
            asset: AssetKind::Stock,
            market: None,
            provider: None,
            timeframe: None,
            start: None,
            end: None,
            raw_symbols: vec!["SH600000".into()],
            canonical_symbols: vec![],
            adjustment: AdjustmentModeParam::None,
        }
    }

    fn capability() -> ProviderCapability {
        ProviderCapability {
            assets: vec![AssetKind::Stock],
            markets: vec![Market::Cn],
            timeframes: vec![Timeframe::D1],
            max_symbols_per_request: 10,
            supports_real_time: false,
            supports_historical: true,
            data_delay_seconds: 0,
            max_history_days: None,
        }
    }

    fn status(name: &str, success_rate: f64, avg_latency_ms: f64) -> ProviderStatus {
        ProviderStatus {
            name: name.to_string(),
            healthy: true,
            score: 1.0,
            has_recorded_requests: true,
            success_rate,
            avg_latency_ms,
        }
    }

    #[test]
    fn native_outranks_default_priority() {
        let table = PriorityTable::defaults();
        let status = status("x", 1.0, 0.0);
        let native = composite_score(&table, "vprism_native", &status, &capability(), &query(), true);
        let unknown = composite_score(&table, "some_unconfigured_vendor", &status, &capability(), &query(), true);
        assert!(native > unknown);
    }

    #[test]
    fn higher_success_rate_and_lower_latency_wins_among_equal_priority() {
        let table = PriorityTable::defaults();
        let high = status("yfinance", 0.99, 50.0);
        let low = status("alpha_vantage", 0.4, 4000.0);
        let s_high = composite_score(&table, "yfinance", &high, &capability(), &query(), true);
        let s_low = composite_score(&table, "alpha_vantage", &low, &capability(), &query(), true);
        assert!(s_high > s_low);
    }

    #[test]
    fn no_recorded_requests_uses_neutral_performance_score() {
        let table = PriorityTable::defaults();
        let with_history = composite_score(&table, "x", &status("x", 1.0, 0.0), &capability(), &query(), true);
        let without_history = composite_score(&table, "x", &status("x", 1.0, 0.0), &capability(), &query(), false);
        assert!((without_history - with_history).abs() < 1e-9);
    }

    #[test]
    fn capability_bonus_rewards_zero_delay() {
        let table = PriorityTable::defaults();
        let st = status("x", 1.0, 0.0);
        let mut delayed = capability();
        delayed.data_delay_seconds = 600;
        let fast_score = composite_score(&table, "x", &st, &capability(), &query(), true);
        let slow_score = composite_score(&table, "x", &st, &delayed, &query(), true);
        assert!(fast_score > slow_score);
    }

    #[test]
    fn performance_score_matches_spec_formula() {
        let table = PriorityTable::defaults();
        let st = status("x", 0.8, 1000.0);
        // performance_score = 0.8 * (1 - min(1000/5000, 0.5)) = 0.8 * 0.8 = 0.64
        let score = composite_score(&table, "unconfigured", &st, &capability(), &query(), true);
        let expected = PRIORITY_WEIGHT * table.priority_score("unconfigured")
            + PERFORMANCE_WEIGHT * 0.64
            + CAPABILITY_WEIGHT * capability_bonus(&capability(), &query());
        assert!((score - expected).abs() < 1e-9);
    }
}
