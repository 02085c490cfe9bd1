use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::query::{AdjustmentModeParam, Market};

/// Adjustment mode the engine was asked to compute. Distinct from
/// [`AdjustmentModeParam`] (the query-facing request parameter) so the
/// engine's own contract doesn't change shape if the query surface grows
/// extra request-only variants later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentMode {
    None,
    Forward,
    Backward,
}

impl From<AdjustmentModeParam> for AdjustmentMode {
    fn from(value: AdjustmentModeParam) -> Self {
        match value {
            AdjustmentModeParam::None => AdjustmentMode::None,
            AdjustmentModeParam::Forward => AdjustmentMode::Forward,
            AdjustmentModeParam::Backward => AdjustmentMode::Backward,
        }
    }
}

/// Per-date factor pair, also the persisted shape for the `adjustments`
/// storage table (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentFactor {
    pub date: NaiveDate,
    pub adj_factor_qfq: Decimal,
    pub adj_factor_hfq: Decimal,
}

/// One row of the adjusted series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRow {
    pub date: NaiveDate,
    pub close_raw: Option<Decimal>,
    pub close_qfq: Option<Decimal>,
    pub close_hfq: Option<Decimal>,
    pub adj_factor_qfq: Decimal,
    pub adj_factor_hfq: Decimal,
}

/// Output of [`crate::adjustment::AdjustmentEngine::compute`].
/// `version = "<algorithm_version>:<first-12-hex of source_events_hash>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentResult {
    pub symbol: String,
    pub market: Market,
    pub mode: AdjustmentMode,
    pub rows: Vec<AdjustmentRow>,
    pub factors: Vec<AdjustmentFactor>,
    pub source_events_hash: String,
    pub version: String,
    pub action_gap_flag: bool,
}
