use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReconcileStatus {
    Pass,
    Warn,
    Fail,
}

impl ReconcileStatus {
    /// More-severe-wins combination used when a sample is classified
    /// independently on close and on volume.
    pub fn worse(self, other: Self) -> Self {
        use ReconcileStatus::*;
        match (self, other) {
            (Fail, _) | (_, Fail) => Fail,
            (Warn, _) | (_, Warn) => Warn,
            _ => Pass,
        }
    }
}

/// One `(symbol, date)` comparison between two providers' series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSample {
    pub symbol: String,
    pub date: NaiveDate,
    pub close_a: Option<Decimal>,
    pub close_b: Option<Decimal>,
    pub close_bp_diff: Option<Decimal>,
    pub volume_a: Option<Decimal>,
    pub volume_b: Option<Decimal>,
    pub volume_ratio: Option<Decimal>,
    pub status: ReconcileStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub pass_count: usize,
    pub warn_count: usize,
    pub fail_count: usize,
    pub p95_close_bp_diff: Decimal,
}

/// Full output of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub summary: ReconciliationSummary,
    pub sampled_symbols: Vec<String>,
    pub samples: Vec<ReconciliationSample>,
}
