use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::query::Market;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DriftStatus {
    Ok,
    Warn,
    Fail,
}

impl DriftStatus {
    /// Classifies a z-score against the configured warn/fail thresholds
    /// (spec.md §4.8 step 6): FAIL if `|z| >= fail`, WARN if `|z| >= warn`,
    /// else OK.
    pub fn classify_zscore(z: Decimal, warn_threshold: Decimal, fail_threshold: Decimal) -> Self {
        let abs_z = z.abs();
        if abs_z >= fail_threshold {
            DriftStatus::Fail
        } else if abs_z >= warn_threshold {
            DriftStatus::Warn
        } else {
            DriftStatus::Ok
        }
    }
}

/// One emitted metric (`close_mean`, `close_std`, `zscore_latest_close`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftMetric {
    pub name: String,
    pub value: Decimal,
    pub status: DriftStatus,
}

/// Full output of one drift-detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftResult {
    pub symbol: String,
    pub market: Market,
    pub window: usize,
    pub metrics: Vec<DriftMetric>,
    pub latest_timestamp: DateTime<Utc>,
    pub run_id: Uuid,
}

impl DriftResult {
    pub fn metric(&self, name: &str) -> Option<&DriftMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Worst status across all emitted metrics; used by the CLI's
    /// data-quality exit code (30).
    pub fn worst_status(&self) -> DriftStatus {
        self.metrics
            .iter()
            .map(|m| m.status)
            .max_by_key(|s| match s {
                DriftStatus::Ok => 0,
                DriftStatus::Warn => 1,
                DriftStatus::Fail => 2,
            })
            .unwrap_or(DriftStatus::Ok)
    }
}
