use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;

/// One OHLCV observation for one instrument at one timestamp. Immutable once
/// produced by an adapter; invariants are checked at construction, not
/// re-validated on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub symbol: String,
    pub market: String,
    pub timestamp: DateTime<Utc>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub provider: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl DataPoint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        market: impl Into<String>,
        timestamp: DateTime<Utc>,
        open: Option<Decimal>,
        high: Option<Decimal>,
        low: Option<Decimal>,
        close: Option<Decimal>,
        volume: Option<Decimal>,
    ) -> Result<Self, DomainError> {
        let point = Self {
            symbol: symbol.into(),
            market: market.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            amount: None,
            provider: None,
            extra: BTreeMap::new(),
        };
        point.check_invariants()?;
        Ok(point)
    }

    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if let (Some(high), Some(low)) = (self.high, self.low) {
            if high < low {
                return Err(DomainError::validation(
                    "model",
                    format!("high {high} < low {low} for {}", self.symbol),
                ));
            }
        }
        if let (Some(open), Some(close), Some(high), Some(low)) =
            (self.open, self.close, self.high, self.low)
        {
            let max_oc = open.max(close);
            let min_oc = open.min(close);
            if high < max_oc {
                return Err(DomainError::validation(
                    "model",
                    format!("high {high} < max(open,close) {max_oc} for {}", self.symbol),
                ));
            }
            if low > min_oc {
                return Err(DomainError::validation(
                    "model",
                    format!("low {low} > min(open,close) {min_oc} for {}", self.symbol),
                ));
            }
        }
        if let Some(volume) = self.volume {
            if volume < Decimal::ZERO {
                return Err(DomainError::validation(
                    "model",
                    format!("negative volume {volume} for {}", self.symbol),
                ));
            }
        }
        Ok(())
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn accepts_consistent_ohlc() {
        let p = DataPoint::new(
            "SH600000",
            "cn",
            ts(),
            Some(dec!(10)),
            Some(dec!(12)),
            Some(dec!(9)),
            Some(dec!(11)),
            Some(dec!(100)),
        );
        assert!(p.is_ok());
    }

    #[test]
    fn rejects_high_below_low() {
        let p = DataPoint::new(
            "SH600000",
            "cn",
            ts(),
            None,
            Some(dec!(9)),
            Some(dec!(10)),
            None,
            None,
        );
        assert!(p.is_err());
    }

    #[test]
    fn rejects_negative_volume() {
        let p = DataPoint::new(
            "SH600000", "cn", ts(), None, None, None, None, Some(dec!(-1)),
        );
        assert!(p.is_err());
    }
}
