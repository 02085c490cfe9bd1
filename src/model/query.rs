use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Stock,
    Bond,
    Etf,
    Fund,
    Futures,
    Options,
    Forex,
    Crypto,
    Index,
    Commodity,
    ConvertibleBond,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Stock => "stock",
            AssetKind::Bond => "bond",
            AssetKind::Etf => "etf",
            AssetKind::Fund => "fund",
            AssetKind::Futures => "futures",
            AssetKind::Options => "options",
            AssetKind::Forex => "forex",
            AssetKind::Crypto => "crypto",
            AssetKind::Index => "index",
            AssetKind::Commodity => "commodity",
            AssetKind::ConvertibleBond => "convertible_bond",
        }
    }
}

impl std::str::FromStr for AssetKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "stock" => AssetKind::Stock,
            "bond" => AssetKind::Bond,
            "etf" => AssetKind::Etf,
            "fund" => AssetKind::Fund,
            "futures" => AssetKind::Futures,
            "options" => AssetKind::Options,
            "forex" => AssetKind::Forex,
            "crypto" => AssetKind::Crypto,
            "index" => AssetKind::Index,
            "commodity" => AssetKind::Commodity,
            "convertible_bond" => AssetKind::ConvertibleBond,
            other => {
                return Err(DomainError::validation(
                    "model",
                    format!("unknown asset kind '{other}'"),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    Cn,
    Us,
    Hk,
    Eu,
    Jp,
    Uk,
    Au,
    Global,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Cn => "cn",
            Market::Us => "us",
            Market::Hk => "hk",
            Market::Eu => "eu",
            Market::Jp => "jp",
            Market::Uk => "uk",
            Market::Au => "au",
            Market::Global => "global",
        }
    }
}

impl std::str::FromStr for Market {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "cn" => Market::Cn,
            "us" => Market::Us,
            "hk" => Market::Hk,
            "eu" => Market::Eu,
            "jp" => Market::Jp,
            "uk" => Market::Uk,
            "au" => Market::Au,
            "global" => Market::Global,
            other => {
                return Err(DomainError::validation(
                    "model",
                    format!("unknown market '{other}'"),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    Tick,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Tick => "tick",
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
            Timeframe::Mo1 => "1M",
        }
    }

    /// TTL band in seconds, per the cache's timeframe-keyed table.
    pub fn ttl_seconds(opt: Option<Timeframe>) -> i64 {
        match opt {
            Some(Timeframe::Tick) => 5,
            Some(Timeframe::M1) => 60,
            Some(Timeframe::M5) => 300,
            Some(Timeframe::M15) => 900,
            Some(Timeframe::M30) => 1800,
            Some(Timeframe::H1) => 3600,
            Some(Timeframe::D1) => 3600,
            Some(Timeframe::W1) => 86_400,
            Some(Timeframe::Mo1) => 86_400,
            Some(Timeframe::H4) => 300,
            None => 300,
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "tick" => Timeframe::Tick,
            "1m" => Timeframe::M1,
            "5m" => Timeframe::M5,
            "15m" => Timeframe::M15,
            "30m" => Timeframe::M30,
            "1h" => Timeframe::H1,
            "4h" => Timeframe::H4,
            "1d" => Timeframe::D1,
            "1w" => Timeframe::W1,
            "1M" => Timeframe::Mo1,
            other => {
                return Err(DomainError::validation(
                    "model",
                    format!("unknown timeframe '{other}'"),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentModeParam {
    None,
    Forward,
    Backward,
}

impl std::str::FromStr for AdjustmentModeParam {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "none" => AdjustmentModeParam::None,
            "forward" => AdjustmentModeParam::Forward,
            "backward" => AdjustmentModeParam::Backward,
            other => {
                return Err(DomainError::validation(
                    "model",
                    format!("unknown adjustment mode '{other}'"),
                ))
            }
        })
    }
}

/// A declarative read request. `start`/`end` are inclusive calendar bounds;
/// `raw_symbols` are caller-supplied (pre-normalization); `canonical_symbols`
/// are filled in by the data service once normalization has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub asset: AssetKind,
    pub market: Option<Market>,
    pub provider: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub raw_symbols: Vec<String>,
    pub canonical_symbols: Vec<String>,
    pub adjustment: AdjustmentModeParam,
}

impl Query {
    pub fn validate(&self) -> Result<(), DomainError> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(DomainError::validation(
                    "model",
                    format!("start {start} is after end {end}"),
                ));
            }
        }
        if self.raw_symbols.is_empty() && self.canonical_symbols.is_empty() {
            return Err(DomainError::validation(
                "model",
                "query must name at least one symbol",
            ));
        }
        Ok(())
    }

    /// Symbols used for cache-key derivation: canonical if resolved, else raw.
    pub fn effective_symbols(&self) -> &[String] {
        if self.canonical_symbols.is_empty() {
            &self.raw_symbols
        } else {
            &self.canonical_symbols
        }
    }
}

/// Historical bound check used by `Provider::can_handle_query`.
pub fn within_history(
    start: Option<NaiveDate>,
    max_history_days: Option<u32>,
    now: DateTime<Utc>,
) -> bool {
    match (start, max_history_days) {
        (Some(start), Some(max_days)) => {
            let earliest = now.date_naive() - chrono::Duration::days(max_days as i64);
            start >= earliest
        }
        _ => true,
    }
}
