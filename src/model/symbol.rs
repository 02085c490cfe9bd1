use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::query::{AssetKind, Market};

/// Resolved canonical symbol: `<MARKET>:<ASSET>:<CORE>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSymbol {
    pub raw_symbol: String,
    pub canonical: String,
    pub market: Market,
    pub asset_type: AssetKind,
    pub rule_id: String,
}

impl CanonicalSymbol {
    pub fn build(market: Market, asset: AssetKind, core: &str) -> String {
        format!(
            "{}:{}:{}",
            market.as_str().to_uppercase(),
            asset.as_str().to_uppercase(),
            core
        )
    }
}

/// Transform applied to a regex match to produce the canonical "core" string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleTransform {
    /// `template` is a format string referencing named capture groups and
    /// the literal `{match}` (the whole matched string).
    Template {
        template: String,
        #[serde(default)]
        uppercase: bool,
    },
    /// Like `template`, but maps an existing group's value through `mapping`
    /// before substitution, exposing the mapped value as `{mapped}`.
    MapTemplate {
        template: String,
        group: String,
        mapping: BTreeMap<String, String>,
        #[serde(default = "default_true")]
        case_insensitive: bool,
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        uppercase: bool,
    },
}

fn default_true() -> bool {
    true
}

/// One normalization rule. `regex` is compiled once at load time from
/// `pattern`/`flags` and cached here; `reload` rebuilds the whole list.
#[derive(Clone)]
pub struct SymbolRule {
    pub id: String,
    pub priority: i32,
    pub pattern: String,
    pub regex: Regex,
    pub transform: RuleTransform,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub market_scope: Vec<Market>,
    pub asset_scope: Vec<AssetKind>,
}

impl SymbolRule {
    pub fn in_scope(&self, market: Market, asset: AssetKind) -> bool {
        let market_ok = self.market_scope.is_empty() || self.market_scope.contains(&market);
        let asset_ok = self.asset_scope.is_empty() || self.asset_scope.contains(&asset);
        market_ok && asset_ok
    }
}

impl std::fmt::Debug for SymbolRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolRule")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("pattern", &self.pattern)
            .finish()
    }
}
