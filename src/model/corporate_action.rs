use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::query::Market;

/// A single cash dividend declared for `(symbol, market)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendEvent {
    pub symbol: String,
    pub market: Market,
    pub ex_date: NaiveDate,
    pub pay_date: Option<NaiveDate>,
    pub cash_amount: Decimal,
    pub currency: Option<String>,
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// A share split/consolidation declared for `(symbol, market)`. `ratio =
/// numerator / denominator` (e.g. a 2-for-1 split is `numerator=2,
/// denominator=1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitEvent {
    pub symbol: String,
    pub market: Market,
    pub ex_date: NaiveDate,
    pub numerator: i64,
    pub denominator: i64,
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl SplitEvent {
    pub fn ratio(&self) -> Decimal {
        Decimal::from(self.numerator) / Decimal::from(self.denominator)
    }
}

/// Immutable pair of per-`(symbol, market)` event sequences. Construct via
/// [`merge_corporate_action_set`] rather than by hand so same-day events are
/// always collapsed before the adjustment engine sees them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorporateActionSet {
    pub dividends: Vec<DividendEvent>,
    pub splits: Vec<SplitEvent>,
}

impl CorporateActionSet {
    pub fn new(dividends: Vec<DividendEvent>, splits: Vec<SplitEvent>) -> Self {
        Self { dividends, splits }
    }
}

/// Collapses events sharing `(symbol, market, ex_date, kind)`: dividend cash
/// amounts sum, split numerator/denominator multiply componentwise, sources
/// join with `;`, and metadata is unioned with a `merged_event_count` key
/// recording how many raw events fed the merged one.
pub fn merge_corporate_action_set(raw: CorporateActionSet) -> CorporateActionSet {
    let mut dividend_groups: BTreeMap<(String, String, NaiveDate), Vec<DividendEvent>> =
        BTreeMap::new();
    for event in raw.dividends {
        let key = (event.symbol.clone(), event.market.as_str().to_string(), event.ex_date);
        dividend_groups.entry(key).or_default().push(event);
    }
    let mut dividends: Vec<DividendEvent> = dividend_groups
        .into_values()
        .map(|group| merge_dividend_group(group))
        .collect();
    dividends.sort_by(|a, b| a.ex_date.cmp(&b.ex_date).then(a.symbol.cmp(&b.symbol)));

    let mut split_groups: BTreeMap<(String, String, NaiveDate), Vec<SplitEvent>> = BTreeMap::new();
    for event in raw.splits {
        let key = (event.symbol.clone(), event.market.as_str().to_string(), event.ex_date);
        split_groups.entry(key).or_default().push(event);
    }
    let mut splits: Vec<SplitEvent> = split_groups
        .into_values()
        .map(|group| merge_split_group(group))
        .collect();
    splits.sort_by(|a, b| a.ex_date.cmp(&b.ex_date).then(a.symbol.cmp(&b.symbol)));

    CorporateActionSet { dividends, splits }
}

fn merge_dividend_group(mut group: Vec<DividendEvent>) -> DividendEvent {
    if group.len() == 1 {
        return group.pop().unwrap();
    }
    let count = group.len();
    let mut iter = group.into_iter();
    let mut merged = iter.next().unwrap();
    let mut sources = merged.source.clone().into_iter().collect::<Vec<_>>();
    for other in iter {
        merged.cash_amount += other.cash_amount;
        if merged.pay_date.is_none() {
            merged.pay_date = other.pay_date;
        }
        if let Some(source) = other.source {
            sources.push(source);
        }
        for (k, v) in other.metadata {
            merged.metadata.entry(k).or_insert(v);
        }
    }
    merged.source = if sources.is_empty() {
        None
    } else {
        Some(sources.join(";"))
    };
    merged
        .metadata
        .insert("merged_event_count".to_string(), Value::from(count));
    merged
}

fn merge_split_group(mut group: Vec<SplitEvent>) -> SplitEvent {
    if group.len() == 1 {
        return group.pop().unwrap();
    }
    let count = group.len();
    let mut iter = group.into_iter();
    let mut merged = iter.next().unwrap();
    let mut sources = merged.source.clone().into_iter().collect::<Vec<_>>();
    for other in iter {
        merged.numerator *= other.numerator;
        merged.denominator *= other.denominator;
        if let Some(source) = other.source {
            sources.push(source);
        }
        for (k, v) in other.metadata {
            merged.metadata.entry(k).or_insert(v);
        }
    }
    merged.source = if sources.is_empty() {
        None
    } else {
        Some(sources.join(";"))
    };
    merged
        .metadata
        .insert("merged_event_count".to_string(), Value::from(count));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn same_day_dividends_sum_cash() {
        let set = CorporateActionSet::new(
            vec![
                DividendEvent {
                    symbol: "SH600000".into(),
                    market: Market::Cn,
                    ex_date: date(2024, 1, 2),
                    pay_date: None,
                    cash_amount: dec!(1.0),
                    currency: None,
                    source: Some("a".into()),
                    metadata: BTreeMap::new(),
                },
                DividendEvent {
                    symbol: "SH600000".into(),
                    market: Market::Cn,
                    ex_date: date(2024, 1, 2),
                    pay_date: None,
                    cash_amount: dec!(0.5),
                    currency: None,
                    source: Some("b".into()),
                    metadata: BTreeMap::new(),
                },
            ],
            vec![],
        );
        let merged = merge_corporate_action_set(set);
        assert_eq!(merged.dividends.len(), 1);
        assert_eq!(merged.dividends[0].cash_amount, dec!(1.5));
        assert_eq!(merged.dividends[0].source.as_deref(), Some("a;b"));
        assert_eq!(
            merged.dividends[0].metadata.get("merged_event_count"),
            Some(&Value::from(2))
        );
    }

    #[test]
    fn same_day_splits_multiply_componentwise() {
        let set = CorporateActionSet::new(
            vec![],
            vec![
                SplitEvent {
                    symbol: "SH600000".into(),
                    market: Market::Cn,
                    ex_date: date(2024, 1, 3),
                    numerator: 2,
                    denominator: 1,
                    source: None,
                    metadata: BTreeMap::new(),
                },
                SplitEvent {
                    symbol: "SH600000".into(),
                    market: Market::Cn,
                    ex_date: date(2024, 1, 3),
                    numerator: 3,
                    denominator: 2,
                    source: None,
                    metadata: BTreeMap::new(),
                },
            ],
        );
        let merged = merge_corporate_action_set(set);
        assert_eq!(merged.splits.len(), 1);
        assert_eq!(merged.splits[0].numerator, 6);
        assert_eq!(merged.splits[0].denominator, 2);
        assert_eq!(merged.splits[0].ratio(), dec!(3));
    }
}
