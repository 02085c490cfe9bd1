//! Symbol normalization engine: rule DSL, priority evaluator, bounded LRU
//! cache, usage metrics, and an optional persistence hook.
//!
//! Grounded on `original_source/vprism/core/services/symbols.py`'s
//! `SymbolService` (priority-ordered rule scan, `OrderedDict` LRU, metrics
//! dict) reshaped around `arc_swap::ArcSwap` for the swappable rule list
//! (the same lock-free-read pattern `scrapers/binance_book_ticker.rs` uses
//! for its latest-snapshot state) and `parking_lot::Mutex` + `lru::LruCache`
//! for the bounded cache.

pub mod rules;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::DomainError;
use crate::model::query::{AssetKind, Market};
use crate::model::symbol::{CanonicalSymbol, RuleTransform, SymbolRule};

pub use rules::{compile_rules, default_rule_configs, default_rules, load_rule_file, SymbolRuleConfig};

type CacheKey = (String, Market, AssetKind);

const DEFAULT_CACHE_SIZE: usize = 10_000;

/// Persistence hook invoked for every newly-resolved (non cache-hit)
/// normalization. Insert-or-ignore semantics on `(raw, market, asset)`.
pub trait SymbolPersistence: Send + Sync {
    fn record(&self, record: SymbolMapRecord);
}

#[derive(Debug, Clone)]
pub struct SymbolMapRecord {
    pub canonical: String,
    pub raw_symbol: String,
    pub market: Market,
    pub asset_type: AssetKind,
    pub provider_hint: Option<String>,
    pub rule_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct NormalizerMetrics {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    unresolved_count: AtomicU64,
    rule_usage: Mutex<HashMap<String, u64>>,
}

/// Snapshot of [`NormalizerMetrics`] for reporting (CLI, tests).
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub unresolved_count: u64,
    pub rule_usage: HashMap<String, u64>,
}

impl NormalizerMetrics {
    fn record_hit(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss_resolved(&self, rule_id: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        *self.rule_usage.lock().entry(rule_id.to_string()).or_insert(0) += 1;
    }

    fn record_unresolved(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.unresolved_count.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.unresolved_count.store(0, Ordering::Relaxed);
        self.rule_usage.lock().clear();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: total,
            cache_hits: hits,
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            unresolved_count: self.unresolved_count.load(Ordering::Relaxed),
            rule_usage: self.rule_usage.lock().clone(),
        }
    }
}

/// Batch-normalization output: inputs partitioned into resolved/unresolved,
/// preserving input order. Partial success never raises.
#[derive(Debug, Clone, Default)]
pub struct BatchNormalizationResult {
    pub resolved: Vec<CanonicalSymbol>,
    pub unresolved: Vec<(String, DomainError)>,
}

/// The normalization engine. Cheap to clone (everything inside is `Arc`'d or
/// itself shareable); callers typically hold one instance behind an `Arc`.
pub struct SymbolNormalizer {
    rules: ArcSwap<Vec<SymbolRule>>,
    cache: Mutex<LruCache<CacheKey, CanonicalSymbol>>,
    cache_size: usize,
    metrics: NormalizerMetrics,
    persistence: Option<Arc<dyn SymbolPersistence>>,
}

impl SymbolNormalizer {
    pub fn new(rules: Vec<SymbolRule>) -> Self {
        Self::with_cache_size(rules, DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(rules: Vec<SymbolRule>, cache_size: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(cache_size.max(1)).unwrap();
        Self {
            rules: ArcSwap::from_pointee(sorted(rules)),
            cache: Mutex::new(LruCache::new(capacity)),
            cache_size,
            metrics: NormalizerMetrics::default(),
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn SymbolPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Replaces the entire rule list, clears the LRU cache, and resets
    /// rule-usage/unresolved counters. Rejected without mutating state if
    /// `new_rules` is empty or fails to compile.
    pub fn reload(&self, new_rules: Vec<SymbolRuleConfig>) -> Result<(), DomainError> {
        let compiled = compile_rules(new_rules)?;
        self.cache.lock().clear();
        self.metrics.reset();
        self.rules.store(Arc::new(compiled));
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.load().len()
    }

    /// Normalizes one `(raw, market, asset)` tuple. See spec.md §4.1 for the
    /// full algorithm: trim, cache lookup, priority-ordered regex scan with
    /// scope filtering, transform application, cache insert.
    pub fn normalize(
        &self,
        raw_symbol: &str,
        market: Market,
        asset: AssetKind,
    ) -> Result<CanonicalSymbol, DomainError> {
        let trimmed = raw_symbol.trim();
        let key: CacheKey = (trimmed.to_string(), market, asset);

        if let Some(hit) = self.cache.lock().get(&key).cloned() {
            self.metrics.record_hit();
            return Ok(hit);
        }

        let rules = self.rules.load();
        let mut evaluated = Vec::new();
        for rule in rules.iter() {
            if !rule.in_scope(market, asset) {
                continue;
            }
            evaluated.push(rule.id.clone());
            let Some(captures) = rule.regex.captures(trimmed) else {
                continue;
            };
            // Only a full-string match counts, per spec.md §4.1 step 3.
            let whole = captures.get(0).unwrap();
            if whole.start() != 0 || whole.end() != trimmed.len() {
                continue;
            }

            let mut core = apply_transform(&rule.transform, trimmed, &captures)?;
            if let Some(prefix) = &rule.prefix {
                core = format!("{prefix}{core}");
            }
            if let Some(suffix) = &rule.suffix {
                core = format!("{core}{suffix}");
            }

            let canonical_str = CanonicalSymbol::build(market, asset, &core);
            let resolved = CanonicalSymbol {
                raw_symbol: trimmed.to_string(),
                canonical: canonical_str,
                market,
                asset_type: asset,
                rule_id: rule.id.clone(),
            };

            self.metrics.record_miss_resolved(&rule.id);
            self.cache.lock().put(key, resolved.clone());

            if let Some(persistence) = &self.persistence {
                persistence.record(SymbolMapRecord {
                    canonical: resolved.canonical.clone(),
                    raw_symbol: resolved.raw_symbol.clone(),
                    market,
                    asset_type: asset,
                    provider_hint: None,
                    rule_id: resolved.rule_id.clone(),
                    created_at: Utc::now(),
                });
            }

            return Ok(resolved);
        }

        self.metrics.record_unresolved();
        Err(DomainError::validation(
            "symbol",
            format!("no rule resolved symbol '{trimmed}'"),
        )
        .with_context("raw_symbol", trimmed.to_string())
        .with_context("market", market.as_str().to_string())
        .with_context("asset_type", asset.as_str().to_string())
        .with_context(
            "evaluated_rules",
            serde_json::Value::Array(
                evaluated.into_iter().map(serde_json::Value::String).collect(),
            ),
        ))
    }

    /// Normalizes a batch of raw symbols independently, partitioning the
    /// result into resolved/unresolved while preserving input order.
    pub fn normalize_batch(
        &self,
        raw_symbols: &[String],
        market: Market,
        asset: AssetKind,
    ) -> BatchNormalizationResult {
        let mut result = BatchNormalizationResult::default();
        for raw in raw_symbols {
            match self.normalize(raw, market, asset) {
                Ok(canonical) => result.resolved.push(canonical),
                Err(err) => result.unresolved.push((raw.clone(), err)),
            }
        }
        result
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_size
    }
}

fn sorted(mut rules: Vec<SymbolRule>) -> Vec<SymbolRule> {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    rules
}

fn apply_transform(
    transform: &RuleTransform,
    raw: &str,
    captures: &regex::Captures<'_>,
) -> Result<String, DomainError> {
    match transform {
        RuleTransform::Template { template, uppercase } => {
            let rendered = render_template(template, raw, captures, None)?;
            Ok(if *uppercase { rendered.to_uppercase() } else { rendered })
        }
        RuleTransform::MapTemplate {
            template,
            group,
            mapping,
            case_insensitive,
            default,
            uppercase,
        } => {
            let raw_value = captures.name(group).map(|m| m.as_str()).unwrap_or_default();
            let lookup_key = if *case_insensitive {
                raw_value.to_uppercase()
            } else {
                raw_value.to_string()
            };
            let normalized_mapping: std::collections::HashMap<String, String> = if *case_insensitive
            {
                mapping
                    .iter()
                    .map(|(k, v)| (k.to_uppercase(), v.clone()))
                    .collect()
            } else {
                mapping.clone()
            };
            let mapped = normalized_mapping.get(&lookup_key).cloned().unwrap_or_else(|| {
                default
                    .as_ref()
                    .map(|d| d.replace("{value}", raw_value))
                    .unwrap_or_else(|| raw_value.to_string())
            });
            let rendered = render_template(template, raw, captures, Some(&mapped))?;
            Ok(if *uppercase { rendered.to_uppercase() } else { rendered })
        }
    }
}

fn render_template(
    template: &str,
    raw: &str,
    captures: &regex::Captures<'_>,
    mapped: Option<&str>,
) -> Result<String, DomainError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let mut field = String::new();
        let mut closed = false;
        for (_, c2) in chars.by_ref() {
            if c2 == '}' {
                closed = true;
                break;
            }
            field.push(c2);
        }
        if !closed {
            return Err(DomainError::validation("symbol", "unterminated template field"));
        }
        match field.as_str() {
            "match" => out.push_str(raw),
            "mapped" => {
                let value = mapped.ok_or_else(|| {
                    DomainError::validation("symbol", "{mapped} referenced outside map_template")
                })?;
                out.push_str(value);
            }
            name => {
                let value = captures.name(name).ok_or_else(|| {
                    DomainError::validation("symbol", format!("unknown template field '{name}'"))
                })?;
                out.push_str(value.as_str());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SymbolNormalizer {
        SymbolNormalizer::new(default_rules().unwrap())
    }

    #[test]
    fn normalizes_cn_suffix_form() {
        let engine = engine();
        let resolved = engine
            .normalize("600000.SS", Market::Cn, AssetKind::Stock)
            .unwrap();
        assert_eq!(resolved.canonical, "CN:STOCK:SH600000");
        assert_eq!(resolved.rule_id, "cn_stock_yfinance");
    }

    #[test]
    fn unresolved_symbol_lists_evaluated_rules() {
        let engine = engine();
        let err = engine
            .normalize("??INVALID??", Market::Cn, AssetKind::Stock)
            .unwrap_err();
        assert_eq!(err.context.get("raw_symbol").unwrap(), "??INVALID??");
        assert_eq!(err.context.get("market").unwrap(), "cn");
        assert_eq!(err.context.get("asset_type").unwrap(), "stock");
    }

    #[test]
    fn repeated_lookup_hits_cache() {
        let engine = engine();
        engine.normalize("600000.SS", Market::Cn, AssetKind::Stock).unwrap();
        engine.normalize("600000.SS", Market::Cn, AssetKind::Stock).unwrap();
        let metrics = engine.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.cache_hits, 1);
    }

    #[test]
    fn batch_partitions_without_raising() {
        let engine = engine();
        let symbols = vec!["600000.SS".to_string(), "??".to_string()];
        let batch = engine.normalize_batch(&symbols, Market::Cn, AssetKind::Stock);
        assert_eq!(batch.resolved.len(), 1);
        assert_eq!(batch.unresolved.len(), 1);
    }

    #[test]
    fn reload_replaces_rules_and_clears_cache() {
        let engine = engine();
        engine.normalize("600000.SS", Market::Cn, AssetKind::Stock).unwrap();
        assert!(engine.cache_len() > 0);

        let mut configs = default_rule_configs();
        configs.retain(|c| c.id != "cn_stock_yfinance");
        engine.reload(configs).unwrap();

        assert_eq!(engine.cache_len(), 0);
        assert_eq!(engine.metrics().total_requests, 0);
        let err = engine.normalize("600000.SS", Market::Cn, AssetKind::Stock);
        assert!(err.is_err());
    }

    #[test]
    fn reload_rejects_empty_without_mutating_state() {
        let engine = engine();
        let before = engine.rule_count();
        assert!(engine.reload(vec![]).is_err());
        assert_eq!(engine.rule_count(), before);
    }

    #[test]
    fn map_template_uses_default_for_unmapped_group() {
        let config = SymbolRuleConfig {
            id: "custom_suffix".into(),
            priority: 5,
            pattern: r"^(?P<code>\d{4})\.(?P<suffix>[A-Z]{2})$".into(),
            flags: vec![],
            transform: RuleTransform::MapTemplate {
                template: "{mapped}{code}".into(),
                group: "suffix".into(),
                mapping: [("AA".to_string(), "XX".to_string())].into_iter().collect(),
                case_insensitive: true,
                default: Some("UNK-{value}".into()),
                uppercase: false,
            },
            prefix: None,
            suffix: None,
            market_scope: vec![],
            asset_scope: vec![],
        };
        let engine = SymbolNormalizer::new(compile_rules(vec![config]).unwrap());
        let resolved = engine.normalize("1234.ZZ", Market::Global, AssetKind::Stock).unwrap();
        assert_eq!(resolved.canonical, "GLOBAL:STOCK:UNK-ZZ1234");
    }
}
