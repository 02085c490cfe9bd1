//! The default rule set and the JSON/YAML rule-configuration loader.
//!
//! Grounded on `original_source/vprism/core/services/symbols.py`'s
//! `default_rules()` (suffix/prefix exchange maps, numeric fallback,
//! generic uppercase catch-all) and
//! `original_source/vprism/core/services/symbol_rule_loader.py` (mapping ->
//! `SymbolRule` parsing, suffix-dispatched file format).

use std::collections::BTreeMap;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::model::query::{AssetKind, Market};
use crate::model::symbol::{RuleTransform, SymbolRule};

/// Serde-facing rule entry, as it appears in a `rules:` configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRuleConfig {
    pub id: String,
    pub priority: i32,
    pub pattern: String,
    #[serde(default)]
    pub flags: Vec<String>,
    pub transform: RuleTransform,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub market_scope: Vec<Market>,
    #[serde(default)]
    pub asset_scope: Vec<AssetKind>,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleFile {
    rules: Vec<SymbolRuleConfig>,
}

/// Loads rules from a `.json`/`.yml`/`.yaml` file, selecting the parser by
/// file extension (suffix-dispatch, matching the Python loader this was
/// distilled from).
pub fn load_rule_file(path: impl AsRef<Path>) -> Result<Vec<SymbolRuleConfig>, DomainError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|err| {
        DomainError::validation(
            "symbol",
            format!("failed to read rule file {}: {err}", path.display()),
        )
        .with_context("path", path.display().to_string())
    })?;

    let suffix = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_lowercase();

    let file: RuleFile = match suffix.as_str() {
        "json" => serde_json::from_str(&content).map_err(|err| {
            DomainError::validation("symbol", format!("invalid JSON rule file: {err}"))
        })?,
        "yml" | "yaml" => serde_yaml::from_str(&content).map_err(|err| {
            DomainError::validation("symbol", format!("invalid YAML rule file: {err}"))
        })?,
        other => {
            return Err(DomainError::validation(
                "symbol",
                format!("unsupported symbol rule file suffix '.{other}'"),
            )
            .with_context("path", path.display().to_string()))
        }
    };

    if file.rules.is_empty() {
        return Err(DomainError::validation(
            "symbol",
            "symbol rule configuration must not be empty",
        ));
    }

    Ok(file.rules)
}

/// Compiles config entries (as loaded from a file, or built in code) into
/// the runtime [`SymbolRule`] list, validating regex compilation, duplicate
/// ids, and `template`/`map_template` field references up front.
pub fn compile_rules(configs: Vec<SymbolRuleConfig>) -> Result<Vec<SymbolRule>, DomainError> {
    if configs.is_empty() {
        return Err(DomainError::validation(
            "symbol",
            "symbol rule set must not be empty",
        ));
    }

    let mut seen_ids = std::collections::HashSet::new();
    let mut rules = Vec::with_capacity(configs.len());
    for config in configs {
        if config.id.trim().is_empty() {
            return Err(DomainError::validation("symbol", "rule id must not be empty"));
        }
        if !seen_ids.insert(config.id.clone()) {
            return Err(DomainError::validation(
                "symbol",
                format!("duplicate rule id '{}'", config.id),
            )
            .with_context("rule_id", config.id.clone()));
        }

        let regex = build_regex(&config.pattern, &config.flags, &config.id)?;
        validate_transform_fields(&config.transform, &regex, &config.id)?;

        rules.push(SymbolRule {
            id: config.id,
            priority: config.priority,
            pattern: config.pattern,
            regex,
            transform: config.transform,
            prefix: config.prefix,
            suffix: config.suffix,
            market_scope: config.market_scope,
            asset_scope: config.asset_scope,
        });
    }

    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    Ok(rules)
}

fn build_regex(pattern: &str, flags: &[String], rule_id: &str) -> Result<Regex, DomainError> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags {
        match flag.as_str() {
            "IGNORECASE" | "i" => {
                builder.case_insensitive(true);
            }
            "MULTILINE" | "m" => {
                builder.multi_line(true);
            }
            "DOTALL" | "s" => {
                builder.dot_matches_new_line(true);
            }
            other => {
                return Err(DomainError::validation(
                    "symbol",
                    format!("unsupported regex flag '{other}' on rule '{rule_id}'"),
                ))
            }
        }
    }
    builder.build().map_err(|err| {
        DomainError::validation("symbol", format!("invalid regex pattern on rule '{rule_id}': {err}"))
            .with_context("rule_id", rule_id.to_string())
    })
}

fn validate_transform_fields(
    transform: &RuleTransform,
    regex: &Regex,
    rule_id: &str,
) -> Result<(), DomainError> {
    let group_names: std::collections::HashSet<&str> = regex.capture_names().flatten().collect();

    let (template, extra_allowed): (&str, &[&str]) = match transform {
        RuleTransform::Template { template, .. } => (template, &["match"]),
        RuleTransform::MapTemplate { template, group, .. } => {
            if !group_names.contains(group.as_str()) {
                return Err(DomainError::validation(
                    "symbol",
                    format!("map_template group '{group}' is not a capture group on rule '{rule_id}'"),
                ));
            }
            (template, &["match", "mapped"])
        }
    };

    for field in template_fields(template) {
        if !group_names.contains(field.as_str()) && !extra_allowed.contains(&field.as_str()) {
            return Err(DomainError::validation(
                "symbol",
                format!("template references unknown field '{{{field}}}' on rule '{rule_id}'"),
            )
            .with_context("rule_id", rule_id.to_string())
            .with_context("unknown_field", field));
        }
    }
    Ok(())
}

/// Extracts `{name}` field references from a format-string-like template.
fn template_fields(template: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut chars = template.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c == '{' {
            let mut field = String::new();
            for (_, c2) in chars.by_ref() {
                if c2 == '}' {
                    break;
                }
                field.push(c2);
            }
            if !field.is_empty() {
                fields.push(field);
            }
        }
    }
    fields
}

fn suffix_template(mapping: &[(&str, &str)], default: Option<&str>) -> RuleTransform {
    RuleTransform::MapTemplate {
        template: "{mapped}{code}".to_string(),
        group: "suffix".to_string(),
        mapping: mapping.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        case_insensitive: true,
        default: default.map(|d| d.to_string()),
        uppercase: false,
    }
}

fn prefix_template(mapping: &[(&str, &str)], default: Option<&str>) -> RuleTransform {
    RuleTransform::MapTemplate {
        template: "{mapped}{code}".to_string(),
        group: "prefix".to_string(),
        mapping: mapping.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        case_insensitive: true,
        default: default.map(|d| d.to_string()),
        uppercase: false,
    }
}

fn numeric_template() -> RuleTransform {
    RuleTransform::Template {
        template: "{code}".to_string(),
        uppercase: false,
    }
}

fn cn_stock_rules() -> Vec<SymbolRuleConfig> {
    vec![
        SymbolRuleConfig {
            id: "cn_stock_yfinance".into(),
            priority: 10,
            pattern: r"^(?P<code>\d{6})\.(?P<suffix>SS|SH|SZ)$".into(),
            flags: vec!["IGNORECASE".into()],
            transform: suffix_template(&[("SS", "SH"), ("SH", "SH"), ("SZ", "SZ")], None),
            prefix: None,
            suffix: None,
            market_scope: vec![Market::Cn],
            asset_scope: vec![AssetKind::Stock],
        },
        SymbolRuleConfig {
            id: "cn_stock_akshare".into(),
            priority: 15,
            pattern: r"^(?P<prefix>sh|sz)(?P<code>\d{6})$".into(),
            flags: vec!["IGNORECASE".into()],
            transform: prefix_template(&[("SH", "SH"), ("SZ", "SZ")], None),
            prefix: None,
            suffix: None,
            market_scope: vec![Market::Cn],
            asset_scope: vec![AssetKind::Stock],
        },
        SymbolRuleConfig {
            id: "cn_stock_numeric".into(),
            priority: 20,
            pattern: r"^(?P<code>\d{6})$".into(),
            flags: vec![],
            transform: numeric_template(),
            prefix: None,
            suffix: None,
            market_scope: vec![Market::Cn],
            asset_scope: vec![AssetKind::Stock],
        },
    ]
}

fn cn_fund_rules() -> Vec<SymbolRuleConfig> {
    vec![
        SymbolRuleConfig {
            id: "cn_fund_yfinance".into(),
            priority: 30,
            pattern: r"^(?P<code>\d{6})\.(?P<suffix>OF|SZ|SH)$".into(),
            flags: vec!["IGNORECASE".into()],
            transform: suffix_template(&[("OF", "OF"), ("SZ", "SZ"), ("SH", "SH")], None),
            prefix: None,
            suffix: None,
            market_scope: vec![Market::Cn],
            asset_scope: vec![AssetKind::Fund],
        },
        SymbolRuleConfig {
            id: "cn_fund_akshare".into(),
            priority: 35,
            pattern: r"^(?P<prefix>of|sz|sh)(?P<code>\d{6})$".into(),
            flags: vec!["IGNORECASE".into()],
            transform: prefix_template(&[("OF", "OF"), ("SZ", "SZ"), ("SH", "SH")], None),
            prefix: None,
            suffix: None,
            market_scope: vec![Market::Cn],
            asset_scope: vec![AssetKind::Fund],
        },
        SymbolRuleConfig {
            id: "cn_fund_numeric".into(),
            priority: 40,
            pattern: r"^(?P<code>\d{6})$".into(),
            flags: vec![],
            transform: numeric_template(),
            prefix: None,
            suffix: None,
            market_scope: vec![Market::Cn],
            asset_scope: vec![AssetKind::Fund],
        },
    ]
}

fn cn_index_rules() -> Vec<SymbolRuleConfig> {
    vec![
        SymbolRuleConfig {
            id: "cn_index_yfinance".into(),
            priority: 50,
            pattern: r"^(?P<code>\d{6})\.(?P<suffix>SH|SZ)$".into(),
            flags: vec!["IGNORECASE".into()],
            transform: suffix_template(&[("SH", "SH"), ("SZ", "SZ")], None),
            prefix: None,
            suffix: None,
            market_scope: vec![Market::Cn],
            asset_scope: vec![AssetKind::Index],
        },
        SymbolRuleConfig {
            id: "cn_index_akshare".into(),
            priority: 55,
            pattern: r"^(?P<prefix>sh|sz)(?P<code>\d{6})$".into(),
            flags: vec!["IGNORECASE".into()],
            transform: prefix_template(&[("SH", "SH"), ("SZ", "SZ")], None),
            prefix: None,
            suffix: None,
            market_scope: vec![Market::Cn],
            asset_scope: vec![AssetKind::Index],
        },
        SymbolRuleConfig {
            id: "cn_index_numeric".into(),
            priority: 60,
            pattern: r"^(?P<code>\d{6})$".into(),
            flags: vec![],
            transform: numeric_template(),
            prefix: None,
            suffix: None,
            market_scope: vec![Market::Cn],
            asset_scope: vec![AssetKind::Index],
        },
    ]
}

/// The rule set the crate ships with zero configuration, mirroring
/// `default_rules()` in `original_source`: CN stock/fund/index forms
/// (yfinance suffix, akshare prefix, bare numeric) plus a generic
/// 1-10-letter uppercase fallback for everything else.
pub fn default_rule_configs() -> Vec<SymbolRuleConfig> {
    let mut rules = Vec::new();
    rules.extend(cn_stock_rules());
    rules.extend(cn_fund_rules());
    rules.extend(cn_index_rules());
    rules.push(SymbolRuleConfig {
        id: "generic_uppercase".into(),
        priority: 1000,
        pattern: r"^(?P<token>[A-Za-z]{1,10})$".into(),
        flags: vec!["IGNORECASE".into()],
        transform: RuleTransform::Template {
            template: "{token}".to_string(),
            uppercase: true,
        },
        prefix: None,
        suffix: None,
        market_scope: vec![],
        asset_scope: vec![],
    });
    rules
}

pub fn default_rules() -> Result<Vec<SymbolRule>, DomainError> {
    compile_rules(default_rule_configs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_compile_and_sort_by_priority() {
        let rules = default_rules().unwrap();
        assert!(rules.windows(2).all(|w| w[0].priority <= w[1].priority));
        assert_eq!(rules.last().unwrap().id, "generic_uppercase");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut configs = default_rule_configs();
        let dup = configs[0].clone();
        configs.push(dup);
        assert!(compile_rules(configs).is_err());
    }

    #[test]
    fn rejects_template_with_unknown_field() {
        let mut configs = vec![default_rule_configs().remove(0)];
        configs[0].transform = RuleTransform::Template {
            template: "{nonexistent}".into(),
            uppercase: false,
        };
        assert!(compile_rules(configs).is_err());
    }
}
