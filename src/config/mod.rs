//! Application-level configuration: storage path, default log level, and
//! the symbol rule-set file, loaded from an optional TOML file and
//! overridable by CLI flags/`VPRISM_*` env vars.
//!
//! Grounded on `route_quality/mitigation.rs`'s sibling config type
//! `RouteQualityConfig` (same `toml`-backed, `serde`-derived, all-fields-
//! optional-with-defaults shape).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

fn default_storage_path() -> PathBuf {
    PathBuf::from("vprism.sqlite3")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage_path: PathBuf,
    pub log_level: String,
    pub rule_set_path: Option<PathBuf>,
    pub max_fallback_attempts: usize,
    pub symbol_cache_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            log_level: default_log_level(),
            rule_set_path: None,
            max_fallback_attempts: crate::router::DEFAULT_MAX_FALLBACK_ATTEMPTS,
            symbol_cache_size: 10_000,
        }
    }
}

impl AppConfig {
    /// Reads and parses a TOML config file. A missing file is not an error
    /// at this layer — callers fall back to [`AppConfig::default`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DomainError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            DomainError::validation("config", format!("failed to read config file {}: {err}", path.display()))
                .with_context("path", path.display().to_string())
        })?;
        toml::from_str(&content)
            .map_err(|err| DomainError::validation("config", format!("invalid config file {}: {err}", path.display())))
    }

    /// Merges CLI-supplied overrides (each `None` leaves the existing value
    /// in place).
    pub fn with_overrides(
        mut self,
        storage_path: Option<PathBuf>,
        log_level: Option<String>,
        rule_set_path: Option<PathBuf>,
    ) -> Self {
        if let Some(storage_path) = storage_path {
            self.storage_path = storage_path;
        }
        if let Some(log_level) = log_level {
            self.log_level = log_level;
        }
        if rule_set_path.is_some() {
            self.rule_set_path = rule_set_path;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_fallback_attempts, 3);
    }

    #[test]
    fn load_parses_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vprism.toml");
        std::fs::write(&path, "storage_path = \"custom.sqlite3\"\nlog_level = \"debug\"\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.storage_path, PathBuf::from("custom.sqlite3"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_fallback_attempts, 3);
    }

    #[test]
    fn overrides_replace_only_supplied_fields() {
        let config = AppConfig::default().with_overrides(None, Some("warn".to_string()), None);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.storage_path, default_storage_path());
    }
}
