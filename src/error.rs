//! Typed error taxonomy shared by every layer of the core.
//!
//! One discriminated error carries a stable `code`, a human message, the
//! layer that raised it, whether a caller may retry, and a context map for
//! structured detail (evaluated rule ids, attempted providers, ...).

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Stable error codes. Mirrors the taxonomy in the spec's error design;
/// CLI exit codes and retry policy are both keyed off this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    Routing,
    Provider,
    RateLimit,
    Authentication,
    NotFound,
    DataQuality,
    Reconcile,
    Cache,
    Network,
    Timeout,
    NoProviderAvailable,
    CircuitBreakerOpen,
    System,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self).unwrap_or(Value::Null);
        match s {
            Value::String(s) => write!(f, "{s}"),
            _ => write!(f, "{self:?}"),
        }
    }
}

/// The one error type propagated through the core.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("[{layer}] {code}: {message}")]
pub struct DomainError {
    pub code: ErrorCode,
    pub message: String,
    pub layer: String,
    pub retryable: bool,
    pub context: BTreeMap<String, Value>,
}

impl DomainError {
    pub fn new(code: ErrorCode, layer: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            layer: layer.into(),
            retryable: false,
            context: BTreeMap::new(),
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Defensive copy: the caller's value is cloned into the map, never
    /// aliased, so later caller-side mutation can't reach into a raised error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn validation(layer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, layer, message)
    }

    pub fn not_found(layer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, layer, message)
    }

    pub fn no_provider_available(layer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoProviderAvailable, layer, message)
    }

    /// Redacts keys whose name looks like a credential before the error is
    /// serialized for a user-facing surface (CLI stderr JSON, logs).
    pub fn redacted_context(&self) -> BTreeMap<String, Value> {
        const SENSITIVE: &[&str] = &["password", "secret", "token", "api_key", "authorization"];
        self.context
            .iter()
            .map(|(k, v)| {
                let lower = k.to_lowercase();
                if SENSITIVE.iter().any(|s| lower.contains(s)) {
                    (k.clone(), Value::String("REDACTED".to_string()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
