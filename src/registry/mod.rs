//! Process-wide provider registry: name -> provider plus per-provider
//! health/score/config state behind one lock per entry (spec.md §5's
//! "fine-grained locks, no global lock across providers" requirement).
//!
//! Grounded on
//! `original_source/vprism/core/provider_abstraction.py::EnhancedProviderRegistry`
//! (register/unregister/find_capable/update_health/update_score), restructured
//! so each entry owns its own `parking_lot::RwLock` rather than three
//! parallel dicts under no lock at all (the Python version runs single
//! -threaded; this one does not).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::DomainError;
use crate::model::query::Query;
use crate::provider::DynProvider;

const SCORE_MIN: f64 = 0.1;
const SCORE_MAX: f64 = 2.0;
const SCORE_SUCCESS_BONUS: f64 = 0.1;
const SCORE_FAILURE_PENALTY: f64 = 0.2;
const LATENCY_DIVISOR: f64 = 10_000.0;

struct ProviderEntry {
    provider: DynProvider,
    state: RwLock<ProviderState>,
}

#[derive(Debug, Clone)]
struct ProviderState {
    healthy: bool,
    score: f64,
    request_count: u64,
    success_count: u64,
    total_latency_ms: f64,
    config: HashMap<String, String>,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            healthy: true,
            score: 1.0,
            request_count: 0,
            success_count: 0,
            total_latency_ms: 0.0,
            config: HashMap::new(),
        }
    }
}

/// A point-in-time view of one provider's registry-tracked state, returned
/// by read operations so callers never hold the entry lock.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub name: String,
    pub healthy: bool,
    pub score: f64,
    /// Whether `update_score` has ever been called for this provider — the
    /// router's composite score falls back to a neutral performance term
    /// until at least one request has been recorded (spec.md §4.3).
    pub has_recorded_requests: bool,
    /// `success_count / request_count`, used by the router's
    /// `performance_score` (spec.md §4.3).
    pub success_rate: f64,
    /// Cumulative mean latency across every recorded request (success and
    /// failure), in milliseconds.
    pub avg_latency_ms: f64,
}

#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<HashMap<String, Arc<ProviderEntry>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        provider: DynProvider,
        config: Option<HashMap<String, String>>,
    ) -> Result<(), DomainError> {
        let name = provider.name().to_string();
        if name.is_empty() {
            return Err(DomainError::validation("registry", "provider name must not be empty"));
        }
        let entry = ProviderEntry {
            provider,
            state: RwLock::new(ProviderState {
                config: config.unwrap_or_default(),
                ..Default::default()
            }),
        };
        self.entries.write().insert(name, Arc::new(entry));
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<DynProvider> {
        self.entries.read().get(name).map(|e| e.provider.clone())
    }

    pub fn status(&self, name: &str) -> Option<ProviderStatus> {
        let entries = self.entries.read();
        let entry = entries.get(name)?;
        let state = entry.state.read();
        Some(ProviderStatus {
            name: name.to_string(),
            healthy: state.healthy,
            score: state.score,
            has_recorded_requests: state.request_count > 0,
            success_rate: if state.request_count > 0 {
                state.success_count as f64 / state.request_count as f64
            } else {
                0.0
            },
            avg_latency_ms: if state.request_count > 0 {
                state.total_latency_ms / state.request_count as f64
            } else {
                0.0
            },
        })
    }

    pub fn all_names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Healthy providers whose capability matches `query`, in descending
    /// score order.
    pub fn find_capable(&self, query: &Query) -> Vec<DynProvider> {
        let entries = self.entries.read();
        let mut matches: Vec<(f64, DynProvider)> = entries
            .values()
            .filter_map(|entry| {
                let state = entry.state.read();
                if !state.healthy {
                    return None;
                }
                if !entry.provider.can_handle_query(query) {
                    return None;
                }
                Some((state.score, entry.provider.clone()))
            })
            .collect();
        matches.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        matches.into_iter().map(|(_, p)| p).collect()
    }

    pub fn update_health(&self, name: &str, healthy: bool) {
        if let Some(entry) = self.entries.read().get(name) {
            entry.state.write().healthy = healthy;
        }
    }

    /// `score += 0.1 - latency_ms/10000` on success, `score -= 0.2` on
    /// failure; clamped to `[0.1, 2.0]` either way (spec.md §4.2).
    pub fn update_score(&self, name: &str, success: bool, latency_ms: f64) {
        if let Some(entry) = self.entries.read().get(name) {
            let mut state = entry.state.write();
            let delta = if success {
                SCORE_SUCCESS_BONUS - latency_ms / LATENCY_DIVISOR
            } else {
                -SCORE_FAILURE_PENALTY
            };
            state.score = (state.score + delta).clamp(SCORE_MIN, SCORE_MAX);
            state.request_count += 1;
            state.total_latency_ms += latency_ms;
            if success {
                state.success_count += 1;
            }
        }
    }

    /// Awaits every provider's `health_check`, treating a panic-free false
    /// result (or an absent provider) as unhealthy; updates registry state
    /// accordingly. Providers are checked concurrently.
    pub async fn check_all_health(&self) {
        let providers: Vec<(String, DynProvider)> = {
            let entries = self.entries.read();
            entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.provider.clone()))
                .collect()
        };
        let checks = providers.into_iter().map(|(name, provider)| async move {
            let healthy = provider.health_check().await;
            (name, healthy)
        });
        let results = futures_util::future::join_all(checks).await;
        for (name, healthy) in results {
            self.update_health(&name, healthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::native::NativeProvider;

    #[test]
    fn register_and_find_capable() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(NativeProvider::new()), None)
            .unwrap();
        assert_eq!(registry.all_names(), vec!["vprism_native".to_string()]);
    }

    #[test]
    fn score_clamped_to_bounds() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(NativeProvider::new()), None)
            .unwrap();
        for _ in 0..50 {
            registry.update_score("vprism_native", true, 0.0);
        }
        assert!(registry.status("vprism_native").unwrap().score <= 2.0);
        for _ in 0..50 {
            registry.update_score("vprism_native", false, 0.0);
        }
        assert!(registry.status("vprism_native").unwrap().score >= 0.1);
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(NativeProvider::new()), None)
            .unwrap();
        assert!(registry.unregister("vprism_native"));
        assert!(registry.get("vprism_native").is_none());
    }
}
