//! Fallback routing: picks the best-scoring healthy provider for a query,
//! retries across the next-best candidates on failure, and feeds outcomes
//! back into the registry's score and each provider's circuit breaker.
//!
//! Grounded on `route_quality/mitigation.rs`'s fallback-on-failure loop
//! (try primary, fall back through a ranked list, record per-endpoint
//! circuit state) combined with `original_source/vprism/core/router.py`'s
//! `DataRouter.route_query` (skip already-attempted providers, cap total
//! attempts, raise once the candidate list is exhausted).

pub mod breaker;
pub mod scoring;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{DomainError, ErrorCode};
use crate::model::query::Query;
use crate::provider::ProviderResponse;
use crate::registry::ProviderRegistry;

use breaker::CircuitBreaker;
use scoring::PriorityTable;

pub const DEFAULT_MAX_FALLBACK_ATTEMPTS: usize = 3;

/// One routing attempt's outcome, useful for CLI `--explain`-style output
/// and for tests asserting the fallback order without network access.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub provider_name: String,
    pub succeeded: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub response: ProviderResponse,
    pub attempts: Vec<AttemptOutcome>,
}

pub struct Router {
    registry: Arc<ProviderRegistry>,
    priorities: PriorityTable,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    max_fallback_attempts: usize,
}

impl Router {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            priorities: PriorityTable::defaults(),
            breakers: RwLock::new(HashMap::new()),
            max_fallback_attempts: DEFAULT_MAX_FALLBACK_ATTEMPTS,
        }
    }

    pub fn with_priorities(mut self, priorities: PriorityTable) -> Self {
        self.priorities = priorities;
        self
    }

    pub fn with_max_fallback_attempts(mut self, attempts: usize) -> Self {
        self.max_fallback_attempts = attempts.max(1);
        self
    }

    fn breaker_for(&self, provider_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(provider_name) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(provider_name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::default()))
            .clone()
    }

    /// Healthy, capability-matching providers ranked by composite score,
    /// descending.
    fn ranked_candidates(&self, query: &Query) -> Vec<String> {
        let candidates = self.registry.find_capable(query);
        let mut scored: Vec<(f64, String)> = candidates
            .iter()
            .filter_map(|provider| {
                let name = provider.name().to_string();
                let status = self.registry.status(&name)?;
                let has_recorded_requests = status.has_recorded_requests;
                let score = scoring::composite_score(
                    &self.priorities,
                    &name,
                    &status,
                    provider.capability(),
                    query,
                    has_recorded_requests,
                );
                Some((score, name))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, name)| name).collect()
    }

    /// Runs `query` against the best candidate, falling back through the
    /// ranked list (skipping providers whose breaker is open) up to
    /// `max_fallback_attempts` times. Selection is re-run before every
    /// attempt rather than computed once up front, so a breaker trip or
    /// score update from attempt N is reflected in the candidate ranking
    /// for attempt N+1 (spec.md §4.3's "re-run selection" step). Fails with
    /// [`ErrorCode::NoProviderAvailable`] once candidates are exhausted.
    /// `token` is checked between fallback attempts and raced against each
    /// in-flight provider call, so a caller can abort a stuck fetch.
    pub async fn route(&self, query: &Query, token: &CancellationToken) -> Result<RoutedResponse, DomainError> {
        let mut attempts = Vec::new();
        let mut already_tried: Vec<String> = Vec::new();

        loop {
            if attempts.len() >= self.max_fallback_attempts {
                break;
            }
            if token.is_cancelled() {
                return Err(DomainError::new(ErrorCode::Timeout, "router", "routing cancelled"));
            }

            let provider_name = match self
                .ranked_candidates(query)
                .into_iter()
                .find(|name| !already_tried.contains(name))
            {
                Some(name) => name,
                None => break,
            };

            let breaker = self.breaker_for(&provider_name);
            if !breaker.allow_request() {
                already_tried.push(provider_name);
                continue;
            }
            let Some(provider) = self.registry.get(&provider_name) else {
                already_tried.push(provider_name);
                continue;
            };

            already_tried.push(provider_name.clone());
            let started = Instant::now();
            let outcome = tokio::select! {
                result = provider.get_data(query) => result,
                _ = token.cancelled() => Err(DomainError::new(ErrorCode::Timeout, "router", "routing cancelled")),
            };
            match outcome {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    breaker.record_success();
                    self.registry.update_score(&provider_name, true, latency_ms);
                    attempts.push(AttemptOutcome {
                        provider_name: provider_name.clone(),
                        succeeded: true,
                        latency_ms,
                        error: None,
                    });
                    return Ok(RoutedResponse { response, attempts });
                }
                Err(err) => {
                    // spec.md §4.3: failures are recorded with a fixed 5000ms latency,
                    // regardless of actual elapsed time.
                    let latency_ms = 5000.0;
                    breaker.record_failure();
                    self.registry.update_score(&provider_name, false, latency_ms);
                    self.registry.update_health(&provider_name, false);
                    attempts.push(AttemptOutcome {
                        provider_name: provider_name.clone(),
                        succeeded: false,
                        latency_ms,
                        error: Some(err.message.clone()),
                    });
                }
            }
        }

        if attempts.is_empty() {
            return Err(DomainError::no_provider_available(
                "router",
                "no healthy provider matches this query",
            ));
        }

        Err(DomainError::new(
            ErrorCode::NoProviderAvailable,
            "router",
            format!(
                "exhausted {} fallback attempt(s) without success",
                attempts.len()
            ),
        )
        .with_context("attempts", serde_json::to_value(&attempt_summaries(&attempts)).unwrap_or_default()))
    }
}

fn attempt_summaries(attempts: &[AttemptOutcome]) -> Vec<String> {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.provider_name, if a.succeeded { "ok" } else { "failed" }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::query::{AdjustmentModeParam, AssetKind, Market, Timeframe};
    use crate::provider::native::NativeProvider;
    use chrono::NaiveDate;

    fn query() -> Query {
        Query {
            asset: AssetKind::Stock,
            market: Some(Market::Cn),
            provider: None,
            timeframe: Some(Timeframe::D1),
            start: NaiveDate::from_ymd_opt(2024, 1, 1),
            end: NaiveDate::from_ymd_opt(2024, 1, 2),
            raw_symbols: vec!["SH600000".into()],
            canonical_symbols: vec![],
            adjustment: AdjustmentModeParam::None,
        }
    }

    #[tokio::test]
    async fn routes_to_only_candidate() {
        let registry = Arc::new(ProviderRegistry::new());
        registry
            .register(Arc::new(NativeProvider::new()), None)
            .unwrap();
        let router = Router::new(registry);
        let routed = router.route(&query(), &CancellationToken::new()).await.unwrap();
        assert_eq!(routed.response.provider_name, "vprism_native");
        assert_eq!(routed.attempts.len(), 1);
        assert!(routed.attempts[0].succeeded);
    }

    #[tokio::test]
    async fn errors_when_no_candidate_matches() {
        let registry = Arc::new(ProviderRegistry::new());
        let router = Router::new(registry);
        let mut q = query();
        q.market = Some(Market::Us);
        let err = router.route(&q, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoProviderAvailable);
    }

    #[tokio::test]
    async fn unhealthy_provider_is_skipped() {
        let registry = Arc::new(ProviderRegistry::new());
        registry
            .register(Arc::new(NativeProvider::new()), None)
            .unwrap();
        registry.update_health("vprism_native", false);
        let router = Router::new(registry);
        let err = router.route(&query(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoProviderAvailable);
    }
}
