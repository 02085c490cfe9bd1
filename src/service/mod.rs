//! Data service façade: the one entry point CLI commands and embedders call.
//! Orchestrates normalize -> cache -> route -> persist -> return.
//!
//! Owns the [`SymbolNormalizer`], [`ProviderRegistry`], [`Router`], and
//! [`Cache`] itself and hands the router a shared registry reference at
//! construction — never the reverse — which is the fix for the cyclic-
//! collaborator smell spec.md §9/REDESIGN FLAGS calls out. Batch execution
//! via `futures_util::future::join_all` is grounded on the same pattern
//! `original_source/vprism/core/services/data.py`'s `DataService.get_batch`
//! uses (one failed query does not abort its siblings).

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::error::DomainError;
use crate::model::point::DataPoint;
use crate::model::query::{Market, Query, Timeframe};
use crate::model::symbol::CanonicalSymbol;
use crate::registry::ProviderRegistry;
use crate::router::Router;
use crate::symbol::SymbolNormalizer;

/// Embedded-store read/write adapter for previously-fetched points, used as
/// the fallback path when the router fails (spec.md §4.5 step 3) and as the
/// write-through target on a successful route (step 4). Implemented by
/// [`crate::store::Store`].
pub trait PointRepository: Send + Sync {
    fn persist_points(&self, market: Market, points: &[DataPoint]) -> Result<(), DomainError>;
    fn load_points(
        &self,
        market: Market,
        symbols: &[String],
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<DataPoint>, DomainError>;
}

/// `data_source` tag on a [`FetchResponse`] (spec.md §4.5 step 2/3).
pub const DATA_SOURCE_CACHE: &str = "cache";
pub const DATA_SOURCE_REPOSITORY: &str = "repository";
pub const DATA_SOURCE_PROVIDER: &str = "provider";

/// Response envelope carrying the spec's `cache_hit`/`data_source`
/// provenance tags alongside the points themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub points: Vec<DataPoint>,
    pub cache_hit: bool,
    pub data_source: String,
}

pub struct DataService {
    normalizer: Arc<SymbolNormalizer>,
    registry: Arc<ProviderRegistry>,
    router: Router,
    cache: Cache,
    repository: Option<Arc<dyn PointRepository>>,
}

impl DataService {
    pub fn new(normalizer: Arc<SymbolNormalizer>, registry: Arc<ProviderRegistry>, cache: Cache) -> Self {
        let router = Router::new(registry.clone());
        Self {
            normalizer,
            registry,
            router,
            cache,
            repository: None,
        }
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Wires an embedded-store repository for the failure-fallback/
    /// persist-on-success path (spec.md §4.5 steps 3-4). Without one, a
    /// router failure is re-raised immediately and successful fetches are
    /// never durably persisted — only cached.
    pub fn with_repository(mut self, repository: Arc<dyn PointRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Resolves `raw_symbols` into `canonical_symbols` in place, runs the
    /// cache/route pipeline, and returns the resulting points. A cache hit
    /// short-circuits before any provider is contacted.
    pub async fn fetch(&self, query: Query) -> Result<FetchResponse, DomainError> {
        self.fetch_cancellable(query, &CancellationToken::new()).await
    }

    /// Same as [`Self::fetch`], but `token` is checked before and raced
    /// during the routing call so a caller can abort a stuck fetch.
    pub async fn fetch_cancellable(
        &self,
        mut query: Query,
        token: &CancellationToken,
    ) -> Result<FetchResponse, DomainError> {
        query.validate()?;

        if query.canonical_symbols.is_empty() {
            query.canonical_symbols = self.resolve_symbols(&query)?;
        }

        let now = Utc::now();
        if let Some(points) = self.cache.get(&query, now) {
            return Ok(FetchResponse {
                points,
                cache_hit: true,
                data_source: DATA_SOURCE_CACHE.to_string(),
            });
        }

        match self.router.route(&query, token).await {
            Ok(routed) => {
                let points = routed.response.points;
                if let Some(repository) = &self.repository {
                    let market = query.market.unwrap_or(Market::Global);
                    if let Err(err) = repository.persist_points(market, &points) {
                        tracing::warn!(error = %err, "failed to persist fetched points");
                    }
                }
                let ttl = Timeframe::ttl_seconds(query.timeframe);
                self.cache.set(&query, points.clone(), ttl, now);
                Ok(FetchResponse {
                    points,
                    cache_hit: false,
                    data_source: DATA_SOURCE_PROVIDER.to_string(),
                })
            }
            Err(err) => {
                if let Some(repository) = &self.repository {
                    let market = query.market.unwrap_or(Market::Global);
                    let symbols = query.effective_symbols().to_vec();
                    match repository.load_points(market, &symbols, query.start, query.end) {
                        Ok(points) if !points.is_empty() => {
                            return Ok(FetchResponse {
                                points,
                                cache_hit: false,
                                data_source: DATA_SOURCE_REPOSITORY.to_string(),
                            });
                        }
                        Ok(_) => {}
                        Err(repo_err) => {
                            tracing::warn!(error = %repo_err, "repository fallback lookup failed");
                        }
                    }
                }
                Err(err)
            }
        }
    }

    fn resolve_symbols(&self, query: &Query) -> Result<Vec<String>, DomainError> {
        let market = query.market.unwrap_or(Market::Global);
        let mut resolved = Vec::with_capacity(query.raw_symbols.len());
        for raw in &query.raw_symbols {
            let canonical: CanonicalSymbol = self.normalizer.normalize(raw, market, query.asset)?;
            resolved.push(canonical.canonical);
        }
        Ok(resolved)
    }

    /// Runs every query concurrently; a single query's failure becomes an
    /// `Err` in its own slot rather than aborting the batch.
    pub async fn fetch_batch(&self, queries: Vec<Query>) -> Vec<Result<FetchResponse, DomainError>> {
        let tasks = queries.into_iter().map(|query| self.fetch(query));
        join_all(tasks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::query::{AdjustmentModeParam, AssetKind, Market as M, Timeframe as T};
    use crate::provider::native::NativeProvider;
    use crate::symbol::default_rules;
    use chrono::NaiveDate;

    fn service() -> DataService {
        let normalizer = Arc::new(SymbolNormalizer::new(default_rules().unwrap()));
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(NativeProvider::new()), None).unwrap();
        DataService::new(normalizer, registry, Cache::new())
    }

    fn query() -> Query {
        Query {
            asset: AssetKind::Stock,
            market: Some(M::Cn),
            provider: None,
            timeframe: Some(T::D1),
            start: NaiveDate::from_ymd_opt(2024, 1, 1),
            end: NaiveDate::from_ymd_opt(2024, 1, 2),
            raw_symbols: vec!["600000.SS".into()],
            canonical_symbols: vec![],
            adjustment: AdjustmentModeParam::None,
        }
    }

    #[tokio::test]
    async fn fetch_resolves_symbols_and_routes() {
        let svc = service();
        let response = svc.fetch(query()).await.unwrap();
        assert!(!response.points.is_empty());
        assert!(!response.cache_hit);
        assert_eq!(response.data_source, DATA_SOURCE_PROVIDER);
    }

    #[tokio::test]
    async fn second_fetch_is_served_from_cache() {
        let svc = service();
        let first = svc.fetch(query()).await.unwrap();
        let second = svc.fetch(query()).await.unwrap();
        assert_eq!(first.points, second.points);
        assert!(second.cache_hit);
        assert_eq!(second.data_source, DATA_SOURCE_CACHE);
    }

    #[tokio::test]
    async fn batch_reports_per_query_failures_independently() {
        let svc = service();
        let mut bad = query();
        bad.raw_symbols = vec!["??INVALID??".into()];
        let results = svc.fetch_batch(vec![query(), bad]).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn router_failure_falls_back_to_repository() {
        use crate::store::StoreFactory;

        let store = Arc::new(StoreFactory::open_in_memory().unwrap());
        let q = query();
        let canonical = "SH600000".to_string();
        let point = crate::model::point::DataPoint::new(
            canonical.clone(),
            "cn",
            chrono::Utc::now(),
            None,
            None,
            None,
            Some(rust_decimal::Decimal::new(10, 0)),
            None,
        )
        .unwrap();
        store.persist_points(M::Cn, std::slice::from_ref(&point)).unwrap();

        let normalizer = Arc::new(SymbolNormalizer::new(default_rules().unwrap()));
        let registry = Arc::new(ProviderRegistry::new());
        let svc = DataService::new(normalizer, registry, Cache::new())
            .with_repository(store as Arc<dyn PointRepository>);

        let mut q = q;
        q.canonical_symbols = vec![canonical];
        let response = svc.fetch(q).await.unwrap();
        assert_eq!(response.data_source, DATA_SOURCE_REPOSITORY);
        assert!(!response.cache_hit);
        assert_eq!(response.points.len(), 1);
    }

    #[tokio::test]
    async fn router_failure_without_repository_fallback_reraises() {
        let normalizer = Arc::new(SymbolNormalizer::new(default_rules().unwrap()));
        let registry = Arc::new(ProviderRegistry::new());
        let svc = DataService::new(normalizer, registry, Cache::new());
        let err = svc.fetch(query()).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::NoProviderAvailable);
    }
}
