//! Multi-level query cache: an in-process LRU fast path backed by the
//! embedded store's `cache_entries` table as a slow path that survives a
//! process restart.
//!
//! Fingerprinting follows spec.md §4.4/§8's "symbol-list-order-independent"
//! invariant (symbols sorted before hashing); the fast path's
//! `parking_lot::Mutex<lru::LruCache<..>>` shape mirrors
//! [`crate::symbol::SymbolNormalizer`]'s cache, and SHA-256 fingerprinting
//! reuses the same `sha2` dependency as [`crate::adjustment`].

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::params;
use sha2::{Digest, Sha256};

use crate::error::DomainError;
use crate::model::point::DataPoint;
use crate::model::query::Query;
use crate::store::Store;

const DEFAULT_CACHE_SIZE: usize = 10_000;

/// First 16 hex characters of a SHA-256 over `(asset, market, sorted
/// symbols, timeframe, start, end, provider)` (spec.md §4.4 / §8 invariant).
pub fn fingerprint(query: &Query) -> String {
    let mut symbols = query.effective_symbols().to_vec();
    symbols.sort();

    let mut hasher = Sha256::new();
    hasher.update(query.asset.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(query.market.map(|m| m.as_str()).unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(symbols.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(query.timeframe.map(|t| t.as_str()).unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(query.start.map(|d| d.to_string()).unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(query.end.map(|d| d.to_string()).unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(query.provider.clone().unwrap_or_default().as_bytes());

    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    points: Vec<DataPoint>,
    stored_at: DateTime<Utc>,
    ttl_seconds: i64,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.stored_at).num_seconds() < self.ttl_seconds
    }
}

/// Two-level cache: `get` checks the in-process LRU first, falling through
/// to the persistent `cache_entries` table on miss (and repopulating the
/// LRU on a persistent hit); `set` writes both levels.
pub struct Cache {
    fast: Mutex<LruCache<String, CacheEntry>>,
    store: Option<Arc<Store>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            fast: Mutex::new(LruCache::new(capacity)),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<Store>) -> Result<Self, DomainError> {
        store.ensure_cache_entries()?;
        self.store = Some(store);
        Ok(self)
    }

    /// Returns `None` on miss or expiry; never errors (cache failures are
    /// logged and treated as a miss, per spec.md §7).
    pub fn get(&self, query: &Query, now: DateTime<Utc>) -> Option<Vec<DataPoint>> {
        let key = fingerprint(query);

        if let Some(entry) = self.fast.lock().get(&key).cloned() {
            if entry.is_fresh(now) {
                return Some(entry.points);
            }
        }

        let Some(store) = &self.store else { return None };
        match self.load_from_store(store, &key, now) {
            Ok(Some(entry)) => {
                self.fast.lock().put(key, entry.clone());
                Some(entry.points)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "cache store read failed, treating as miss");
                None
            }
        }
    }

    pub fn set(&self, query: &Query, points: Vec<DataPoint>, ttl_seconds: i64, now: DateTime<Utc>) {
        let key = fingerprint(query);
        let entry = CacheEntry { points, stored_at: now, ttl_seconds };
        self.fast.lock().put(key.clone(), entry.clone());

        if let Some(store) = &self.store {
            if let Err(err) = self.write_to_store(store, &key, &entry) {
                tracing::warn!(error = %err, "cache store write failed");
            }
        }
    }

    pub fn invalidate(&self, query: &Query) {
        let key = fingerprint(query);
        self.fast.lock().pop(&key);
        if let Some(store) = &self.store {
            let _ = store
                .connection()
                .lock()
                .execute("DELETE FROM cache_entries WHERE fingerprint = ?1", params![key]);
        }
    }

    fn load_from_store(&self, store: &Store, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, DomainError> {
        let conn = store.connection();
        let conn = conn.lock();
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT payload, stored_at, ttl_seconds FROM cache_entries WHERE fingerprint = ?1",
                params![key],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .ok();
        let Some((payload, stored_at, ttl_seconds)) = row else {
            return Ok(None);
        };
        let points: Vec<DataPoint> = serde_json::from_str(&payload)
            .map_err(|err| DomainError::new(crate::error::ErrorCode::Cache, "cache", format!("corrupt cache payload: {err}")))?;
        let stored_at = DateTime::parse_from_rfc3339(&stored_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| DomainError::new(crate::error::ErrorCode::Cache, "cache", format!("corrupt stored_at: {err}")))?;
        let entry = CacheEntry { points, stored_at, ttl_seconds };
        if entry.is_fresh(now) {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    fn write_to_store(&self, store: &Store, key: &str, entry: &CacheEntry) -> Result<(), DomainError> {
        let payload = serde_json::to_string(&entry.points)
            .map_err(|err| DomainError::new(crate::error::ErrorCode::Cache, "cache", format!("failed to serialize cache payload: {err}")))?;
        store
            .connection()
            .lock()
            .execute(
                "INSERT INTO cache_entries (fingerprint, payload, stored_at, ttl_seconds)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    payload = excluded.payload,
                    stored_at = excluded.stored_at,
                    ttl_seconds = excluded.ttl_seconds",
                params![key, payload, entry.stored_at.to_rfc3339(), entry.ttl_seconds],
            )
            .map(|_| ())
            .map_err(|err| DomainError::new(crate::error::ErrorCode::Cache, "cache", format!("sqlite error: {err}")))
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::query::{AdjustmentModeParam, AssetKind, Market, Timeframe};
    use chrono::{TimeZone, Utc};

    fn query(symbols: Vec<&str>) -> Query {
        Query {
            asset: AssetKind::Stock,
            market: Some(Market::Cn),
            provider: None,
            timeframe: Some(Timeframe::D1),
            start: None,
            end: None,
            raw_symbols: symbols.into_iter().map(String::from).collect(),
            canonical_symbols: vec![],
            adjustment: AdjustmentModeParam::None,
        }
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = fingerprint(&query(vec!["SZ000001", "SH600000"]));
        let b = fingerprint(&query(vec!["SH600000", "SZ000001"]));
        assert_eq!(a, b);
    }

    #[test]
    fn fast_path_hit_then_expiry() {
        let cache = Cache::new();
        let q = query(vec!["SH600000"]);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        cache.set(&q, vec![], 60, now);
        assert!(cache.get(&q, now + chrono::Duration::seconds(30)).is_some());
        assert!(cache.get(&q, now + chrono::Duration::seconds(120)).is_none());
    }

    #[test]
    fn persistent_layer_survives_fast_path_eviction() {
        let store = Arc::new(crate::store::StoreFactory::open_in_memory().unwrap());
        let cache = Cache::with_capacity(1).with_store(store).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let q1 = query(vec!["A"]);
        let q2 = query(vec!["B"]);
        cache.set(&q1, vec![], 3600, now);
        cache.set(&q2, vec![], 3600, now);

        assert!(cache.get(&q1, now).is_some());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = Cache::new();
        let q = query(vec!["SH600000"]);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        cache.set(&q, vec![], 60, now);
        cache.invalidate(&q);
        assert!(cache.get(&q, now).is_none());
    }
}
