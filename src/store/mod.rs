//! Embedded analytical store: `rusqlite`-backed write adapters for the five
//! tables named in spec.md §4.7 (adjustments, drift_metrics,
//! reconciliation_runs, reconciliation_diffs, symbol_map).
//!
//! Grounded on `vault/vault_db.rs::VaultDb` — same `Arc<Mutex<Connection>>`
//! handle, same WAL + NORMAL pragma bootstrap, same `CREATE TABLE IF NOT
//! EXISTS` ensure-on-open pattern. `rusqlite` over DuckDB is a deliberate
//! divergence from `original_source`'s `duckdb_factory.py`; no crate in the
//! retrieval pack binds DuckDB, and this is the teacher's own established
//! embedded-store idiom (see DESIGN.md).

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::adjustment::AdjustmentFactorWriter;
use crate::error::{DomainError, ErrorCode};
use crate::model::adjustment::AdjustmentFactor;
use crate::model::drift::DriftMetric;
use crate::model::point::DataPoint;
use crate::model::query::Market;
use crate::model::reconcile::{ReconciliationSample, ReconciliationSummary};
use crate::reconcile::{ReconciliationDiffWriter, ReconciliationRunWriter};
use crate::drift::DriftMetricWriter;
use crate::service::PointRepository;
use crate::symbol::{SymbolMapRecord, SymbolPersistence};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub busy_timeout_ms: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { busy_timeout_ms: 5_000 }
    }
}

fn to_domain_error(layer: &str, err: rusqlite::Error) -> DomainError {
    DomainError::new(ErrorCode::System, layer, format!("sqlite error: {err}"))
}

/// Opens and bootstraps the five tables; released on drop like the rest of
/// the process's per-unit-of-work resources (spec.md §5).
pub struct StoreFactory;

impl StoreFactory {
    pub fn open(path: &str, config: StoreConfig) -> Result<Store, DomainError> {
        let conn = Connection::open(path)
            .map_err(|err| to_domain_error("store", err))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms as u64))
            .map_err(|err| to_domain_error("store", err))?;

        let store = Store { conn: Arc::new(Mutex::new(conn)) };
        store.ensure_all()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Store, DomainError> {
        let conn = Connection::open_in_memory().map_err(|err| to_domain_error("store", err))?;
        let store = Store { conn: Arc::new(Mutex::new(conn)) };
        store.ensure_all()?;
        Ok(store)
    }
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    fn ensure_all(&self) -> Result<(), DomainError> {
        self.ensure_adjustments()?;
        self.ensure_drift_metrics()?;
        self.ensure_reconciliation_runs()?;
        self.ensure_reconciliation_diffs()?;
        self.ensure_symbol_map()?;
        self.ensure_data_points()?;
        Ok(())
    }

    /// Not one of spec.md §4.7's four named tables — this is the "embedded-
    /// store lookup of previously-persisted points" spec.md §4.5 step 3
    /// falls back to on router failure, so it bootstraps here alongside the
    /// rest (see DESIGN.md).
    fn ensure_data_points(&self) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "CREATE TABLE IF NOT EXISTS data_points (
                    market TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    open TEXT,
                    high TEXT,
                    low TEXT,
                    close TEXT,
                    volume TEXT,
                    amount TEXT,
                    provider TEXT,
                    PRIMARY KEY (market, symbol, timestamp)
                )",
                [],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))?;
        self.conn
            .lock()
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_data_points_symbol_timestamp ON data_points(market, symbol, timestamp)",
                [],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }

    fn ensure_adjustments(&self) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "CREATE TABLE IF NOT EXISTS adjustments (
                    market TEXT NOT NULL,
                    supplier_symbol TEXT NOT NULL,
                    date TEXT NOT NULL,
                    adj_factor_qfq TEXT NOT NULL,
                    adj_factor_hfq TEXT NOT NULL,
                    version TEXT NOT NULL,
                    build_time TEXT NOT NULL,
                    source_events_hash TEXT NOT NULL,
                    PRIMARY KEY (market, supplier_symbol, date)
                )",
                [],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }

    fn ensure_drift_metrics(&self) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "CREATE TABLE IF NOT EXISTS drift_metrics (
                    date TEXT NOT NULL,
                    market TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    metric TEXT NOT NULL,
                    value TEXT NOT NULL,
                    status TEXT NOT NULL,
                    window_size INTEGER NOT NULL,
                    run_id TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )",
                [],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))?;
        self.conn
            .lock()
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_drift_metrics_symbol_date ON drift_metrics(symbol, date)",
                [],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }

    fn ensure_reconciliation_runs(&self) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "CREATE TABLE IF NOT EXISTS reconciliation_runs (
                    run_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    pass_count INTEGER NOT NULL,
                    warn_count INTEGER NOT NULL,
                    fail_count INTEGER NOT NULL,
                    p95_close_bp_diff TEXT NOT NULL,
                    sampled_symbols TEXT NOT NULL
                )",
                [],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }

    fn ensure_reconciliation_diffs(&self) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "CREATE TABLE IF NOT EXISTS reconciliation_diffs (
                    run_id TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    date TEXT NOT NULL,
                    close_a TEXT,
                    close_b TEXT,
                    close_bp_diff TEXT,
                    volume_a TEXT,
                    volume_b TEXT,
                    volume_ratio TEXT,
                    status TEXT NOT NULL
                )",
                [],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))?;
        self.conn
            .lock()
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_reconciliation_diffs_run ON reconciliation_diffs(run_id)",
                [],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }

    fn ensure_symbol_map(&self) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "CREATE TABLE IF NOT EXISTS symbol_map (
                    raw_symbol TEXT NOT NULL,
                    market TEXT NOT NULL,
                    asset_type TEXT NOT NULL,
                    canonical TEXT NOT NULL,
                    rule_id TEXT NOT NULL,
                    provider_hint TEXT,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (raw_symbol, market, asset_type)
                )",
                [],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }

    /// `cache_entries` bootstrap lives here too since it shares this
    /// connection as the cache's slow path (SPEC_FULL.md §4.4).
    pub fn ensure_cache_entries(&self) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "CREATE TABLE IF NOT EXISTS cache_entries (
                    fingerprint TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    stored_at TEXT NOT NULL,
                    ttl_seconds INTEGER NOT NULL
                )",
                [],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl AdjustmentFactorWriter for Store {
    fn write_factor(
        &self,
        market: Market,
        supplier_symbol: &str,
        factor: &AdjustmentFactor,
        version: &str,
        source_events_hash: &str,
        build_time: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO adjustments
                    (market, supplier_symbol, date, adj_factor_qfq, adj_factor_hfq, version, build_time, source_events_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(market, supplier_symbol, date) DO UPDATE SET
                    adj_factor_qfq = excluded.adj_factor_qfq,
                    adj_factor_hfq = excluded.adj_factor_hfq,
                    version = excluded.version,
                    build_time = excluded.build_time,
                    source_events_hash = excluded.source_events_hash",
                params![
                    market.as_str(),
                    supplier_symbol,
                    factor.date.to_string(),
                    factor.adj_factor_qfq.to_string(),
                    factor.adj_factor_hfq.to_string(),
                    version,
                    build_time.to_rfc3339(),
                    source_events_hash,
                ],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }
}

impl DriftMetricWriter for Store {
    fn write_metric(
        &self,
        date: NaiveDate,
        market: Market,
        symbol: &str,
        metric: &DriftMetric,
        window: usize,
        run_id: uuid::Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO drift_metrics (date, market, symbol, metric, value, status, window_size, run_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    date.to_string(),
                    market.as_str(),
                    symbol,
                    metric.name,
                    metric.value.to_string(),
                    format!("{:?}", metric.status).to_uppercase(),
                    window as i64,
                    run_id.to_string(),
                    created_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }
}

impl ReconciliationRunWriter for Store {
    fn write_run(
        &self,
        run_id: uuid::Uuid,
        created_at: DateTime<Utc>,
        summary: &ReconciliationSummary,
        sampled_symbols: &[String],
    ) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO reconciliation_runs
                    (run_id, created_at, pass_count, warn_count, fail_count, p95_close_bp_diff, sampled_symbols)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id.to_string(),
                    created_at.to_rfc3339(),
                    summary.pass_count as i64,
                    summary.warn_count as i64,
                    summary.fail_count as i64,
                    summary.p95_close_bp_diff.to_string(),
                    sampled_symbols.join(","),
                ],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }
}

impl ReconciliationDiffWriter for Store {
    fn write_diff(&self, run_id: uuid::Uuid, sample: &ReconciliationSample) -> Result<(), DomainError> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO reconciliation_diffs
                    (run_id, symbol, date, close_a, close_b, close_bp_diff, volume_a, volume_b, volume_ratio, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id.to_string(),
                    sample.symbol,
                    sample.date.to_string(),
                    sample.close_a.map(|v| v.to_string()),
                    sample.close_b.map(|v| v.to_string()),
                    sample.close_bp_diff.map(|v| v.to_string()),
                    sample.volume_a.map(|v| v.to_string()),
                    sample.volume_b.map(|v| v.to_string()),
                    sample.volume_ratio.map(|v| v.to_string()),
                    format!("{:?}", sample.status).to_uppercase(),
                ],
            )
            .map(|_| ())
            .map_err(|err| to_domain_error("store", err))
    }
}

impl SymbolPersistence for Store {
    /// Insert-or-ignore on `(raw_symbol, market, asset_type)` (spec.md
    /// §4.7). The trait's return type is `()` (a best-effort hook invoked
    /// inline from `SymbolNormalizer::normalize`, per spec.md §7 "cache/
    /// persistence errors never block a read"); failures are logged, not
    /// propagated.
    fn record(&self, record: SymbolMapRecord) {
        let result = self.conn.lock().execute(
            "INSERT OR IGNORE INTO symbol_map
                (raw_symbol, market, asset_type, canonical, rule_id, provider_hint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.raw_symbol,
                record.market.as_str(),
                record.asset_type.as_str(),
                record.canonical,
                record.rule_id,
                record.provider_hint,
                record.created_at.to_rfc3339(),
            ],
        );
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to persist symbol_map row");
        }
    }
}

impl PointRepository for Store {
    /// Replace-on-key upsert keyed by (market, symbol, timestamp), same
    /// idiom as [`AdjustmentFactorWriter::write_factor`].
    fn persist_points(&self, market: Market, points: &[DataPoint]) -> Result<(), DomainError> {
        let conn = self.conn.lock();
        for point in points {
            conn.execute(
                "INSERT INTO data_points
                    (market, symbol, timestamp, open, high, low, close, volume, amount, provider)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(market, symbol, timestamp) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    amount = excluded.amount,
                    provider = excluded.provider",
                params![
                    market.as_str(),
                    point.symbol,
                    point.timestamp.to_rfc3339(),
                    point.open.map(|v| v.to_string()),
                    point.high.map(|v| v.to_string()),
                    point.low.map(|v| v.to_string()),
                    point.close.map(|v| v.to_string()),
                    point.volume.map(|v| v.to_string()),
                    point.amount.map(|v| v.to_string()),
                    point.provider,
                ],
            )
            .map_err(|err| to_domain_error("store", err))?;
        }
        Ok(())
    }

    fn load_points(
        &self,
        market: Market,
        symbols: &[String],
        start: Option<chrono::NaiveDate>,
        end: Option<chrono::NaiveDate>,
    ) -> Result<Vec<DataPoint>, DomainError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let placeholders = symbols.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT symbol, timestamp, open, high, low, close, volume, amount, provider
             FROM data_points
             WHERE market = ? AND symbol IN ({placeholders})
             ORDER BY symbol, timestamp"
        );
        let mut stmt = conn.prepare(&sql).map_err(|err| to_domain_error("store", err))?;
        let mut bound: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(symbols.len() + 1);
        let market_str = market.as_str();
        bound.push(&market_str);
        for symbol in symbols {
            bound.push(symbol);
        }
        let rows = stmt
            .query_map(bound.as_slice(), |r| {
                let symbol: String = r.get(0)?;
                let timestamp: String = r.get(1)?;
                let open: Option<String> = r.get(2)?;
                let high: Option<String> = r.get(3)?;
                let low: Option<String> = r.get(4)?;
                let close: Option<String> = r.get(5)?;
                let volume: Option<String> = r.get(6)?;
                let amount: Option<String> = r.get(7)?;
                let provider: Option<String> = r.get(8)?;
                Ok((symbol, timestamp, open, high, low, close, volume, amount, provider))
            })
            .map_err(|err| to_domain_error("store", err))?;

        let mut points = Vec::new();
        for row in rows {
            let (symbol, timestamp, open, high, low, close, volume, amount, provider) =
                row.map_err(|err| to_domain_error("store", err))?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| DomainError::new(ErrorCode::System, "store", format!("corrupt timestamp: {err}")))?;
            let date = timestamp.date_naive();
            if start.is_some_and(|s| date < s) || end.is_some_and(|e| date > e) {
                continue;
            }
            points.push(DataPoint {
                symbol,
                market: market.as_str().to_string(),
                timestamp,
                open: parse_decimal(open)?,
                high: parse_decimal(high)?,
                low: parse_decimal(low)?,
                close: parse_decimal(close)?,
                volume: parse_decimal(volume)?,
                amount: parse_decimal(amount)?,
                provider,
                extra: Default::default(),
            });
        }
        Ok(points)
    }
}

fn parse_decimal(raw: Option<String>) -> Result<Option<rust_decimal::Decimal>, DomainError> {
    raw.map(|v| {
        v.parse()
            .map_err(|err| DomainError::new(ErrorCode::System, "store", format!("corrupt decimal {v}: {err}")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn adjustments_upsert_overwrites_on_rerun() {
        let store = StoreFactory::open_in_memory().unwrap();
        let factor = AdjustmentFactor {
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            adj_factor_qfq: dec!(0.5),
            adj_factor_hfq: dec!(2),
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        store.write_factor(Market::Cn, "SH600000", &factor, "v1", "hash1", now).unwrap();
        let factor2 = AdjustmentFactor { adj_factor_qfq: dec!(0.75), ..factor };
        store.write_factor(Market::Cn, "SH600000", &factor2, "v2", "hash2", now).unwrap();

        let conn = store.connection();
        let conn = conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM adjustments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let version: String = conn
            .query_row("SELECT version FROM adjustments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, "v2");
    }

    #[test]
    fn persisted_points_round_trip_within_date_range() {
        let store = StoreFactory::open_in_memory().unwrap();
        let point = DataPoint::new(
            "SH600000",
            "cn",
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            Some(dec!(10)),
            Some(dec!(11)),
            Some(dec!(9)),
            Some(dec!(10.5)),
            Some(dec!(1000)),
        )
        .unwrap();
        store.persist_points(Market::Cn, std::slice::from_ref(&point)).unwrap();

        let loaded = store
            .load_points(
                Market::Cn,
                &["SH600000".to_string()],
                NaiveDate::from_ymd_opt(2024, 1, 1),
                NaiveDate::from_ymd_opt(2024, 1, 31),
            )
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].close, Some(dec!(10.5)));

        let out_of_range = store
            .load_points(
                Market::Cn,
                &["SH600000".to_string()],
                NaiveDate::from_ymd_opt(2024, 2, 1),
                NaiveDate::from_ymd_opt(2024, 2, 28),
            )
            .unwrap();
        assert!(out_of_range.is_empty());
    }

    #[test]
    fn symbol_map_insert_or_ignore_keeps_first_write() {
        use crate::model::query::{AssetKind, Market as ModelMarket};

        let store = StoreFactory::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = SymbolMapRecord {
            raw_symbol: "600000.SS".into(),
            market: ModelMarket::Cn,
            asset_type: AssetKind::Stock,
            canonical: "CN:STOCK:SH600000".into(),
            provider_hint: None,
            rule_id: "cn_stock_yfinance".into(),
            created_at: now,
        };
        store.record(record.clone());
        let record2 = SymbolMapRecord { canonical: "DIFFERENT".into(), ..record };
        store.record(record2);

        let conn = store.connection();
        let conn = conn.lock();
        let canonical: String = conn
            .query_row("SELECT canonical FROM symbol_map", [], |r| r.get(0))
            .unwrap();
        assert_eq!(canonical, "CN:STOCK:SH600000");
    }
}
