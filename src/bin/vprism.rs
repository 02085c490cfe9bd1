//! vprism CLI: `data fetch`, `symbol resolve`, `drift report`, `reconcile run`.
//!
//! Bootstrap (clap::Parser + tracing_subscriber::FmtSubscriber) is grounded
//! on `route_quality_monitor.rs`; the exit-code contract and stderr JSON
//! error shape are spec.md §6/§7, concretized in SPEC_FULL.md §4.10.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vprism_core::cache::Cache;
use vprism_core::config::AppConfig;
use vprism_core::drift::DriftDetector;
use vprism_core::error::{DomainError, ErrorCode};
use vprism_core::model::point::DataPoint;
use vprism_core::model::query::{AdjustmentModeParam, AssetKind, Market, Query, Timeframe};
use vprism_core::provider::native::NativeProvider;
use vprism_core::provider::DynProvider;
use vprism_core::reconcile::{ReconciliationSampler, SeriesLoader};
use vprism_core::registry::ProviderRegistry;
use vprism_core::service::{DataService, PointRepository};
use vprism_core::store::{Store, StoreConfig, StoreFactory};
use vprism_core::support::clock::SystemClock;
use vprism_core::support::ids::UuidRunIdFactory;
use vprism_core::symbol::{default_rules, load_rule_file, SymbolNormalizer};

#[derive(Parser, Debug)]
#[command(name = "vprism", about = "Unified market-data access platform CLI")]
struct Cli {
    /// Path to a TOML app-config file (default: none, built-in defaults apply).
    #[arg(long, global = true, env = "VPRISM_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `AppConfig::storage_path`.
    #[arg(long, global = true, env = "VPRISM_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Write rendered output here instead of stdout.
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[arg(long, global = true, env = "VPRISM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Accepted for CLI surface parity; this renderer never emits color.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Jsonl,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch OHLCV points through the full normalize/cache/route pipeline.
    Data {
        #[command(subcommand)]
        action: DataCommand,
    },
    /// Resolve a raw symbol to its canonical form.
    Symbol {
        #[command(subcommand)]
        action: SymbolCommand,
    },
    /// Run drift detection against a symbol's recent history.
    Drift {
        #[command(subcommand)]
        action: DriftCommand,
    },
    /// Run two-provider reconciliation sampling.
    Reconcile {
        #[command(subcommand)]
        action: ReconcileCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DataCommand {
    Fetch {
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// UTF-8 file, one raw symbol per line; merged with `--symbols`.
        #[arg(long)]
        symbols_from: Option<PathBuf>,
        #[arg(long, default_value = "stock")]
        asset: String,
        #[arg(long, default_value = "global")]
        market: String,
        /// Inclusive start date, `YYYY-MM-DD`. Defaults to `end - 30d`.
        #[arg(long)]
        start: Option<String>,
        /// Inclusive end date, `YYYY-MM-DD`. Defaults to today.
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        timeframe: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SymbolCommand {
    Resolve {
        symbol: String,
        #[arg(long, default_value = "global")]
        market: String,
        #[arg(long, default_value = "stock")]
        asset: String,
    },
}

#[derive(Subcommand, Debug)]
enum DriftCommand {
    Report {
        symbol: String,
        #[arg(long, default_value = "global")]
        market: String,
        #[arg(long, default_value_t = 20)]
        window: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ReconcileCommand {
    Run {
        symbols: Vec<String>,
        #[arg(long, default_value = "global")]
        market: String,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        sample_size: Option<usize>,
        /// Caps the number of rendered diff rows; the full sample still
        /// contributes to the summary counts and p95.
        #[arg(long)]
        limit: Option<usize>,
        /// Registry name of the first series under comparison.
        #[arg(long, default_value = "vprism_native")]
        provider_a: String,
        /// Registry name of the second series under comparison.
        #[arg(long, default_value = "vprism_native")]
        provider_b: String,
    },
}

type Row = Vec<(&'static str, Value)>;

struct CommandOutput {
    rows: Vec<Row>,
    exit_code: i32,
}

impl CommandOutput {
    fn ok(rows: Vec<Row>) -> Self {
        Self { rows, exit_code: 0 }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    bootstrap_logging(&cli.log_level);

    let exit_code = run(&cli).await;
    std::process::exit(exit_code);
}

fn bootstrap_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run(cli: &Cli) -> i32 {
    let config = load_config(cli);

    let outcome = match &cli.command {
        Command::Data { action } => {
            let DataCommand::Fetch {
                symbols,
                symbols_from,
                asset,
                market,
                start,
                end,
                timeframe,
            } = action;
            handle_data_fetch(
                &config, symbols, symbols_from.as_deref(), asset, market, start.as_deref(), end.as_deref(),
                timeframe.as_deref(),
            )
            .await
        }
        Command::Symbol { action } => {
            let SymbolCommand::Resolve { symbol, market, asset } = action;
            handle_symbol_resolve(&config, symbol, market, asset)
        }
        Command::Drift { action } => {
            let DriftCommand::Report { symbol, market, window } = action;
            handle_drift_report(&config, symbol, market, *window).await
        }
        Command::Reconcile { action } => {
            let ReconcileCommand::Run {
                symbols,
                market,
                start,
                end,
                sample_size,
                limit,
                provider_a,
                provider_b,
            } = action;
            handle_reconcile_run(
                &config, symbols, market, start.as_deref(), end.as_deref(), *sample_size, *limit,
                provider_a, provider_b,
            )
        }
    };

    match outcome {
        Ok(output) => {
            render(cli, &output.rows);
            output.exit_code
        }
        Err(err) => {
            emit_error(&err);
            match &cli.command {
                Command::Data { .. } => data_fetch_exit(&err),
                Command::Symbol { .. } => symbol_resolve_exit(&err),
                Command::Drift { .. } => drift_report_exit(&err),
                Command::Reconcile { .. } => reconcile_run_exit(&err),
            }
        }
    }
}

fn load_config(cli: &Cli) -> AppConfig {
    let base = match &cli.config {
        Some(path) => AppConfig::load(path).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "falling back to default config");
            AppConfig::default()
        }),
        None => AppConfig::default(),
    };
    base.with_overrides(cli.storage_path.clone(), Some(cli.log_level.clone()), None)
}

fn open_store(config: &AppConfig) -> Result<Arc<Store>, DomainError> {
    let path = config.storage_path.display().to_string();
    Ok(Arc::new(StoreFactory::open(&path, StoreConfig::default())?))
}

fn build_normalizer(config: &AppConfig) -> Result<Arc<SymbolNormalizer>, DomainError> {
    let rules = match &config.rule_set_path {
        Some(path) => vprism_core::symbol::compile_rules(load_rule_file(path)?)?,
        None => default_rules()?,
    };
    Ok(Arc::new(SymbolNormalizer::with_cache_size(rules, config.symbol_cache_size)))
}

fn build_registry() -> Arc<ProviderRegistry> {
    let registry = Arc::new(ProviderRegistry::new());
    // NativeProvider is this crate's zero-network default; real deployments
    // register HTTP providers into the same registry before routing.
    let _ = registry.register(Arc::new(NativeProvider::new()), None);
    registry
}

fn parse_date(label: &str, raw: &str) -> Result<NaiveDate, DomainError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|err| DomainError::validation("cli", format!("invalid {label} date '{raw}': {err}")))
}

fn read_symbols_file(path: &std::path::Path) -> Result<Vec<String>, DomainError> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        DomainError::validation("cli", format!("failed to read symbols file {}: {err}", path.display()))
    })?;
    Ok(content.lines().map(str::trim).filter(|line| !line.is_empty()).map(str::to_string).collect())
}

fn merge_symbols(explicit: &[String], from_file: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for symbol in explicit.iter().cloned().chain(from_file) {
        if seen.insert(symbol.clone()) {
            out.push(symbol);
        }
    }
    out
}

async fn handle_data_fetch(
    config: &AppConfig,
    symbols: &[String],
    symbols_from: Option<&std::path::Path>,
    asset: &str,
    market: &str,
    start: Option<&str>,
    end: Option<&str>,
    timeframe: Option<&str>,
) -> Result<CommandOutput, DomainError> {
    let from_file = match symbols_from {
        Some(path) => read_symbols_file(path)?,
        None => Vec::new(),
    };
    let raw_symbols = merge_symbols(symbols, from_file);

    let asset: AssetKind = asset.parse()?;
    let market: Market = market.parse()?;
    let timeframe = timeframe.map(|t| t.parse::<Timeframe>()).transpose()?;
    let end = end.map(|s| parse_date("end", s)).transpose()?.unwrap_or_else(|| Utc::now().date_naive());
    let start = start.map(|s| parse_date("start", s)).transpose()?.unwrap_or(end - chrono::Duration::days(30));

    let store = open_store(config)?;
    let registry = build_registry();
    let normalizer = build_normalizer(config)?;
    let cache = Cache::with_capacity(config.symbol_cache_size).with_store(store.clone())?;
    let router = vprism_core::router::Router::new(registry.clone()).with_max_fallback_attempts(config.max_fallback_attempts);
    let service = DataService::new(normalizer, registry, cache)
        .with_router(router)
        .with_repository(store as Arc<dyn PointRepository>);

    let query = Query {
        asset,
        market: Some(market),
        provider: None,
        timeframe,
        start: Some(start),
        end: Some(end),
        raw_symbols,
        canonical_symbols: vec![],
        adjustment: AdjustmentModeParam::None,
    };
    let response = service.fetch(query).await?;
    let rows = response
        .points
        .iter()
        .map(|point| point_row(point, response.cache_hit, &response.data_source))
        .collect();
    Ok(CommandOutput::ok(rows))
}

fn emit_error(err: &DomainError) {
    let mut body = serde_json::Map::new();
    body.insert("code".to_string(), Value::String(err.code.to_string()));
    body.insert("message".to_string(), Value::String(err.message.clone()));
    let details = err.redacted_context();
    if !details.is_empty() {
        body.insert("details".to_string(), serde_json::to_value(details).unwrap_or_default());
    }
    eprintln!("{}", Value::Object(body));
}

fn data_fetch_exit(err: &DomainError) -> i32 {
    if err.code == ErrorCode::Validation {
        10
    } else if matches!(
        err.code,
        ErrorCode::Provider
            | ErrorCode::NoProviderAvailable
            | ErrorCode::RateLimit
            | ErrorCode::Authentication
            | ErrorCode::CircuitBreakerOpen
            | ErrorCode::Routing
            | ErrorCode::Network
            | ErrorCode::Timeout
    ) {
        20
    } else {
        1
    }
}

fn symbol_resolve_exit(err: &DomainError) -> i32 {
    if err.code == ErrorCode::Validation {
        10
    } else {
        1
    }
}

fn drift_report_exit(err: &DomainError) -> i32 {
    if err.code == ErrorCode::Validation {
        10
    } else if err.code == ErrorCode::DataQuality {
        30
    } else {
        1
    }
}

fn reconcile_run_exit(err: &DomainError) -> i32 {
    if err.code == ErrorCode::Validation {
        10
    } else {
        1
    }
}

fn render(cli: &Cli, rows: &[Row]) {
    let rendered = match cli.format {
        OutputFormat::Table => render_table(rows),
        OutputFormat::Jsonl => render_jsonl(rows),
    };
    match &cli.output {
        Some(path) => {
            if let Ok(mut file) = std::fs::File::create(path) {
                let _ = file.write_all(rendered.as_bytes());
            }
        }
        None => print!("{rendered}"),
    }
}

fn cell_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn render_table(rows: &[Row]) -> String {
    if rows.is_empty() {
        return String::new();
    }
    let headers: Vec<&str> = rows[0].iter().map(|(k, _)| *k).collect();
    let str_rows: Vec<Vec<String>> = rows.iter().map(|row| row.iter().map(|(_, v)| cell_str(v)).collect()).collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &str_rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    for (i, header) in headers.iter().enumerate() {
        out.push_str(&format!("{header:<width$}  ", width = widths[i]));
    }
    out.push('\n');
    for row in &str_rows {
        for (i, cell) in row.iter().enumerate() {
            out.push_str(&format!("{cell:<width$}  ", width = widths[i]));
        }
        out.push('\n');
    }
    out
}

fn render_jsonl(rows: &[Row]) -> String {
    let mut out = String::new();
    for row in rows {
        let parts: Vec<String> = row
            .iter()
            .map(|(k, v)| format!("{}:{v}", serde_json::to_string(k).unwrap_or_default()))
            .collect();
        out.push('{');
        out.push_str(&parts.join(","));
        out.push_str("}\n");
    }
    out
}

fn point_row(point: &DataPoint, cache_hit: bool, data_source: &str) -> Row {
    vec![
        ("symbol", Value::String(point.symbol.clone())),
        ("market", Value::String(point.market.clone())),
        ("timestamp", Value::String(point.timestamp.to_rfc3339())),
        ("open", decimal_value(point.open)),
        ("high", decimal_value(point.high)),
        ("low", decimal_value(point.low)),
        ("close", decimal_value(point.close)),
        ("volume", decimal_value(point.volume)),
        ("provider", Value::String(point.provider.clone().unwrap_or_default())),
        ("cache_hit", Value::Bool(cache_hit)),
        ("data_source", Value::String(data_source.to_string())),
    ]
}

fn decimal_value(value: Option<rust_decimal::Decimal>) -> Value {
    match value {
        Some(d) => serde_json::Number::from_f64(rust_decimal::prelude::ToPrimitive::to_f64(&d).unwrap_or(0.0))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        None => Value::Null,
    }
}

/// Wraps a registered [`DynProvider`] as a synchronous [`SeriesLoader`] for
/// `reconcile run` — `SeriesLoader::load` is sync (the sampler has no
/// dependency on an async runtime), while `Provider::get_data` is async, so
/// the call is bridged with `block_in_place` + `Handle::current().block_on`.
struct ProviderSeriesLoader {
    provider: DynProvider,
    market: Market,
    asset: AssetKind,
}

impl SeriesLoader for ProviderSeriesLoader {
    fn load(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<DataPoint>, DomainError> {
        let query = Query {
            asset: self.asset,
            market: Some(self.market),
            provider: None,
            timeframe: Some(Timeframe::D1),
            start: Some(start),
            end: Some(end),
            raw_symbols: vec![],
            canonical_symbols: vec![symbol.to_string()],
            adjustment: AdjustmentModeParam::None,
        };
        let provider = self.provider.clone();
        let response = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move { provider.get_data(&query).await })
        })?;
        Ok(response.points)
    }
}

fn handle_symbol_resolve(
    config: &AppConfig,
    symbol: &str,
    market: &str,
    asset: &str,
) -> Result<CommandOutput, DomainError> {
    let market: Market = market.parse()?;
    let asset: AssetKind = asset.parse()?;
    let normalizer = build_normalizer(config)?;
    let resolved = normalizer.normalize(symbol, market, asset)?;
    let row = vec![
        ("raw_symbol", Value::String(resolved.raw_symbol)),
        ("canonical", Value::String(resolved.canonical)),
        ("market", Value::String(market.as_str().to_string())),
        ("asset_type", Value::String(asset.as_str().to_string())),
        ("rule_id", Value::String(resolved.rule_id)),
    ];
    Ok(CommandOutput::ok(vec![row]))
}

async fn handle_drift_report(
    config: &AppConfig,
    symbol: &str,
    market: &str,
    window: usize,
) -> Result<CommandOutput, DomainError> {
    let market: Market = market.parse()?;
    let store = open_store(config)?;
    let registry = build_registry();
    let normalizer = build_normalizer(config)?;
    let cache = Cache::with_capacity(config.symbol_cache_size).with_store(store.clone())?;
    let router = vprism_core::router::Router::new(registry.clone()).with_max_fallback_attempts(config.max_fallback_attempts);
    let service = DataService::new(normalizer, registry, cache)
        .with_router(router)
        .with_repository(store.clone() as Arc<dyn PointRepository>);

    let end = Utc::now().date_naive();
    let start = end - chrono::Duration::days(window as i64);
    let query = Query {
        asset: AssetKind::Stock,
        market: Some(market),
        provider: None,
        timeframe: Some(Timeframe::D1),
        start: Some(start),
        end: Some(end),
        raw_symbols: vec![symbol.to_string()],
        canonical_symbols: vec![],
        adjustment: AdjustmentModeParam::None,
    };
    let response = service.fetch(query).await?;

    let detector = DriftDetector::new(Arc::new(SystemClock), Arc::new(UuidRunIdFactory))
        .with_writer(store as Arc<dyn vprism_core::drift::DriftMetricWriter>);
    let result = detector.detect(symbol, market, window, response.points)?;

    let rows = result
        .metrics
        .iter()
        .map(|metric| {
            vec![
                ("symbol", Value::String(result.symbol.clone())),
                ("market", Value::String(market.as_str().to_string())),
                ("window", Value::Number(window.into())),
                ("metric", Value::String(metric.name.clone())),
                ("value", decimal_value(Some(metric.value))),
                ("status", Value::String(format!("{:?}", metric.status).to_uppercase())),
                ("run_id", Value::String(result.run_id.to_string())),
            ]
        })
        .collect();

    let exit_code = match result.worst_status() {
        vprism_core::model::drift::DriftStatus::Fail => 30,
        _ => 0,
    };
    Ok(CommandOutput { rows, exit_code })
}

fn handle_reconcile_run(
    config: &AppConfig,
    symbols: &[String],
    market: &str,
    start: Option<&str>,
    end: Option<&str>,
    sample_size: Option<usize>,
    limit: Option<usize>,
    provider_a: &str,
    provider_b: &str,
) -> Result<CommandOutput, DomainError> {
    if symbols.is_empty() {
        return Err(DomainError::validation("cli", "reconcile run requires at least one symbol"));
    }
    let market: Market = market.parse()?;
    let end = end.map(|s| parse_date("end", s)).transpose()?.unwrap_or_else(|| Utc::now().date_naive());
    let start = start.map(|s| parse_date("start", s)).transpose()?.unwrap_or(end - chrono::Duration::days(30));

    let store = open_store(config)?;
    let registry = build_registry();
    let provider_a = registry
        .get(provider_a)
        .ok_or_else(|| DomainError::not_found("cli", format!("unknown provider '{provider_a}'")))?;
    let provider_b = registry
        .get(provider_b)
        .ok_or_else(|| DomainError::not_found("cli", format!("unknown provider '{provider_b}'")))?;
    let loader_a = ProviderSeriesLoader { provider: provider_a, market, asset: AssetKind::Stock };
    let loader_b = ProviderSeriesLoader { provider: provider_b, market, asset: AssetKind::Stock };

    let sampler = ReconciliationSampler::new(Arc::new(SystemClock), Arc::new(UuidRunIdFactory))
        .with_run_writer(store.clone() as Arc<dyn vprism_core::reconcile::ReconciliationRunWriter>)
        .with_diff_writer(store as Arc<dyn vprism_core::reconcile::ReconciliationDiffWriter>);

    let mut rng = rand::thread_rng();
    let result = sampler.run(symbols, start, end, sample_size, &loader_a, &loader_b, &mut rng)?;

    let rendered_count = limit.unwrap_or(result.samples.len());
    if rendered_count < result.samples.len() {
        info!(
            total = result.samples.len(),
            rendered = rendered_count,
            "truncating rendered reconciliation rows to --limit"
        );
    }

    let mut rows: Vec<Row> = result
        .samples
        .iter()
        .take(rendered_count)
        .map(|sample| {
            vec![
                ("symbol", Value::String(sample.symbol.clone())),
                ("date", Value::String(sample.date.to_string())),
                ("close_a", decimal_value(sample.close_a)),
                ("close_b", decimal_value(sample.close_b)),
                ("close_bp_diff", decimal_value(sample.close_bp_diff)),
                ("volume_a", decimal_value(sample.volume_a)),
                ("volume_b", decimal_value(sample.volume_b)),
                ("volume_ratio", decimal_value(sample.volume_ratio)),
                ("status", Value::String(format!("{:?}", sample.status).to_uppercase())),
            ]
        })
        .collect();

    rows.push(vec![
        ("symbol", Value::String("__summary__".to_string())),
        ("date", Value::Null),
        ("close_a", Value::Null),
        ("close_b", Value::Null),
        ("close_bp_diff", decimal_value(Some(result.summary.p95_close_bp_diff))),
        ("volume_a", Value::Null),
        ("volume_b", Value::Null),
        ("volume_ratio", Value::Null),
        (
            "status",
            Value::String(format!(
                "pass={} warn={} fail={}",
                result.summary.pass_count, result.summary.warn_count, result.summary.fail_count
            )),
        ),
    ]);

    let exit_code = if result.summary.fail_count > 0 { 40 } else { 0 };
    Ok(CommandOutput { rows, exit_code })
}
