//! ETF Replay — portfolio backtesting server and CLI
//!
//! Usage:
//!   etf-replay serve --port 3001                                  — Launch the job API
//!   etf-replay run --symbols VTI,BND --allocations 0.6,0.4 \
//!       --start 2020-01-02 --end 2023-12-29                       — One-shot backtest

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use engine::{
    strategy_catalog, BacktestJob, BacktestOrchestrator, BacktestRequest, BacktestStatus,
    CachedProvider, EngineError, FallbackProvider, FmpClient, Holding, OrchestratorConfig,
    PriceSeriesProvider, RebalancingFrequency, SqliteResultsStore, StrategyParams, YahooClient,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Parser)]
#[command(name = "etf-replay")]
#[command(about = "Portfolio backtesting over historical ETF prices", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the backtest job API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Run a single backtest from CLI (no web server)
    Run {
        /// Symbols to hold (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
        /// Allocations matching --symbols (comma-separated, sum to 1). Equal weight if omitted.
        #[arg(long, value_delimiter = ',')]
        allocations: Vec<f64>,
        /// First date (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Last date (YYYY-MM-DD), defaults to today
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Starting capital
        #[arg(long, default_value_t = 10_000.0)]
        capital: f64,
        /// buy_and_hold, equal_weight, momentum, mean_reversion, risk_parity
        #[arg(long, default_value = "buy_and_hold")]
        strategy: String,
        /// Strategy parameter as key=value (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
        /// daily, weekly, monthly, quarterly, annually, none
        #[arg(long, default_value = "monthly")]
        rebalance: String,
        /// Benchmark symbol for beta/alpha
        #[arg(long)]
        benchmark: Option<String>,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<String>,
    },
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<BacktestOrchestrator>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,etf_replay=debug,sqlx=warn,hyper=info")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,etf_replay=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Run {
            symbols,
            allocations,
            start,
            end,
            capital,
            strategy,
            params,
            rebalance,
            benchmark,
            export,
        } => {
            let request = build_cli_request(
                symbols, allocations, start, end, capital, strategy, params, &rebalance, benchmark,
            )?;
            cmd_run(request, export).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Wiring — database, providers, orchestrator
// ============================================================================

fn db_path() -> String {
    std::env::var("ETF_REPLAY_DB_PATH").unwrap_or_else(|_| "data/etf_replay.db".to_string())
}

/// FMP first when a key is configured, Yahoo as fallback, cached in front
fn build_provider() -> anyhow::Result<Arc<dyn PriceSeriesProvider>> {
    let mut sources: Vec<Arc<dyn PriceSeriesProvider>> = Vec::new();

    match std::env::var("FMP_API_KEY") {
        Ok(key) if !key.trim().is_empty() => sources.push(Arc::new(FmpClient::new(key.trim())?)),
        _ => warn!("FMP_API_KEY not set, using Yahoo Finance only"),
    }
    sources.push(Arc::new(YahooClient::new()?));

    let cache_minutes = std::env::var("ETF_REPLAY_CACHE_MINUTES")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);
    info!(sources = sources.len(), cache_minutes, "Price providers configured");

    Ok(Arc::new(CachedProvider::new(
        Arc::new(FallbackProvider::new(sources)),
        Duration::from_secs(cache_minutes * 60),
    )))
}

async fn build_orchestrator(db_path: &str) -> anyhow::Result<Arc<BacktestOrchestrator>> {
    let db = persistence::Database::new(db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);

    let store = Arc::new(SqliteResultsStore::new(db.pool_clone()));
    Ok(BacktestOrchestrator::new(store, build_provider()?, OrchestratorConfig::from_env()))
}

// ============================================================================
// Serve command — Axum web server
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("ETF Replay v{} starting...", APP_VERSION);

    let db_path = db_path();
    let orchestrator = build_orchestrator(&db_path).await?;
    // The server owns the queue: it recovers abandoned jobs and runs the dispatcher
    orchestrator.recover().await?;
    orchestrator.start();
    let state = AppState { orchestrator };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/strategies", get(api_strategies))
        .route("/backtests", get(api_list_backtests).post(api_create_backtest))
        .route("/backtests/:id", get(api_get_backtest).delete(api_delete_backtest))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== ETF Replay v{} ===", APP_VERSION);
    println!("Backtest Server");
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET    /api/health             - Health check");
    println!("  GET    /api/strategies         - Strategy catalog with defaults");
    println!("  POST   /api/backtests          - Submit a backtest");
    println!("  GET    /api/backtests?user_id= - List a user's backtests");
    println!("  GET    /api/backtests/:id      - Backtest status and results");
    println!("  DELETE /api/backtests/:id      - Delete a finished backtest");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Run command — CLI mode (no web server)
// ============================================================================

/// Parse `key=value`; the value is read as JSON when it parses, else as a string
fn parse_param(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid --param '{}', expected key=value", raw))?;
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| serde_json::Value::String(value.trim().to_string()));
    Ok((key.trim().to_string(), value))
}

#[allow(clippy::too_many_arguments)]
fn build_cli_request(
    symbols: Vec<String>,
    allocations: Vec<f64>,
    start: NaiveDate,
    end: Option<NaiveDate>,
    capital: f64,
    strategy: String,
    params: Vec<String>,
    rebalance: &str,
    benchmark: Option<String>,
) -> anyhow::Result<BacktestRequest> {
    let allocations = if allocations.is_empty() {
        vec![1.0 / symbols.len() as f64; symbols.len()]
    } else if allocations.len() == symbols.len() {
        allocations
    } else {
        anyhow::bail!(
            "{} allocations given for {} symbols",
            allocations.len(),
            symbols.len()
        );
    };

    let mut strategy_params = StrategyParams::new();
    for raw in &params {
        let (key, value) = parse_param(raw)?;
        strategy_params.insert(key, value);
    }

    Ok(BacktestRequest {
        user_id: "cli".to_string(),
        portfolio_id: String::new(),
        holdings: symbols
            .iter()
            .zip(allocations)
            .map(|(s, a)| Holding::new(s, a))
            .collect(),
        start_date: start,
        end_date: end.unwrap_or_else(|| Utc::now().date_naive()),
        initial_capital: capital,
        strategy,
        strategy_params,
        rebalancing_frequency: RebalancingFrequency::from_str(rebalance)?,
        benchmark_symbol: benchmark,
    })
}

async fn cmd_run(request: BacktestRequest, export: Option<String>) -> anyhow::Result<()> {
    println!("\n=== ETF Replay v{} ===", APP_VERSION);

    let db_path = db_path();
    let orchestrator = build_orchestrator(&db_path).await?;

    println!("Database: {}", db_path);
    println!(
        "Holdings: {}",
        request
            .holdings
            .iter()
            .map(|h| format!("{} {:.1}%", h.symbol, h.allocation * 100.0))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "Period: {} -> {} | Capital: {:.2} | Strategy: {} | Rebalance: {}",
        request.start_date,
        request.end_date,
        request.initial_capital,
        request.strategy,
        request.rebalancing_frequency
    );
    println!();

    // No dispatcher here: this process runs only the job it creates and never
    // touches other jobs in a database a server may be using
    let created = orchestrator.create_backtest(&request).await?;
    info!(job_id = created.id, "Backtest submitted");
    let worker = orchestrator.spawn_job(created.id);

    // Progress display loop
    let mut last_progress = None;
    let job = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let job = orchestrator.get_backtest(created.id).await?;
        if job.status.is_terminal() {
            break job;
        }
        if last_progress != Some(job.progress) {
            println!("  [{:>3}%] {}", job.progress, job.status);
            last_progress = Some(job.progress);
        }
    };

    if let Err(e) = worker.await {
        error!(job_id = created.id, error = %e, "Backtest task aborted");
    }

    match job.status {
        BacktestStatus::Completed => print_summary(&job),
        _ => println!(
            "\nBacktest failed: {}",
            job.error_message.as_deref().unwrap_or("unknown error")
        ),
    }

    if let Some(path) = export {
        let json = serde_json::to_string_pretty(&job)?;
        std::fs::write(&path, json)?;
        println!("\nExported to {}", path);
    }

    Ok(())
}

fn print_summary(job: &BacktestJob) {
    let Some(metrics) = &job.metrics else {
        return;
    };
    let fmt_opt = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |x| format!("{:.2}", x));

    println!("\nResults:");
    if let Some(final_value) = job.results.as_ref().and_then(|r| r.final_value()) {
        println!("  Final value        {:>12.2}", final_value);
    }
    println!("  Total return       {:>11.2}%", metrics.total_return * 100.0);
    println!("  Annualized return  {:>11.2}%", metrics.annualized_return * 100.0);
    println!("  Volatility         {:>11.2}%", metrics.volatility * 100.0);
    println!("  Sharpe             {:>12}", fmt_opt(metrics.sharpe_ratio));
    println!("  Sortino            {:>12}", fmt_opt(metrics.sortino_ratio));
    println!("  Max drawdown       {:>11.2}%", metrics.max_drawdown * 100.0);
    println!("  Drawdown duration  {:>12}", metrics.max_drawdown_duration);
    println!("  VaR / CVaR (95%)   {:>+.4} / {:>+.4}", metrics.var_95, metrics.cvar_95);
    println!("  Win rate           {:>11.1}%", metrics.win_rate * 100.0);
    println!("  Profit factor      {:>12}", fmt_opt(metrics.profit_factor));
    if let (Some(beta), Some(alpha)) = (metrics.beta, metrics.alpha) {
        println!("  Beta / Alpha       {:.2} / {:+.4}", beta, alpha);
    }
    if let Some(b) = &metrics.benchmark {
        println!("\n  vs {}:", b.benchmark_symbol);
        println!("  Benchmark return   {:>11.2}%", b.benchmark_total_return * 100.0);
        println!("  Correlation        {:>12}", fmt_opt(b.correlation));
        println!("  Tracking error     {:>11.2}%", b.tracking_error * 100.0);
        println!("  Information ratio  {:>12}", fmt_opt(b.information_ratio));
        println!("  Treynor            {:>12}", fmt_opt(b.treynor_ratio));
        println!(
            "  Up / Down capture  {} / {}",
            fmt_opt(b.up_capture),
            fmt_opt(b.down_capture)
        );
    }

    if let Some(results) = &job.results {
        if !results.holding_summaries.is_empty() {
            println!("\n  {:<10} {:>12} {:>12} {:>9} {:>9}", "Symbol", "Start", "End", "Return", "MaxDD");
            println!("  {}", "-".repeat(56));
            for h in &results.holding_summaries {
                println!(
                    "  {:<10} {:>12.2} {:>12.2} {:>8.2}% {:>8.2}%",
                    h.symbol,
                    h.initial_value,
                    h.final_value,
                    h.total_return * 100.0,
                    h.max_drawdown * 100.0
                );
            }
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// Engine errors rendered as `{success: false, error}` with a matching status
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            EngineError::JobNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::JobRunning(_) | EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            e => {
                error!(error = %e, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "etf-replay",
        "version": APP_VERSION,
    }))
}

/// GET /api/strategies — strategy catalog with parameter defaults
async fn api_strategies() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "strategies": strategy_catalog(),
    }))
}

/// POST /api/backtests — validate and enqueue a backtest
async fn api_create_backtest(
    State(state): State<AppState>,
    Json(request): Json<BacktestRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let created = state.orchestrator.create_backtest(&request).await?;
    info!(
        job_id = created.id,
        user = %request.user_id,
        holdings = request.holdings.len(),
        "Backtest accepted"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "success": true,
            "id": created.id,
            "status": created.status,
        })),
    ))
}

/// GET /api/backtests/:id — status, progress, and results once completed
async fn api_get_backtest(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state.orchestrator.get_backtest(id).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "backtest": job,
    })))
}

/// GET /api/backtests?user_id=&limit= — newest first, without result payloads
async fn api_list_backtests(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = params
        .get("user_id")
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| EngineError::Validation("user_id query parameter is required".to_string()))?;
    let limit: usize = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_LIST_LIMIT);

    let jobs = state.orchestrator.list_backtests(user_id, limit).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": jobs,
        "total": jobs.len(),
    })))
}

/// DELETE /api/backtests/:id — refused while the job is running
async fn api_delete_backtest(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.orchestrator.delete_backtest(id).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "id": id,
    })))
}
