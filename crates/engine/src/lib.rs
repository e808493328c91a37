//! ETF Replay Engine — portfolio backtesting over historical daily prices
//!
//! Provides:
//! - Price series cleaning and date alignment
//! - Portfolio simulation with buy-and-hold and rebalancing strategies
//! - Performance and risk metrics (Sharpe, Sortino, drawdown, VaR, beta)
//! - Backtest job orchestration with background execution and timeouts
//! - FMP and Yahoo Finance price clients behind a cached fallback provider

pub mod api;
pub mod calendar;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod series;
pub mod simulator;
pub mod store;
pub mod strategy;
pub mod types;
pub mod validation;

// Re-exports for convenience
pub use api::{FmpClient, YahooClient};
pub use error::{EngineError, EngineResult};
pub use metrics::{compute_metrics, BenchmarkSeries};
pub use orchestrator::{BacktestOrchestrator, JobCreated, OrchestratorConfig};
pub use provider::{CachedProvider, FallbackProvider, PriceSeriesProvider};
pub use series::{align_series, fill_missing_data, AlignedSeries};
pub use simulator::PortfolioSimulator;
pub use store::{JobSpec, ResultsStore, SqliteResultsStore};
pub use strategy::{build_strategy, strategy_catalog, Strategy, StrategyCatalogEntry};
pub use types::*;
