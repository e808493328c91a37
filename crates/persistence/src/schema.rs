//! Database schema definitions

/// SQL to create all tables
/// NOTE: metric values are stored as TEXT (shortest round-trip f64 repr) so that
/// infinities survive and reads return the exact value that was written.
pub const CREATE_TABLES: &str = r#"
-- Backtest jobs (one row per requested simulation)
CREATE TABLE IF NOT EXISTS backtest_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    portfolio_id TEXT NOT NULL,
    strategy_type TEXT NOT NULL,
    strategy_params TEXT NOT NULL DEFAULT '{}',
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    initial_capital REAL NOT NULL,
    benchmark_symbol TEXT,
    rebalancing_frequency TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    progress INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    results_json TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    updated_at INTEGER
);

-- Holdings snapshot captured at creation time
CREATE TABLE IF NOT EXISTS backtest_holdings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backtest_id INTEGER NOT NULL REFERENCES backtest_jobs(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    allocation REAL NOT NULL,
    UNIQUE (backtest_id, symbol)
);

-- Performance metrics (present only for completed jobs)
CREATE TABLE IF NOT EXISTS performance_metrics (
    backtest_id INTEGER PRIMARY KEY REFERENCES backtest_jobs(id) ON DELETE CASCADE,
    total_return TEXT NOT NULL,
    annualized_return TEXT NOT NULL,
    volatility TEXT NOT NULL,
    sharpe_ratio TEXT,
    max_drawdown TEXT NOT NULL,
    max_drawdown_duration INTEGER NOT NULL DEFAULT 0,
    calmar_ratio TEXT,
    sortino_ratio TEXT,
    var_95 TEXT NOT NULL,
    cvar_95 TEXT NOT NULL,
    win_rate TEXT NOT NULL,
    profit_factor TEXT,
    beta TEXT,
    alpha TEXT,
    benchmark_json TEXT,
    created_at INTEGER NOT NULL
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_backtest_user ON backtest_jobs(user_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_backtest_status ON backtest_jobs(status);
CREATE INDEX IF NOT EXISTS idx_holdings_backtest ON backtest_holdings(backtest_id, position)
"#;

/// Additive column migrations, applied after CREATE_TABLES.
/// "duplicate column name" failures are expected on databases that already have them.
pub const MIGRATIONS: &[&str] = &[];
