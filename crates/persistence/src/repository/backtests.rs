//! Backtest jobs repository: job rows, holdings snapshots, results and metrics

use crate::{DbError, DbResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

/// A persisted backtest job
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestJobRecord {
    pub id: i64,
    pub user_id: String,
    pub portfolio_id: String,
    pub strategy_type: String,
    pub strategy_params: String,
    pub start_date: String,
    pub end_date: String,
    pub initial_capital: f64,
    pub benchmark_symbol: Option<String>,
    pub rebalancing_frequency: String,
    pub status: String,
    pub progress: i64,
    pub error_message: Option<String>,
    pub results_json: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: Option<i64>,
}

/// Fields supplied by the caller when a job is created
#[derive(Debug, Clone)]
pub struct NewBacktestJob {
    pub user_id: String,
    pub portfolio_id: String,
    pub strategy_type: String,
    pub strategy_params: String,
    pub start_date: String,
    pub end_date: String,
    pub initial_capital: f64,
    pub benchmark_symbol: Option<String>,
    pub rebalancing_frequency: String,
}

/// One row of a job's holdings snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct HoldingRecord {
    pub symbol: String,
    pub allocation: f64,
}

/// Performance metrics row; numeric values are f64 text representations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MetricsRecord {
    pub total_return: String,
    pub annualized_return: String,
    pub volatility: String,
    pub sharpe_ratio: Option<String>,
    pub max_drawdown: String,
    pub max_drawdown_duration: i64,
    pub calmar_ratio: Option<String>,
    pub sortino_ratio: Option<String>,
    pub var_95: String,
    pub cvar_95: String,
    pub win_rate: String,
    pub profit_factor: Option<String>,
    pub beta: Option<String>,
    pub alpha: Option<String>,
    /// Serialized benchmark comparison, when one was computed
    pub benchmark_json: Option<String>,
}

/// A status transition. `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: String,
    pub progress: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

const JOB_COLUMNS: &str = r#"
    id, user_id, portfolio_id, strategy_type, strategy_params,
    start_date, end_date, initial_capital, benchmark_symbol, rebalancing_frequency,
    status, progress, error_message, results_json,
    created_at, started_at, completed_at, updated_at
"#;

/// Repository for backtest jobs
pub struct BacktestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BacktestRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a job in `pending` together with its holdings snapshot (single transaction)
    pub async fn create(&self, job: &NewBacktestJob, holdings: &[HoldingRecord]) -> DbResult<i64> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO backtest_jobs (
                user_id, portfolio_id, strategy_type, strategy_params,
                start_date, end_date, initial_capital, benchmark_symbol,
                rebalancing_frequency, status, progress, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(&job.user_id)
        .bind(&job.portfolio_id)
        .bind(&job.strategy_type)
        .bind(&job.strategy_params)
        .bind(&job.start_date)
        .bind(&job.end_date)
        .bind(job.initial_capital)
        .bind(&job.benchmark_symbol)
        .bind(&job.rebalancing_frequency)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let id = result.last_insert_rowid();

        for (position, holding) in holdings.iter().enumerate() {
            sqlx::query(
                "INSERT INTO backtest_holdings (backtest_id, position, symbol, allocation) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(position as i64)
            .bind(&holding.symbol)
            .bind(holding.allocation)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(id, holdings = holdings.len(), "Created backtest job");
        Ok(id)
    }

    /// Get a job by id
    pub async fn get(&self, id: i64) -> DbResult<Option<BacktestJobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM backtest_jobs WHERE id = ?");
        let record = sqlx::query_as::<_, BacktestJobRecord>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        Ok(record)
    }

    /// Holdings snapshot in the order it was submitted
    pub async fn get_holdings(&self, id: i64) -> DbResult<Vec<HoldingRecord>> {
        let records = sqlx::query_as::<_, HoldingRecord>(
            "SELECT symbol, allocation FROM backtest_holdings WHERE backtest_id = ? ORDER BY position",
        )
        .bind(id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Metrics row for a completed job
    pub async fn get_metrics(&self, id: i64) -> DbResult<Option<MetricsRecord>> {
        let record = sqlx::query_as::<_, MetricsRecord>(
            r#"
            SELECT total_return, annualized_return, volatility, sharpe_ratio,
                   max_drawdown, max_drawdown_duration, calmar_ratio, sortino_ratio,
                   var_95, cvar_95, win_rate, profit_factor, beta, alpha, benchmark_json
            FROM performance_metrics
            WHERE backtest_id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent jobs for a user
    pub async fn list_by_user(&self, user_id: &str, limit: i64) -> DbResult<Vec<BacktestJobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM backtest_jobs WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
        );
        let records = sqlx::query_as::<_, BacktestJobRecord>(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;

        Ok(records)
    }

    /// Ids of jobs still waiting to be executed, oldest first
    pub async fn pending_ids(&self) -> DbResult<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM backtest_jobs WHERE status = 'pending' ORDER BY id")
                .fetch_all(self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Apply a status transition. Terminal jobs (completed/failed) are never updated,
    /// and only a `pending` job can move to `running`, so exactly one caller wins a claim.
    pub async fn update_status(&self, id: i64, update: &StatusUpdate) -> DbResult<()> {
        let now = Utc::now().timestamp_millis();
        let guard = if update.status == "running" {
            "status = 'pending'"
        } else {
            "status NOT IN ('completed', 'failed')"
        };
        let sql = format!(
            r#"
            UPDATE backtest_jobs SET
                status = ?,
                progress = COALESCE(?, progress),
                error_message = COALESCE(?, error_message),
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ? AND {guard}
            "#
        );
        let result = sqlx::query(&sql)
        .bind(&update.status)
        .bind(update.progress)
        .bind(&update.error_message)
        .bind(update.started_at)
        .bind(update.completed_at)
        .bind(now)
        .bind(id)
        .execute(self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.missing_or_conflict(id, "transition not allowed").await);
        }
        Ok(())
    }

    /// Update progress of a running job (no-op for any other status)
    pub async fn set_progress(&self, id: i64, progress: i64) -> DbResult<()> {
        sqlx::query(
            "UPDATE backtest_jobs SET progress = ?, updated_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(progress.clamp(0, 100))
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Store the results blob and metrics row and mark the job completed, atomically.
    /// Only a running job can complete.
    pub async fn save_results(
        &self,
        id: i64,
        results_json: &str,
        metrics: &MetricsRecord,
    ) -> DbResult<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE backtest_jobs SET
                status = 'completed', progress = 100, results_json = ?,
                completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(results_json)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.missing_or_conflict(id, "job is not running").await);
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO performance_metrics (
                backtest_id, total_return, annualized_return, volatility, sharpe_ratio,
                max_drawdown, max_drawdown_duration, calmar_ratio, sortino_ratio,
                var_95, cvar_95, win_rate, profit_factor, beta, alpha, benchmark_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&metrics.total_return)
        .bind(&metrics.annualized_return)
        .bind(&metrics.volatility)
        .bind(&metrics.sharpe_ratio)
        .bind(&metrics.max_drawdown)
        .bind(metrics.max_drawdown_duration)
        .bind(&metrics.calmar_ratio)
        .bind(&metrics.sortino_ratio)
        .bind(&metrics.var_95)
        .bind(&metrics.cvar_95)
        .bind(&metrics.win_rate)
        .bind(&metrics.profit_factor)
        .bind(&metrics.beta)
        .bind(&metrics.alpha)
        .bind(&metrics.benchmark_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete a job with its snapshot and metrics. Rejected while the job is running.
    pub async fn delete(&self, id: i64) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM backtest_jobs WHERE id = ? AND status != 'running'")
            .bind(id)
            .execute(self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.missing_or_conflict(id, "job is running").await);
        }
        Ok(())
    }

    /// Fail `running` jobs started at or before `started_before` (epoch millis).
    /// Returns the number of rows touched.
    pub async fn fail_interrupted(&self, message: &str, started_before: i64) -> DbResult<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE backtest_jobs SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ?
            WHERE status = 'running' AND (started_at IS NULL OR started_at <= ?)
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(started_before)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn missing_or_conflict(&self, id: i64, conflict: &str) -> DbError {
        match sqlx::query_as::<_, (String,)>("SELECT status FROM backtest_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await
        {
            Ok(Some((status,))) => DbError::Conflict(format!("backtest {id}: {conflict} (status {status})")),
            Ok(None) => DbError::NotFound(format!("backtest {id}")),
            Err(e) => DbError::Sqlx(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn new_job() -> NewBacktestJob {
        NewBacktestJob {
            user_id: "user-1".to_string(),
            portfolio_id: "pf-1".to_string(),
            strategy_type: "buy_and_hold".to_string(),
            strategy_params: "{}".to_string(),
            start_date: "2023-01-02".to_string(),
            end_date: "2023-12-29".to_string(),
            initial_capital: 10000.0,
            benchmark_symbol: Some("SPY".to_string()),
            rebalancing_frequency: "none".to_string(),
        }
    }

    fn holdings() -> Vec<HoldingRecord> {
        vec![
            HoldingRecord { symbol: "VTI".to_string(), allocation: 0.6 },
            HoldingRecord { symbol: "BND".to_string(), allocation: 0.1 + 0.2 + 0.1 },
        ]
    }

    fn metrics() -> MetricsRecord {
        MetricsRecord {
            total_return: 0.1.to_string(),
            annualized_return: 0.123456789012345.to_string(),
            volatility: 0.2.to_string(),
            sharpe_ratio: None,
            max_drawdown: (-0.05f64).to_string(),
            max_drawdown_duration: 3,
            calmar_ratio: Some(2.5.to_string()),
            sortino_ratio: None,
            var_95: (-0.01f64).to_string(),
            cvar_95: (-0.02f64).to_string(),
            win_rate: 0.5.to_string(),
            profit_factor: Some(f64::INFINITY.to_string()),
            beta: None,
            alpha: None,
            benchmark_json: Some(r#"{"benchmark_symbol":"SPY"}"#.to_string()),
        }
    }

    async fn start(repo: &BacktestRepository<'_>, id: i64) {
        repo.update_status(
            id,
            &StatusUpdate {
                status: "running".to_string(),
                progress: Some(0),
                started_at: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_persists_snapshot_in_order() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        let id = repo.create(&new_job(), &holdings()).await.unwrap();
        let job = repo.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(job.progress, 0);
        assert!(job.results_json.is_none());

        // Allocations come back bit-for-bit
        let snapshot = repo.get_holdings(id).await.unwrap();
        assert_eq!(snapshot, holdings());
    }

    #[tokio::test]
    async fn test_duplicate_symbol_rolls_back_whole_job() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        let dup = vec![
            HoldingRecord { symbol: "VTI".to_string(), allocation: 0.5 },
            HoldingRecord { symbol: "VTI".to_string(), allocation: 0.5 },
        ];
        assert!(repo.create(&new_job(), &dup).await.is_err());
        assert!(repo.list_by_user("user-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_results_completes_and_round_trips() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());
        let id = repo.create(&new_job(), &holdings()).await.unwrap();
        start(&repo, id).await;

        repo.save_results(id, r#"{"values":[1.0]}"#, &metrics()).await.unwrap();

        let job = repo.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, "completed");
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
        assert_eq!(job.results_json.as_deref(), Some(r#"{"values":[1.0]}"#));

        let stored = repo.get_metrics(id).await.unwrap().unwrap();
        assert_eq!(stored, metrics());
        assert_eq!(stored.profit_factor.unwrap().parse::<f64>().unwrap(), f64::INFINITY);
    }

    #[tokio::test]
    async fn test_save_results_requires_running() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());
        let id = repo.create(&new_job(), &holdings()).await.unwrap();

        let err = repo.save_results(id, "{}", &metrics()).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
        assert!(repo.get_metrics(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());
        let id = repo.create(&new_job(), &holdings()).await.unwrap();
        start(&repo, id).await;

        repo.update_status(
            id,
            &StatusUpdate {
                status: "failed".to_string(),
                error_message: Some("boom".to_string()),
                completed_at: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let err = repo
            .update_status(id, &StatusUpdate { status: "running".to_string(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));

        let job = repo.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_delete_rejected_while_running() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());
        let id = repo.create(&new_job(), &holdings()).await.unwrap();
        start(&repo, id).await;

        assert!(matches!(repo.delete(id).await.unwrap_err(), DbError::Conflict(_)));

        repo.save_results(id, "{}", &metrics()).await.unwrap();
        repo.delete(id).await.unwrap();
        assert!(repo.get(id).await.unwrap().is_none());
        assert!(repo.get_holdings(id).await.unwrap().is_empty());
        assert!(repo.get_metrics(id).await.unwrap().is_none());
        assert!(matches!(repo.delete(id).await.unwrap_err(), DbError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fail_interrupted_and_pending_ids() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());
        let running = repo.create(&new_job(), &holdings()).await.unwrap();
        let pending = repo.create(&new_job(), &holdings()).await.unwrap();
        start(&repo, running).await;

        // Started at t=1: a cutoff before that leaves it alone
        assert_eq!(repo.fail_interrupted("interrupted", 0).await.unwrap(), 0);
        assert_eq!(repo.get(running).await.unwrap().unwrap().status, "running");

        assert_eq!(repo.fail_interrupted("interrupted", 1).await.unwrap(), 1);
        assert_eq!(repo.get(running).await.unwrap().unwrap().status, "failed");
        assert_eq!(repo.pending_ids().await.unwrap(), vec![pending]);
    }

    #[tokio::test]
    async fn test_running_claim_only_from_pending() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());
        let id = repo.create(&new_job(), &holdings()).await.unwrap();
        start(&repo, id).await;

        // A second claim on a running job loses
        let err = repo
            .update_status(
                id,
                &StatusUpdate {
                    status: "running".to_string(),
                    started_at: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
        assert_eq!(repo.get(id).await.unwrap().unwrap().started_at, Some(1));

        let missing = repo
            .update_status(999, &StatusUpdate { status: "running".to_string(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(missing, DbError::NotFound(_)));
    }
}
