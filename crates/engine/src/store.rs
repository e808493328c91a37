//! Durable job storage
//!
//! `ResultsStore` is the orchestrator's view of persistence; `SqliteResultsStore`
//! implements it over the persistence crate.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use persistence::repository::{
    BacktestJobRecord, BacktestRepository, HoldingRecord, MetricsRecord, NewBacktestJob, StatusUpdate,
};
use persistence::{DbError, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::*;

/// A validated job, ready to be persisted in `pending`
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub user_id: String,
    pub portfolio_id: String,
    pub strategy: StrategyKind,
    pub strategy_params: StrategyParams,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub benchmark_symbol: Option<String>,
    pub rebalancing_frequency: RebalancingFrequency,
    pub holdings: Vec<Holding>,
}

#[async_trait]
pub trait ResultsStore: Send + Sync {
    /// Persist a job with its holdings snapshot, atomically
    async fn create_job(&self, spec: &JobSpec) -> EngineResult<JobId>;

    /// Move a job to `running` or `failed`. Completion goes through `save_results`.
    async fn set_status(
        &self,
        id: JobId,
        status: BacktestStatus,
        error_message: Option<String>,
    ) -> EngineResult<()>;

    async fn set_progress(&self, id: JobId, progress: u8) -> EngineResult<()>;

    /// Store results and metrics and mark the job `completed`, atomically
    async fn save_results(
        &self,
        id: JobId,
        result: &SimulationResult,
        metrics: &PerformanceMetrics,
    ) -> EngineResult<()>;

    async fn get_job(&self, id: JobId) -> EngineResult<BacktestJob>;

    /// A user's jobs, newest first, without results payloads
    async fn list_jobs(&self, user_id: &str, limit: usize) -> EngineResult<Vec<BacktestJob>>;

    /// Rejected while the job is running
    async fn delete_job(&self, id: JobId) -> EngineResult<()>;

    /// Fail jobs that have been `running` for at least `older_than`.
    /// No live execution outlasts the execution timeout, so such jobs belong
    /// to a process that is gone. Returns the number of jobs failed.
    async fn fail_stale(&self, older_than: Duration) -> EngineResult<u64>;

    /// Ids of jobs waiting in `pending`, oldest first
    async fn pending_jobs(&self) -> EngineResult<Vec<JobId>>;
}

/// Error message recorded on jobs abandoned by a dead process
pub const INTERRUPTED_MESSAGE: &str = "interrupted: server restarted during execution";

/// SQLite-backed results store
#[derive(Clone)]
pub struct SqliteResultsStore {
    pool: SqlitePool,
}

impl SqliteResultsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn repo(&self) -> BacktestRepository<'_> {
        BacktestRepository::new(&self.pool)
    }

    async fn load(&self, record: BacktestJobRecord, with_results: bool) -> EngineResult<BacktestJob> {
        let repo = self.repo();
        let holdings = repo
            .get_holdings(record.id)
            .await?
            .into_iter()
            .map(|h| Holding {
                symbol: h.symbol,
                allocation: h.allocation,
            })
            .collect();

        let (results, metrics) = if with_results {
            let results = record
                .results_json
                .as_deref()
                .map(serde_json::from_str::<SimulationResult>)
                .transpose()?;
            let metrics = repo.get_metrics(record.id).await?.map(metrics_from_record).transpose()?;
            (results, metrics)
        } else {
            (None, None)
        };

        Ok(BacktestJob {
            id: record.id,
            user_id: record.user_id,
            portfolio_id: record.portfolio_id,
            strategy: StrategyKind::from_str(&record.strategy_type)?,
            strategy_params: serde_json::from_str(&record.strategy_params)?,
            start_date: parse_date(&record.start_date)?,
            end_date: parse_date(&record.end_date)?,
            initial_capital: record.initial_capital,
            benchmark_symbol: record.benchmark_symbol,
            rebalancing_frequency: RebalancingFrequency::from_str(&record.rebalancing_frequency)?,
            holdings,
            status: BacktestStatus::from_str(&record.status)?,
            progress: record.progress.clamp(0, 100) as u8,
            error_message: record.error_message,
            results,
            metrics,
            created_at: millis(record.created_at).unwrap_or_default(),
            started_at: record.started_at.and_then(millis),
            completed_at: record.completed_at.and_then(millis),
        })
    }
}

fn parse_date(s: &str) -> EngineResult<NaiveDate> {
    s.parse()
        .map_err(|e| EngineError::Store(DbError::Query(format!("bad stored date '{s}': {e}"))))
}

fn millis(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ts)
}

fn parse_metric(field: &str, s: &str) -> EngineResult<f64> {
    s.parse()
        .map_err(|e| EngineError::Store(DbError::Query(format!("bad stored {field} '{s}': {e}"))))
}

fn parse_opt_metric(field: &str, s: Option<String>) -> EngineResult<Option<f64>> {
    s.map(|v| parse_metric(field, &v)).transpose()
}

/// f64 Display is the shortest representation that parses back to the same value
fn metrics_to_record(m: &PerformanceMetrics) -> EngineResult<MetricsRecord> {
    let opt = |v: Option<f64>| v.map(|x| x.to_string());
    Ok(MetricsRecord {
        total_return: m.total_return.to_string(),
        annualized_return: m.annualized_return.to_string(),
        volatility: m.volatility.to_string(),
        sharpe_ratio: opt(m.sharpe_ratio),
        max_drawdown: m.max_drawdown.to_string(),
        max_drawdown_duration: m.max_drawdown_duration as i64,
        calmar_ratio: opt(m.calmar_ratio),
        sortino_ratio: opt(m.sortino_ratio),
        var_95: m.var_95.to_string(),
        cvar_95: m.cvar_95.to_string(),
        win_rate: m.win_rate.to_string(),
        profit_factor: opt(m.profit_factor),
        beta: opt(m.beta),
        alpha: opt(m.alpha),
        benchmark_json: m.benchmark.as_ref().map(serde_json::to_string).transpose()?,
    })
}

fn metrics_from_record(r: MetricsRecord) -> EngineResult<PerformanceMetrics> {
    Ok(PerformanceMetrics {
        total_return: parse_metric("total_return", &r.total_return)?,
        annualized_return: parse_metric("annualized_return", &r.annualized_return)?,
        volatility: parse_metric("volatility", &r.volatility)?,
        sharpe_ratio: parse_opt_metric("sharpe_ratio", r.sharpe_ratio)?,
        max_drawdown: parse_metric("max_drawdown", &r.max_drawdown)?,
        max_drawdown_duration: r.max_drawdown_duration.max(0) as usize,
        calmar_ratio: parse_opt_metric("calmar_ratio", r.calmar_ratio)?,
        sortino_ratio: parse_opt_metric("sortino_ratio", r.sortino_ratio)?,
        var_95: parse_metric("var_95", &r.var_95)?,
        cvar_95: parse_metric("cvar_95", &r.cvar_95)?,
        win_rate: parse_metric("win_rate", &r.win_rate)?,
        profit_factor: parse_opt_metric("profit_factor", r.profit_factor)?,
        beta: parse_opt_metric("beta", r.beta)?,
        alpha: parse_opt_metric("alpha", r.alpha)?,
        benchmark: r
            .benchmark_json
            .as_deref()
            .map(serde_json::from_str::<BenchmarkComparison>)
            .transpose()?,
    })
}

/// Repository NotFound becomes JobNotFound
fn job_error(id: JobId, e: DbError) -> EngineError {
    match e {
        DbError::NotFound(_) => EngineError::JobNotFound(id),
        other => EngineError::Store(other),
    }
}

#[async_trait]
impl ResultsStore for SqliteResultsStore {
    async fn create_job(&self, spec: &JobSpec) -> EngineResult<JobId> {
        let job = NewBacktestJob {
            user_id: spec.user_id.clone(),
            portfolio_id: spec.portfolio_id.clone(),
            strategy_type: spec.strategy.as_str().to_string(),
            strategy_params: serde_json::to_string(&spec.strategy_params)?,
            start_date: spec.start_date.to_string(),
            end_date: spec.end_date.to_string(),
            initial_capital: spec.initial_capital,
            benchmark_symbol: spec.benchmark_symbol.clone(),
            rebalancing_frequency: spec.rebalancing_frequency.as_str().to_string(),
        };
        let holdings: Vec<HoldingRecord> = spec
            .holdings
            .iter()
            .map(|h| HoldingRecord {
                symbol: h.symbol.clone(),
                allocation: h.allocation,
            })
            .collect();

        let id = self.repo().create(&job, &holdings).await?;
        info!(job_id = id, user = %spec.user_id, strategy = %spec.strategy, "Backtest job created");
        Ok(id)
    }

    async fn set_status(
        &self,
        id: JobId,
        status: BacktestStatus,
        error_message: Option<String>,
    ) -> EngineResult<()> {
        let repo = self.repo();
        let record = repo.get(id).await?.ok_or(EngineError::JobNotFound(id))?;
        let current = BacktestStatus::from_str(&record.status)?;
        if status == BacktestStatus::Completed || !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition { from: current, to: status });
        }

        let now = Utc::now().timestamp_millis();
        let update = match status {
            BacktestStatus::Running => StatusUpdate {
                status: status.as_str().to_string(),
                progress: Some(0),
                started_at: Some(now),
                ..Default::default()
            },
            _ => StatusUpdate {
                status: status.as_str().to_string(),
                error_message,
                completed_at: Some(now),
                ..Default::default()
            },
        };

        match repo.update_status(id, &update).await {
            Ok(()) => Ok(()),
            // Lost a race with another writer that claimed or finished the job
            Err(DbError::Conflict(_)) => {
                let from = match repo.get(id).await? {
                    Some(r) => BacktestStatus::from_str(&r.status)?,
                    None => return Err(EngineError::JobNotFound(id)),
                };
                Err(EngineError::InvalidTransition { from, to: status })
            }
            Err(e) => Err(job_error(id, e)),
        }
    }

    async fn set_progress(&self, id: JobId, progress: u8) -> EngineResult<()> {
        self.repo().set_progress(id, progress.min(100) as i64).await?;
        Ok(())
    }

    async fn save_results(
        &self,
        id: JobId,
        result: &SimulationResult,
        metrics: &PerformanceMetrics,
    ) -> EngineResult<()> {
        let json = serde_json::to_string(result)?;
        let record = metrics_to_record(metrics)?;
        match self.repo().save_results(id, &json, &record).await {
            Ok(()) => Ok(()),
            Err(DbError::Conflict(_)) => {
                let job = self.get_job(id).await?;
                Err(EngineError::InvalidTransition {
                    from: job.status,
                    to: BacktestStatus::Completed,
                })
            }
            Err(e) => Err(job_error(id, e)),
        }
    }

    async fn get_job(&self, id: JobId) -> EngineResult<BacktestJob> {
        let record = self.repo().get(id).await?.ok_or(EngineError::JobNotFound(id))?;
        self.load(record, true).await
    }

    async fn list_jobs(&self, user_id: &str, limit: usize) -> EngineResult<Vec<BacktestJob>> {
        let records = self.repo().list_by_user(user_id, limit as i64).await?;
        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            jobs.push(self.load(record, false).await?);
        }
        Ok(jobs)
    }

    async fn delete_job(&self, id: JobId) -> EngineResult<()> {
        match self.repo().delete(id).await {
            Ok(()) => {
                info!(job_id = id, "Backtest job deleted");
                Ok(())
            }
            Err(DbError::Conflict(_)) => Err(EngineError::JobRunning(id)),
            Err(e) => Err(job_error(id, e)),
        }
    }

    async fn fail_stale(&self, older_than: Duration) -> EngineResult<u64> {
        let age = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(age);
        let failed = self.repo().fail_interrupted(INTERRUPTED_MESSAGE, cutoff).await?;
        if failed > 0 {
            warn!(jobs = failed, older_than = ?older_than, "Marked interrupted backtests as failed");
        }
        Ok(failed)
    }

    async fn pending_jobs(&self) -> EngineResult<Vec<JobId>> {
        Ok(self.repo().pending_ids().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::Database;

    fn make_spec() -> JobSpec {
        JobSpec {
            user_id: "u1".to_string(),
            portfolio_id: "p1".to_string(),
            strategy: StrategyKind::Momentum,
            strategy_params: serde_json::from_value(serde_json::json!({"top_n": 2})).unwrap(),
            start_date: NaiveDate::from_ymd_opt(2023, 1, 3).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2023, 6, 30).unwrap(),
            initial_capital: 25_000.0,
            benchmark_symbol: None,
            rebalancing_frequency: RebalancingFrequency::Quarterly,
            holdings: vec![Holding::new("QQQ", 0.7), Holding::new("TLT", 0.3)],
        }
    }

    fn make_metrics() -> PerformanceMetrics {
        PerformanceMetrics {
            total_return: 0.1,
            annualized_return: 1.0 / 3.0,
            volatility: 0.17,
            sharpe_ratio: Some(0.93),
            max_drawdown: -0.042,
            max_drawdown_duration: 7,
            calmar_ratio: Some(7.9),
            sortino_ratio: None,
            var_95: -0.011,
            cvar_95: -0.019,
            win_rate: 0.55,
            profit_factor: Some(f64::INFINITY),
            beta: Some(0.8),
            alpha: Some(-0.001),
            benchmark: Some(BenchmarkComparison {
                benchmark_symbol: "SPY".to_string(),
                benchmark_total_return: 0.07,
                benchmark_annualized_return: 0.15,
                benchmark_volatility: 0.14,
                benchmark_sharpe_ratio: Some(0.93),
                correlation: Some(0.88),
                tracking_error: 0.05,
                information_ratio: Some(1.0 / 3.0),
                treynor_ratio: Some(0.39),
                up_capture: Some(1.1),
                down_capture: None,
            }),
        }
    }

    fn make_result() -> SimulationResult {
        let d0 = NaiveDate::from_ymd_opt(2023, 1, 3).unwrap();
        SimulationResult {
            dates: vec![d0, d0.succ_opt().unwrap()],
            values: vec![25_000.0, 25_000.0 * (1.0 + 1.0 / 7.0)],
            daily_returns: vec![1.0 / 7.0],
            drawdowns: vec![0.0, 0.0],
            ..Default::default()
        }
    }

    async fn store() -> SqliteResultsStore {
        let db = Database::in_memory().await.unwrap();
        SqliteResultsStore::new(db.pool_clone())
    }

    #[tokio::test]
    async fn test_round_trip_through_completion() {
        let store = store().await;
        let id = store.create_job(&make_spec()).await.unwrap();

        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.status, BacktestStatus::Pending);
        assert_eq!(job.holdings, make_spec().holdings);
        assert_eq!(job.strategy_params, make_spec().strategy_params);

        store.set_status(id, BacktestStatus::Running, None).await.unwrap();
        store.set_progress(id, 40).await.unwrap();
        assert_eq!(store.get_job(id).await.unwrap().progress, 40);

        store.save_results(id, &make_result(), &make_metrics()).await.unwrap();
        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.status, BacktestStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.results, Some(make_result()));
        assert_eq!(job.metrics, Some(make_metrics()));
        assert!(job.started_at.is_some() && job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let store = store().await;
        let id = store.create_job(&make_spec()).await.unwrap();

        let err = store.set_status(id, BacktestStatus::Completed, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        store.set_status(id, BacktestStatus::Running, None).await.unwrap();
        store
            .set_status(id, BacktestStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();

        let err = store.set_status(id, BacktestStatus::Running, None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { from: BacktestStatus::Failed, to: BacktestStatus::Running }
        ));
        let err = store.save_results(id, &make_result(), &make_metrics()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert!(job.metrics.is_none());
    }

    #[tokio::test]
    async fn test_delete_and_missing_jobs() {
        let store = store().await;
        let id = store.create_job(&make_spec()).await.unwrap();
        store.set_status(id, BacktestStatus::Running, None).await.unwrap();

        assert!(matches!(store.delete_job(id).await, Err(EngineError::JobRunning(_))));
        store.set_status(id, BacktestStatus::Failed, Some("x".into())).await.unwrap();
        store.delete_job(id).await.unwrap();

        assert!(matches!(store.get_job(id).await, Err(EngineError::JobNotFound(_))));
        assert!(matches!(store.delete_job(id).await, Err(EngineError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_and_recover() {
        let store = store().await;
        let first = store.create_job(&make_spec()).await.unwrap();
        let second = store.create_job(&make_spec()).await.unwrap();
        store.set_status(first, BacktestStatus::Running, None).await.unwrap();

        let jobs = store.list_jobs("u1", 10).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.results.is_none()));
        assert!(store.list_jobs("someone-else", 10).await.unwrap().is_empty());

        assert_eq!(store.pending_jobs().await.unwrap(), vec![second]);

        // A job that only just started is not stale
        assert_eq!(store.fail_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(store.get_job(first).await.unwrap().status, BacktestStatus::Running);

        assert_eq!(store.fail_stale(Duration::ZERO).await.unwrap(), 1);
        let job = store.get_job(first).await.unwrap();
        assert_eq!(job.status, BacktestStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(store.get_job(second).await.unwrap().status, BacktestStatus::Pending);
    }

    #[tokio::test]
    async fn test_second_claim_is_rejected() {
        let store = store().await;
        let id = store.create_job(&make_spec()).await.unwrap();
        store.set_status(id, BacktestStatus::Running, None).await.unwrap();

        let err = store.set_status(id, BacktestStatus::Running, None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { from: BacktestStatus::Running, to: BacktestStatus::Running }
        ));
    }
}
