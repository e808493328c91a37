//! Backtest orchestrator: job lifecycle and background execution
//!
//! Creation is synchronous: validate, persist in `pending`, enqueue, return.
//! A dispatcher task drains the queue and runs each job on its own task,
//! bounded by a semaphore. Every failure after creation ends up on the job row.

use chrono::NaiveDate;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::metrics::{compute_metrics, BenchmarkSeries, DEFAULT_RISK_FREE_RATE};
use crate::provider::PriceSeriesProvider;
use crate::series::{align_series, project_onto_dates};
use crate::simulator::PortfolioSimulator;
use crate::store::ResultsStore;
use crate::strategy::build_strategy;
use crate::types::*;
use crate::validation::validate_request;

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Symbols fetched concurrently per batch
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Pause between batches, for upstream rate limits
    pub batch_delay: Duration,
    /// Budget for fetch + simulate + metrics + persist
    pub execution_timeout: Duration,
    pub risk_free_rate: f64,
    pub max_concurrent_jobs: usize,
    pub min_capital: f64,
    pub max_capital: f64,
    pub max_holdings: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_timeout: Duration::from_secs(120),
            batch_delay: Duration::from_secs(1),
            execution_timeout: Duration::from_secs(600),
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
            max_concurrent_jobs: 4,
            min_capital: 100.0,
            max_capital: 1_000_000_000.0,
            max_holdings: 50,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `ETF_REPLAY_WORKERS`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = std::env::var("ETF_REPLAY_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|w| *w > 0)
        {
            config.max_concurrent_jobs = workers;
        }
        config
    }
}

/// Returned to the creator of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobCreated {
    pub id: JobId,
    pub status: BacktestStatus,
}

/// Progress milestones written to the job row
mod progress {
    pub const FETCH_START: u8 = 10;
    pub const FETCH_END: u8 = 60;
    pub const SIMULATED: u8 = 70;
    pub const METRICS: u8 = 80;
    pub const PERSISTING: u8 = 90;
}

/// Owns the job state machine and the hand-off between provider, engine and store
pub struct BacktestOrchestrator {
    store: Arc<dyn ResultsStore>,
    provider: Arc<dyn PriceSeriesProvider>,
    config: OrchestratorConfig,
    queue: mpsc::UnboundedSender<JobId>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    workers: Arc<Semaphore>,
}

impl BacktestOrchestrator {
    pub fn new(
        store: Arc<dyn ResultsStore>,
        provider: Arc<dyn PriceSeriesProvider>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let (queue, receiver) = mpsc::unbounded_channel();
        let workers = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Arc::new(Self {
            store,
            provider,
            config,
            queue,
            receiver: Mutex::new(Some(receiver)),
            workers,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// How long a job may sit in `running` before it is presumed abandoned.
    /// Every live execution ends within `execution_timeout`.
    pub fn stale_after(&self) -> Duration {
        self.config.execution_timeout * 2
    }

    /// Spawn the dispatcher and the stale-job sweeper. Jobs enqueued before
    /// this call are picked up too. Returns `None` if already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut receiver = self.receiver.lock().unwrap().take()?;
        let this = Arc::clone(self);
        tokio::spawn(Arc::clone(self).sweep_stale());

        Some(tokio::spawn(async move {
            info!(workers = this.config.max_concurrent_jobs, "Backtest dispatcher started");
            while let Some(id) = receiver.recv().await {
                let Ok(permit) = this.workers.clone().acquire_owned().await else {
                    break;
                };
                let worker = Arc::clone(&this);
                tokio::spawn(async move {
                    worker.run_guarded(id).await;
                    drop(permit);
                });
            }
            info!("Backtest dispatcher stopped");
        }))
    }

    /// Periodically fail jobs whose executor has gone away
    async fn sweep_stale(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.execution_timeout.max(Duration::from_secs(1)));
        // The first tick completes immediately; recovery covers startup
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.store.fail_stale(self.stale_after()).await {
                warn!(error = %e, "Stale backtest sweep failed");
            }
        }
    }

    /// Fail abandoned `running` jobs and re-enqueue pending ones.
    ///
    /// Only jobs older than [`Self::stale_after`] are failed, so a job another
    /// live process is executing on the same database is left alone. A
    /// pending job queued here and elsewhere still runs once: the claim only
    /// succeeds from `pending`.
    pub async fn recover(&self) -> EngineResult<usize> {
        self.store.fail_stale(self.stale_after()).await?;
        let pending = self.store.pending_jobs().await?;
        for id in &pending {
            self.enqueue(*id);
        }
        if !pending.is_empty() {
            info!(jobs = pending.len(), "Re-enqueued pending backtests");
        }
        Ok(pending.len())
    }

    // ===== Read / write surface =====

    /// Validate, persist as `pending`, and hand off for background execution
    pub async fn create_backtest(&self, request: &BacktestRequest) -> EngineResult<JobCreated> {
        let spec = validate_request(request, &self.config)?;
        let id = self.store.create_job(&spec).await?;
        self.enqueue(id);
        Ok(JobCreated {
            id,
            status: BacktestStatus::Pending,
        })
    }

    pub async fn get_backtest(&self, id: JobId) -> EngineResult<BacktestJob> {
        self.store.get_job(id).await
    }

    pub async fn list_backtests(&self, user_id: &str, limit: usize) -> EngineResult<Vec<BacktestJob>> {
        self.store.list_jobs(user_id, limit).await
    }

    pub async fn delete_backtest(&self, id: JobId) -> EngineResult<()> {
        self.store.delete_job(id).await
    }

    fn enqueue(&self, id: JobId) {
        if self.queue.send(id).is_err() {
            error!(job_id = id, "Job queue closed, backtest will stay pending");
        }
    }

    // ===== Execution =====

    /// Execute one job in the background, outside the queue
    pub fn spawn_job(self: &Arc<Self>, id: JobId) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_guarded(id))
    }

    /// Run a job on its own task so a panic still lands the job in `failed`
    async fn run_guarded(self: Arc<Self>, id: JobId) {
        let this = Arc::clone(&self);
        if let Err(e) = tokio::spawn(async move { this.execute(id).await }).await {
            error!(job_id = id, error = %e, "Backtest task aborted");
            self.mark_failed(id, format!("internal error: {e}")).await;
        }
    }

    /// Execute one pending job to a terminal state. Never returns an error:
    /// every failure is recorded on the job.
    pub async fn execute(&self, id: JobId) {
        let job = match self.store.get_job(id).await {
            Ok(job) => job,
            Err(EngineError::JobNotFound(_)) => {
                warn!(job_id = id, "Backtest deleted before it ran");
                return;
            }
            Err(e) => {
                error!(job_id = id, error = %e, "Cannot load backtest");
                self.mark_failed(id, format!("cannot load backtest: {e}")).await;
                return;
            }
        };
        if job.status != BacktestStatus::Pending {
            warn!(job_id = id, status = %job.status, "Skipping backtest that is not pending");
            return;
        }
        match self.store.set_status(id, BacktestStatus::Running, None).await {
            Ok(()) => {}
            Err(EngineError::InvalidTransition { from, .. }) => {
                info!(job_id = id, status = %from, "Backtest claimed elsewhere");
                return;
            }
            Err(EngineError::JobNotFound(_)) => {
                warn!(job_id = id, "Backtest deleted before it ran");
                return;
            }
            Err(e) => {
                error!(job_id = id, error = %e, "Cannot start backtest");
                self.mark_failed(id, format!("cannot start backtest: {e}")).await;
                return;
            }
        }

        info!(
            job_id = id,
            strategy = %job.strategy,
            holdings = job.holdings.len(),
            start = %job.start_date,
            end = %job.end_date,
            "Backtest started"
        );
        let started = Instant::now();

        let outcome = match timeout(self.config.execution_timeout, self.run_pipeline(&job)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "backtest exceeded execution limit of {:?}",
                self.config.execution_timeout
            ))),
        };

        match outcome {
            Ok(()) => info!(
                job_id = id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Backtest completed"
            ),
            Err(e) => {
                warn!(job_id = id, error = %e, "Backtest failed");
                self.mark_failed(id, e.to_string()).await;
            }
        }
    }

    async fn mark_failed(&self, id: JobId, message: String) {
        if let Err(e) = self.store.set_status(id, BacktestStatus::Failed, Some(message)).await {
            error!(job_id = id, error = %e, "Cannot record backtest failure");
        }
    }

    async fn set_progress(&self, id: JobId, progress: u8) {
        if let Err(e) = self.store.set_progress(id, progress).await {
            debug!(job_id = id, error = %e, "Progress update failed");
        }
    }

    /// fetch -> align -> simulate -> metrics -> persist
    async fn run_pipeline(&self, job: &BacktestJob) -> EngineResult<()> {
        let strategy = build_strategy(job.strategy, &job.strategy_params)?;
        let symbols: Vec<String> = job.holdings.iter().map(|h| h.symbol.clone()).collect();

        self.set_progress(job.id, progress::FETCH_START).await;
        let series = self
            .fetch_series(job.id, &symbols, job.start_date, job.end_date)
            .await;

        let missing: Vec<String> = symbols
            .iter()
            .filter(|s| series.get(*s).map_or(true, Vec::is_empty))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::DataUnavailable { missing });
        }

        let aligned = align_series(&series);
        if aligned.is_empty() {
            return Err(EngineError::DataUnavailable { missing: symbols });
        }
        if aligned.len() < 2 {
            return Err(EngineError::InsufficientData(format!(
                "only {} common trading date(s) across holdings",
                aligned.len()
            )));
        }

        let result = PortfolioSimulator::simulate(
            &aligned,
            &job.holdings,
            job.initial_capital,
            strategy.as_ref(),
            job.rebalancing_frequency,
        )?;
        self.set_progress(job.id, progress::SIMULATED).await;

        let benchmark = match &job.benchmark_symbol {
            Some(symbol) => self
                .benchmark_values(symbol, &result.dates, job.start_date, job.end_date)
                .await
                .map(|values| (symbol.as_str(), values)),
            None => None,
        };
        let metrics = compute_metrics(
            &result,
            job.initial_capital,
            self.config.risk_free_rate,
            benchmark
                .as_ref()
                .map(|(symbol, values)| BenchmarkSeries { symbol: *symbol, values: values.as_slice() }),
        )?;
        self.set_progress(job.id, progress::METRICS).await;

        self.set_progress(job.id, progress::PERSISTING).await;
        self.store.save_results(job.id, &result, &metrics).await?;

        info!(
            job_id = job.id,
            bars = result.dates.len(),
            total_return = metrics.total_return,
            sharpe = ?metrics.sharpe_ratio,
            "Backtest results saved"
        );
        Ok(())
    }

    /// Fetch every symbol in sequential batches. Symbols within a batch are
    /// fetched concurrently against a shared deadline; a symbol that errors
    /// or misses the deadline gets an empty series.
    async fn fetch_series(
        &self,
        job_id: JobId,
        symbols: &[String],
        from: NaiveDate,
        to: NaiveDate,
    ) -> BTreeMap<String, Vec<PricePoint>> {
        let batch_size = self.config.batch_size.max(1);
        let batches = symbols.len().div_ceil(batch_size).max(1);
        let mut series = BTreeMap::new();

        for (i, batch) in symbols.chunks(batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }

            let deadline = Instant::now() + self.config.batch_timeout;
            let fetches = batch
                .iter()
                .map(|symbol| timeout_at(deadline, self.fetch_one(symbol, from, to)));
            let results = join_all(fetches).await;

            for (symbol, result) in batch.iter().zip(results) {
                let points = result.unwrap_or_else(|_| {
                    warn!(job_id, symbol = %symbol, "Price fetch timed out");
                    Vec::new()
                });
                series.insert(symbol.clone(), points);
            }

            let span = (progress::FETCH_END - progress::FETCH_START) as usize;
            let done = progress::FETCH_START as usize + span * (i + 1) / batches;
            self.set_progress(job_id, done as u8).await;
            debug!(job_id, batch = i + 1, batches, "Fetched batch");
        }

        series
    }

    async fn fetch_one(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Vec<PricePoint> {
        match self.provider.get_historical_series(symbol, from, to).await {
            Ok(points) => points,
            Err(e) => {
                warn!(symbol, error = %e, "Price fetch failed");
                Vec::new()
            }
        }
    }

    /// Benchmark prices on the simulation dates. A missing benchmark only
    /// drops beta, alpha and the comparison.
    async fn benchmark_values(
        &self,
        symbol: &str,
        dates: &[NaiveDate],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Option<Vec<f64>> {
        let points = timeout(self.config.batch_timeout, self.fetch_one(symbol, from, to))
            .await
            .unwrap_or_default();
        let values = project_onto_dates(dates, &points);
        if values.is_none() {
            warn!(benchmark = symbol, "Benchmark data unavailable, skipping comparison");
        }
        values
    }
}
