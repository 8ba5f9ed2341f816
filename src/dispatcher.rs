use crate::compliance::{ComplianceRuleset, ComplianceVerdict, RiskInputs};
use crate::config::EngineSettings;
use crate::covariance::{CovarianceMatrix, ShrinkageConfig};
use crate::engine::{BacktestParams, BacktestResult};
use crate::error::{EngineError, Result};
use crate::factors::{SignalRecipe, SignalResult};
use crate::models::{PortfolioWeights, SecurityMaster};
use crate::optimizer::{ConstraintSet, OptimizationMethod, OptimizationResult};
use crate::panel::AssetPanel;
use crate::risk::{RiskParams, RiskReport};
use crate::strategy::StrategyConfig;
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// One self-contained unit of work. Jobs share inputs only through `Arc`
/// and never see each other's results.
#[derive(Debug, Clone)]
pub enum Job {
    ComputeSignals {
        panel: Arc<AssetPanel>,
        recipe: SignalRecipe,
    },
    EstimateCovariance {
        panel: Arc<AssetPanel>,
        window: usize,
        shrinkage: ShrinkageConfig,
    },
    Optimize {
        expected_returns: BTreeMap<String, f64>,
        covariance: CovarianceMatrix,
        constraints: ConstraintSet,
        method: OptimizationMethod,
        securities: SecurityMaster,
    },
    AssessRisk {
        weights: PortfolioWeights,
        panel: Arc<AssetPanel>,
        params: RiskParams,
    },
    CheckCompliance {
        weights: PortfolioWeights,
        ruleset: ComplianceRuleset,
        securities: SecurityMaster,
        risk: RiskInputs,
    },
    Backtest {
        panel: Arc<AssetPanel>,
        strategy: StrategyConfig,
        params: BacktestParams,
    },
}

impl Job {
    pub fn label(&self) -> String {
        match self {
            Job::ComputeSignals { .. } => "compute_signals".to_string(),
            Job::EstimateCovariance { window, .. } => format!("estimate_covariance({})", window),
            Job::Optimize { method, .. } => format!("optimize({})", method),
            Job::AssessRisk { .. } => "assess_risk".to_string(),
            Job::CheckCompliance { ruleset, .. } => format!("check_compliance({})", ruleset.id),
            Job::Backtest { strategy, .. } => format!("backtest({})", strategy.name()),
        }
    }

    pub fn execute(&self, settings: &EngineSettings) -> Result<JobOutput> {
        match self {
            Job::ComputeSignals { panel, recipe } => {
                crate::compute_signals(panel, recipe).map(JobOutput::Signals)
            }
            Job::EstimateCovariance {
                panel,
                window,
                shrinkage,
            } => crate::estimate_covariance(panel, *window, *shrinkage).map(JobOutput::Covariance),
            Job::Optimize {
                expected_returns,
                covariance,
                constraints,
                method,
                securities,
            } => crate::optimize_portfolio(
                expected_returns,
                covariance,
                constraints,
                method,
                securities,
                settings,
            )
            .map(JobOutput::Optimization),
            Job::AssessRisk {
                weights,
                panel,
                params,
            } => crate::assess_risk(weights, panel, params).map(JobOutput::Risk),
            Job::CheckCompliance {
                weights,
                ruleset,
                securities,
                risk,
            } => crate::check_compliance(weights, ruleset, securities, risk)
                .map(JobOutput::Compliance),
            Job::Backtest {
                panel,
                strategy,
                params,
            } => crate::run_backtest(strategy, panel, params, settings)
                .map(|result| JobOutput::Backtest(Box::new(result))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "output", rename_all = "snake_case")]
pub enum JobOutput {
    Signals(SignalResult),
    Covariance(CovarianceMatrix),
    Optimization(OptimizationResult),
    Risk(RiskReport),
    Compliance(ComplianceVerdict),
    Backtest(Box<BacktestResult>),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: usize,
    pub label: String,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// A failing or panicking job carries its message here; other jobs are unaffected.
    pub result: std::result::Result<JobOutput, String>,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u128(duration.as_millis())
    }
}

impl JobOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

struct QueuedJob {
    id: usize,
    job: Job,
}

#[derive(Clone)]
pub struct WorkerPool {
    workers: usize,
    settings: EngineSettings,
    show_progress: bool,
}

impl WorkerPool {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            workers: settings.worker_threads.max(1),
            settings,
            show_progress: false,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Runs every job on the pool and returns outcomes in submission order.
    pub fn run(&self, jobs: Vec<Job>) -> Result<Vec<JobOutcome>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let job_count = jobs.len();
        let num_workers = std::cmp::min(job_count, std::cmp::max(1, self.workers));
        info!("Running {} jobs on {} worker threads", job_count, num_workers);

        let (tx, rx): (Sender<QueuedJob>, Receiver<QueuedJob>) = bounded(job_count);
        let (result_tx, result_rx): (Sender<JobOutcome>, Receiver<JobOutcome>) = bounded(job_count);

        let mut handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            let settings = self.settings.clone();
            let handle = thread::spawn(move || {
                while let Ok(queued) = rx.recv() {
                    let outcome = run_isolated(queued, &settings);
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for (id, job) in jobs.into_iter().enumerate() {
            tx.send(QueuedJob { id, job })
                .map_err(|e| EngineError::Worker(format!("job queue closed: {}", e)))?;
        }
        drop(tx);

        let pb = if self.show_progress {
            ProgressBar::new(job_count as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .map_err(|e| EngineError::Worker(e.to_string()))?
                .progress_chars("#>-"),
        );

        let mut outcomes = Vec::with_capacity(job_count);
        let mut failed = 0;
        while outcomes.len() < job_count {
            match result_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(outcome) => {
                    if !outcome.is_ok() {
                        failed += 1;
                    }
                    outcomes.push(outcome);
                    pb.set_position(outcomes.len() as u64);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    warn!("Result channel closed unexpectedly. Some results may be lost.");
                    break;
                }
            }
        }
        if failed > 0 {
            warn!("{} of {} jobs failed", failed, job_count);
            pb.finish_with_message("Jobs completed with errors");
        } else {
            pb.finish_with_message("Jobs completed");
        }

        for handle in handles {
            if handle.join().is_err() {
                warn!("A worker thread exited abnormally");
            }
        }
        if outcomes.len() < job_count {
            return Err(EngineError::Worker(format!(
                "{} of {} job results were lost",
                job_count - outcomes.len(),
                job_count
            )));
        }
        outcomes.sort_by_key(|o| o.job_id);
        Ok(outcomes)
    }

    /// [`WorkerPool::run`] off the async executor.
    pub async fn run_async(&self, jobs: Vec<Job>) -> Result<Vec<JobOutcome>> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.run(jobs))
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?
    }
}

fn run_isolated(queued: QueuedJob, settings: &EngineSettings) -> JobOutcome {
    let label = queued.job.label();
    let start = Instant::now();
    let job = &queued.job;
    let result = match panic::catch_unwind(AssertUnwindSafe(|| job.execute(settings))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(error.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    };
    let duration = start.elapsed();
    match &result {
        Ok(_) => info!("Job {} ({}) finished in {:.2}s", queued.id, label, duration.as_secs_f64()),
        Err(error) => warn!(
            "Job {} ({}) failed after {:.2}s: {}",
            queued.id,
            label,
            duration.as_secs_f64(),
            error
        ),
    }
    JobOutcome {
        job_id: queued.id,
        label,
        duration,
        result,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_string()
    }
}

/// Backtests several strategies on one panel, each as its own job.
pub fn compare_strategies(
    pool: &WorkerPool,
    panel: Arc<AssetPanel>,
    strategies: &[StrategyConfig],
    params: &BacktestParams,
) -> Result<Vec<JobOutcome>> {
    if strategies.is_empty() {
        return Err(EngineError::validation("no strategies to compare"));
    }
    let jobs = strategies
        .iter()
        .map(|strategy| Job::Backtest {
            panel: Arc::clone(&panel),
            strategy: strategy.clone(),
            params: params.clone(),
        })
        .collect();
    pool.run(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetObservation, Fundamentals, RebalanceFrequency};
    use chrono::{Duration as ChronoDuration, NaiveDate};

    fn panel() -> Arc<AssetPanel> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut rows = Vec::new();
        for day in 0..40 {
            for (symbol, drift) in [("A", 0.002), ("B", -0.001)] {
                rows.push(AssetObservation {
                    symbol: symbol.to_string(),
                    date: start + ChronoDuration::days(day),
                    close: 100.0 * (1.0 + drift * day as f64),
                    daily_return: None,
                    volume: 1_000.0,
                    market_cap: 1e9,
                    sector: Some("Technology".to_string()),
                    country: Some("US".to_string()),
                    fundamentals: Fundamentals::default(),
                    betas: None,
                    esg_score: None,
                    adv_ratio: None,
                });
            }
        }
        Arc::new(AssetPanel::new(rows).unwrap())
    }

    fn params() -> BacktestParams {
        BacktestParams {
            frequency: RebalanceFrequency::Weekly,
            ..Default::default()
        }
    }

    #[test]
    fn a_failing_job_does_not_affect_the_others() {
        let pool = WorkerPool::new(EngineSettings::default()).with_workers(2);
        let strategies = vec![
            StrategyConfig::EqualWeight { symbols: Vec::new() },
            StrategyConfig::FixedWeights {
                weights: PortfolioWeights::from_pairs([("MISSING", 1.0)]),
            },
            StrategyConfig::FixedWeights {
                weights: PortfolioWeights::from_pairs([("A", 1.0)]),
            },
        ];
        let outcomes = compare_strategies(&pool, panel(), &strategies, &params()).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes.iter().map(|o| o.job_id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].result.as_ref().unwrap_err().contains("MISSING"));
        assert!(outcomes[2].is_ok());
        assert_eq!(outcomes[2].label, "backtest(fixed_weights)");
    }

    #[test]
    fn mixed_jobs_return_matching_outputs() {
        let pool = WorkerPool::new(EngineSettings::default());
        let jobs = vec![
            Job::EstimateCovariance {
                panel: panel(),
                window: 20,
                shrinkage: ShrinkageConfig::Disabled,
            },
            Job::CheckCompliance {
                weights: PortfolioWeights::from_pairs([("A", 0.5), ("B", 0.5)]),
                ruleset: ComplianceRuleset::default(),
                securities: SecurityMaster::new(),
                risk: RiskInputs::default(),
            },
        ];
        let outcomes = pool.run(jobs).unwrap();
        assert!(matches!(outcomes[0].result, Ok(JobOutput::Covariance(_))));
        assert!(matches!(outcomes[1].result, Ok(JobOutput::Compliance(_))));
    }

    #[tokio::test]
    async fn async_run_matches_blocking_run() {
        let pool = WorkerPool::new(EngineSettings::default()).with_workers(1);
        let jobs = vec![Job::Backtest {
            panel: panel(),
            strategy: StrategyConfig::FixedWeights {
                weights: PortfolioWeights::from_pairs([("A", 0.5), ("B", 0.5)]),
            },
            params: params(),
        }];
        let asynchronous = pool.run_async(jobs.clone()).await.unwrap();
        let blocking = pool.run(jobs).unwrap();
        match (&asynchronous[0].result, &blocking[0].result) {
            (Ok(JobOutput::Backtest(a)), Ok(JobOutput::Backtest(b))) => {
                assert_eq!(a.equity_curve, b.equity_curve)
            }
            _ => panic!("backtest job failed"),
        }
    }
}
