use crate::commands::backtest::resolve_params;
use crate::commands::{load_panel, read_json, write_json};
use crate::config::EngineSettings;
use crate::dispatcher::{compare_strategies, JobOutput, WorkerPool};
use crate::models::RebalanceFrequency;
use crate::strategy::StrategyConfig;
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct CompareArgs {
    /// JSON array of strategy configs.
    pub strategies_file: PathBuf,
    pub params_file: Option<PathBuf>,
    pub frequency: Option<RebalanceFrequency>,
    pub ruleset: Option<String>,
}

pub async fn run(
    settings: &EngineSettings,
    panel_file: &Path,
    args: CompareArgs,
    output: Option<&Path>,
) -> Result<()> {
    let panel = Arc::new(load_panel(panel_file).await?);
    let strategies: Vec<StrategyConfig> = read_json(&args.strategies_file)?;
    let params = resolve_params(
        settings,
        args.params_file.as_deref(),
        args.frequency,
        args.ruleset.as_deref(),
    )?;
    let pool = WorkerPool::new(settings.clone()).with_progress(true);
    info!("Comparing {} strategies", strategies.len());

    let outcomes = tokio::task::spawn_blocking(move || {
        compare_strategies(&pool, panel, &strategies, &params)
    })
    .await
    .map_err(|e| anyhow!("comparison worker failed: {}", e))??;

    for outcome in &outcomes {
        match &outcome.result {
            Ok(JobOutput::Backtest(result)) => info!(
                "#{} {}: total return {:.2}%, Sharpe {:.3}, max drawdown {:.2}% ({:.1}s)",
                outcome.job_id,
                outcome.label,
                result.performance.total_return * 100.0,
                result.performance.sharpe_ratio,
                result.performance.max_drawdown * 100.0,
                outcome.duration.as_secs_f64()
            ),
            Ok(_) => {}
            Err(error) => warn!("#{} {} failed: {}", outcome.job_id, outcome.label, error),
        }
    }
    write_json(&outcomes, output)
}
