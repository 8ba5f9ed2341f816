use crate::commands::{load_panel, read_json, write_json};
use crate::compliance::ComplianceRuleset;
use crate::config::EngineSettings;
use crate::engine::{BacktestEngine, BacktestParams};
use crate::models::RebalanceFrequency;
use crate::run_status::{CancellationToken, RunStatus};
use crate::strategy::StrategyConfig;
use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct BacktestArgs {
    pub strategy_file: PathBuf,
    pub params_file: Option<PathBuf>,
    pub frequency: Option<RebalanceFrequency>,
    pub ruleset: Option<String>,
}

/// Loads backtest parameters: file first, then settings defaults, then flags on top.
pub fn resolve_params(
    settings: &EngineSettings,
    params_file: Option<&Path>,
    frequency: Option<RebalanceFrequency>,
    ruleset: Option<&str>,
) -> Result<BacktestParams> {
    let mut params = match params_file {
        Some(path) => read_json(path)?,
        None => BacktestParams::from_settings(settings),
    };
    if let Some(frequency) = frequency {
        params.frequency = frequency;
    }
    if let Some(id) = ruleset {
        params.compliance = Some(ComplianceRuleset::builtin(id)?);
    }
    Ok(params)
}

pub async fn run(
    settings: &EngineSettings,
    panel_file: &Path,
    args: BacktestArgs,
    output: Option<&Path>,
) -> Result<()> {
    let panel = load_panel(panel_file).await?;
    let config: StrategyConfig = read_json(&args.strategy_file)?;
    let params = resolve_params(
        settings,
        args.params_file.as_deref(),
        args.frequency,
        args.ruleset.as_deref(),
    )?;
    let mut strategy = config.build(settings)?;
    info!(
        "Backtesting {} with {:?} rebalancing, initial capital ${:.2}",
        config.name(),
        params.frequency,
        params.initial_capital
    );

    let status = RunStatus::new();
    let token = CancellationToken::new();
    let engine = BacktestEngine::new(params)
        .with_status(status.clone())
        .with_cancellation(token.clone());
    let mut handle =
        tokio::task::spawn_blocking(move || engine.run(strategy.as_mut(), &panel));

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .map_err(|e| anyhow!(e))?
            .progress_chars("#>-"),
    );

    let joined = loop {
        tokio::select! {
            joined = &mut handle => break joined,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupt received; cancelling after the current rebalance step");
                token.cancel();
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                let snapshot = status.snapshot();
                pb.set_length(snapshot.total_steps as u64);
                pb.set_position(snapshot.completed_steps as u64);
                if let Some(value) = snapshot.last_value {
                    pb.set_message(format!("${:.0}", value));
                }
            }
        }
    };
    let result = joined.map_err(|e| anyhow!("backtest worker failed: {}", e))?;
    let result = match result {
        Ok(result) => {
            pb.finish_with_message("Backtest completed");
            result
        }
        Err(error) => {
            pb.abandon_with_message("Backtest stopped");
            return Err(error.into());
        }
    };

    let metrics = &result.performance;
    info!(
        "Final value ${:.2}: total return {:.2}%, annualized {:.2}%, Sharpe {:.3}, max drawdown {:.2}%, {} trades, {} skipped rebalances",
        result.final_value,
        metrics.total_return * 100.0,
        metrics.annualized_return * 100.0,
        metrics.sharpe_ratio,
        metrics.max_drawdown * 100.0,
        metrics.total_trades,
        result.skipped_rebalances.len()
    );
    write_json(&result, output)
}
