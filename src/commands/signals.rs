use crate::commands::{load_panel, write_json};
use crate::factors::SignalRecipe;
use crate::models::RebalanceFrequency;
use crate::strategy::{backtest_signals, SignalBacktestParams};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::info;
use std::path::Path;

pub struct SignalsArgs<'a> {
    pub factors: &'a [String],
    pub lookback: Option<usize>,
    pub as_of: Option<NaiveDate>,
    /// Run the quantile backtest instead of a single cross-section.
    pub backtest: Option<RebalanceFrequency>,
}

pub async fn run(panel_file: &Path, args: SignalsArgs<'_>, output: Option<&Path>) -> Result<()> {
    let panel = load_panel(panel_file).await?;
    let mut recipe = SignalRecipe::from_names(args.factors).context("invalid factor list")?;
    if let Some(lookback) = args.lookback {
        recipe = recipe.with_lookback(lookback);
    }
    recipe.as_of = args.as_of;

    if let Some(frequency) = args.backtest {
        let params = SignalBacktestParams {
            frequency,
            ..Default::default()
        };
        let result = backtest_signals(&panel, &recipe, &params)?;
        info!(
            "Quantile spread: total {:.2}%, Sharpe {:.3}, win rate {:.1}%",
            result.performance.total_return * 100.0,
            result.performance.sharpe_ratio,
            result.performance.win_rate * 100.0
        );
        return write_json(&result, output);
    }

    let result = crate::compute_signals(&panel, &recipe)?;
    info!(
        "Signals as of {}: {} symbols, IC {:.4}, concentration {:.4}",
        result.as_of,
        result.diagnostics.universe_size,
        result.diagnostics.information_coefficient,
        result.diagnostics.concentration
    );
    write_json(&result, output)
}
