use crate::commands::{load_panel, read_json, write_json};
use crate::config::EngineSettings;
use crate::covariance::{CovarianceEstimator, ShrinkageConfig};
use crate::factors::{FactorEngine, ReturnModel, SignalRecipe};
use crate::optimizer::{
    BlackLittermanParams, ConstraintSet, OptimizationMethod, PortfolioOptimizer, View,
};
use anyhow::{Context, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};

pub struct OptimizeArgs {
    pub factors: Vec<String>,
    pub method: String,
    pub window: usize,
    pub constraints_file: Option<PathBuf>,
    pub views_file: Option<PathBuf>,
    pub max_position: Option<f64>,
    pub compare: bool,
}

pub async fn run(
    settings: &EngineSettings,
    panel_file: &Path,
    args: OptimizeArgs,
    output: Option<&Path>,
) -> Result<()> {
    let panel = load_panel(panel_file).await?;
    let recipe = SignalRecipe::from_names(&args.factors).context("invalid factor list")?;
    let signals = FactorEngine::compute(&panel, &recipe)?;
    let expected = ReturnModel::default().expected_returns(&signals.combined);
    let symbols: Vec<String> = expected.keys().cloned().collect();
    info!(
        "Optimizing {} symbols as of {} with {}-day covariance window",
        symbols.len(),
        signals.as_of,
        args.window
    );

    let covariance = CovarianceEstimator::estimate_for(
        &panel,
        &symbols,
        signals.as_of,
        args.window,
        ShrinkageConfig::Disabled,
    )?;
    let securities = panel.security_master(signals.as_of);

    let mut constraints: ConstraintSet = match &args.constraints_file {
        Some(path) => read_json(path)?,
        None => ConstraintSet::default(),
    };
    if let Some(max_position) = args.max_position {
        constraints.max_position = max_position;
    }

    let views: Vec<View> = match &args.views_file {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };
    let mut method: OptimizationMethod = args.method.parse()?;
    if let OptimizationMethod::BlackLitterman(params) = &mut method {
        params.views = views.clone();
    } else if !views.is_empty() {
        warn!("Views are only used by black_litterman; ignoring {} views", views.len());
    }

    let optimizer = PortfolioOptimizer::new(settings);
    if args.compare {
        let bl = BlackLittermanParams {
            views,
            ..Default::default()
        };
        let results = optimizer.compare_methods(&expected, &covariance, &constraints, &bl, &securities);
        for (name, result) in &results {
            match result {
                Ok(result) => info!(
                    "{}: Sharpe {:.3}, volatility {:.2}%, {} positions",
                    name,
                    result.metrics.sharpe_ratio,
                    result.metrics.volatility * 100.0,
                    result.metrics.num_positions
                ),
                Err(error) => warn!("{} failed: {}", name, error),
            }
        }
        return write_json(&results, output);
    }

    let result = optimizer.optimize(&expected, &covariance, &constraints, &method, &securities)?;
    let failed = result.failed_checks();
    if !failed.is_empty() {
        warn!("Post-solve constraint checks failed: {}", failed.join(", "));
    }
    info!(
        "{}: expected return {:.2}%, volatility {:.2}%, Sharpe {:.3}",
        result.method,
        result.metrics.expected_return * 100.0,
        result.metrics.volatility * 100.0,
        result.metrics.sharpe_ratio
    );
    write_json(&result, output)
}
