//! Quantitative research core: factor signals, covariance estimation,
//! constrained portfolio optimization, risk, pre-trade compliance and a
//! rebalancing backtester.

pub mod commands;
pub mod compliance;
pub mod config;
pub mod covariance;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod execution;
pub mod factors;
pub mod models;
pub mod optimizer;
pub mod panel;
pub mod performance;
pub mod risk;
pub mod run_status;
pub mod solver;
pub mod stats;
pub mod strategy;

use crate::compliance::{ComplianceGate, ComplianceRuleset, ComplianceVerdict, RiskInputs};
use crate::config::EngineSettings;
use crate::covariance::{CovarianceEstimator, CovarianceMatrix, ShrinkageConfig};
use crate::engine::{BacktestEngine, BacktestParams, BacktestResult};
use crate::factors::{FactorEngine, SignalRecipe, SignalResult};
use crate::models::{PortfolioWeights, SecurityMaster};
use crate::optimizer::{ConstraintSet, OptimizationMethod, OptimizationResult, PortfolioOptimizer};
use crate::panel::AssetPanel;
use crate::risk::{RiskEngine, RiskParams, RiskReport};
use crate::strategy::StrategyConfig;
use std::collections::BTreeMap;

pub use crate::error::{EngineError, Result};

pub fn compute_signals(panel: &AssetPanel, recipe: &SignalRecipe) -> Result<SignalResult> {
    FactorEngine::compute(panel, recipe)
}

/// Covariance of the whole panel as of its last date.
pub fn estimate_covariance(
    panel: &AssetPanel,
    window: usize,
    shrinkage: ShrinkageConfig,
) -> Result<CovarianceMatrix> {
    CovarianceEstimator::estimate(panel, window, shrinkage)
}

pub fn optimize_portfolio(
    expected_returns: &BTreeMap<String, f64>,
    covariance: &CovarianceMatrix,
    constraints: &ConstraintSet,
    method: &OptimizationMethod,
    securities: &SecurityMaster,
    settings: &EngineSettings,
) -> Result<OptimizationResult> {
    PortfolioOptimizer::new(settings).optimize(expected_returns, covariance, constraints, method, securities)
}

pub fn assess_risk(
    weights: &PortfolioWeights,
    panel: &AssetPanel,
    params: &RiskParams,
) -> Result<RiskReport> {
    RiskEngine::assess(weights, panel, params)
}

pub fn check_compliance(
    weights: &PortfolioWeights,
    ruleset: &ComplianceRuleset,
    securities: &SecurityMaster,
    risk: &RiskInputs,
) -> Result<ComplianceVerdict> {
    ComplianceGate::check(weights, ruleset, securities, risk)
}

pub fn run_backtest(
    strategy: &StrategyConfig,
    panel: &AssetPanel,
    params: &BacktestParams,
    settings: &EngineSettings,
) -> Result<BacktestResult> {
    let mut strategy = strategy.build(settings)?;
    BacktestEngine::new(params.clone()).run(strategy.as_mut(), panel)
}
