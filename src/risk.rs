//! Value-at-risk, expected shortfall, factor exposures and stress scenarios
//! for a weight vector over a panel's return history.
//!
//! Losses (VaR, ES, scenario losses, drawdowns) are reported as positive
//! magnitudes; returns keep their sign.

use crate::error::{EngineError, Result};
use crate::models::{FactorBetas, PortfolioWeights, SecurityMaster, UNCLASSIFIED_SECTOR};
use crate::panel::AssetPanel;
use crate::stats;
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::collections::BTreeMap;

const ILLIQUID_ADV_RATIO: f64 = 0.01;
const BASE_TRADING_COST: f64 = 0.001;
const RATES_SIZE_SENSITIVITY: f64 = 0.5;

/// How scenario drawdown is aggregated across stress scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioDrawdownMode {
    /// Scenarios are unrelated one-shot shocks; no drawdown is reported.
    #[default]
    Independent,
    /// Compounds scenario returns in order as if they were a path.
    SequentialPath,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_probability")]
    pub probability: f64,
    /// Applied through each asset's market beta.
    #[serde(default)]
    pub market_shock: f64,
    /// Applied through each asset's size beta at half strength.
    #[serde(default)]
    pub rates_shock: f64,
    /// Direct return shock for assets in the named sectors.
    #[serde(default)]
    pub sector_shocks: BTreeMap<String, f64>,
}

fn default_probability() -> f64 {
    0.01
}

impl StressScenario {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            probability: default_probability(),
            market_shock: 0.0,
            rates_shock: 0.0,
            sector_shocks: BTreeMap::new(),
        }
    }

    fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    fn sector(mut self, sector: &str, shock: f64) -> Self {
        self.sector_shocks.insert(sector.to_string(), shock);
        self
    }

    /// Market crash, rate spike, oil shock, FX crisis and sector rotation.
    pub fn defaults() -> Vec<StressScenario> {
        vec![
            StressScenario {
                market_shock: -0.20,
                ..StressScenario::new("market_crash")
            }
            .describe("Broad equity sell-off of 20%"),
            StressScenario {
                rates_shock: 0.02,
                ..StressScenario::new("rates_spike")
            }
            .describe("200bp rise in rates hitting small caps"),
            StressScenario::new("oil_shock")
                .sector("Energy", -0.25)
                .describe("Oil price collapse"),
            StressScenario {
                market_shock: -0.10,
                ..StressScenario::new("fx_crisis")
            }
            .describe("Currency crisis spilling into equities"),
            StressScenario::new("sector_rotation")
                .sector("Technology", -0.15)
                .sector("Healthcare", 0.10)
                .sector("Utilities", 0.10)
                .describe("Rotation out of technology into defensives"),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    pub var_confidence: f64,
    pub es_confidence: f64,
    /// Trailing number of return dates used for portfolio returns.
    pub lookback: usize,
    pub as_of: Option<NaiveDate>,
    /// Caller-supplied scenarios; the built-in set when empty.
    pub scenarios: Vec<StressScenario>,
    pub drawdown_mode: ScenarioDrawdownMode,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            var_confidence: 0.95,
            es_confidence: 0.95,
            lookback: 252,
            as_of: None,
            scenarios: Vec::new(),
            drawdown_mode: ScenarioDrawdownMode::Independent,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorExposures {
    pub market: f64,
    pub size: f64,
    pub value: f64,
    pub momentum: f64,
    /// Positions without stored betas, counted at the default loadings.
    pub missing_betas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioStats {
    pub mean_return: f64,
    pub volatility: f64,
    pub skewness: f64,
    pub kurtosis: f64,
    pub min_return: f64,
    pub max_return: f64,
    pub var_95: f64,
    pub var_99: f64,
    pub es_95: f64,
    pub es_99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub description: String,
    pub probability: f64,
    pub scenario_return: f64,
    pub scenario_loss: f64,
    pub adjusted_exposures: FactorExposures,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRiskMetrics {
    pub expected_loss: f64,
    pub worst_case_loss: f64,
    pub scenario_var_95: f64,
    /// Only computed in [`ScenarioDrawdownMode::SequentialPath`].
    pub max_drawdown: Option<f64>,
    pub drawdown_mode: ScenarioDrawdownMode,
    pub num_scenarios: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioAnalysis {
    pub results: Vec<ScenarioResult>,
    pub metrics: ScenarioRiskMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub as_of: NaiveDate,
    pub observations: usize,
    pub var_confidence: f64,
    pub es_confidence: f64,
    pub var_parametric: f64,
    pub var_historical: f64,
    pub es_parametric: f64,
    pub es_historical: f64,
    pub factor_exposures: FactorExposures,
    pub sector_exposures: BTreeMap<String, f64>,
    pub stress: ScenarioAnalysis,
    pub stats: PortfolioStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityImpact {
    pub liquidity_multiplier: f64,
    pub spread_widening: f64,
    pub stressed_cost: f64,
    pub cost_impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityReport {
    pub weighted_adv_ratio: f64,
    pub illiquid_weight: f64,
    pub concentration: f64,
    pub missing_adv: Vec<String>,
    pub scenarios: BTreeMap<String, LiquidityImpact>,
}

fn standard_normal() -> Result<Normal> {
    Normal::new(0.0, 1.0)
        .map_err(|e| EngineError::validation(format!("standard normal unavailable: {}", e)))
}

fn check_confidence(confidence: f64) -> Result<()> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(EngineError::validation(format!(
            "confidence must be in (0, 1) (value: {})",
            confidence
        )));
    }
    Ok(())
}

fn require_returns(returns: &[f64]) -> Result<()> {
    if returns.len() < 2 {
        return Err(EngineError::validation(format!(
            "at least two portfolio returns are required (got {})",
            returns.len()
        )));
    }
    Ok(())
}

/// Gaussian VaR: `-(mean + z * std)` with `z = Φ⁻¹(1 - c)`.
pub fn var_parametric(returns: &[f64], confidence: f64) -> Result<f64> {
    check_confidence(confidence)?;
    require_returns(returns)?;
    let z = standard_normal()?.inverse_cdf(1.0 - confidence);
    Ok(-(stats::mean(returns) + z * stats::sample_std(returns)))
}

/// Gaussian expected shortfall: `-(mean - std * φ(z) / (1 - c))`.
pub fn es_parametric(returns: &[f64], confidence: f64) -> Result<f64> {
    check_confidence(confidence)?;
    require_returns(returns)?;
    let normal = standard_normal()?;
    let z = normal.inverse_cdf(1.0 - confidence);
    let tail = normal.pdf(z) / (1.0 - confidence);
    Ok(-(stats::mean(returns) - stats::sample_std(returns) * tail))
}

/// Negated empirical `(1 - c)` quantile, linearly interpolated.
pub fn var_historical(returns: &[f64], confidence: f64) -> Result<f64> {
    check_confidence(confidence)?;
    require_returns(returns)?;
    Ok(-stats::quantile(returns, 1.0 - confidence))
}

/// Negated mean of the returns at or below the historical VaR threshold.
pub fn es_historical(returns: &[f64], confidence: f64) -> Result<f64> {
    check_confidence(confidence)?;
    require_returns(returns)?;
    let threshold = stats::quantile(returns, 1.0 - confidence);
    let tail: Vec<f64> = returns.iter().copied().filter(|r| *r <= threshold).collect();
    Ok(-stats::mean(&tail))
}

pub struct RiskEngine;

impl RiskEngine {
    pub fn assess(
        weights: &PortfolioWeights,
        panel: &AssetPanel,
        params: &RiskParams,
    ) -> Result<RiskReport> {
        if panel.is_empty() {
            return Err(EngineError::no_data());
        }
        if weights.is_empty() {
            return Err(EngineError::validation("weights are empty"));
        }
        let as_of = match params.as_of.or_else(|| panel.last_date()) {
            Some(date) => date,
            None => return Err(EngineError::no_data()),
        };

        let returns = Self::portfolio_returns(weights, panel, as_of, params.lookback)?;
        let securities = panel.security_master(as_of);

        let var_parametric = var_parametric(&returns, params.var_confidence)?;
        let var_historical = var_historical(&returns, params.var_confidence)?;
        let es_parametric = es_parametric(&returns, params.es_confidence)?;
        let es_historical = es_historical(&returns, params.es_confidence)?;

        let factor_exposures = Self::factor_exposures(weights, &securities);
        let sector_exposures = Self::sector_exposures(weights, &securities);
        let scenarios = if params.scenarios.is_empty() {
            StressScenario::defaults()
        } else {
            params.scenarios.clone()
        };
        let stress =
            Self::run_scenario_analysis(weights, &securities, &scenarios, params.drawdown_mode)?;
        let stats = Self::portfolio_stats(&returns)?;

        info!(
            "Risk assessment on {} with {} returns: VaR {:.4} (parametric) / {:.4} (historical)",
            as_of,
            returns.len(),
            var_parametric,
            var_historical
        );

        Ok(RiskReport {
            as_of,
            observations: returns.len(),
            var_confidence: params.var_confidence,
            es_confidence: params.es_confidence,
            var_parametric,
            var_historical,
            es_parametric,
            es_historical,
            factor_exposures,
            sector_exposures,
            stress,
            stats,
        })
    }

    /// Weighted sum of asset returns on dates where every held asset has a return.
    pub fn portfolio_returns(
        weights: &PortfolioWeights,
        panel: &AssetPanel,
        as_of: NaiveDate,
        lookback: usize,
    ) -> Result<Vec<f64>> {
        let symbols: Vec<String> = weights.symbols().cloned().collect();
        for symbol in &symbols {
            if panel.series(symbol).is_empty() {
                return Err(EngineError::validation(format!(
                    "no return history for {}",
                    symbol
                )));
            }
        }
        let loadings: Vec<f64> = symbols.iter().map(|s| weights.get(s)).collect();
        let rows = panel.aligned_returns(&symbols, as_of, lookback);
        let returns: Vec<f64> = rows
            .iter()
            .map(|(_, row)| row.iter().zip(&loadings).map(|(r, w)| r * w).sum())
            .collect();
        require_returns(&returns)?;
        Ok(returns)
    }

    pub fn portfolio_stats(returns: &[f64]) -> Result<PortfolioStats> {
        require_returns(returns)?;
        Ok(PortfolioStats {
            mean_return: stats::mean(returns),
            volatility: stats::sample_std(returns),
            skewness: stats::skewness(returns),
            kurtosis: stats::excess_kurtosis(returns),
            min_return: returns.iter().copied().fold(f64::INFINITY, f64::min),
            max_return: returns.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            var_95: var_historical(returns, 0.95)?,
            var_99: var_historical(returns, 0.99)?,
            es_95: es_historical(returns, 0.95)?,
            es_99: es_historical(returns, 0.99)?,
        })
    }

    pub fn factor_exposures(
        weights: &PortfolioWeights,
        securities: &SecurityMaster,
    ) -> FactorExposures {
        let mut exposures = FactorExposures::default();
        for (symbol, weight) in weights.iter() {
            let betas = match securities.get(symbol).and_then(|info| info.betas) {
                Some(betas) => betas,
                None => {
                    exposures.missing_betas.push(symbol.clone());
                    FactorBetas::default()
                }
            };
            exposures.market += weight * betas.market;
            exposures.size += weight * betas.size;
            exposures.value += weight * betas.value;
            exposures.momentum += weight * betas.momentum;
        }
        if !exposures.missing_betas.is_empty() {
            debug!(
                "{} positions have no stored betas; default loadings used",
                exposures.missing_betas.len()
            );
        }
        exposures
    }

    pub fn sector_exposures(
        weights: &PortfolioWeights,
        securities: &SecurityMaster,
    ) -> BTreeMap<String, f64> {
        let mut exposures = BTreeMap::new();
        for (symbol, weight) in weights.iter() {
            let sector = securities
                .sector_of(symbol)
                .unwrap_or(UNCLASSIFIED_SECTOR)
                .to_string();
            *exposures.entry(sector).or_insert(0.0) += weight;
        }
        exposures
    }

    /// Linear shock of one scenario on the portfolio.
    pub fn scenario_return(
        weights: &PortfolioWeights,
        securities: &SecurityMaster,
        scenario: &StressScenario,
    ) -> f64 {
        weights
            .iter()
            .map(|(symbol, weight)| {
                let info = securities.get(symbol);
                let betas = info.and_then(|i| i.betas).unwrap_or_default();
                let sector_shock = info
                    .and_then(|i| i.sector.as_deref())
                    .and_then(|sector| scenario.sector_shocks.get(sector))
                    .copied()
                    .unwrap_or(0.0);
                let impact = scenario.market_shock * betas.market
                    + sector_shock
                    + scenario.rates_shock * betas.size * RATES_SIZE_SENSITIVITY;
                weight * impact
            })
            .sum()
    }

    pub fn run_scenario_analysis(
        weights: &PortfolioWeights,
        securities: &SecurityMaster,
        scenarios: &[StressScenario],
        drawdown_mode: ScenarioDrawdownMode,
    ) -> Result<ScenarioAnalysis> {
        for scenario in scenarios {
            if !(0.0..=1.0).contains(&scenario.probability) {
                return Err(EngineError::validation(format!(
                    "scenario {} probability must be in [0, 1] (value: {})",
                    scenario.name, scenario.probability
                )));
            }
        }

        let base = Self::factor_exposures(weights, securities);
        let results: Vec<ScenarioResult> = scenarios
            .iter()
            .map(|scenario| {
                let scenario_return = Self::scenario_return(weights, securities, scenario);
                let mut adjusted = base.clone();
                adjusted.market *= 1.0 + scenario.market_shock * 0.1;
                adjusted.size *= 1.0 + scenario.rates_shock * 0.2;
                ScenarioResult {
                    name: scenario.name.clone(),
                    description: scenario.description.clone(),
                    probability: scenario.probability,
                    scenario_return,
                    scenario_loss: (-scenario_return).max(0.0),
                    adjusted_exposures: adjusted,
                }
            })
            .collect();

        let losses: Vec<f64> = results.iter().map(|r| r.scenario_loss).collect();
        let expected_loss = results
            .iter()
            .map(|r| r.scenario_loss * r.probability)
            .sum();
        let worst_case_loss = losses.iter().copied().fold(0.0, f64::max);
        let scenario_var_95 = if losses.is_empty() {
            0.0
        } else {
            stats::quantile(&losses, 0.95)
        };
        let max_drawdown = match drawdown_mode {
            ScenarioDrawdownMode::Independent => None,
            ScenarioDrawdownMode::SequentialPath => {
                warn!("Compounding unrelated stress scenarios into a path for drawdown");
                let mut level = 1.0;
                let path: Vec<f64> = results
                    .iter()
                    .map(|r| {
                        level *= 1.0 + r.scenario_return;
                        level
                    })
                    .collect();
                Some(stats::max_drawdown(&path))
            }
        };

        Ok(ScenarioAnalysis {
            metrics: ScenarioRiskMetrics {
                expected_loss,
                worst_case_loss,
                scenario_var_95,
                max_drawdown,
                drawdown_mode,
                num_scenarios: results.len(),
            },
            results,
        })
    }

    /// ADV-based liquidity profile and trading-cost impact under
    /// normal, stressed and crisis market conditions.
    pub fn liquidity_stress(
        weights: &PortfolioWeights,
        securities: &SecurityMaster,
    ) -> LiquidityReport {
        let mut weighted_adv_ratio = 0.0;
        let mut illiquid_weight = 0.0;
        let mut missing_adv = Vec::new();
        for (symbol, weight) in weights.iter() {
            match securities.get(symbol).and_then(|info| info.adv_ratio) {
                Some(adv) => {
                    weighted_adv_ratio += weight * adv;
                    if adv < ILLIQUID_ADV_RATIO {
                        illiquid_weight += weight;
                    }
                }
                None => missing_adv.push(symbol.clone()),
            }
        }

        let scenarios = [
            ("normal_market", 1.0, 0.0),
            ("stressed_market", 3.0, 0.002),
            ("crisis_market", 10.0, 0.01),
        ]
        .iter()
        .map(|(name, multiplier, spread)| {
            let stressed_cost = BASE_TRADING_COST * multiplier + spread;
            (
                name.to_string(),
                LiquidityImpact {
                    liquidity_multiplier: *multiplier,
                    spread_widening: *spread,
                    stressed_cost,
                    cost_impact: stressed_cost - BASE_TRADING_COST,
                },
            )
        })
        .collect();

        LiquidityReport {
            weighted_adv_ratio,
            illiquid_weight,
            concentration: weights.herfindahl(),
            missing_adv,
            scenarios,
        }
    }
}
