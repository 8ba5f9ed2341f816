use crate::config::EngineSettings;
use crate::covariance::{CovarianceEstimator, ShrinkageConfig};
use crate::error::{EngineError, Result};
use crate::factors::{FactorEngine, ReturnModel, SignalRecipe};
use crate::models::{PortfolioWeights, RebalanceFrequency};
use crate::optimizer::{ConstraintSet, OptimizationMethod, PortfolioOptimizer, View};
use crate::panel::AssetPanel;
use crate::performance::{PerformanceCalculator, PerformanceMetrics};
use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Produces target weights at each rebalance date of a backtest.
pub trait WeightStrategy: Send {
    fn name(&self) -> &str;

    /// `None` means no target yet (for example during warm-up); current positions are held.
    fn target_weights(
        &mut self,
        panel: &AssetPanel,
        as_of: NaiveDate,
    ) -> Result<Option<PortfolioWeights>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    FixedWeights {
        weights: PortfolioWeights,
    },
    EqualWeight {
        /// Every panel symbol priced on the date when empty.
        #[serde(default)]
        symbols: Vec<String>,
    },
    FactorOptimized(FactorStrategyConfig),
}

impl StrategyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyConfig::FixedWeights { .. } => "fixed_weights",
            StrategyConfig::EqualWeight { .. } => "equal_weight",
            StrategyConfig::FactorOptimized(_) => "factor_optimized",
        }
    }

    pub fn build(&self, settings: &EngineSettings) -> Result<Box<dyn WeightStrategy>> {
        match self {
            StrategyConfig::FixedWeights { weights } => {
                if weights.is_empty() {
                    return Err(EngineError::validation("fixed weights are empty"));
                }
                Ok(Box::new(FixedWeightsStrategy {
                    weights: weights.clone(),
                }))
            }
            StrategyConfig::EqualWeight { symbols } => Ok(Box::new(EqualWeightStrategy {
                symbols: symbols.clone(),
            })),
            StrategyConfig::FactorOptimized(config) => {
                Ok(Box::new(FactorOptimizedStrategy::new(config.clone(), settings)?))
            }
        }
    }
}

pub struct FixedWeightsStrategy {
    weights: PortfolioWeights,
}

impl WeightStrategy for FixedWeightsStrategy {
    fn name(&self) -> &str {
        "fixed_weights"
    }

    fn target_weights(&mut self, _panel: &AssetPanel, _as_of: NaiveDate) -> Result<Option<PortfolioWeights>> {
        Ok(Some(self.weights.clone()))
    }
}

pub struct EqualWeightStrategy {
    symbols: Vec<String>,
}

impl WeightStrategy for EqualWeightStrategy {
    fn name(&self) -> &str {
        "equal_weight"
    }

    fn target_weights(&mut self, panel: &AssetPanel, as_of: NaiveDate) -> Result<Option<PortfolioWeights>> {
        let universe: Vec<&String> = if self.symbols.is_empty() {
            panel
                .symbols()
                .iter()
                .filter(|s| panel.price_on_or_before(s, as_of).is_some())
                .collect()
        } else {
            self.symbols.iter().collect()
        };
        if universe.is_empty() {
            return Ok(None);
        }
        let weight = 1.0 / universe.len() as f64;
        Ok(Some(
            universe.into_iter().map(|s| (s.clone(), weight)).collect(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorStrategyConfig {
    pub recipe: SignalRecipe,
    #[serde(default)]
    pub return_model: ReturnModel,
    #[serde(default = "default_covariance_window")]
    pub covariance_window: usize,
    #[serde(default = "default_method")]
    pub method: OptimizationMethod,
    #[serde(default)]
    pub constraints: ConstraintSet,
    /// Black-Litterman views by effective date; the latest on or before a
    /// rebalance date applies.
    #[serde(default)]
    pub views_schedule: BTreeMap<NaiveDate, Vec<View>>,
    /// Panel dates required before the first target; defaults to the longest
    /// factor lookback plus one.
    #[serde(default)]
    pub warmup: Option<usize>,
}

fn default_covariance_window() -> usize {
    252
}

fn default_method() -> OptimizationMethod {
    OptimizationMethod::MeanVariance
}

impl FactorStrategyConfig {
    pub fn new(recipe: SignalRecipe) -> Self {
        Self {
            recipe,
            return_model: ReturnModel::default(),
            covariance_window: default_covariance_window(),
            method: default_method(),
            constraints: ConstraintSet::default(),
            views_schedule: BTreeMap::new(),
            warmup: None,
        }
    }

    fn warmup_dates(&self) -> usize {
        self.warmup.unwrap_or_else(|| {
            self.recipe
                .factors
                .values()
                .map(|c| c.lookback)
                .max()
                .unwrap_or(0)
                + 1
        })
    }
}

/// Signals, then expected returns, then covariance, then the optimizer, at every rebalance.
pub struct FactorOptimizedStrategy {
    config: FactorStrategyConfig,
    optimizer: PortfolioOptimizer,
}

impl FactorOptimizedStrategy {
    pub fn new(config: FactorStrategyConfig, settings: &EngineSettings) -> Result<Self> {
        if config.recipe.factors.is_empty() {
            return Err(EngineError::validation("recipe names no factors"));
        }
        if config.covariance_window < 2 {
            return Err(EngineError::validation(format!(
                "covariance window must be at least 2 (value: {})",
                config.covariance_window
            )));
        }
        Ok(Self {
            config,
            optimizer: PortfolioOptimizer::new(settings),
        })
    }

    fn method_for(&self, as_of: NaiveDate) -> OptimizationMethod {
        match &self.config.method {
            OptimizationMethod::BlackLitterman(params) if !self.config.views_schedule.is_empty() => {
                let mut params = params.clone();
                match self.config.views_schedule.range(..=as_of).next_back() {
                    Some((effective, views)) => {
                        if *effective < as_of {
                            info!("Carrying forward views from {} to {}", effective, as_of);
                        }
                        params.views = views.clone();
                    }
                    None => debug!("No views effective on {}", as_of),
                }
                OptimizationMethod::BlackLitterman(params)
            }
            method => method.clone(),
        }
    }
}

impl WeightStrategy for FactorOptimizedStrategy {
    fn name(&self) -> &str {
        "factor_optimized"
    }

    fn target_weights(&mut self, panel: &AssetPanel, as_of: NaiveDate) -> Result<Option<PortfolioWeights>> {
        let history = panel.dates_through(as_of).len();
        if history < self.config.warmup_dates() {
            debug!("{} dates of history on {}; still warming up", history, as_of);
            return Ok(None);
        }

        let mut recipe = self.config.recipe.clone();
        recipe.as_of = Some(as_of);
        recipe.previous_signal = None;
        let signals = FactorEngine::compute(panel, &recipe)?;
        let expected = self.config.return_model.expected_returns(&signals.combined);
        let symbols: Vec<String> = expected.keys().cloned().collect();

        // Shrinkage is applied once, by the optimizer's constraint flag.
        let covariance = CovarianceEstimator::estimate_for(
            panel,
            &symbols,
            as_of,
            self.config.covariance_window,
            ShrinkageConfig::Disabled,
        )?;
        let securities = panel.security_master(as_of);
        let method = self.method_for(as_of);
        let result = self.optimizer.optimize(
            &expected,
            &covariance,
            &self.config.constraints,
            &method,
            &securities,
        )?;
        Ok(Some(result.weights))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalBacktestParams {
    pub frequency: RebalanceFrequency,
    /// Number of buckets; the long leg is the top bucket, the short leg the bottom.
    pub quantiles: usize,
    pub start_date: Option<NaiveDate>,
    pub risk_free_rate: f64,
}

impl Default for SignalBacktestParams {
    fn default() -> Self {
        Self {
            frequency: RebalanceFrequency::Monthly,
            quantiles: 5,
            start_date: None,
            risk_free_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub long_return: f64,
    pub short_return: f64,
    pub spread: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBacktestResult {
    pub periods: Vec<SignalPeriod>,
    pub performance: PerformanceMetrics,
}

/// Long top bucket, short bottom bucket, equal weight, held between rebalance dates.
pub fn backtest_signals(
    panel: &AssetPanel,
    recipe: &SignalRecipe,
    params: &SignalBacktestParams,
) -> Result<SignalBacktestResult> {
    if panel.is_empty() {
        return Err(EngineError::no_data());
    }
    if params.quantiles < 2 {
        return Err(EngineError::validation(format!(
            "quantiles must be at least 2 (value: {})",
            params.quantiles
        )));
    }
    let dates: Vec<NaiveDate> = panel
        .dates()
        .iter()
        .copied()
        .filter(|d| params.start_date.map(|start| *d >= start).unwrap_or(true))
        .collect();
    let schedule = params.frequency.schedule(&dates);
    if schedule.len() < 2 {
        return Err(EngineError::validation(
            "signal backtest needs at least two rebalance dates",
        ));
    }

    let mut periods = Vec::with_capacity(schedule.len() - 1);
    for window in schedule.windows(2) {
        let (start, end) = (window[0], window[1]);
        let mut step = recipe.clone();
        step.as_of = Some(start);
        step.previous_signal = None;
        let signal = FactorEngine::compute(panel, &step)?;

        let mut ranked: Vec<(&String, f64)> = signal
            .combined
            .scores
            .iter()
            .map(|(s, v)| (s, *v))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        let bucket = ranked.len() / params.quantiles;
        if bucket == 0 {
            return Err(EngineError::validation(format!(
                "{} scored symbols cannot fill {} quantiles on {}",
                ranked.len(),
                params.quantiles,
                start
            )));
        }

        let leg_return = |leg: &[(&String, f64)]| -> f64 {
            let returns: Vec<f64> = leg
                .iter()
                .filter_map(|(symbol, _)| {
                    let from = panel.price_on_or_before(symbol, start)?;
                    let to = panel.price_on_or_before(symbol, end)?;
                    Some(to / from - 1.0)
                })
                .collect();
            crate::stats::mean(&returns)
        };
        let short_return = leg_return(&ranked[..bucket]);
        let long_return = leg_return(&ranked[ranked.len() - bucket..]);
        periods.push(SignalPeriod {
            start,
            end,
            long_return,
            short_return,
            spread: long_return - short_return,
        });
    }

    let spreads: Vec<f64> = periods.iter().map(|p| p.spread).collect();
    let performance = PerformanceCalculator::from_returns(
        &spreads,
        params.frequency.periods_per_year(),
        params.risk_free_rate,
    );
    info!(
        "Signal backtest over {} periods: annualized spread {:.4}",
        periods.len(),
        performance.annualized_return
    );
    Ok(SignalBacktestResult {
        periods,
        performance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::FactorKind;
    use crate::models::{AssetObservation, Fundamentals};
    use chrono::Duration;

    fn observation(symbol: &str, date: NaiveDate, close: f64) -> AssetObservation {
        AssetObservation {
            symbol: symbol.to_string(),
            date,
            close,
            daily_return: None,
            volume: 1_000.0,
            market_cap: 1e9,
            sector: Some("Technology".to_string()),
            country: Some("US".to_string()),
            fundamentals: Fundamentals::default(),
            betas: None,
            esg_score: None,
            adv_ratio: None,
        }
    }

    /// Ten symbols with constant daily growth rates spread around zero.
    fn trending_panel(days: i64) -> AssetPanel {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut rows = Vec::new();
        for k in 0..10 {
            let growth = 1.0 + (k as f64 - 4.5) * 0.001;
            let mut close = 100.0;
            for day in 0..days {
                rows.push(observation(&format!("S{}", k), start + Duration::days(day), close));
                close *= growth;
            }
        }
        AssetPanel::new(rows).unwrap()
    }

    #[test]
    fn equal_weight_uses_priced_symbols() {
        let panel = trending_panel(5);
        let mut strategy = StrategyConfig::EqualWeight { symbols: Vec::new() }
            .build(&EngineSettings::default())
            .unwrap();
        let weights = strategy
            .target_weights(&panel, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(weights.len(), 10);
        assert!((weights.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_fixed_weights_are_rejected() {
        let config = StrategyConfig::FixedWeights {
            weights: PortfolioWeights::new(),
        };
        assert!(config.build(&EngineSettings::default()).is_err());
    }

    #[test]
    fn factor_strategy_waits_for_history() {
        let panel = trending_panel(40);
        let mut recipe = SignalRecipe::from_names(&["momentum"]).unwrap().with_lookback(10);
        recipe.pipeline.sector_neutralize = false;
        recipe.pipeline.size_neutralize = false;
        let mut config = FactorStrategyConfig::new(recipe);
        config.covariance_window = 20;
        config.constraints.max_position = 0.3;
        config.method = OptimizationMethod::RiskParity;
        let mut strategy = FactorOptimizedStrategy::new(config, &EngineSettings::default()).unwrap();

        let early = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert!(strategy.target_weights(&panel, early).unwrap().is_none());
    }

    #[test]
    fn views_are_carried_forward() {
        let recipe = SignalRecipe::from_names(&["momentum"]).unwrap();
        let mut config = FactorStrategyConfig::new(recipe);
        config.method = "black_litterman".parse().unwrap();
        let effective = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        config.views_schedule.insert(
            effective,
            vec![View {
                assets: [("S1".to_string(), 1.0)].into(),
                expected_return: 0.1,
                uncertainty: 0.01,
            }],
        );
        let strategy = FactorOptimizedStrategy::new(config, &EngineSettings::default()).unwrap();
        let later = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        match strategy.method_for(later) {
            OptimizationMethod::BlackLitterman(params) => assert_eq!(params.views.len(), 1),
            other => panic!("unexpected method {}", other),
        }
        let before = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        match strategy.method_for(before) {
            OptimizationMethod::BlackLitterman(params) => assert!(params.views.is_empty()),
            other => panic!("unexpected method {}", other),
        }
    }

    #[test]
    fn momentum_quantile_backtest_earns_the_spread() {
        let panel = trending_panel(120);
        let mut recipe = SignalRecipe::from_names(&[FactorKind::Momentum.as_str()])
            .unwrap()
            .with_lookback(5);
        recipe.pipeline.sector_neutralize = false;
        recipe.pipeline.size_neutralize = false;
        let params = SignalBacktestParams {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 10),
            ..Default::default()
        };
        let result = backtest_signals(&panel, &recipe, &params).unwrap();
        assert!(!result.periods.is_empty());
        assert!(result.periods.iter().all(|p| p.spread > 0.0));
        assert!((result.performance.win_rate - 1.0).abs() < 1e-12);
    }
}
