use crate::config::{EngineSettings, SolverSettings};
use crate::covariance::CovarianceMatrix;
use crate::error::{EngineError, Result, SolverStatus};
use crate::factors::{FactorSignal, ReturnModel};
use crate::models::{PortfolioMode, PortfolioWeights, SecurityMaster, UNCLASSIFIED_SECTOR};
use crate::solver::{self, FeasibleSet, Halfspace, Objective};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const CHECK_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintSet {
    pub mode: PortfolioMode,
    pub max_position: f64,
    /// Largest short weight magnitude in long-short mode; defaults to `max_position`.
    pub max_short_position: Option<f64>,
    /// Target sum of weights in long-short mode. Long-only portfolios always sum to 1.
    pub budget: f64,
    pub max_sector_weight: Option<f64>,
    pub min_sector_weight: Option<f64>,
    /// Per-sector caps; override `max_sector_weight` for the sectors they name.
    pub sector_caps: BTreeMap<String, f64>,
    pub max_gross_exposure: Option<f64>,
    pub max_net_exposure: Option<f64>,
    pub max_beta: Option<f64>,
    /// Shrink the supplied covariance toward constant correlation before solving,
    /// unless it already carries a shrinkage intensity.
    pub shrinkage: bool,
}

impl Default for ConstraintSet {
    fn default() -> Self {
        Self {
            mode: PortfolioMode::LongOnly,
            max_position: 0.05,
            max_short_position: None,
            budget: 1.0,
            max_sector_weight: None,
            min_sector_weight: None,
            sector_caps: BTreeMap::new(),
            max_gross_exposure: None,
            max_net_exposure: None,
            max_beta: None,
            shrinkage: true,
        }
    }
}

impl ConstraintSet {
    pub fn budget(&self) -> f64 {
        match self.mode {
            PortfolioMode::LongOnly => 1.0,
            PortfolioMode::LongShort => self.budget,
        }
    }

    pub fn sector_cap(&self, sector: &str) -> Option<f64> {
        self.sector_caps
            .get(sector)
            .copied()
            .or(self.max_sector_weight)
    }

    fn has_sector_limits(&self) -> bool {
        !self.sector_caps.is_empty() || self.max_sector_weight.is_some()
    }
}

/// One Black-Litterman view: `sum(assets[i] * mu[i]) = expected_return`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub assets: BTreeMap<String, f64>,
    pub expected_return: f64,
    /// Variance of the view (diagonal entry of omega).
    #[serde(default = "default_view_uncertainty")]
    pub uncertainty: f64,
}

fn default_view_uncertainty() -> f64 {
    0.01
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackLittermanParams {
    pub risk_aversion: f64,
    pub tau: f64,
    pub views: Vec<View>,
    /// Equilibrium weights; market-cap weights from the security master when absent.
    pub market_weights: Option<BTreeMap<String, f64>>,
}

impl Default for BlackLittermanParams {
    fn default() -> Self {
        Self {
            risk_aversion: 3.0,
            tau: 0.05,
            views: Vec::new(),
            market_weights: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum OptimizationMethod {
    MeanVariance,
    BlackLitterman(BlackLittermanParams),
    RiskParity,
}

impl OptimizationMethod {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizationMethod::MeanVariance => "mean_variance",
            OptimizationMethod::BlackLitterman(_) => "black_litterman",
            OptimizationMethod::RiskParity => "risk_parity",
        }
    }
}

impl fmt::Display for OptimizationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OptimizationMethod {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "mean_variance" | "mv" => Ok(OptimizationMethod::MeanVariance),
            "black_litterman" | "bl" => {
                Ok(OptimizationMethod::BlackLitterman(BlackLittermanParams::default()))
            }
            "risk_parity" | "rp" => Ok(OptimizationMethod::RiskParity),
            _ => Err(EngineError::validation(format!(
                "unknown optimization method: {}",
                raw
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub herfindahl: f64,
    pub num_positions: usize,
    pub gross_exposure: f64,
    pub net_exposure: f64,
    pub portfolio_beta: Option<f64>,
    pub sector_exposures: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverReport {
    pub status: SolverStatus,
    pub iterations: usize,
    pub objective_value: f64,
    /// Return and volatility of the solution under the inputs the solver used.
    pub expected_return: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackLittermanPosterior {
    pub equilibrium_returns: BTreeMap<String, f64>,
    pub posterior_returns: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub method: String,
    pub weights: PortfolioWeights,
    pub metrics: PortfolioMetrics,
    pub constraint_checks: BTreeMap<String, bool>,
    pub solver: SolverReport,
    pub posterior: Option<BlackLittermanPosterior>,
    /// Set when the requested method fell back to another formulation.
    pub fallback: Option<String>,
}

impl OptimizationResult {
    pub fn failed_checks(&self) -> Vec<String> {
        self.constraint_checks
            .iter()
            .filter(|(_, passed)| !**passed)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Negative Sharpe ratio `-(mu.w - rf) / sqrt(w' S w)`.
struct NegativeSharpe<'a> {
    mu: &'a DVector<f64>,
    sigma: &'a DMatrix<f64>,
    risk_free_rate: f64,
}

impl Objective for NegativeSharpe<'_> {
    fn value(&self, w: &DVector<f64>) -> f64 {
        let volatility = w.dot(&(self.sigma * w)).max(1e-18).sqrt();
        -(self.mu.dot(w) - self.risk_free_rate) / volatility
    }

    fn gradient(&self, w: &DVector<f64>) -> DVector<f64> {
        let sigma_w = self.sigma * w;
        let variance = w.dot(&sigma_w).max(1e-18);
        let volatility = variance.sqrt();
        let excess = self.mu.dot(w) - self.risk_free_rate;
        -(self.mu / volatility - sigma_w * (excess / (variance * volatility)))
    }
}

/// Sum of squared deviations of risk contributions from `volatility / n`.
struct RiskParityObjective<'a> {
    sigma: &'a DMatrix<f64>,
}

impl RiskParityObjective<'_> {
    fn contributions(&self, w: &DVector<f64>) -> (DVector<f64>, DVector<f64>, f64) {
        let sigma_w = self.sigma * w;
        let volatility = w.dot(&sigma_w).max(1e-18).sqrt();
        let contributions = w.component_mul(&sigma_w) / volatility;
        (contributions, sigma_w, volatility)
    }
}

impl Objective for RiskParityObjective<'_> {
    fn value(&self, w: &DVector<f64>) -> f64 {
        let (contributions, _, volatility) = self.contributions(w);
        let target = volatility / w.len() as f64;
        contributions.map(|c| (c - target).powi(2)).sum()
    }

    fn gradient(&self, w: &DVector<f64>) -> DVector<f64> {
        let n = w.len() as f64;
        let (contributions, sigma_w, volatility) = self.contributions(w);
        let deviations = contributions.add_scalar(-volatility / n);
        let weighted = deviations.component_mul(w);
        let cross = self.sigma * &weighted;
        let rc_term = deviations.dot(&contributions);
        let total_deviation = deviations.sum();

        let mut gradient = deviations.component_mul(&sigma_w) / volatility;
        gradient += cross / volatility;
        gradient -= &sigma_w * (rc_term / (volatility * volatility));
        gradient -= &sigma_w * (total_deviation / (n * volatility));
        gradient * 2.0
    }
}

/// Dense inputs aligned to the covariance symbol order.
struct Problem {
    symbols: Vec<String>,
    mu: DVector<f64>,
    sigma: DMatrix<f64>,
}

pub struct PortfolioOptimizer {
    solver: SolverSettings,
    risk_free_rate: f64,
    shrinkage_intensity: f64,
}

impl Default for PortfolioOptimizer {
    fn default() -> Self {
        Self::new(&EngineSettings::default())
    }
}

impl PortfolioOptimizer {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            solver: settings.solver,
            risk_free_rate: settings.risk_free_rate,
            shrinkage_intensity: settings.shrinkage_intensity,
        }
    }

    pub fn optimize(
        &self,
        expected_returns: &BTreeMap<String, f64>,
        covariance: &CovarianceMatrix,
        constraints: &ConstraintSet,
        method: &OptimizationMethod,
        securities: &SecurityMaster,
    ) -> Result<OptimizationResult> {
        validate_constraints(constraints)?;
        let covariance = if constraints.shrinkage && covariance.shrinkage_intensity <= 0.0 {
            covariance.shrunk(self.shrinkage_intensity)
        } else {
            if constraints.shrinkage {
                debug!(
                    "Covariance already shrunk (intensity {:.3}); not shrinking again",
                    covariance.shrinkage_intensity
                );
            }
            covariance.clone()
        };
        let problem = build_problem(expected_returns, &covariance)?;

        let (outcome, used_mu, used_sigma, posterior, fallback) = match method {
            OptimizationMethod::MeanVariance => {
                let outcome = self.solve_mean_variance(&problem.mu, &problem.sigma, &problem, constraints, securities)?;
                (outcome, problem.mu.clone(), problem.sigma.clone(), None, None)
            }
            OptimizationMethod::BlackLitterman(params) => {
                if params.views.is_empty() {
                    warn!("Black-Litterman called without views; using mean-variance on the input returns");
                    let outcome = self.solve_mean_variance(&problem.mu, &problem.sigma, &problem, constraints, securities)?;
                    (
                        outcome,
                        problem.mu.clone(),
                        problem.sigma.clone(),
                        None,
                        Some("no views supplied; mean_variance on input expected returns".to_string()),
                    )
                } else {
                    let (pi, mu_bl, sigma_bl) = black_litterman_posterior(&problem, params, securities)?;
                    let outcome = self.solve_mean_variance(&mu_bl, &sigma_bl, &problem, constraints, securities)?;
                    let posterior = BlackLittermanPosterior {
                        equilibrium_returns: to_map(&problem.symbols, &pi),
                        posterior_returns: to_map(&problem.symbols, &mu_bl),
                    };
                    (outcome, mu_bl, sigma_bl, Some(posterior), None)
                }
            }
            OptimizationMethod::RiskParity => {
                let outcome = self.solve_risk_parity(&problem, constraints)?;
                (outcome, problem.mu.clone(), problem.sigma.clone(), None, None)
            }
        };

        info!(
            "{} optimization over {} assets: {} after {} iterations",
            method.name(),
            problem.symbols.len(),
            outcome.status,
            outcome.iterations
        );

        let weights = to_weights(&problem.symbols, &outcome.weights);
        let used_returns = to_map(&problem.symbols, &used_mu);
        let used_covariance = CovarianceMatrix {
            symbols: problem.symbols.clone(),
            matrix: used_sigma.clone(),
            shrinkage_intensity: covariance.shrinkage_intensity,
            observations: covariance.observations,
            as_of: covariance.as_of,
        };
        let metrics = calculate_portfolio_metrics(
            &weights,
            &used_returns,
            &used_covariance,
            securities,
            self.risk_free_rate,
        )?;
        let constraint_checks = check_constraints(&weights, constraints, securities);

        let solver = SolverReport {
            status: outcome.status,
            iterations: outcome.iterations,
            objective_value: outcome.objective,
            expected_return: used_mu.dot(&outcome.weights),
            volatility: outcome.weights.dot(&(&used_sigma * &outcome.weights)).max(0.0).sqrt(),
        };

        Ok(OptimizationResult {
            method: method.name().to_string(),
            weights,
            metrics,
            constraint_checks,
            solver,
            posterior,
            fallback,
        })
    }

    /// Like [`optimize`](Self::optimize) but a failed advisory check is an error.
    pub fn optimize_strict(
        &self,
        expected_returns: &BTreeMap<String, f64>,
        covariance: &CovarianceMatrix,
        constraints: &ConstraintSet,
        method: &OptimizationMethod,
        securities: &SecurityMaster,
    ) -> Result<OptimizationResult> {
        let result = self.optimize(expected_returns, covariance, constraints, method, securities)?;
        let failed = result.failed_checks();
        if !failed.is_empty() {
            return Err(EngineError::ConstraintViolation { failed });
        }
        Ok(result)
    }

    /// Runs every method on the same inputs; each failure is reported on its own.
    pub fn compare_methods(
        &self,
        expected_returns: &BTreeMap<String, f64>,
        covariance: &CovarianceMatrix,
        constraints: &ConstraintSet,
        black_litterman: &BlackLittermanParams,
        securities: &SecurityMaster,
    ) -> BTreeMap<String, std::result::Result<OptimizationResult, String>> {
        let methods = [
            OptimizationMethod::MeanVariance,
            OptimizationMethod::BlackLitterman(black_litterman.clone()),
            OptimizationMethod::RiskParity,
        ];
        methods
            .iter()
            .map(|method| {
                let result = self
                    .optimize(expected_returns, covariance, constraints, method, securities)
                    .map_err(|e| e.to_string());
                (method.name().to_string(), result)
            })
            .collect()
    }

    fn solve_mean_variance(
        &self,
        mu: &DVector<f64>,
        sigma: &DMatrix<f64>,
        problem: &Problem,
        constraints: &ConstraintSet,
        securities: &SecurityMaster,
    ) -> Result<solver::SolverOutcome> {
        let set = full_feasible_set(problem, constraints, securities)?;
        let objective = NegativeSharpe {
            mu,
            sigma,
            risk_free_rate: 0.0,
        };
        let start = DVector::from_element(problem.symbols.len(), constraints.budget() / problem.symbols.len() as f64);
        solver::minimize(&objective, &set, &start, &self.solver)
    }

    /// Risk parity honours budget, long-only and max-position only.
    fn solve_risk_parity(
        &self,
        problem: &Problem,
        constraints: &ConstraintSet,
    ) -> Result<solver::SolverOutcome> {
        let n = problem.symbols.len();
        let set = FeasibleSet::new(
            DVector::zeros(n),
            DVector::from_element(n, constraints.max_position),
            1.0,
        )?;
        let objective = RiskParityObjective {
            sigma: &problem.sigma,
        };
        let start = DVector::from_element(n, 1.0 / n as f64);
        solver::minimize(&objective, &set, &start, &self.solver)
    }
}

fn validate_constraints(constraints: &ConstraintSet) -> Result<()> {
    if !constraints.max_position.is_finite() || constraints.max_position <= 0.0 {
        return Err(EngineError::validation(format!(
            "max_position must be positive (value: {})",
            constraints.max_position
        )));
    }
    if let Some(short) = constraints.max_short_position {
        if !short.is_finite() || short < 0.0 {
            return Err(EngineError::validation(format!(
                "max_short_position must be a non-negative magnitude (value: {})",
                short
            )));
        }
    }
    for (sector, cap) in &constraints.sector_caps {
        if !cap.is_finite() {
            return Err(EngineError::validation(format!(
                "sector cap for {} must be finite",
                sector
            )));
        }
    }
    Ok(())
}

fn build_problem(
    expected_returns: &BTreeMap<String, f64>,
    covariance: &CovarianceMatrix,
) -> Result<Problem> {
    if covariance.is_empty() {
        return Err(EngineError::validation("covariance matrix has no assets"));
    }
    let mut mu = DVector::zeros(covariance.len());
    for (i, symbol) in covariance.symbols.iter().enumerate() {
        let value = expected_returns.get(symbol).copied().ok_or_else(|| {
            EngineError::validation(format!("missing expected return for {}", symbol))
        })?;
        if !value.is_finite() {
            return Err(EngineError::validation(format!(
                "expected return for {} is not finite",
                symbol
            )));
        }
        mu[i] = value;
    }
    let ignored = expected_returns
        .keys()
        .filter(|s| covariance.index_of(s).is_none())
        .count();
    if ignored > 0 {
        debug!("{} expected returns have no covariance row and are ignored", ignored);
    }
    Ok(Problem {
        symbols: covariance.symbols.clone(),
        mu,
        sigma: covariance.matrix.clone(),
    })
}

fn full_feasible_set(
    problem: &Problem,
    constraints: &ConstraintSet,
    securities: &SecurityMaster,
) -> Result<FeasibleSet> {
    let n = problem.symbols.len();
    let lower = match constraints.mode {
        PortfolioMode::LongOnly => DVector::zeros(n),
        PortfolioMode::LongShort => DVector::from_element(
            n,
            -constraints
                .max_short_position
                .unwrap_or(constraints.max_position),
        ),
    };
    let upper = DVector::from_element(n, constraints.max_position);
    let budget = constraints.budget();
    let mut set = FeasibleSet::new(lower, upper, budget)?;

    if constraints.has_sector_limits() || constraints.min_sector_weight.is_some() {
        let mut members: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, symbol) in problem.symbols.iter().enumerate() {
            if let Some(sector) = securities.sector_of(symbol) {
                members.entry(sector.to_string()).or_default().push(i);
            }
        }
        for (sector, indices) in &members {
            let indicator = DVector::from_fn(n, |i, _| if indices.contains(&i) { 1.0 } else { 0.0 });
            if let Some(cap) = constraints.sector_cap(sector) {
                set.add_halfspace(Halfspace {
                    label: format!("sector cap {}", sector),
                    normal: indicator.clone(),
                    bound: cap,
                });
            }
            if let Some(floor) = constraints.min_sector_weight {
                set.add_halfspace(Halfspace {
                    label: format!("sector floor {}", sector),
                    normal: -indicator,
                    bound: -floor,
                });
            }
        }
    }

    if let Some(max_beta) = constraints.max_beta {
        let betas = DVector::from_iterator(
            n,
            problem
                .symbols
                .iter()
                .map(|symbol| {
                    securities.market_beta(symbol).ok_or_else(|| {
                        EngineError::validation(format!(
                            "max_beta constraint needs a market beta for {}",
                            symbol
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?,
        );
        set.add_halfspace(Halfspace {
            label: "max beta".to_string(),
            normal: betas,
            bound: max_beta,
        });
    }

    if let Some(max_net) = constraints.max_net_exposure {
        if budget.abs() > max_net + CHECK_TOLERANCE {
            return Err(EngineError::numerical(
                SolverStatus::Infeasible,
                format!("budget {} exceeds max net exposure {}", budget, max_net),
            ));
        }
    }
    if let Some(max_gross) = constraints.max_gross_exposure {
        if max_gross + CHECK_TOLERANCE < budget.abs() {
            return Err(EngineError::numerical(
                SolverStatus::Infeasible,
                format!("max gross exposure {} is below the budget {}", max_gross, budget),
            ));
        }
        if constraints.mode == PortfolioMode::LongShort {
            set.set_l1_radius(max_gross);
        }
    }

    Ok(set)
}

/// Equilibrium returns, posterior mean and posterior covariance.
fn black_litterman_posterior(
    problem: &Problem,
    params: &BlackLittermanParams,
    securities: &SecurityMaster,
) -> Result<(DVector<f64>, DVector<f64>, DMatrix<f64>)> {
    let n = problem.symbols.len();
    if params.tau <= 0.0 || params.risk_aversion <= 0.0 {
        return Err(EngineError::validation(
            "Black-Litterman tau and risk_aversion must be positive",
        ));
    }
    let market_weights = market_weights(problem, params, securities)?;
    let pi = &problem.sigma * &market_weights * params.risk_aversion;

    let k = params.views.len();
    let mut pick = DMatrix::zeros(k, n);
    let mut view_returns = DVector::zeros(k);
    let mut omega_inverse = DMatrix::zeros(k, k);
    for (row, view) in params.views.iter().enumerate() {
        if view.uncertainty <= 0.0 || !view.uncertainty.is_finite() {
            return Err(EngineError::validation(format!(
                "view {} must have a positive uncertainty",
                row
            )));
        }
        for (symbol, loading) in &view.assets {
            let column = problem
                .symbols
                .iter()
                .position(|s| s == symbol)
                .ok_or_else(|| {
                    EngineError::validation(format!("view {} references unknown asset {}", row, symbol))
                })?;
            pick[(row, column)] = *loading;
        }
        view_returns[row] = view.expected_return;
        omega_inverse[(row, row)] = 1.0 / view.uncertainty;
    }

    let singular = |what: &str| {
        EngineError::numerical(SolverStatus::Singular, format!("{} is not invertible", what))
    };
    let tau_sigma_inverse = (&problem.sigma * params.tau)
        .try_inverse()
        .ok_or_else(|| singular("tau * covariance"))?;
    let precision = &tau_sigma_inverse + pick.transpose() * &omega_inverse * &pick;
    let posterior_covariance = precision
        .try_inverse()
        .ok_or_else(|| singular("posterior precision"))?;
    let mu_bl = &posterior_covariance
        * (&tau_sigma_inverse * &pi + pick.transpose() * &omega_inverse * &view_returns);
    let sigma_bl = &problem.sigma + &posterior_covariance;
    Ok((pi, mu_bl, sigma_bl))
}

fn market_weights(
    problem: &Problem,
    params: &BlackLittermanParams,
    securities: &SecurityMaster,
) -> Result<DVector<f64>> {
    let n = problem.symbols.len();
    let raw: Vec<f64> = match &params.market_weights {
        Some(weights) => problem
            .symbols
            .iter()
            .map(|s| weights.get(s).copied().unwrap_or(0.0))
            .collect(),
        None => {
            let caps: Option<Vec<f64>> = problem
                .symbols
                .iter()
                .map(|s| securities.get(s).and_then(|info| info.market_cap))
                .collect();
            match caps {
                Some(caps) => caps,
                None => {
                    warn!("Market caps unavailable for some assets; using equal equilibrium weights");
                    vec![1.0; n]
                }
            }
        }
    };
    let total: f64 = raw.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return Err(EngineError::validation(
            "market weights must sum to a positive number",
        ));
    }
    Ok(DVector::from_iterator(n, raw.into_iter().map(|w| w / total)))
}

fn to_map(symbols: &[String], values: &DVector<f64>) -> BTreeMap<String, f64> {
    symbols.iter().cloned().zip(values.iter().copied()).collect()
}

fn to_weights(symbols: &[String], values: &DVector<f64>) -> PortfolioWeights {
    symbols.iter().cloned().zip(values.iter().copied()).collect()
}

/// Annual expected returns implied by a combined signal.
pub fn expected_returns_from_signal(
    signal: &FactorSignal,
    model: &ReturnModel,
) -> BTreeMap<String, f64> {
    model.expected_returns(signal)
}

/// Expected return, volatility, Sharpe ratio, concentration and exposures of a weight vector.
pub fn calculate_portfolio_metrics(
    weights: &PortfolioWeights,
    expected_returns: &BTreeMap<String, f64>,
    covariance: &CovarianceMatrix,
    securities: &SecurityMaster,
    risk_free_rate: f64,
) -> Result<PortfolioMetrics> {
    let w = DVector::from_iterator(
        covariance.len(),
        covariance.symbols.iter().map(|s| weights.get(s)),
    );
    let expected_return: f64 = weights
        .iter()
        .map(|(symbol, weight)| {
            expected_returns
                .get(symbol)
                .map(|r| r * weight)
                .ok_or_else(|| {
                    EngineError::validation(format!("missing expected return for {}", symbol))
                })
        })
        .sum::<Result<f64>>()?;
    let volatility = covariance.portfolio_variance(&w).max(0.0).sqrt();
    let sharpe_ratio = if volatility > 0.0 {
        (expected_return - risk_free_rate) / volatility
    } else {
        0.0
    };

    let mut sector_exposures = BTreeMap::new();
    let mut beta = Some(0.0);
    for (symbol, weight) in weights.iter() {
        let sector = securities
            .sector_of(symbol)
            .unwrap_or(UNCLASSIFIED_SECTOR)
            .to_string();
        *sector_exposures.entry(sector).or_insert(0.0) += weight;
        beta = match (beta, securities.market_beta(symbol)) {
            (Some(total), Some(b)) => Some(total + b * weight),
            _ => None,
        };
    }

    Ok(PortfolioMetrics {
        expected_return,
        volatility,
        sharpe_ratio,
        herfindahl: weights.herfindahl(),
        num_positions: weights.active_positions(),
        gross_exposure: weights.gross_exposure(),
        net_exposure: weights.net_exposure(),
        portfolio_beta: beta,
        sector_exposures,
    })
}

/// Pass/fail per constraint category, recomputed from the weights alone.
pub fn check_constraints(
    weights: &PortfolioWeights,
    constraints: &ConstraintSet,
    securities: &SecurityMaster,
) -> BTreeMap<String, bool> {
    let mut checks = BTreeMap::new();
    checks.insert(
        "budget".to_string(),
        (weights.sum() - constraints.budget()).abs() <= CHECK_TOLERANCE,
    );
    if constraints.mode == PortfolioMode::LongOnly {
        checks.insert(
            "long_only".to_string(),
            weights.iter().all(|(_, w)| *w >= -CHECK_TOLERANCE),
        );
    } else {
        let max_short = constraints
            .max_short_position
            .unwrap_or(constraints.max_position);
        checks.insert(
            "max_short".to_string(),
            weights.iter().all(|(_, w)| *w >= -max_short - CHECK_TOLERANCE),
        );
    }
    checks.insert(
        "max_position".to_string(),
        weights
            .iter()
            .all(|(_, w)| *w <= constraints.max_position + CHECK_TOLERANCE),
    );

    if constraints.has_sector_limits() || constraints.min_sector_weight.is_some() {
        let mut exposures: BTreeMap<&str, f64> = BTreeMap::new();
        for (symbol, weight) in weights.iter() {
            if let Some(sector) = securities.sector_of(symbol) {
                *exposures.entry(sector).or_insert(0.0) += weight;
            }
        }
        if constraints.has_sector_limits() {
            checks.insert(
                "sector_caps".to_string(),
                exposures.iter().all(|(sector, exposure)| {
                    constraints
                        .sector_cap(sector)
                        .map(|cap| *exposure <= cap + CHECK_TOLERANCE)
                        .unwrap_or(true)
                }),
            );
        }
        if let Some(floor) = constraints.min_sector_weight {
            checks.insert(
                "sector_floor".to_string(),
                exposures
                    .values()
                    .all(|exposure| *exposure >= floor - CHECK_TOLERANCE),
            );
        }
    }

    if let Some(max_beta) = constraints.max_beta {
        let beta: Option<f64> = weights
            .iter()
            .map(|(symbol, weight)| securities.market_beta(symbol).map(|b| b * weight))
            .sum();
        checks.insert(
            "max_beta".to_string(),
            beta.map(|b| b <= max_beta + CHECK_TOLERANCE).unwrap_or(false),
        );
    }
    if let Some(max_gross) = constraints.max_gross_exposure {
        checks.insert(
            "gross_exposure".to_string(),
            weights.gross_exposure() <= max_gross + CHECK_TOLERANCE,
        );
    }
    if let Some(max_net) = constraints.max_net_exposure {
        checks.insert(
            "net_exposure".to_string(),
            weights.net_exposure().abs() <= max_net + CHECK_TOLERANCE,
        );
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FactorBetas, SecurityInfo};

    fn covariance(symbols: &[&str], matrix: Vec<f64>) -> CovarianceMatrix {
        let n = symbols.len();
        CovarianceMatrix::from_matrix(
            symbols.iter().map(|s| s.to_string()).collect(),
            DMatrix::from_row_slice(n, n, &matrix),
        )
        .unwrap()
    }

    fn returns(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(s, r)| (s.to_string(), *r)).collect()
    }

    fn unconstrained() -> ConstraintSet {
        ConstraintSet {
            max_position: 1.0,
            shrinkage: false,
            ..Default::default()
        }
    }

    fn master(entries: &[(&str, &str, f64)]) -> SecurityMaster {
        let mut master = SecurityMaster::new();
        for (symbol, sector, beta) in entries {
            master.insert(
                *symbol,
                SecurityInfo {
                    sector: Some(sector.to_string()),
                    betas: Some(FactorBetas {
                        market: *beta,
                        ..Default::default()
                    }),
                    market_cap: Some(1e9),
                    ..Default::default()
                },
            );
        }
        master
    }

    fn two_assets() -> (BTreeMap<String, f64>, CovarianceMatrix) {
        (
            returns(&[("A", 0.10), ("B", 0.05)]),
            covariance(&["A", "B"], vec![0.04, 0.0, 0.0, 0.01]),
        )
    }

    #[test]
    fn mean_variance_two_assets_reaches_tangency() {
        let (mu, cov) = two_assets();
        let result = PortfolioOptimizer::default()
            .optimize(&mu, &cov, &unconstrained(), &OptimizationMethod::MeanVariance, &SecurityMaster::new())
            .unwrap();
        assert_eq!(result.solver.status, SolverStatus::Optimal);
        assert!((result.weights.sum() - 1.0).abs() < 1e-6);
        assert!((result.weights.get("A") - 1.0 / 3.0).abs() < 1e-4);
        assert!((result.weights.get("B") - 2.0 / 3.0).abs() < 1e-4);
        assert!(result.constraint_checks.values().all(|passed| *passed));
    }

    #[test]
    fn metrics_reproduce_solver_objective_inputs() {
        let (mu, cov) = two_assets();
        let result = PortfolioOptimizer::default()
            .optimize(&mu, &cov, &unconstrained(), &OptimizationMethod::MeanVariance, &SecurityMaster::new())
            .unwrap();
        let metrics =
            calculate_portfolio_metrics(&result.weights, &mu, &cov, &SecurityMaster::new(), 0.02).unwrap();
        assert!((metrics.expected_return - result.solver.expected_return).abs() < 1e-10);
        assert!((metrics.volatility - result.solver.volatility).abs() < 1e-10);
        assert!((result.solver.objective_value + metrics.expected_return / metrics.volatility).abs() < 1e-9);
    }

    #[test]
    fn max_position_binds_in_long_only_mode() {
        let mu = returns(&[("A", 0.20), ("B", 0.05), ("C", 0.04), ("D", 0.03)]);
        let cov = covariance(
            &["A", "B", "C", "D"],
            vec![
                0.04, 0.0, 0.0, 0.0, //
                0.0, 0.02, 0.0, 0.0, //
                0.0, 0.0, 0.03, 0.0, //
                0.0, 0.0, 0.0, 0.05,
            ],
        );
        let constraints = ConstraintSet {
            max_position: 0.4,
            ..unconstrained()
        };
        let result = PortfolioOptimizer::default()
            .optimize(&mu, &cov, &constraints, &OptimizationMethod::MeanVariance, &SecurityMaster::new())
            .unwrap();
        assert!((result.weights.sum() - 1.0).abs() < 1e-6);
        assert!(result.weights.iter().all(|(_, w)| *w >= -1e-9 && *w <= 0.4 + 1e-6));
        assert!((result.weights.get("A") - 0.4).abs() < 1e-5);
    }

    #[test]
    fn impossible_position_cap_is_infeasible() {
        let (mu, cov) = two_assets();
        let constraints = ConstraintSet {
            max_position: 0.3,
            ..unconstrained()
        };
        let err = PortfolioOptimizer::default()
            .optimize(&mu, &cov, &constraints, &OptimizationMethod::MeanVariance, &SecurityMaster::new())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Numerical {
                status: SolverStatus::Infeasible,
                ..
            }
        ));
    }

    #[test]
    fn sector_cap_and_beta_cap_hold() {
        let mu = returns(&[("A", 0.15), ("B", 0.14), ("C", 0.05)]);
        let cov = covariance(
            &["A", "B", "C"],
            vec![0.04, 0.01, 0.0, 0.01, 0.04, 0.0, 0.0, 0.0, 0.02],
        );
        let securities = master(&[("A", "Technology", 1.4), ("B", "Technology", 1.2), ("C", "Utilities", 0.5)]);
        let mut constraints = unconstrained();
        constraints.sector_caps.insert("Technology".to_string(), 0.5);
        constraints.max_beta = Some(0.9);
        let result = PortfolioOptimizer::default()
            .optimize(&mu, &cov, &constraints, &OptimizationMethod::MeanVariance, &securities)
            .unwrap();
        let tech = result.weights.get("A") + result.weights.get("B");
        assert!(tech <= 0.5 + 1e-6);
        assert!(result.metrics.portfolio_beta.unwrap() <= 0.9 + 1e-6);
        assert_eq!(result.constraint_checks["sector_caps"], true);
        assert_eq!(result.constraint_checks["max_beta"], true);
        assert!((result.metrics.sector_exposures["Technology"] - tech).abs() < 1e-12);
    }

    #[test]
    fn missing_beta_for_beta_cap_is_validation_error() {
        let (mu, cov) = two_assets();
        let mut constraints = unconstrained();
        constraints.max_beta = Some(1.0);
        let err = PortfolioOptimizer::default()
            .optimize(&mu, &cov, &constraints, &OptimizationMethod::MeanVariance, &SecurityMaster::new())
            .unwrap_err();
        assert!(err.to_string().contains("market beta for A"));
    }

    #[test]
    fn risk_parity_equalizes_contributions() {
        let (mu, cov) = two_assets();
        let result = PortfolioOptimizer::default()
            .optimize(&mu, &cov, &unconstrained(), &OptimizationMethod::RiskParity, &SecurityMaster::new())
            .unwrap();
        assert!((result.weights.get("A") - 1.0 / 3.0).abs() < 1e-4);
        assert!((result.weights.get("B") - 2.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn risk_parity_ignores_sector_caps_and_strict_mode_reports_it() {
        let (mu, cov) = two_assets();
        let securities = master(&[("A", "Energy", 1.0), ("B", "Energy", 1.0)]);
        let mut constraints = unconstrained();
        constraints.max_sector_weight = Some(0.5);
        let optimizer = PortfolioOptimizer::default();
        let result = optimizer
            .optimize(&mu, &cov, &constraints, &OptimizationMethod::RiskParity, &securities)
            .unwrap();
        assert_eq!(result.constraint_checks["sector_caps"], false);
        match optimizer.optimize_strict(&mu, &cov, &constraints, &OptimizationMethod::RiskParity, &securities) {
            Err(EngineError::ConstraintViolation { failed }) => {
                assert_eq!(failed, vec!["sector_caps".to_string()])
            }
            other => panic!("expected constraint violation, got {:?}", other.map(|r| r.weights)),
        }
    }

    #[test]
    fn black_litterman_without_views_falls_back() {
        let (mu, cov) = two_assets();
        let optimizer = PortfolioOptimizer::default();
        let bl = optimizer
            .optimize(
                &mu,
                &cov,
                &unconstrained(),
                &OptimizationMethod::BlackLitterman(BlackLittermanParams::default()),
                &SecurityMaster::new(),
            )
            .unwrap();
        let mv = optimizer
            .optimize(&mu, &cov, &unconstrained(), &OptimizationMethod::MeanVariance, &SecurityMaster::new())
            .unwrap();
        assert!(bl.fallback.is_some());
        assert!(bl.posterior.is_none());
        assert_eq!(bl.weights, mv.weights);
    }

    #[test]
    fn black_litterman_view_tilts_posterior() {
        let (mu, cov) = two_assets();
        let params = BlackLittermanParams {
            views: vec![View {
                assets: [("A".to_string(), 1.0)].into(),
                expected_return: 0.25,
                uncertainty: 0.001,
            }],
            market_weights: Some([("A".to_string(), 0.5), ("B".to_string(), 0.5)].into()),
            ..Default::default()
        };
        let result = PortfolioOptimizer::default()
            .optimize(
                &mu,
                &cov,
                &unconstrained(),
                &OptimizationMethod::BlackLitterman(params),
                &SecurityMaster::new(),
            )
            .unwrap();
        let posterior = result.posterior.unwrap();
        // pi = 3 * diag(0.04, 0.01) * [0.5, 0.5]
        assert!((posterior.equilibrium_returns["A"] - 0.06).abs() < 1e-12);
        assert!((posterior.equilibrium_returns["B"] - 0.015).abs() < 1e-12);
        assert!(posterior.posterior_returns["A"] > 0.06);
        assert!((posterior.posterior_returns["B"] - 0.015).abs() < 1e-12);
        assert!((result.weights.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn unknown_method_name_is_rejected() {
        assert!("risk-parity".parse::<OptimizationMethod>().is_ok());
        let err = "kelly".parse::<OptimizationMethod>().unwrap_err();
        assert!(err.to_string().contains("unknown optimization method: kelly"));
    }

    #[test]
    fn compare_methods_reports_each_method() {
        let (mu, cov) = two_assets();
        let results = PortfolioOptimizer::default().compare_methods(
            &mu,
            &cov,
            &unconstrained(),
            &BlackLittermanParams::default(),
            &SecurityMaster::new(),
        );
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.is_ok()));
    }
}
