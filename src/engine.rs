use crate::compliance::{ApprovedWeights, ComplianceGate, ComplianceRuleset, ComplianceStatus, RiskInputs};
use crate::config::EngineSettings;
use crate::error::{EngineError, Result};
use crate::models::{EquityPoint, PortfolioWeights, RebalanceFrequency, Trade, TradeSide};
use crate::panel::AssetPanel;
use crate::performance::{PerformanceCalculator, PerformanceMetrics};
use crate::run_status::{CancellationToken, RunStatus};
use crate::strategy::WeightStrategy;
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const LEVERAGE_EPSILON: f64 = 1e-9;

/// Cash plus share positions, owned and mutated by exactly one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub cash: f64,
    /// Signed share counts.
    pub positions: BTreeMap<String, f64>,
    pub total_value: f64,
}

impl Portfolio {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            positions: BTreeMap::new(),
            total_value: initial_capital,
        }
    }

    fn notionals<'a>(&'a self, prices: &'a BTreeMap<String, f64>) -> impl Iterator<Item = f64> + 'a {
        self.positions
            .iter()
            .map(move |(symbol, shares)| shares * prices.get(symbol).copied().unwrap_or(0.0))
    }

    pub fn gross_notional(&self, prices: &BTreeMap<String, f64>) -> f64 {
        self.notionals(prices).map(f64::abs).sum()
    }

    pub fn net_notional(&self, prices: &BTreeMap<String, f64>) -> f64 {
        self.notionals(prices).sum()
    }

    /// Recomputes `total_value` from cash and the given prices.
    pub fn mark_to_market(&mut self, prices: &BTreeMap<String, f64>) -> f64 {
        self.total_value = self.cash + self.net_notional(prices);
        self.total_value
    }

    pub fn weights(&self, prices: &BTreeMap<String, f64>) -> PortfolioWeights {
        if self.total_value <= 0.0 {
            return PortfolioWeights::new();
        }
        self.positions
            .iter()
            .map(|(symbol, shares)| {
                let price = prices.get(symbol).copied().unwrap_or(0.0);
                (symbol.clone(), shares * price / self.total_value)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestParams {
    pub initial_capital: f64,
    pub frequency: RebalanceFrequency,
    pub transaction_cost_rate: f64,
    pub borrow_cost_annual_rate: f64,
    /// Gross exposure cap; larger targets are scaled down.
    pub max_leverage: f64,
    pub min_trade_shares: f64,
    pub risk_free_rate: f64,
    /// Evaluated at every rebalance; a BLOCK verdict holds current positions.
    pub compliance: Option<ComplianceRuleset>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl Default for BacktestParams {
    fn default() -> Self {
        Self {
            initial_capital: 1_000_000.0,
            frequency: RebalanceFrequency::Monthly,
            transaction_cost_rate: 0.001,
            borrow_cost_annual_rate: 0.02,
            max_leverage: 1.0,
            min_trade_shares: 1e-6,
            risk_free_rate: 0.0,
            compliance: None,
            start_date: None,
            end_date: None,
        }
    }
}

impl BacktestParams {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            transaction_cost_rate: settings.transaction_cost_rate,
            borrow_cost_annual_rate: settings.borrow_cost_annual_rate,
            min_trade_shares: settings.min_trade_shares,
            risk_free_rate: settings.risk_free_rate,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        ensure_setting("initial_capital", self.initial_capital, f64::MIN_POSITIVE)?;
        ensure_setting("transaction_cost_rate", self.transaction_cost_rate, 0.0)?;
        ensure_setting("borrow_cost_annual_rate", self.borrow_cost_annual_rate, 0.0)?;
        ensure_setting("max_leverage", self.max_leverage, f64::MIN_POSITIVE)?;
        ensure_setting("min_trade_shares", self.min_trade_shares, 0.0)?;
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(EngineError::validation(format!(
                    "start date {} is after end date {}",
                    start, end
                )));
            }
        }
        Ok(())
    }
}

fn ensure_setting(name: &str, value: f64, min: f64) -> Result<()> {
    if !value.is_finite() || value < min {
        return Err(EngineError::validation(format!(
            "Setting {} must be >= {} (value: {})",
            name, min, value
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRebalance {
    pub date: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub final_value: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    pub final_portfolio: Portfolio,
    pub performance: PerformanceMetrics,
    pub skipped_rebalances: Vec<SkippedRebalance>,
}

enum TargetDecision {
    Rebalance(PortfolioWeights),
    Hold(String),
}

pub struct BacktestEngine {
    params: BacktestParams,
    status: RunStatus,
    cancellation: CancellationToken,
}

impl BacktestEngine {
    pub fn new(params: BacktestParams) -> Self {
        Self {
            params,
            status: RunStatus::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn params(&self) -> &BacktestParams {
        &self.params
    }

    pub fn status(&self) -> RunStatus {
        self.status.clone()
    }

    /// Drives one portfolio through every rebalance date in order.
    pub fn run(&self, strategy: &mut dyn WeightStrategy, panel: &AssetPanel) -> Result<BacktestResult> {
        self.params.validate()?;
        if panel.is_empty() {
            return Err(EngineError::no_data());
        }
        let dates: Vec<NaiveDate> = panel
            .dates()
            .iter()
            .copied()
            .filter(|d| self.params.start_date.map(|s| *d >= s).unwrap_or(true))
            .filter(|d| self.params.end_date.map(|e| *d <= e).unwrap_or(true))
            .collect();
        let schedule = self.params.frequency.schedule(&dates);
        let (first, last) = match (schedule.first(), schedule.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => {
                return Err(EngineError::validation(
                    "no panel dates inside the backtest window",
                ))
            }
        };

        info!(
            "Backtesting {} over {} rebalance dates ({} to {})",
            strategy.name(),
            schedule.len(),
            first,
            last
        );
        self.status.set_phase("Rebalancing");
        self.status.set_total(schedule.len());

        let mut portfolio = Portfolio::new(self.params.initial_capital);
        let mut prices: BTreeMap<String, f64> = BTreeMap::new();
        let mut equity_curve = Vec::with_capacity(schedule.len());
        let mut trades: Vec<Trade> = Vec::new();
        let mut skipped = Vec::new();
        let mut previous: Option<NaiveDate> = None;

        for (step, date) in schedule.iter().copied().enumerate() {
            if self.cancellation.is_cancelled() {
                warn!("Backtest cancelled after {} of {} steps", step, schedule.len());
                self.status.set_phase("Cancelled");
                return Err(EngineError::Cancelled {
                    completed: step,
                    total: schedule.len(),
                });
            }

            update_prices(&mut prices, panel, date, portfolio.positions.keys());
            portfolio.mark_to_market(&prices);

            let rebalanced = match self.decide_target(strategy, panel, date, &portfolio)? {
                TargetDecision::Rebalance(target) => {
                    update_prices(&mut prices, panel, date, target.symbols());
                    let executed = self.rebalance(&mut portfolio, &target, &prices, date, trades.len())?;
                    trades.extend(executed);
                    true
                }
                TargetDecision::Hold(reason) => {
                    debug!("Holding positions on {}: {}", date, reason);
                    skipped.push(SkippedRebalance { date, reason });
                    false
                }
            };

            portfolio.mark_to_market(&prices);
            let days = previous
                .map(|prev| trading_days_between(&dates, prev, date))
                .unwrap_or(1);
            self.accrue_financing(&mut portfolio, &prices, days);
            previous = Some(date);

            let value = portfolio.mark_to_market(&prices);
            let (gross, net) = if value.abs() > f64::EPSILON {
                (
                    portfolio.gross_notional(&prices) / value,
                    portfolio.net_notional(&prices) / value,
                )
            } else {
                (0.0, 0.0)
            };
            equity_curve.push(EquityPoint {
                date,
                value,
                cash: portfolio.cash,
                gross_exposure: gross,
                net_exposure: net,
                rebalanced,
            });
            self.status.record_step(value, !rebalanced);
        }

        let performance = PerformanceCalculator::calculate(
            &equity_curve,
            &trades,
            self.params.initial_capital,
            self.params.frequency.periods_per_year(),
            self.params.risk_free_rate,
        );
        self.status.set_phase("Completed");
        info!(
            "Backtest of {} finished: final value {:.2}, {} trades, {} skipped rebalances",
            strategy.name(),
            portfolio.total_value,
            trades.len(),
            skipped.len()
        );

        Ok(BacktestResult {
            strategy: strategy.name().to_string(),
            start_date: first,
            end_date: last,
            initial_capital: self.params.initial_capital,
            final_value: portfolio.total_value,
            equity_curve,
            trades,
            final_portfolio: portfolio,
            performance,
            skipped_rebalances: skipped,
        })
    }

    fn decide_target(
        &self,
        strategy: &mut dyn WeightStrategy,
        panel: &AssetPanel,
        date: NaiveDate,
        portfolio: &Portfolio,
    ) -> Result<TargetDecision> {
        let mut target = match strategy.target_weights(panel, date)? {
            Some(target) => target,
            None => return Ok(TargetDecision::Hold("strategy produced no target".to_string())),
        };
        if portfolio.total_value <= 0.0 {
            return Ok(TargetDecision::Hold(format!(
                "portfolio value {:.2} is not positive",
                portfolio.total_value
            )));
        }

        let gross = target.gross_exposure();
        if gross > self.params.max_leverage + LEVERAGE_EPSILON {
            let scale = self.params.max_leverage / gross;
            warn!(
                "Target gross exposure {:.4} on {} exceeds max leverage {:.4}; scaling by {:.4}",
                gross, date, self.params.max_leverage, scale
            );
            target = target
                .iter()
                .map(|(symbol, weight)| (symbol.clone(), weight * scale))
                .collect();
        }

        let ruleset = match &self.params.compliance {
            Some(ruleset) => ruleset,
            None => return Ok(TargetDecision::Rebalance(target)),
        };
        let verdict = ComplianceGate::check(
            &target,
            ruleset,
            &panel.security_master(date),
            &RiskInputs::default(),
        )?;
        if verdict.status == ComplianceStatus::Block {
            let cited: Vec<&str> = verdict.violations().map(|v| v.id.as_str()).collect();
            warn!(
                "Compliance BLOCK under {} on {}; holding positions",
                ruleset.id, date
            );
            return Ok(TargetDecision::Hold(format!(
                "compliance {} blocked: {}",
                ruleset.id,
                cited.join(", ")
            )));
        }
        let approved = ApprovedWeights::from_verdict(&verdict, &[])?;
        Ok(TargetDecision::Rebalance(approved.into_weights()))
    }

    /// Trades from current shares to target weights: sells first, then buys.
    fn rebalance(
        &self,
        portfolio: &mut Portfolio,
        target: &PortfolioWeights,
        prices: &BTreeMap<String, f64>,
        date: NaiveDate,
        trade_count: usize,
    ) -> Result<Vec<Trade>> {
        let value = portfolio.total_value;
        let symbols: BTreeSet<String> = portfolio
            .positions
            .keys()
            .chain(target.symbols())
            .cloned()
            .collect();

        let mut orders: Vec<(String, f64, f64)> = Vec::new();
        for symbol in symbols {
            let price = match prices.get(&symbol) {
                Some(price) if *price > 0.0 => *price,
                _ => {
                    return Err(EngineError::validation(format!(
                        "no price for {} on or before {}",
                        symbol, date
                    )))
                }
            };
            let current = portfolio.positions.get(&symbol).copied().unwrap_or(0.0);
            let desired = target.get(&symbol) * value / price;
            let delta = desired - current;
            if delta.abs() < self.params.min_trade_shares {
                continue;
            }
            orders.push((symbol, delta, price));
        }
        orders.sort_by(|a, b| {
            let a_buy = a.1 > 0.0;
            let b_buy = b.1 > 0.0;
            a_buy.cmp(&b_buy).then_with(|| a.0.cmp(&b.0))
        });

        let mut executed = Vec::with_capacity(orders.len());
        for (symbol, shares, price) in orders {
            let notional = shares * price;
            let cost = notional.abs() * self.params.transaction_cost_rate;
            portfolio.cash -= notional + cost;
            let position = portfolio.positions.entry(symbol.clone()).or_insert(0.0);
            *position += shares;
            if position.abs() < self.params.min_trade_shares {
                portfolio.positions.remove(&symbol);
            }
            executed.push(Trade {
                id: format!("trade_{:06}", trade_count + executed.len() + 1),
                date,
                symbol,
                side: if shares > 0.0 { TradeSide::Buy } else { TradeSide::Sell },
                shares,
                price,
                value: notional,
                cost,
            });
        }
        Ok(executed)
    }

    fn accrue_financing(&self, portfolio: &mut Portfolio, prices: &BTreeMap<String, f64>, days: usize) {
        let net = portfolio.net_notional(prices);
        if net <= 0.0 || self.params.borrow_cost_annual_rate <= 0.0 {
            return;
        }
        let charge = net * self.params.borrow_cost_annual_rate / TRADING_DAYS_PER_YEAR * days as f64;
        portfolio.cash -= charge;
    }
}

fn update_prices<'a, I>(prices: &mut BTreeMap<String, f64>, panel: &AssetPanel, date: NaiveDate, symbols: I)
where
    I: Iterator<Item = &'a String>,
{
    for symbol in symbols {
        if let Some(price) = panel.price_on_or_before(symbol, date) {
            prices.insert(symbol.clone(), price);
        }
    }
}

/// Panel dates in `(from, to]`, at least one.
fn trading_days_between(dates: &[NaiveDate], from: NaiveDate, to: NaiveDate) -> usize {
    dates.iter().filter(|d| **d > from && **d <= to).count().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::PositionLimits;
    use crate::models::{AssetObservation, Fundamentals};
    use crate::strategy::StrategyConfig;
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

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn panel(days: i64) -> AssetPanel {
        let mut rows = Vec::new();
        for day in 0..days {
            let date = start() + Duration::days(day);
            rows.push(observation("A", date, 100.0 + day as f64));
            rows.push(observation("B", date, 50.0));
        }
        AssetPanel::new(rows).unwrap()
    }

    fn frictionless() -> BacktestParams {
        BacktestParams {
            initial_capital: 10_000.0,
            frequency: RebalanceFrequency::Daily,
            transaction_cost_rate: 0.0,
            borrow_cost_annual_rate: 0.0,
            ..Default::default()
        }
    }

    fn fixed(pairs: &[(&str, f64)]) -> Box<dyn WeightStrategy> {
        StrategyConfig::FixedWeights {
            weights: PortfolioWeights::from_pairs(pairs.iter().map(|(s, w)| (s.to_string(), *w))),
        }
        .build(&EngineSettings::default())
        .unwrap()
    }

    #[test]
    fn buy_and_hold_tracks_prices_without_costs() {
        let mut strategy = fixed(&[("B", 1.0)]);
        let result = BacktestEngine::new(frictionless()).run(strategy.as_mut(), &panel(5)).unwrap();
        assert_eq!(result.equity_curve.len(), 5);
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].id, "trade_000001");
        assert!((result.final_value - 10_000.0).abs() < 1e-9);
        assert!((result.final_portfolio.positions["B"] - 200.0).abs() < 1e-9);
    }

    #[test]
    fn transaction_and_borrow_costs_reduce_cash() {
        let params = BacktestParams {
            transaction_cost_rate: 0.001,
            borrow_cost_annual_rate: 0.0252,
            ..frictionless()
        };
        let mut strategy = fixed(&[("B", 1.0)]);
        let result = BacktestEngine::new(params).run(strategy.as_mut(), &panel(1)).unwrap();
        let trade_cost = 10.0;
        let financing = 10_000.0 * 0.0252 / 252.0;
        assert!((result.trades[0].cost - trade_cost).abs() < 1e-9);
        assert!((result.final_value - (10_000.0 - trade_cost - financing)).abs() < 1e-9);
        assert!((result.performance.total_costs - trade_cost).abs() < 1e-9);
    }

    #[test]
    fn tiny_drifts_do_not_trade() {
        let params = BacktestParams {
            min_trade_shares: 1.0,
            ..frictionless()
        };
        let mut strategy = fixed(&[("A", 0.5), ("B", 0.5)]);
        let result = BacktestEngine::new(params).run(strategy.as_mut(), &panel(2)).unwrap();
        // A drifts by a quarter share on the second day.
        assert_eq!(result.trades.len(), 2);
        assert!(result.trades.iter().all(|t| t.side == TradeSide::Buy));
    }

    #[test]
    fn sells_execute_before_buys() {
        let mut rows = Vec::new();
        for day in 0..2 {
            let date = start() + Duration::days(day);
            rows.push(observation("A", date, 10.0));
            rows.push(observation("B", date, 10.0));
        }
        let panel = AssetPanel::new(rows).unwrap();

        struct Rotate(usize);
        impl WeightStrategy for Rotate {
            fn name(&self) -> &str {
                "rotate"
            }
            fn target_weights(&mut self, _: &AssetPanel, _: NaiveDate) -> Result<Option<PortfolioWeights>> {
                self.0 += 1;
                let symbol = if self.0 == 1 { "B" } else { "A" };
                Ok(Some(PortfolioWeights::from_pairs([(symbol, 1.0)])))
            }
        }

        let result = BacktestEngine::new(frictionless()).run(&mut Rotate(0), &panel).unwrap();
        let second_day: Vec<&Trade> = result.trades.iter().filter(|t| t.date != start()).collect();
        assert_eq!(second_day.len(), 2);
        assert_eq!(second_day[0].side, TradeSide::Sell);
        assert_eq!(second_day[0].symbol, "B");
        assert_eq!(second_day[1].side, TradeSide::Buy);
    }

    #[test]
    fn leverage_above_cap_is_scaled() {
        let mut strategy = fixed(&[("A", 1.0), ("B", 1.0)]);
        let result = BacktestEngine::new(frictionless()).run(strategy.as_mut(), &panel(1)).unwrap();
        let point = &result.equity_curve[0];
        assert!((point.gross_exposure - 1.0).abs() < 1e-9);
        assert!(point.cash.abs() < 1e-6);
    }

    #[test]
    fn compliance_block_holds_positions() {
        let params = BacktestParams {
            compliance: Some(ComplianceRuleset {
                id: "tight".to_string(),
                position_limits: PositionLimits {
                    max_single_position: Some(0.3),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..frictionless()
        };
        let mut strategy = fixed(&[("A", 0.5), ("B", 0.5)]);
        let result = BacktestEngine::new(params).run(strategy.as_mut(), &panel(3)).unwrap();
        assert!(result.trades.is_empty());
        assert_eq!(result.skipped_rebalances.len(), 3);
        assert!(result.skipped_rebalances[0].reason.contains("tight"));
        assert!(result.equity_curve.iter().all(|p| !p.rebalanced && p.value == 10_000.0));
    }

    #[test]
    fn runs_are_deterministic() {
        let run = || {
            let mut strategy = fixed(&[("A", 0.6), ("B", 0.4)]);
            BacktestEngine::new(BacktestParams::default())
                .run(strategy.as_mut(), &panel(60))
                .unwrap()
        };
        assert_eq!(run().equity_curve, run().equity_curve);
    }

    #[test]
    fn cancelled_run_reports_progress() {
        let token = CancellationToken::new();
        token.cancel();
        let status = RunStatus::new();
        let engine = BacktestEngine::new(frictionless())
            .with_status(status.clone())
            .with_cancellation(token);
        let mut strategy = fixed(&[("A", 1.0)]);
        match engine.run(strategy.as_mut(), &panel(3)) {
            Err(EngineError::Cancelled { completed, total }) => {
                assert_eq!(completed, 0);
                assert_eq!(total, 3);
            }
            other => panic!("expected cancellation, got {:?}", other.map(|r| r.final_value)),
        }
        assert_eq!(status.snapshot().phase, "Cancelled");
    }

    #[test]
    fn missing_target_price_is_an_error() {
        let mut strategy = fixed(&[("ZZZ", 1.0)]);
        let err = BacktestEngine::new(frictionless())
            .run(strategy.as_mut(), &panel(2))
            .unwrap_err();
        assert!(err.to_string().contains("ZZZ"));
    }
}
