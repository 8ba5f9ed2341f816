use crate::models::{EquityPoint, Trade};
use crate::stats;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    /// Peak-to-trough decline of the cumulative return index, positive.
    pub max_drawdown: f64,
    pub calmar_ratio: f64,
    /// Fraction of periods with a positive return.
    pub win_rate: f64,
    /// Absolute traded notional divided by the number of equity points.
    pub turnover: f64,
    pub periods: usize,
    pub total_trades: usize,
    pub total_costs: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Metrics of a backtest; the initial capital is the reference for the first period.
    pub fn calculate(
        equity_curve: &[EquityPoint],
        trades: &[Trade],
        initial_capital: f64,
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> PerformanceMetrics {
        let mut values = Vec::with_capacity(equity_curve.len() + 1);
        values.push(initial_capital);
        values.extend(equity_curve.iter().map(|point| point.value));
        let returns = Self::period_returns(&values);

        let mut metrics = Self::from_returns(&returns, periods_per_year, risk_free_rate);
        metrics.max_drawdown = stats::max_drawdown(&values);
        metrics.calmar_ratio = Self::calmar_ratio(metrics.annualized_return, metrics.max_drawdown);

        let traded: f64 = trades.iter().map(|t| t.value.abs()).sum();
        metrics.turnover = if equity_curve.is_empty() {
            0.0
        } else {
            traded / equity_curve.len() as f64
        };
        metrics.total_trades = trades.len();
        metrics.total_costs = trades.iter().map(|t| t.cost).sum();
        metrics
    }

    /// Metrics of a bare return series (no trades).
    pub fn from_returns(
        returns: &[f64],
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> PerformanceMetrics {
        let mut index = Vec::with_capacity(returns.len() + 1);
        let mut level = 1.0;
        index.push(level);
        for r in returns {
            level *= 1.0 + r;
            index.push(level);
        }
        let total_return = level - 1.0;
        let annualized_return = Self::annualized_return(level, returns.len(), periods_per_year);
        let max_drawdown = stats::max_drawdown(&index);
        let win_rate = if returns.is_empty() {
            0.0
        } else {
            returns.iter().filter(|r| **r > 0.0).count() as f64 / returns.len() as f64
        };

        PerformanceMetrics {
            total_return,
            annualized_return,
            annualized_volatility: stats::sample_std(returns) * periods_per_year.sqrt(),
            sharpe_ratio: Self::calculate_sharpe_ratio(returns, periods_per_year, risk_free_rate),
            max_drawdown,
            calmar_ratio: Self::calmar_ratio(annualized_return, max_drawdown),
            win_rate,
            turnover: 0.0,
            periods: returns.len(),
            total_trades: 0,
            total_costs: 0.0,
        }
    }

    pub fn period_returns(values: &[f64]) -> Vec<f64> {
        stats::pct_change(values)
    }

    /// `(mean * ppy - rf) / (std * sqrt(ppy))`, zero when volatility is zero.
    pub fn calculate_sharpe_ratio(returns: &[f64], periods_per_year: f64, risk_free_rate: f64) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let std_dev = stats::sample_std(returns);
        if std_dev <= f64::EPSILON {
            return 0.0;
        }
        let annualized_return = stats::mean(returns) * periods_per_year;
        let annualized_volatility = std_dev * periods_per_year.sqrt();
        (annualized_return - risk_free_rate) / annualized_volatility
    }

    fn annualized_return(growth: f64, periods: usize, periods_per_year: f64) -> f64 {
        if periods == 0 || !growth.is_finite() {
            return 0.0;
        }
        if growth <= 0.0 {
            return -1.0;
        }
        growth.powf(periods_per_year / periods as f64) - 1.0
    }

    fn calmar_ratio(annualized_return: f64, max_drawdown: f64) -> f64 {
        if !annualized_return.is_finite() || max_drawdown <= f64::EPSILON {
            return 0.0;
        }
        annualized_return / max_drawdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeSide;
    use chrono::NaiveDate;

    fn point(day: u32, value: f64) -> EquityPoint {
        EquityPoint {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            value,
            cash: 0.0,
            gross_exposure: 1.0,
            net_exposure: 1.0,
            rebalanced: true,
        }
    }

    #[test]
    fn drawdown_win_rate_and_total_return() {
        let curve = vec![point(2, 110.0), point(3, 99.0), point(4, 121.0)];
        let metrics = PerformanceCalculator::calculate(&curve, &[], 100.0, 252.0, 0.0);
        assert!((metrics.total_return - 0.21).abs() < 1e-12);
        assert!((metrics.max_drawdown - 0.1).abs() < 1e-12);
        assert!((metrics.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(metrics.periods, 3);
        assert_eq!(metrics.total_trades, 0);
    }

    #[test]
    fn turnover_is_traded_notional_per_point() {
        let curve = vec![point(2, 100.0), point(3, 100.0)];
        let trade = Trade {
            id: "trade_000001".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            symbol: "A".to_string(),
            side: TradeSide::Sell,
            shares: -2.0,
            price: 25.0,
            value: -50.0,
            cost: 0.05,
        };
        let metrics = PerformanceCalculator::calculate(&curve, &[trade], 100.0, 252.0, 0.0);
        assert!((metrics.turnover - 25.0).abs() < 1e-12);
        assert!((metrics.total_costs - 0.05).abs() < 1e-12);
    }

    #[test]
    fn sharpe_uses_annualized_mean_and_std() {
        let returns = [0.01, -0.005, 0.02, 0.0];
        let sharpe = PerformanceCalculator::calculate_sharpe_ratio(&returns, 12.0, 0.02);
        let expected = (stats::mean(&returns) * 12.0 - 0.02) / (stats::sample_std(&returns) * 12f64.sqrt());
        assert!((sharpe - expected).abs() < 1e-12);
        assert_eq!(PerformanceCalculator::calculate_sharpe_ratio(&[0.01, 0.01], 252.0, 0.0), 0.0);
    }

    #[test]
    fn annualized_return_compounds_over_periods() {
        let metrics = PerformanceCalculator::from_returns(&[0.01; 12], 12.0, 0.0);
        assert!((metrics.annualized_return - (1.01f64.powi(12) - 1.0)).abs() < 1e-12);
        assert!((metrics.annualized_return - metrics.total_return).abs() < 1e-12);
        assert_eq!(metrics.max_drawdown, 0.0);
    }
}
