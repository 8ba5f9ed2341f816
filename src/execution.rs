//! Order slicing for approved target weights.
//!
//! A parent trade per symbol is split into time buckets across a trading
//! window. TWAP gives every bucket the same share; VWAP scales buckets by a
//! [`VolumeProfile`]. The bundled [`UShapedProfile`] is a fixed heuristic
//! (heavier first and last hour), not an estimate from market volume; plug in
//! another profile to use historical volume curves.

use crate::compliance::ApprovedWeights;
use crate::error::{EngineError, Result};
use crate::models::{PortfolioWeights, TradeSide};
use chrono::{Duration, NaiveTime, Timelike};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MIN_TRADE_VALUE: f64 = 1_000.0;
pub const MIN_SLICE_VALUE: f64 = 100.0;
pub const COMMISSION_RATE: f64 = 0.001;
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Notional change for one symbol. Only [`required_trades`] builds these, so
/// every order traces back to weights that cleared compliance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeOrder {
    pub symbol: String,
    pub side: TradeSide,
    pub current_weight: f64,
    pub target_weight: f64,
    /// Signed notional.
    pub value: f64,
    #[serde(skip)]
    _approved: (),
}

/// Orders needed to move from `current` to the approved weights, skipping
/// changes smaller than `min_trade_value` in notional.
pub fn required_trades(
    current: &PortfolioWeights,
    approved: &ApprovedWeights,
    portfolio_value: f64,
    min_trade_value: f64,
) -> Result<Vec<TradeOrder>> {
    if !portfolio_value.is_finite() || portfolio_value <= 0.0 {
        return Err(EngineError::validation(format!(
            "portfolio value must be positive (value: {})",
            portfolio_value
        )));
    }
    let target = approved.weights();
    let mut symbols: Vec<&String> = current.symbols().chain(target.symbols()).collect();
    symbols.sort();
    symbols.dedup();

    let mut orders = Vec::new();
    for symbol in symbols {
        let current_weight = current.get(symbol);
        let target_weight = target.get(symbol);
        let value = (target_weight - current_weight) * portfolio_value;
        if value.abs() <= min_trade_value {
            continue;
        }
        orders.push(TradeOrder {
            symbol: symbol.clone(),
            side: if value > 0.0 { TradeSide::Buy } else { TradeSide::Sell },
            current_weight,
            target_weight,
            value,
            _approved: (),
        });
    }
    debug!(
        "{} orders required under ruleset {}",
        orders.len(),
        approved.ruleset_id()
    );
    Ok(orders)
}

/// Relative trading intensity at a point of the window.
pub trait VolumeProfile: Send + Sync {
    /// `elapsed` and `window` are minutes from the window start.
    fn multiplier(&self, elapsed: f64, window: f64) -> f64;
}

pub struct FlatProfile;

impl VolumeProfile for FlatProfile {
    fn multiplier(&self, _elapsed: f64, _window: f64) -> f64 {
        1.0
    }
}

pub struct UShapedProfile {
    pub edge_minutes: f64,
    pub edge_multiplier: f64,
    pub middle_multiplier: f64,
}

impl Default for UShapedProfile {
    fn default() -> Self {
        Self {
            edge_minutes: 60.0,
            edge_multiplier: 1.5,
            middle_multiplier: 0.7,
        }
    }
}

impl VolumeProfile for UShapedProfile {
    fn multiplier(&self, elapsed: f64, window: f64) -> f64 {
        if elapsed < self.edge_minutes || elapsed > window - self.edge_minutes {
            self.edge_multiplier
        } else {
            self.middle_multiplier
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlicingAlgorithm {
    Twap,
    #[default]
    Vwap,
}

impl std::str::FromStr for SlicingAlgorithm {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "twap" => Ok(Self::Twap),
            "vwap" => Ok(Self::Vwap),
            _ => Err(EngineError::validation(format!(
                "unknown slicing algorithm: {}",
                raw
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicingParams {
    pub algorithm: SlicingAlgorithm,
    pub start_time: NaiveTime,
    pub window_minutes: u32,
    pub slice_minutes: u32,
    pub min_trade_value: f64,
    pub min_slice_value: f64,
}

impl Default for SlicingParams {
    fn default() -> Self {
        Self {
            algorithm: SlicingAlgorithm::Vwap,
            start_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            window_minutes: 360,
            slice_minutes: 30,
            min_trade_value: MIN_TRADE_VALUE,
            min_slice_value: MIN_SLICE_VALUE,
        }
    }
}

impl SlicingParams {
    fn slice_count(&self) -> Result<usize> {
        if self.slice_minutes == 0 || self.window_minutes < self.slice_minutes {
            return Err(EngineError::validation(format!(
                "window of {} minutes cannot hold {}-minute slices",
                self.window_minutes, self.slice_minutes
            )));
        }
        let window_end = self.start_time.num_seconds_from_midnight() as u64
            + self.window_minutes as u64 * 60;
        if window_end >= SECONDS_PER_DAY {
            return Err(EngineError::validation(format!(
                "window of {} minutes from {} does not close before midnight",
                self.window_minutes, self.start_time
            )));
        }
        Ok((self.window_minutes / self.slice_minutes) as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSlice {
    pub slice_id: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Signed notional per symbol.
    pub trades: BTreeMap<String, f64>,
}

impl OrderSlice {
    pub fn notional(&self) -> f64 {
        self.trades.values().map(|v| v.abs()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub algorithm: SlicingAlgorithm,
    pub ruleset_id: String,
    pub orders: Vec<TradeOrder>,
    pub slices: Vec<OrderSlice>,
    pub total_notional: f64,
}

/// Splits each order across the window. Per symbol, slice values sum to the
/// parent order; slices under `min_slice_value` fold into that symbol's
/// largest slice.
pub fn generate_slices(
    orders: &[TradeOrder],
    params: &SlicingParams,
    profile: &dyn VolumeProfile,
) -> Result<Vec<OrderSlice>> {
    let count = params.slice_count()?;
    let window = params.window_minutes as f64;
    let step = params.slice_minutes as f64;
    let multipliers: Vec<f64> = (0..count)
        .map(|i| {
            let midpoint = (i as f64 + 0.5) * step;
            profile.multiplier(midpoint, window).max(0.0)
        })
        .collect();
    let total: f64 = multipliers.iter().sum();
    if total <= 0.0 {
        return Err(EngineError::validation("volume profile is zero across the window"));
    }

    let mut slices: Vec<OrderSlice> = (0..count)
        .map(|i| {
            let offset = Duration::minutes((i as u32 * params.slice_minutes) as i64);
            let start = params.start_time + offset;
            OrderSlice {
                slice_id: format!("slice_{:03}", i + 1),
                start,
                end: start + Duration::minutes(params.slice_minutes as i64),
                trades: BTreeMap::new(),
            }
        })
        .collect();

    for order in orders {
        let mut values: Vec<f64> = multipliers.iter().map(|m| order.value * m / total).collect();
        fold_small_slices(&mut values, params.min_slice_value);
        for (slice, value) in slices.iter_mut().zip(values) {
            if value != 0.0 {
                slice.trades.insert(order.symbol.clone(), value);
            }
        }
    }
    Ok(slices)
}

fn fold_small_slices(values: &mut [f64], min_slice_value: f64) {
    let largest = match values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
    {
        Some((index, _)) => index,
        None => return,
    };
    let mut folded = 0.0;
    for (index, value) in values.iter_mut().enumerate() {
        if index != largest && value.abs() < min_slice_value {
            folded += *value;
            *value = 0.0;
        }
    }
    values[largest] += folded;
}

/// Required trades from current to approved weights, sliced with the
/// algorithm named in `params`.
pub fn plan_execution(
    current: &PortfolioWeights,
    approved: &ApprovedWeights,
    portfolio_value: f64,
    params: &SlicingParams,
    profile: Option<&dyn VolumeProfile>,
) -> Result<ExecutionPlan> {
    let orders = required_trades(current, approved, portfolio_value, params.min_trade_value)?;
    let u_shaped = UShapedProfile::default();
    let profile: &dyn VolumeProfile = match (params.algorithm, profile) {
        (SlicingAlgorithm::Twap, _) => &FlatProfile,
        (SlicingAlgorithm::Vwap, Some(profile)) => profile,
        (SlicingAlgorithm::Vwap, None) => &u_shaped,
    };
    let slices = generate_slices(&orders, params, profile)?;
    let total_notional = orders.iter().map(|o| o.value.abs()).sum();
    info!(
        "{:?} plan: {} orders over {} slices, notional {:.2}",
        params.algorithm,
        orders.len(),
        slices.len(),
        total_notional
    );
    Ok(ExecutionPlan {
        algorithm: params.algorithm,
        ruleset_id: approved.ruleset_id().to_string(),
        orders,
        slices,
        total_notional,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceExecution {
    pub slice_id: String,
    /// Absolute shares across all symbols.
    pub quantity: f64,
    pub executed_value: f64,
    pub avg_price: f64,
    pub commission: f64,
    /// Symbols without a price; left unexecuted.
    pub unpriced: Vec<String>,
}

/// Fills a slice at the given prices, charging `commission_rate` on notional.
pub fn simulate_slice_execution(
    slice: &OrderSlice,
    prices: &BTreeMap<String, f64>,
    commission_rate: f64,
) -> SliceExecution {
    let mut quantity = 0.0;
    let mut executed_value = 0.0;
    let mut commission = 0.0;
    let mut unpriced = Vec::new();
    for (symbol, value) in &slice.trades {
        match prices.get(symbol) {
            Some(price) if *price > 0.0 => {
                quantity += (value / price).abs();
                executed_value += value.abs();
                commission += value.abs() * commission_rate;
            }
            _ => unpriced.push(symbol.clone()),
        }
    }
    SliceExecution {
        slice_id: slice.slice_id.clone(),
        quantity,
        executed_value,
        avg_price: if quantity > 0.0 { executed_value / quantity } else { 0.0 },
        commission,
        unpriced,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftKind {
    PriceDrift,
    VolumeDrift,
    TimingDrift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Medium,
    High,
}

/// Alert and escalation bounds per drift measure. A drift alerts when its
/// magnitude is strictly above the alert bound and is HIGH strictly above the
/// escalation bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftThresholds {
    pub price: f64,
    pub price_high: f64,
    pub volume: f64,
    pub volume_high: f64,
    pub timing_seconds: f64,
    pub timing_high_seconds: f64,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            price: 0.01,
            price_high: 0.02,
            volume: 0.05,
            volume_high: 0.10,
            timing_seconds: 180.0,
            timing_high_seconds: 300.0,
        }
    }
}

/// Fill observed for one symbol of a slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFill {
    pub price: f64,
    /// Signed notional actually traded.
    pub value: f64,
    pub completed_at: NaiveTime,
}

/// How a slice fill deviated from its plan for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolDrift {
    pub symbol: String,
    /// Fill price relative to the reference price.
    pub price_drift: f64,
    /// Traded notional relative to the planned notional.
    pub volume_drift: f64,
    /// Seconds past the slice end; negative when finished early.
    pub timing_drift_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAlert {
    pub kind: DriftKind,
    pub symbol: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: AlertSeverity,
}

/// Drift of each filled symbol in `slice` against its planned value and the
/// reference (arrival) price. Symbols without a fill or reference price are skipped.
pub fn measure_drift(
    slice: &OrderSlice,
    reference_prices: &BTreeMap<String, f64>,
    fills: &BTreeMap<String, SymbolFill>,
) -> Vec<SymbolDrift> {
    slice
        .trades
        .iter()
        .filter_map(|(symbol, planned)| {
            let fill = fills.get(symbol)?;
            let reference = reference_prices.get(symbol).copied().filter(|p| *p > 0.0)?;
            let volume_drift = if planned.abs() > 0.0 {
                (fill.value.abs() - planned.abs()) / planned.abs()
            } else {
                0.0
            };
            Some(SymbolDrift {
                symbol: symbol.clone(),
                price_drift: fill.price / reference - 1.0,
                volume_drift,
                timing_drift_seconds: (fill.completed_at - slice.end).num_seconds() as f64,
            })
        })
        .collect()
}

pub fn check_drift_alerts(drifts: &[SymbolDrift], thresholds: &DriftThresholds) -> Vec<DriftAlert> {
    let mut alerts = Vec::new();
    for drift in drifts {
        let measures = [
            (DriftKind::PriceDrift, drift.price_drift, thresholds.price, thresholds.price_high),
            (DriftKind::VolumeDrift, drift.volume_drift, thresholds.volume, thresholds.volume_high),
            (
                DriftKind::TimingDrift,
                drift.timing_drift_seconds,
                thresholds.timing_seconds,
                thresholds.timing_high_seconds,
            ),
        ];
        for (kind, value, threshold, high) in measures {
            if value.abs() > threshold {
                alerts.push(DriftAlert {
                    kind,
                    symbol: drift.symbol.clone(),
                    value,
                    threshold,
                    severity: if value.abs() > high {
                        AlertSeverity::High
                    } else {
                        AlertSeverity::Medium
                    },
                });
            }
        }
    }
    if !alerts.is_empty() {
        warn!("{} execution drift alerts", alerts.len());
    }
    alerts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillStatus {
    Pending,
    InProgress,
    Completed,
}

/// Running totals of an execution plan's fills against its target notional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFillSummary {
    pub total_slices: usize,
    pub executed_slices: usize,
    pub target_value: f64,
    pub executed_value: f64,
    pub total_quantity: f64,
    pub total_commission: f64,
    /// Value-weighted across fills.
    pub avg_execution_price: f64,
}

impl OrderFillSummary {
    pub fn new(plan: &ExecutionPlan) -> Self {
        Self {
            total_slices: plan.slices.iter().filter(|s| !s.trades.is_empty()).count(),
            executed_slices: 0,
            target_value: plan.total_notional,
            executed_value: 0.0,
            total_quantity: 0.0,
            total_commission: 0.0,
            avg_execution_price: 0.0,
        }
    }

    pub fn record(&mut self, execution: &SliceExecution) {
        self.executed_slices += 1;
        self.executed_value += execution.executed_value;
        self.total_quantity += execution.quantity;
        self.total_commission += execution.commission;
        self.avg_execution_price = if self.total_quantity > 0.0 {
            self.executed_value / self.total_quantity
        } else {
            0.0
        };
    }

    /// Executed over target notional; 1 for an empty plan.
    pub fn fill_ratio(&self) -> f64 {
        if self.target_value > 0.0 {
            self.executed_value / self.target_value
        } else {
            1.0
        }
    }

    pub fn status(&self) -> FillStatus {
        if self.executed_slices >= self.total_slices {
            FillStatus::Completed
        } else if self.executed_slices > 0 {
            FillStatus::InProgress
        } else {
            FillStatus::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::{ComplianceGate, ComplianceRuleset, RiskInputs};
    use crate::models::SecurityMaster;

    fn approve(pairs: &[(&str, f64)]) -> ApprovedWeights {
        let weights = PortfolioWeights::from_pairs(pairs.iter().map(|(s, w)| (s.to_string(), *w)));
        let verdict = ComplianceGate::check(
            &weights,
            &ComplianceRuleset::default(),
            &SecurityMaster::new(),
            &RiskInputs::default(),
        )
        .unwrap();
        ApprovedWeights::from_verdict(&verdict, &[]).unwrap()
    }

    #[test]
    fn small_changes_need_no_trade() {
        let current = PortfolioWeights::from_pairs([("A", 0.5), ("B", 0.5)]);
        let approved = approve(&[("A", 0.5005), ("B", 0.4995)]);
        let orders = required_trades(&current, &approved, 1_000_000.0, MIN_TRADE_VALUE).unwrap();
        assert!(orders.is_empty());

        let approved = approve(&[("A", 0.6), ("C", 0.4)]);
        let orders = required_trades(&current, &approved, 1_000_000.0, MIN_TRADE_VALUE).unwrap();
        let sides: Vec<(&str, TradeSide)> = orders.iter().map(|o| (o.symbol.as_str(), o.side)).collect();
        assert_eq!(
            sides,
            vec![("A", TradeSide::Buy), ("B", TradeSide::Sell), ("C", TradeSide::Buy)]
        );
    }

    #[test]
    fn twap_splits_evenly() {
        let approved = approve(&[("A", 0.1)]);
        let params = SlicingParams {
            algorithm: SlicingAlgorithm::Twap,
            window_minutes: 120,
            ..Default::default()
        };
        let plan = plan_execution(&PortfolioWeights::new(), &approved, 1_000_000.0, &params, None).unwrap();
        assert_eq!(plan.slices.len(), 4);
        for slice in &plan.slices {
            assert!((slice.trades["A"] - 25_000.0).abs() < 1e-6);
        }
        assert_eq!(plan.slices[1].start, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
    }

    #[test]
    fn vwap_weights_the_edges() {
        let approved = approve(&[("A", 0.1)]);
        let plan = plan_execution(
            &PortfolioWeights::new(),
            &approved,
            1_000_000.0,
            &SlicingParams::default(),
            None,
        )
        .unwrap();
        let values: Vec<f64> = plan.slices.iter().map(|s| s.trades["A"]).collect();
        assert_eq!(values.len(), 12);
        assert!(values[0] > values[5]);
        assert!(values[11] > values[6]);
        assert!((values.iter().sum::<f64>() - 100_000.0).abs() < 1e-6);
    }

    #[test]
    fn tiny_slices_fold_into_the_largest() {
        let approved = approve(&[("A", 0.0012)]);
        let params = SlicingParams {
            algorithm: SlicingAlgorithm::Twap,
            ..Default::default()
        };
        // Every slice after the first ends up under the 100 minimum.
        struct Skewed;
        impl VolumeProfile for Skewed {
            fn multiplier(&self, elapsed: f64, _window: f64) -> f64 {
                if elapsed < 30.0 { 12.0 } else { 1.0 }
            }
        }
        let orders = required_trades(&PortfolioWeights::new(), &approved, 1_000_000.0, MIN_TRADE_VALUE).unwrap();
        let slices = generate_slices(&orders, &params, &Skewed).unwrap();
        let filled: Vec<&OrderSlice> = slices.iter().filter(|s| !s.trades.is_empty()).collect();
        assert_eq!(filled.len(), 1);
        assert!((filled[0].trades["A"] - 1_200.0).abs() < 1e-9);
    }

    #[test]
    fn execution_charges_commission() {
        let slice = OrderSlice {
            slice_id: "slice_001".to_string(),
            start: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            end: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            trades: [("A".to_string(), 5_000.0), ("B".to_string(), -1_000.0)].into(),
        };
        let prices: BTreeMap<String, f64> = [("A".to_string(), 50.0)].into();
        let fill = simulate_slice_execution(&slice, &prices, COMMISSION_RATE);
        assert!((fill.quantity - 100.0).abs() < 1e-12);
        assert!((fill.commission - 5.0).abs() < 1e-12);
        assert_eq!(fill.unpriced, vec!["B".to_string()]);
    }

    fn slice_a() -> OrderSlice {
        OrderSlice {
            slice_id: "slice_001".to_string(),
            start: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            end: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            trades: [("A".to_string(), 10_000.0)].into(),
        }
    }

    fn drift(price: f64, volume: f64, timing: f64) -> SymbolDrift {
        SymbolDrift {
            symbol: "A".to_string(),
            price_drift: price,
            volume_drift: volume,
            timing_drift_seconds: timing,
        }
    }

    #[test]
    fn drift_is_measured_against_plan_and_reference() {
        let fills: BTreeMap<String, SymbolFill> = [(
            "A".to_string(),
            SymbolFill {
                price: 101.5,
                value: 9_000.0,
                completed_at: NaiveTime::from_hms_opt(10, 4, 0).unwrap(),
            },
        )]
        .into();
        let reference: BTreeMap<String, f64> = [("A".to_string(), 100.0)].into();
        let drifts = measure_drift(&slice_a(), &reference, &fills);
        assert_eq!(drifts.len(), 1);
        assert!((drifts[0].price_drift - 0.015).abs() < 1e-12);
        assert!((drifts[0].volume_drift + 0.1).abs() < 1e-12);
        assert_eq!(drifts[0].timing_drift_seconds, 240.0);

        let alerts = check_drift_alerts(&drifts, &DriftThresholds::default());
        let kinds: Vec<(DriftKind, AlertSeverity)> = alerts.iter().map(|a| (a.kind, a.severity)).collect();
        assert_eq!(
            kinds,
            vec![
                (DriftKind::PriceDrift, AlertSeverity::Medium),
                (DriftKind::VolumeDrift, AlertSeverity::Medium),
                (DriftKind::TimingDrift, AlertSeverity::Medium),
            ]
        );
        assert!(measure_drift(&slice_a(), &BTreeMap::new(), &fills).is_empty());
    }

    #[test]
    fn drift_thresholds_are_strict() {
        let thresholds = DriftThresholds::default();
        assert!(check_drift_alerts(&[drift(0.01, -0.05, 180.0)], &thresholds).is_empty());

        let alerts = check_drift_alerts(&[drift(-0.0201, 0.0501, 300.0)], &thresholds);
        let kinds: Vec<(DriftKind, AlertSeverity)> = alerts.iter().map(|a| (a.kind, a.severity)).collect();
        assert_eq!(
            kinds,
            vec![
                (DriftKind::PriceDrift, AlertSeverity::High),
                (DriftKind::VolumeDrift, AlertSeverity::Medium),
                (DriftKind::TimingDrift, AlertSeverity::Medium),
            ]
        );

        let alerts = check_drift_alerts(&[drift(0.0, 0.2, -301.0)], &thresholds);
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.severity == AlertSeverity::High));
        assert_eq!(alerts[1].threshold, 180.0);
    }

    #[test]
    fn fill_summary_tracks_progress_against_target() {
        let approved = approve(&[("A", 0.1)]);
        let params = SlicingParams {
            algorithm: SlicingAlgorithm::Twap,
            window_minutes: 60,
            ..Default::default()
        };
        let plan = plan_execution(&PortfolioWeights::new(), &approved, 1_000_000.0, &params, None).unwrap();
        let mut summary = OrderFillSummary::new(&plan);
        assert_eq!(summary.total_slices, 2);
        assert_eq!(summary.status(), FillStatus::Pending);

        let first: BTreeMap<String, f64> = [("A".to_string(), 100.0)].into();
        summary.record(&simulate_slice_execution(&plan.slices[0], &first, COMMISSION_RATE));
        assert_eq!(summary.status(), FillStatus::InProgress);
        assert!((summary.fill_ratio() - 0.5).abs() < 1e-12);

        let second: BTreeMap<String, f64> = [("A".to_string(), 125.0)].into();
        summary.record(&simulate_slice_execution(&plan.slices[1], &second, COMMISSION_RATE));
        assert_eq!(summary.status(), FillStatus::Completed);
        assert!((summary.fill_ratio() - 1.0).abs() < 1e-12);
        // 500 shares at 100 and 400 at 125
        assert!((summary.total_quantity - 900.0).abs() < 1e-9);
        assert!((summary.avg_execution_price - 100_000.0 / 900.0).abs() < 1e-9);
        assert!((summary.total_commission - 100.0).abs() < 1e-9);
    }

    #[test]
    fn windows_past_midnight_are_rejected() {
        let approved = approve(&[("A", 0.1)]);
        let params = SlicingParams {
            start_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            window_minutes: 180,
            ..Default::default()
        };
        let err = plan_execution(&PortfolioWeights::new(), &approved, 1_000_000.0, &params, None).unwrap_err();
        assert!(err.to_string().contains("does not close before midnight"));

        let params = SlicingParams {
            start_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            window_minutes: 90,
            ..Default::default()
        };
        let plan = plan_execution(&PortfolioWeights::new(), &approved, 1_000_000.0, &params, None).unwrap();
        assert_eq!(plan.slices.len(), 3);
        assert_eq!(plan.slices[2].end, NaiveTime::from_hms_opt(23, 30, 0).unwrap());
    }
}
