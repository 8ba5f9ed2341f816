use crate::config::DEFAULT_WINSORIZE_PERCENTILE;
use crate::error::{EngineError, Result};
use crate::models::{AssetObservation, UNCLASSIFIED_SECTOR};
use crate::panel::AssetPanel;
use crate::stats;
use chrono::NaiveDate;
use log::{debug, warn};
use nalgebra::{DMatrix, SymmetricEigen};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    Momentum,
    Value,
    Quality,
    Growth,
    LowVol,
    Size,
    Esg,
}

impl FactorKind {
    pub const ALL: [FactorKind; 7] = [
        FactorKind::Momentum,
        FactorKind::Value,
        FactorKind::Quality,
        FactorKind::Growth,
        FactorKind::LowVol,
        FactorKind::Size,
        FactorKind::Esg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactorKind::Momentum => "momentum",
            FactorKind::Value => "value",
            FactorKind::Quality => "quality",
            FactorKind::Growth => "growth",
            FactorKind::LowVol => "low_vol",
            FactorKind::Size => "size",
            FactorKind::Esg => "esg",
        }
    }
}

impl fmt::Display for FactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactorKind {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "momentum" => Ok(FactorKind::Momentum),
            "value" => Ok(FactorKind::Value),
            "quality" => Ok(FactorKind::Quality),
            "growth" => Ok(FactorKind::Growth),
            "low_vol" | "lowvol" | "low_volatility" => Ok(FactorKind::LowVol),
            "size" => Ok(FactorKind::Size),
            "esg" => Ok(FactorKind::Esg),
            _ => Err(EngineError::validation(format!("unknown factor: {}", raw))),
        }
    }
}

/// Normalization stage a signal has been taken through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeutralizationState {
    Raw,
    ZScored,
    SectorNeutral,
    SizeNeutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorConfig {
    pub lookback: usize,
    pub winsorize_percentile: f64,
    /// Weight in the weighted-sum combination.
    pub weight: f64,
}

impl Default for FactorConfig {
    fn default() -> Self {
        Self {
            lookback: 252,
            winsorize_percentile: DEFAULT_WINSORIZE_PERCENTILE,
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub zscore: bool,
    pub sector_neutralize: bool,
    pub size_neutralize: bool,
    /// Signals are scaled by `1 - decay`.
    pub decay: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            zscore: true,
            sector_neutralize: true,
            size_neutralize: true,
            decay: 0.0,
        }
    }
}

impl PipelineConfig {
    fn final_state(&self) -> NeutralizationState {
        if self.size_neutralize {
            NeutralizationState::SizeNeutral
        } else if self.sector_neutralize {
            NeutralizationState::SectorNeutral
        } else if self.zscore {
            NeutralizationState::ZScored
        } else {
            NeutralizationState::Raw
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombinationMethod {
    #[default]
    WeightedSum,
    Pca,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecipe {
    pub factors: BTreeMap<FactorKind, FactorConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub combination: CombinationMethod,
    /// Signal date; defaults to the last panel date.
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    /// Observations ahead used for the information coefficient.
    #[serde(default = "default_ic_horizon")]
    pub ic_horizon: usize,
    #[serde(default)]
    pub previous_signal: Option<BTreeMap<String, f64>>,
}

fn default_ic_horizon() -> usize {
    21
}

impl SignalRecipe {
    pub fn new(factors: BTreeMap<FactorKind, FactorConfig>) -> Self {
        Self {
            factors,
            pipeline: PipelineConfig::default(),
            combination: CombinationMethod::default(),
            as_of: None,
            ic_horizon: default_ic_horizon(),
            previous_signal: None,
        }
    }

    /// Equal-weighted recipe from factor names; an unknown name is an error naming it.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut factors = BTreeMap::new();
        for name in names {
            let kind = name.as_ref().parse::<FactorKind>()?;
            factors.insert(kind, FactorConfig::default());
        }
        Ok(Self::new(factors))
    }

    pub fn with_lookback(mut self, lookback: usize) -> Self {
        for config in self.factors.values_mut() {
            config.lookback = lookback;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSignal {
    pub name: String,
    pub state: NeutralizationState,
    pub scores: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDiagnostics {
    pub mean: f64,
    pub std: f64,
    pub skewness: f64,
    pub kurtosis: f64,
    pub min: f64,
    pub max: f64,
    pub information_coefficient: f64,
    pub turnover: f64,
    pub concentration: f64,
    pub universe_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalResult {
    pub as_of: NaiveDate,
    pub factor_signals: BTreeMap<FactorKind, FactorSignal>,
    pub combined: FactorSignal,
    pub diagnostics: SignalDiagnostics,
}

/// Maps a combined signal to annual expected returns: `base + scale * score`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReturnModel {
    pub base_return: f64,
    pub signal_scale: f64,
}

impl Default for ReturnModel {
    fn default() -> Self {
        Self {
            base_return: 0.08,
            signal_scale: 0.02,
        }
    }
}

impl ReturnModel {
    pub fn expected_returns(&self, signal: &FactorSignal) -> BTreeMap<String, f64> {
        signal
            .scores
            .iter()
            .map(|(symbol, score)| (symbol.clone(), self.base_return + self.signal_scale * score))
            .collect()
    }
}

pub struct FactorEngine;

impl FactorEngine {
    pub fn compute(panel: &AssetPanel, recipe: &SignalRecipe) -> Result<SignalResult> {
        if panel.is_empty() {
            return Err(EngineError::no_data());
        }
        if recipe.factors.is_empty() {
            return Err(EngineError::validation("recipe names no factors"));
        }
        let as_of = match recipe.as_of {
            Some(date) => date,
            None => panel.last_date().ok_or_else(EngineError::no_data)?,
        };
        if panel.dates_through(as_of).is_empty() {
            return Err(EngineError::no_data());
        }

        let context = CrossSection::new(panel, as_of);
        let factor_signals: BTreeMap<FactorKind, FactorSignal> = recipe
            .factors
            .par_iter()
            .map(|(kind, config)| {
                let signal = Self::factor_signal(panel, &context, *kind, config, &recipe.pipeline)?;
                Ok((*kind, signal))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .collect();

        let combined = Self::combine(&factor_signals, recipe)?;
        let diagnostics = Self::diagnostics(panel, &combined, as_of, recipe);
        debug!(
            "Computed {} factor signals as of {} over {} symbols",
            factor_signals.len(),
            as_of,
            combined.scores.len()
        );

        Ok(SignalResult {
            as_of,
            factor_signals,
            combined,
            diagnostics,
        })
    }

    fn factor_signal(
        panel: &AssetPanel,
        context: &CrossSection,
        kind: FactorKind,
        config: &FactorConfig,
        pipeline: &PipelineConfig,
    ) -> Result<FactorSignal> {
        let raw = Self::raw_scores(panel, context, kind, config);
        if raw.is_empty() {
            return Err(EngineError::validation(format!(
                "factor {} has no scores as of {} (insufficient history or missing fields)",
                kind, context.as_of
            )));
        }

        let symbols: Vec<String> = raw.keys().cloned().collect();
        let values: Vec<f64> = raw.values().copied().collect();
        let mut values = stats::winsorize(&values, config.winsorize_percentile);

        if pipeline.zscore {
            values = stats::zscore(&values);
        }
        if pipeline.sector_neutralize {
            let groups: Vec<String> = symbols.iter().map(|s| context.sector_of(s)).collect();
            demean_within_groups(&mut values, &groups);
        }
        if pipeline.size_neutralize {
            let groups = context.size_quintiles(&symbols);
            demean_within_groups(&mut values, &groups);
        }
        if pipeline.decay > 0.0 {
            let scale = 1.0 - pipeline.decay;
            values.iter_mut().for_each(|v| *v *= scale);
        }

        Ok(FactorSignal {
            name: kind.to_string(),
            state: pipeline.final_state(),
            scores: symbols.into_iter().zip(values).collect(),
        })
    }

    fn raw_scores(
        panel: &AssetPanel,
        context: &CrossSection,
        kind: FactorKind,
        config: &FactorConfig,
    ) -> BTreeMap<String, f64> {
        let mut scores = BTreeMap::new();
        for symbol in panel.symbols() {
            let history = panel.series_through(symbol, context.as_of);
            let latest = match history.last() {
                Some(latest) => latest,
                None => continue,
            };
            let score = match kind {
                FactorKind::Momentum => momentum(history, config.lookback),
                FactorKind::LowVol => low_volatility(history, config.lookback),
                FactorKind::Value => match (
                    latest.fundamentals.pe_ratio,
                    latest.fundamentals.pb_ratio,
                ) {
                    (Some(pe), Some(pb)) => Some(-(pe + pb) / 2.0),
                    _ => None,
                },
                FactorKind::Quality => match (
                    latest.fundamentals.roe,
                    latest.fundamentals.debt_to_equity,
                ) {
                    (Some(roe), Some(de)) => Some(roe - de),
                    _ => None,
                },
                FactorKind::Growth => latest.fundamentals.revenue_growth,
                FactorKind::Size => {
                    (latest.market_cap > 0.0).then(|| -latest.market_cap.ln())
                }
                FactorKind::Esg => latest.esg_score,
            };
            if let Some(score) = score.filter(|s| s.is_finite()) {
                scores.insert(symbol.clone(), score);
            }
        }
        scores
    }

    fn combine(
        signals: &BTreeMap<FactorKind, FactorSignal>,
        recipe: &SignalRecipe,
    ) -> Result<FactorSignal> {
        let mut common: Option<BTreeSet<String>> = None;
        for signal in signals.values() {
            let symbols: BTreeSet<String> = signal.scores.keys().cloned().collect();
            common = Some(match common {
                Some(existing) => existing.intersection(&symbols).cloned().collect(),
                None => symbols,
            });
        }
        let common: Vec<String> = common.unwrap_or_default().into_iter().collect();
        if common.is_empty() {
            return Err(EngineError::validation(
                "no symbol has a score for every requested factor",
            ));
        }

        let scores = match recipe.combination {
            CombinationMethod::WeightedSum => {
                let mut combined = BTreeMap::new();
                for symbol in &common {
                    let value: f64 = signals
                        .iter()
                        .map(|(kind, signal)| {
                            let weight = recipe.factors.get(kind).map(|c| c.weight).unwrap_or(0.0);
                            weight * signal.scores[symbol]
                        })
                        .sum();
                    combined.insert(symbol.clone(), value);
                }
                combined
            }
            CombinationMethod::Pca => first_principal_component(signals, &common)?,
        };

        Ok(FactorSignal {
            name: "combined".to_string(),
            state: recipe.pipeline.final_state(),
            scores,
        })
    }

    fn diagnostics(
        panel: &AssetPanel,
        combined: &FactorSignal,
        as_of: NaiveDate,
        recipe: &SignalRecipe,
    ) -> SignalDiagnostics {
        let values: Vec<f64> = combined.scores.values().copied().collect();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut signal_values = Vec::new();
        let mut forward_returns = Vec::new();
        for (symbol, score) in &combined.scores {
            if let Some(forward) = forward_return(panel.series(symbol), as_of, recipe.ic_horizon) {
                signal_values.push(*score);
                forward_returns.push(forward);
            }
        }
        let information_coefficient = if signal_values.len() >= 3 {
            stats::pearson_correlation(&signal_values, &forward_returns)
        } else {
            0.0
        };

        let turnover = match &recipe.previous_signal {
            Some(previous) => signal_turnover(previous, &combined.scores),
            None => 0.0,
        };

        SignalDiagnostics {
            mean: stats::mean(&values),
            std: stats::sample_std(&values),
            skewness: stats::skewness(&values),
            kurtosis: stats::excess_kurtosis(&values),
            min: if min.is_finite() { min } else { 0.0 },
            max: if max.is_finite() { max } else { 0.0 },
            information_coefficient,
            turnover,
            concentration: stats::herfindahl_of_abs(&values),
            universe_size: values.len(),
        }
    }
}

/// Sector and size groupings of the universe at the signal date.
struct CrossSection {
    as_of: NaiveDate,
    sectors: HashMap<String, String>,
    market_caps: HashMap<String, f64>,
}

impl CrossSection {
    fn new(panel: &AssetPanel, as_of: NaiveDate) -> Self {
        let mut sectors = HashMap::new();
        let mut market_caps = HashMap::new();
        for symbol in panel.symbols() {
            if let Some(latest) = panel.latest(symbol, as_of) {
                if let Some(sector) = &latest.sector {
                    sectors.insert(symbol.clone(), sector.clone());
                }
                if latest.market_cap > 0.0 {
                    market_caps.insert(symbol.clone(), latest.market_cap);
                }
            }
        }
        Self {
            as_of,
            sectors,
            market_caps,
        }
    }

    fn sector_of(&self, symbol: &str) -> String {
        self.sectors
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| UNCLASSIFIED_SECTOR.to_string())
    }

    /// Market-cap quintile label per symbol, ranked within `symbols`.
    fn size_quintiles(&self, symbols: &[String]) -> Vec<String> {
        let mut ranked: Vec<(usize, f64)> = symbols
            .iter()
            .enumerate()
            .filter_map(|(i, s)| self.market_caps.get(s).map(|cap| (i, *cap)))
            .collect();
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut groups = vec!["size_unknown".to_string(); symbols.len()];
        let n = ranked.len();
        for (rank, (i, _)) in ranked.into_iter().enumerate() {
            let quintile = (rank * 5 / n.max(1)).min(4);
            groups[i] = format!("size_q{}", quintile + 1);
        }
        groups
    }
}

fn momentum(history: &[AssetObservation], lookback: usize) -> Option<f64> {
    if lookback == 0 || history.len() <= lookback {
        return None;
    }
    let last = history[history.len() - 1].close;
    let base = history[history.len() - 1 - lookback].close;
    (base > 0.0).then(|| last / base - 1.0)
}

fn low_volatility(history: &[AssetObservation], lookback: usize) -> Option<f64> {
    let returns: Vec<f64> = history
        .iter()
        .rev()
        .take(lookback)
        .filter_map(|o| o.daily_return)
        .collect();
    (returns.len() >= 2).then(|| -stats::sample_std(&returns))
}

fn demean_within_groups(values: &mut [f64], groups: &[String]) {
    let mut sums: HashMap<&str, (f64, usize)> = HashMap::new();
    for (value, group) in values.iter().zip(groups) {
        let entry = sums.entry(group.as_str()).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }
    for (value, group) in values.iter_mut().zip(groups) {
        let (sum, count) = sums[group.as_str()];
        *value -= sum / count as f64;
    }
}

fn first_principal_component(
    signals: &BTreeMap<FactorKind, FactorSignal>,
    symbols: &[String],
) -> Result<BTreeMap<String, f64>> {
    let n = symbols.len();
    let k = signals.len();
    if n < 2 {
        return Err(EngineError::validation(
            "PCA combination needs at least two symbols",
        ));
    }
    let columns: Vec<&FactorSignal> = signals.values().collect();
    let mut data = DMatrix::from_fn(n, k, |i, j| columns[j].scores[&symbols[i]]);
    for j in 0..k {
        let column_mean = data.column(j).mean();
        data.column_mut(j).add_scalar_mut(-column_mean);
    }

    let covariance = data.transpose() * &data / (n as f64 - 1.0);
    let eigen = SymmetricEigen::new(covariance);
    let leading = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .ok_or_else(|| EngineError::validation("PCA combination has no factors"))?;
    let mut loading = eigen.eigenvectors.column(leading).into_owned();
    // Eigenvector sign is arbitrary; orient so loadings sum positive.
    if loading.sum() < 0.0 {
        loading = -loading;
    }
    if eigen.eigenvalues[leading] <= f64::EPSILON {
        warn!("PCA combination: factor scores have no variance, combined signal is flat");
    }

    let projection = &data * loading;
    Ok(symbols
        .iter()
        .cloned()
        .zip(projection.iter().copied())
        .collect())
}

fn forward_return(series: &[AssetObservation], as_of: NaiveDate, horizon: usize) -> Option<f64> {
    if horizon == 0 {
        return None;
    }
    let start = series.binary_search_by(|o| o.date.cmp(&as_of)).ok()?;
    let end = series.get(start + horizon)?;
    let base = series[start].close;
    (base > 0.0).then(|| end.close / base - 1.0)
}

/// Half the L1 distance between the gross-normalized previous and current signals.
pub fn signal_turnover(previous: &BTreeMap<String, f64>, current: &BTreeMap<String, f64>) -> f64 {
    let normalize = |scores: &BTreeMap<String, f64>| -> BTreeMap<String, f64> {
        let gross: f64 = scores.values().map(|v| v.abs()).sum();
        if gross <= f64::EPSILON {
            return BTreeMap::new();
        }
        scores
            .iter()
            .map(|(s, v)| (s.clone(), v / gross))
            .collect()
    };
    let previous = normalize(previous);
    let current = normalize(current);
    let symbols: BTreeSet<&String> = previous.keys().chain(current.keys()).collect();
    0.5 * symbols
        .into_iter()
        .map(|s| {
            (current.get(s).copied().unwrap_or(0.0) - previous.get(s).copied().unwrap_or(0.0))
                .abs()
        })
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fundamentals;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn observation(symbol: &str, day: u32, close: f64, sector: &str, cap: f64) -> AssetObservation {
        AssetObservation {
            symbol: symbol.to_string(),
            date: date(day),
            close,
            daily_return: None,
            volume: 1_000.0,
            market_cap: cap,
            sector: Some(sector.to_string()),
            country: Some("US".to_string()),
            fundamentals: Fundamentals {
                pe_ratio: Some(10.0 + close / 10.0),
                pb_ratio: Some(2.0),
                roe: Some(0.1),
                debt_to_equity: Some(0.5),
                revenue_growth: Some(close / 1000.0),
            },
            betas: None,
            esg_score: Some(50.0),
            adv_ratio: None,
        }
    }

    /// Four symbols over five days with distinct trends.
    fn panel() -> AssetPanel {
        let mut rows = Vec::new();
        let paths: [(&str, [f64; 5], &str, f64); 4] = [
            ("AAA", [100.0, 102.0, 104.0, 106.0, 110.0], "Technology", 4e9),
            ("BBB", [100.0, 99.0, 98.0, 97.0, 95.0], "Technology", 3e9),
            ("CCC", [50.0, 51.0, 50.5, 52.0, 53.0], "Energy", 2e9),
            ("DDD", [80.0, 79.0, 81.0, 78.0, 77.0], "Energy", 1e9),
        ];
        for (symbol, closes, sector, cap) in paths {
            for (i, close) in closes.iter().enumerate() {
                rows.push(observation(symbol, 4 + i as u32, *close, sector, cap));
            }
        }
        AssetPanel::new(rows).unwrap()
    }

    fn raw_recipe(names: &[&str]) -> SignalRecipe {
        let mut recipe = SignalRecipe::from_names(names).unwrap().with_lookback(4);
        recipe.pipeline = PipelineConfig {
            zscore: false,
            sector_neutralize: false,
            size_neutralize: false,
            decay: 0.0,
        };
        for config in recipe.factors.values_mut() {
            config.winsorize_percentile = 0.0;
        }
        recipe
    }

    #[test]
    fn unknown_factor_is_named() {
        let err = SignalRecipe::from_names(&["momentum", "astrology"]).unwrap_err();
        assert!(err.to_string().contains("unknown factor: astrology"));
    }

    #[test]
    fn empty_panel_reports_no_data() {
        let panel = AssetPanel::new(Vec::new()).unwrap();
        let err = FactorEngine::compute(&panel, &raw_recipe(&["momentum"])).unwrap_err();
        assert_eq!(err.to_string(), "Validation error: no data");
    }

    #[test]
    fn raw_momentum_is_lookback_return() {
        let result = FactorEngine::compute(&panel(), &raw_recipe(&["momentum"])).unwrap();
        let momentum = &result.factor_signals[&FactorKind::Momentum];
        assert_eq!(momentum.state, NeutralizationState::Raw);
        assert!((momentum.scores["AAA"] - 0.10).abs() < 1e-12);
        assert!((momentum.scores["BBB"] + 0.05).abs() < 1e-12);
        assert_eq!(result.combined.scores, momentum.scores);
    }

    #[test]
    fn sector_neutral_scores_sum_to_zero_per_sector() {
        let mut recipe = raw_recipe(&["momentum"]);
        recipe.pipeline.zscore = true;
        recipe.pipeline.sector_neutralize = true;
        let result = FactorEngine::compute(&panel(), &recipe).unwrap();
        let scores = &result.factor_signals[&FactorKind::Momentum].scores;
        assert!((scores["AAA"] + scores["BBB"]).abs() < 1e-12);
        assert!((scores["CCC"] + scores["DDD"]).abs() < 1e-12);
        assert_eq!(
            result.combined.state,
            NeutralizationState::SectorNeutral
        );
    }

    #[test]
    fn weighted_sum_uses_factor_weights() {
        let mut recipe = raw_recipe(&["momentum", "growth"]);
        recipe.factors.get_mut(&FactorKind::Growth).unwrap().weight = 2.0;
        let result = FactorEngine::compute(&panel(), &recipe).unwrap();
        let expected = 0.10 + 2.0 * 0.110;
        assert!((result.combined.scores["AAA"] - expected).abs() < 1e-12);
    }

    #[test]
    fn pca_of_single_factor_is_centered_factor() {
        let mut recipe = raw_recipe(&["momentum"]);
        recipe.combination = CombinationMethod::Pca;
        let result = FactorEngine::compute(&panel(), &recipe).unwrap();
        let momentum = &result.factor_signals[&FactorKind::Momentum].scores;
        let mean: f64 = momentum.values().sum::<f64>() / 4.0;
        for (symbol, score) in &result.combined.scores {
            assert!((score - (momentum[symbol] - mean)).abs() < 1e-9);
        }
    }

    #[test]
    fn diagnostics_report_ic_from_forward_returns() {
        let mut recipe = raw_recipe(&["momentum"]).with_lookback(2);
        recipe.as_of = Some(date(6));
        recipe.ic_horizon = 2;
        let result = FactorEngine::compute(&panel(), &recipe).unwrap();
        assert_eq!(result.as_of, date(6));
        assert_eq!(result.diagnostics.universe_size, 4);
        assert!(result.diagnostics.information_coefficient.abs() <= 1.0);
        assert!(result.diagnostics.information_coefficient > 0.0);
        assert!(result.diagnostics.concentration > 0.0);
    }

    #[test]
    fn turnover_against_previous_signal() {
        let previous: BTreeMap<String, f64> =
            [("A".to_string(), 1.0), ("B".to_string(), -1.0)].into();
        let current: BTreeMap<String, f64> =
            [("A".to_string(), -1.0), ("B".to_string(), 1.0)].into();
        assert!((signal_turnover(&previous, &current) - 1.0).abs() < 1e-12);
        assert_eq!(signal_turnover(&previous, &previous), 0.0);
    }
}
