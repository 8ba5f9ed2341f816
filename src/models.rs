use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weights below this magnitude count as flat positions.
pub const ZERO_WEIGHT_THRESHOLD: f64 = 1e-4;

pub const UNCLASSIFIED_SECTOR: &str = "Unclassified";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fundamentals {
    #[serde(default)]
    pub pe_ratio: Option<f64>,
    #[serde(default)]
    pub pb_ratio: Option<f64>,
    #[serde(default)]
    pub roe: Option<f64>,
    #[serde(default)]
    pub debt_to_equity: Option<f64>,
    #[serde(default)]
    pub revenue_growth: Option<f64>,
}

/// Stored factor loadings of one asset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorBetas {
    pub market: f64,
    pub size: f64,
    pub value: f64,
    pub momentum: f64,
}

impl Default for FactorBetas {
    fn default() -> Self {
        Self {
            market: 1.0,
            size: 0.0,
            value: 0.0,
            momentum: 0.0,
        }
    }
}

/// One row of the asset panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetObservation {
    pub symbol: String,
    pub date: NaiveDate,
    pub close: f64,
    /// Close-to-close return; derived from consecutive closes when absent.
    #[serde(default)]
    pub daily_return: Option<f64>,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub market_cap: f64,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub fundamentals: Fundamentals,
    #[serde(default)]
    pub betas: Option<FactorBetas>,
    #[serde(default)]
    pub esg_score: Option<f64>,
    /// Average daily volume as a fraction of shares outstanding.
    #[serde(default)]
    pub adv_ratio: Option<f64>,
}

/// Signed fraction of NAV per symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortfolioWeights(BTreeMap<String, f64>);

impl PortfolioWeights {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_map(weights: BTreeMap<String, f64>) -> Self {
        Self(weights)
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self(pairs.into_iter().map(|(s, w)| (s.into(), w)).collect())
    }

    pub fn insert<S: Into<String>>(&mut self, symbol: S, weight: f64) {
        self.0.insert(symbol.into(), weight);
    }

    pub fn get(&self, symbol: &str) -> f64 {
        self.0.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }

    pub fn into_map(self) -> BTreeMap<String, f64> {
        self.0
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn gross_exposure(&self) -> f64 {
        self.0.values().map(|w| w.abs()).sum()
    }

    pub fn net_exposure(&self) -> f64 {
        self.sum()
    }

    pub fn max_weight(&self) -> f64 {
        self.0.values().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn herfindahl(&self) -> f64 {
        self.0.values().map(|w| w * w).sum()
    }

    pub fn active_positions(&self) -> usize {
        self.0
            .values()
            .filter(|w| w.abs() > ZERO_WEIGHT_THRESHOLD)
            .count()
    }
}

impl FromIterator<(String, f64)> for PortfolioWeights {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PortfolioMode {
    #[default]
    LongOnly,
    LongShort,
}

/// Static attributes of one security used by constraints, risk and compliance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityInfo {
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub betas: Option<FactorBetas>,
    #[serde(default)]
    pub esg_score: Option<f64>,
    #[serde(default)]
    pub adv_ratio: Option<f64>,
    #[serde(default)]
    pub restricted: bool,
    #[serde(default)]
    pub watchlist: bool,
}

impl SecurityInfo {
    pub fn from_observation(observation: &AssetObservation) -> Self {
        Self {
            sector: observation.sector.clone(),
            country: observation.country.clone(),
            market_cap: (observation.market_cap > 0.0).then_some(observation.market_cap),
            betas: observation.betas,
            esg_score: observation.esg_score,
            adv_ratio: observation.adv_ratio,
            restricted: false,
            watchlist: false,
        }
    }

    pub fn sector_or_unclassified(&self) -> &str {
        self.sector.as_deref().unwrap_or(UNCLASSIFIED_SECTOR)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityMaster(BTreeMap<String, SecurityInfo>);

impl SecurityMaster {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert<S: Into<String>>(&mut self, symbol: S, info: SecurityInfo) {
        self.0.insert(symbol.into(), info);
    }

    pub fn get(&self, symbol: &str) -> Option<&SecurityInfo> {
        self.0.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut SecurityInfo> {
        self.0.get_mut(symbol)
    }

    pub fn sector_of(&self, symbol: &str) -> Option<&str> {
        self.0.get(symbol).and_then(|info| info.sector.as_deref())
    }

    pub fn market_beta(&self, symbol: &str) -> Option<f64> {
        self.0
            .get(symbol)
            .and_then(|info| info.betas)
            .map(|betas| betas.market)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SecurityInfo)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub date: NaiveDate,
    pub symbol: String,
    pub side: TradeSide,
    /// Signed share change.
    pub shares: f64,
    pub price: f64,
    /// Signed notional, shares * price.
    pub value: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
    pub cash: f64,
    /// Sum of absolute position notionals as a fraction of value.
    pub gross_exposure: f64,
    /// Signed position notionals as a fraction of value.
    pub net_exposure: f64,
    pub rebalanced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceFrequency {
    Daily,
    Weekly,
    #[default]
    Monthly,
}

impl RebalanceFrequency {
    pub fn periods_per_year(self) -> f64 {
        match self {
            Self::Daily => 252.0,
            Self::Weekly => 52.0,
            Self::Monthly => 12.0,
        }
    }

    /// Calendar bucket a date falls in; rebalancing happens on the last
    /// trading date of each bucket.
    pub fn bucket(self, date: NaiveDate) -> (i32, u32) {
        match self {
            Self::Daily => (date.year(), date.ordinal()),
            Self::Weekly => {
                let week = date.iso_week();
                (week.year(), week.week())
            }
            Self::Monthly => (date.year(), date.month()),
        }
    }

    /// Picks the rebalance dates out of an ordered trading calendar.
    pub fn schedule(self, dates: &[NaiveDate]) -> Vec<NaiveDate> {
        let mut schedule = Vec::new();
        for (index, date) in dates.iter().enumerate() {
            let is_last_in_bucket = match dates.get(index + 1) {
                Some(next) => self.bucket(*next) != self.bucket(*date),
                None => true,
            };
            if is_last_in_bucket {
                schedule.push(*date);
            }
        }
        schedule
    }
}

impl std::str::FromStr for RebalanceFrequency {
    type Err = crate::error::EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" | "d" => Ok(Self::Daily),
            "weekly" | "w" => Ok(Self::Weekly),
            "monthly" | "m" => Ok(Self::Monthly),
            other => Err(crate::error::EngineError::validation(format!(
                "unknown rebalance frequency: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn monthly_schedule_uses_last_trading_day() {
        let dates = vec![
            date(2024, 1, 30),
            date(2024, 1, 31),
            date(2024, 2, 1),
            date(2024, 2, 28),
            date(2024, 3, 1),
        ];
        let schedule = RebalanceFrequency::Monthly.schedule(&dates);
        assert_eq!(
            schedule,
            vec![date(2024, 1, 31), date(2024, 2, 28), date(2024, 3, 1)]
        );
        assert_eq!(RebalanceFrequency::Daily.schedule(&dates), dates);
    }

    #[test]
    fn weekly_schedule_groups_iso_weeks() {
        // 2024-01-05 is a Friday, 2024-01-08 the following Monday.
        let dates = vec![date(2024, 1, 4), date(2024, 1, 5), date(2024, 1, 8)];
        let schedule = RebalanceFrequency::Weekly.schedule(&dates);
        assert_eq!(schedule, vec![date(2024, 1, 5), date(2024, 1, 8)]);
    }

    #[test]
    fn weights_exposures() {
        let weights = PortfolioWeights::from_pairs([("A", 0.6), ("B", -0.2), ("C", 0.00001)]);
        assert!((weights.gross_exposure() - 0.80001).abs() < 1e-12);
        assert!((weights.net_exposure() - 0.40001).abs() < 1e-12);
        assert_eq!(weights.active_positions(), 2);
        assert_eq!(weights.get("missing"), 0.0);
    }

    #[test]
    fn frequency_parse_rejects_unknown() {
        assert_eq!(
            "Weekly".parse::<RebalanceFrequency>().unwrap(),
            RebalanceFrequency::Weekly
        );
        assert!("hourly".parse::<RebalanceFrequency>().is_err());
    }
}
