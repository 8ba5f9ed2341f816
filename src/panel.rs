use crate::error::{EngineError, Result};
use crate::models::{AssetObservation, FactorBetas, Fundamentals, SecurityInfo, SecurityMaster};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::{LogNormal, Normal};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

const PANEL_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct PanelSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    observations: Vec<AssetObservation>,
}

/// Read-only table of per-symbol daily observations.
///
/// Rows are stored grouped by symbol and ordered by date, so every symbol's
/// history is one contiguous slice.
#[derive(Debug, Clone)]
pub struct AssetPanel {
    observations: Vec<AssetObservation>,
    symbols: Vec<String>,
    dates: Vec<NaiveDate>,
    index: HashMap<String, Range<usize>>,
}

impl AssetPanel {
    pub fn new(mut observations: Vec<AssetObservation>) -> Result<Self> {
        for observation in &observations {
            if observation.symbol.trim().is_empty() {
                return Err(EngineError::validation(format!(
                    "observation on {} has an empty symbol",
                    observation.date
                )));
            }
            if !observation.close.is_finite() || observation.close <= 0.0 {
                return Err(EngineError::validation(format!(
                    "close for {} on {} must be a positive number (value: {})",
                    observation.symbol, observation.date, observation.close
                )));
            }
        }

        observations.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.date.cmp(&b.date)));

        let mut symbols = Vec::new();
        let mut index = HashMap::new();
        let mut all_dates = BTreeSet::new();
        let mut start = 0;
        for i in 0..observations.len() {
            all_dates.insert(observations[i].date);
            if i > 0 && observations[i].symbol == observations[i - 1].symbol {
                if observations[i].date == observations[i - 1].date {
                    return Err(EngineError::validation(format!(
                        "duplicate observation for {} on {}",
                        observations[i].symbol, observations[i].date
                    )));
                }
                if observations[i].daily_return.is_none() {
                    let previous = observations[i - 1].close;
                    observations[i].daily_return = Some(observations[i].close / previous - 1.0);
                }
            }
            let is_last = i + 1 == observations.len()
                || observations[i + 1].symbol != observations[i].symbol;
            if is_last {
                let symbol = observations[i].symbol.clone();
                index.insert(symbol.clone(), start..i + 1);
                symbols.push(symbol);
                start = i + 1;
            }
        }

        Ok(Self {
            observations,
            symbols,
            dates: all_dates.into_iter().collect(),
            index,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Union of observation dates across symbols, ascending.
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn dates_through(&self, as_of: NaiveDate) -> &[NaiveDate] {
        let end = self.dates.partition_point(|d| *d <= as_of);
        &self.dates[..end]
    }

    pub fn observations(&self) -> &[AssetObservation] {
        &self.observations
    }

    pub fn series(&self, symbol: &str) -> &[AssetObservation] {
        match self.index.get(symbol) {
            Some(range) => &self.observations[range.clone()],
            None => &[],
        }
    }

    /// History of a symbol up to and including `as_of`.
    pub fn series_through(&self, symbol: &str, as_of: NaiveDate) -> &[AssetObservation] {
        let series = self.series(symbol);
        let end = series.partition_point(|o| o.date <= as_of);
        &series[..end]
    }

    pub fn latest(&self, symbol: &str, as_of: NaiveDate) -> Option<&AssetObservation> {
        self.series_through(symbol, as_of).last()
    }

    pub fn observation_on(&self, symbol: &str, date: NaiveDate) -> Option<&AssetObservation> {
        let series = self.series(symbol);
        series
            .binary_search_by(|o| o.date.cmp(&date))
            .ok()
            .map(|i| &series[i])
    }

    /// Last known close on or before `date`.
    pub fn price_on_or_before(&self, symbol: &str, date: NaiveDate) -> Option<f64> {
        self.latest(symbol, date).map(|o| o.close)
    }

    pub fn return_on(&self, symbol: &str, date: NaiveDate) -> Option<f64> {
        self.observation_on(symbol, date)
            .and_then(|o| o.daily_return)
            .filter(|r| r.is_finite())
    }

    /// Daily returns of `symbols` over the trailing `window` dates ending at
    /// `as_of`, keeping only dates on which every symbol has a return.
    /// Rows are oldest first; columns follow `symbols`.
    pub fn aligned_returns(
        &self,
        symbols: &[String],
        as_of: NaiveDate,
        window: usize,
    ) -> Vec<(NaiveDate, Vec<f64>)> {
        let mut rows = Vec::with_capacity(window);
        for date in self.dates_through(as_of).iter().rev() {
            if rows.len() == window {
                break;
            }
            let row: Option<Vec<f64>> = symbols
                .iter()
                .map(|symbol| self.return_on(symbol, *date))
                .collect();
            if let Some(row) = row {
                rows.push((*date, row));
            }
        }
        rows.reverse();
        rows
    }

    /// Attributes of every symbol from its latest observation on or before `as_of`.
    pub fn security_master(&self, as_of: NaiveDate) -> SecurityMaster {
        let mut master = SecurityMaster::new();
        for symbol in &self.symbols {
            if let Some(observation) = self.latest(symbol, as_of) {
                master.insert(symbol.clone(), SecurityInfo::from_observation(observation));
            }
        }
        master
    }

    pub fn restrict_to_symbols(&self, allowed: &BTreeSet<String>) -> Result<Self> {
        let filtered: Vec<AssetObservation> = self
            .observations
            .iter()
            .filter(|o| allowed.contains(&o.symbol))
            .cloned()
            .collect();
        if filtered.is_empty() {
            return Err(EngineError::no_data());
        }
        Self::new(filtered)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading asset panel snapshot from {}", path.display());
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let snapshot: PanelSnapshot = bincode::deserialize_from(reader)?;

        if snapshot.version != PANEL_SNAPSHOT_VERSION {
            return Err(EngineError::validation(format!(
                "Asset panel snapshot version mismatch (found {}, expected {})",
                snapshot.version, PANEL_SNAPSHOT_VERSION
            )));
        }
        debug!(
            "Snapshot generated at {} with {} observations",
            snapshot.generated_at,
            snapshot.observations.len()
        );
        Self::new(snapshot.observations)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let snapshot = PanelSnapshot {
            version: PANEL_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            observations: self.observations.clone(),
        };
        bincode::serialize_into(&mut writer, &snapshot)?;
        writer.flush()?;
        Ok(())
    }
}

/// Source of asset panels. Market data ingestion lives outside the engine.
pub trait PanelProvider: Send + Sync {
    fn load_panel(&self) -> Result<AssetPanel>;
}

pub struct SnapshotPanelProvider {
    path: PathBuf,
}

impl SnapshotPanelProvider {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl PanelProvider for SnapshotPanelProvider {
    fn load_panel(&self) -> Result<AssetPanel> {
        AssetPanel::load_from_file(&self.path)
    }
}

pub struct InMemoryPanelProvider {
    observations: Vec<AssetObservation>,
}

impl InMemoryPanelProvider {
    pub fn new(observations: Vec<AssetObservation>) -> Self {
        Self { observations }
    }
}

impl PanelProvider for InMemoryPanelProvider {
    fn load_panel(&self) -> Result<AssetPanel> {
        if self.observations.is_empty() {
            return Err(EngineError::no_data());
        }
        AssetPanel::new(self.observations.clone())
    }
}

const SYNTHETIC_SECTORS: &[&str] = &[
    "Technology",
    "Healthcare",
    "Financials",
    "Energy",
    "Consumer",
    "Industrials",
    "Utilities",
];
const SYNTHETIC_COUNTRIES: &[&str] = &["US", "US", "US", "GB", "DE", "JP"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticPanelConfig {
    pub symbols: usize,
    pub trading_days: usize,
    pub start_date: NaiveDate,
    pub seed: u64,
}

impl Default for SyntheticPanelConfig {
    fn default() -> Self {
        Self {
            symbols: 20,
            trading_days: 504,
            start_date: NaiveDate::from_ymd_opt(2022, 1, 3).unwrap_or_default(),
            seed: 42,
        }
    }
}

/// Seeded geometric random walk panel. The same config always yields the same panel.
pub struct SyntheticPanelProvider {
    config: SyntheticPanelConfig,
}

impl SyntheticPanelProvider {
    pub fn new(config: SyntheticPanelConfig) -> Self {
        Self { config }
    }

    fn business_days(start: NaiveDate, count: usize) -> Vec<NaiveDate> {
        let mut days = Vec::with_capacity(count);
        let mut current = start;
        while days.len() < count {
            if !matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
                days.push(current);
            }
            current += Duration::days(1);
        }
        days
    }

    fn generate(&self) -> Result<Vec<AssetObservation>> {
        let config = &self.config;
        if config.symbols == 0 || config.trading_days < 2 {
            return Err(EngineError::validation(
                "synthetic panel needs at least one symbol and two trading days",
            ));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let dates = Self::business_days(config.start_date, config.trading_days);
        let distribution_error = |e: statrs::StatsError| EngineError::validation(e.to_string());
        let market_factor = Normal::new(0.0003, 0.009).map_err(distribution_error)?;
        let market_returns: Vec<f64> = dates.iter().map(|_| rng.sample(market_factor)).collect();

        let cap_distribution = LogNormal::new(23.0, 1.0).map_err(distribution_error)?;
        let volume_distribution = LogNormal::new(13.8, 0.5).map_err(distribution_error)?;

        let mut observations = Vec::with_capacity(config.symbols * dates.len());
        for i in 0..config.symbols {
            let symbol = format!("A{:03}", i);
            let sector = SYNTHETIC_SECTORS[i % SYNTHETIC_SECTORS.len()];
            let country = SYNTHETIC_COUNTRIES[rng.gen_range(0..SYNTHETIC_COUNTRIES.len())];
            let betas = FactorBetas {
                market: rng.gen_range(0.5..1.6),
                size: rng.gen_range(-0.5..0.5),
                value: rng.gen_range(-0.5..0.5),
                momentum: rng.gen_range(-0.5..0.5),
            };
            let idiosyncratic =
                Normal::new(0.0001, rng.gen_range(0.008..0.02)).map_err(distribution_error)?;
            let shares_outstanding = rng.sample(cap_distribution) / 100.0;
            let fundamentals = Fundamentals {
                pe_ratio: Some(rng.gen_range(8.0..40.0)),
                pb_ratio: Some(rng.gen_range(0.8..8.0)),
                roe: Some(rng.gen_range(-0.05..0.30)),
                debt_to_equity: Some(rng.gen_range(0.1..2.5)),
                revenue_growth: Some(rng.gen_range(-0.10..0.25)),
            };
            let esg_score = rng.gen_range(20.0..90.0);
            let adv_ratio = rng.gen_range(0.001..0.05);

            let mut close: f64 = rng.gen_range(20.0..200.0);
            for (day, date) in dates.iter().enumerate() {
                let daily_return = if day == 0 {
                    None
                } else {
                    let r = betas.market * market_returns[day] + rng.sample(idiosyncratic);
                    close *= 1.0 + r;
                    Some(r)
                };
                observations.push(AssetObservation {
                    symbol: symbol.clone(),
                    date: *date,
                    close,
                    daily_return,
                    volume: rng.sample(volume_distribution).round(),
                    market_cap: close * shares_outstanding,
                    sector: Some(sector.to_string()),
                    country: Some(country.to_string()),
                    fundamentals: fundamentals.clone(),
                    betas: Some(betas),
                    esg_score: Some(esg_score),
                    adv_ratio: Some(adv_ratio),
                });
            }
        }
        Ok(observations)
    }
}

impl PanelProvider for SyntheticPanelProvider {
    fn load_panel(&self) -> Result<AssetPanel> {
        let observations = self.generate()?;
        info!(
            "Generated synthetic panel: {} symbols x {} days (seed {})",
            self.config.symbols, self.config.trading_days, self.config.seed
        );
        AssetPanel::new(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(symbol: &str, day: u32, close: f64) -> AssetObservation {
        AssetObservation {
            symbol: symbol.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            close,
            daily_return: None,
            volume: 1000.0,
            market_cap: 1e9,
            sector: Some("Technology".to_string()),
            country: Some("US".to_string()),
            fundamentals: Fundamentals::default(),
            betas: None,
            esg_score: None,
            adv_ratio: None,
        }
    }

    #[test]
    fn new_sorts_and_derives_returns() {
        let panel = AssetPanel::new(vec![
            observation("B", 3, 11.0),
            observation("A", 2, 10.0),
            observation("B", 2, 10.0),
            observation("A", 3, 12.0),
        ])
        .unwrap();
        assert_eq!(panel.symbols(), &["A".to_string(), "B".to_string()]);
        assert_eq!(panel.dates().len(), 2);
        let a = panel.series("A");
        assert!(a[0].daily_return.is_none());
        assert!((a[1].daily_return.unwrap() - 0.2).abs() < 1e-12);
        let day3 = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        assert!((panel.return_on("B", day3).unwrap() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let err = AssetPanel::new(vec![observation("A", 2, 10.0), observation("A", 2, 11.0)])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate observation for A"));
    }

    #[test]
    fn aligned_returns_skip_incomplete_dates() {
        let panel = AssetPanel::new(vec![
            observation("A", 2, 10.0),
            observation("A", 3, 11.0),
            observation("A", 4, 12.1),
            observation("B", 2, 20.0),
            observation("B", 4, 22.0),
        ])
        .unwrap();
        let symbols = vec!["A".to_string(), "B".to_string()];
        let as_of = NaiveDate::from_ymd_opt(2024, 1, 4).unwrap();
        let rows = panel.aligned_returns(&symbols, as_of, 10);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, as_of);
        assert!((rows[0].1[1] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn synthetic_panel_is_reproducible() {
        let config = SyntheticPanelConfig {
            symbols: 3,
            trading_days: 30,
            ..Default::default()
        };
        let first = SyntheticPanelProvider::new(config.clone()).load_panel().unwrap();
        let second = SyntheticPanelProvider::new(config).load_panel().unwrap();
        assert_eq!(first.observations(), second.observations());
        assert_eq!(first.symbols().len(), 3);
        assert_eq!(first.dates().len(), 30);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.bin");
        let panel = AssetPanel::new(vec![observation("A", 2, 10.0), observation("A", 3, 11.0)])
            .unwrap();
        panel.save_to_file(&path).unwrap();
        let loaded = AssetPanel::load_from_file(&path).unwrap();
        assert_eq!(loaded.observations(), panel.observations());
    }
}
