use crate::error::{EngineError, Result};
use std::collections::HashMap;
use std::env;

pub const DEFAULT_TRANSACTION_COST_RATE: f64 = 0.001;
pub const DEFAULT_BORROW_COST_ANNUAL_RATE: f64 = 0.02;
pub const DEFAULT_RISK_FREE_RATE: f64 = 0.02;
pub const DEFAULT_SHRINKAGE_INTENSITY: f64 = 0.3;
pub const DEFAULT_WINSORIZE_PERCENTILE: f64 = 0.05;
pub const DEFAULT_SOLVER_MAX_ITERATIONS: usize = 20_000;
pub const DEFAULT_SOLVER_TOLERANCE: f64 = 1e-10;
pub const DEFAULT_MIN_TRADE_SHARES: f64 = 1e-6;

const SETTING_KEYS: &[&str] = &[
    "TRANSACTION_COST_RATE",
    "BORROW_COST_ANNUAL_RATE",
    "RISK_FREE_RATE",
    "SHRINKAGE_INTENSITY",
    "WINSORIZE_PERCENTILE",
    "WORKER_THREADS",
    "SOLVER_MAX_ITERATIONS",
    "SOLVER_TOLERANCE",
    "MIN_TRADE_SHARES",
];

/// Solver knobs shared by every optimization method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_SOLVER_MAX_ITERATIONS,
            tolerance: DEFAULT_SOLVER_TOLERANCE,
        }
    }
}

/// Process-level defaults. Per-call parameter structs override these.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub transaction_cost_rate: f64,
    pub borrow_cost_annual_rate: f64,
    pub risk_free_rate: f64,
    pub shrinkage_intensity: f64,
    pub winsorize_percentile: f64,
    pub worker_threads: usize,
    pub solver: SolverSettings,
    pub min_trade_shares: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            transaction_cost_rate: DEFAULT_TRANSACTION_COST_RATE,
            borrow_cost_annual_rate: DEFAULT_BORROW_COST_ANNUAL_RATE,
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
            shrinkage_intensity: DEFAULT_SHRINKAGE_INTENSITY,
            winsorize_percentile: DEFAULT_WINSORIZE_PERCENTILE,
            worker_threads: num_cpus::get().max(1),
            solver: SolverSettings::default(),
            min_trade_shares: DEFAULT_MIN_TRADE_SHARES,
        }
    }
}

impl EngineSettings {
    /// Reads every known key from the process environment; unset keys keep defaults.
    pub fn from_env() -> Result<Self> {
        let settings: HashMap<String, String> = SETTING_KEYS
            .iter()
            .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect();
        Self::from_settings_map(&settings)
    }

    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let transaction_cost_rate = optional_setting_f64(
            settings,
            "TRANSACTION_COST_RATE",
            defaults.transaction_cost_rate,
            Some(0.0),
            Some(1.0),
        )?;
        let borrow_cost_annual_rate = optional_setting_f64(
            settings,
            "BORROW_COST_ANNUAL_RATE",
            defaults.borrow_cost_annual_rate,
            Some(0.0),
            None,
        )?;
        let risk_free_rate = optional_setting_f64(
            settings,
            "RISK_FREE_RATE",
            defaults.risk_free_rate,
            None,
            None,
        )?;
        let shrinkage_intensity = optional_setting_f64(
            settings,
            "SHRINKAGE_INTENSITY",
            defaults.shrinkage_intensity,
            Some(0.0),
            Some(1.0),
        )?;
        let winsorize_percentile = optional_setting_f64(
            settings,
            "WINSORIZE_PERCENTILE",
            defaults.winsorize_percentile,
            Some(0.0),
            Some(0.5),
        )?;
        let worker_threads =
            optional_setting_usize(settings, "WORKER_THREADS", defaults.worker_threads, 1)?;
        let max_iterations = optional_setting_usize(
            settings,
            "SOLVER_MAX_ITERATIONS",
            defaults.solver.max_iterations,
            1,
        )?;
        let tolerance = optional_setting_f64(
            settings,
            "SOLVER_TOLERANCE",
            defaults.solver.tolerance,
            Some(0.0),
            None,
        )?;
        if tolerance <= 0.0 {
            return Err(EngineError::validation(format!(
                "Setting SOLVER_TOLERANCE must be > 0 (value: {})",
                tolerance
            )));
        }
        let min_trade_shares = optional_setting_f64(
            settings,
            "MIN_TRADE_SHARES",
            defaults.min_trade_shares,
            Some(0.0),
            None,
        )?;

        Ok(Self {
            transaction_cost_rate,
            borrow_cost_annual_rate,
            risk_free_rate,
            shrinkage_intensity,
            winsorize_percentile,
            worker_threads,
            solver: SolverSettings {
                max_iterations,
                tolerance,
            },
            min_trade_shares,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let raw = match optional_setting(settings, key) {
        Some(raw) => raw,
        None => return Ok(default),
    };
    let value = raw.parse::<f64>().map_err(|_| {
        EngineError::validation(format!("Setting {} must be a number (value: {})", key, raw))
    })?;
    if !value.is_finite() {
        return Err(EngineError::validation(format!(
            "Setting {} must be finite (value: {})",
            key, raw
        )));
    }
    if let Some(min) = min {
        if value < min {
            return Err(EngineError::validation(format!(
                "Setting {} must be >= {} (value: {})",
                key, min, raw
            )));
        }
    }
    if let Some(max) = max {
        if value > max {
            return Err(EngineError::validation(format!(
                "Setting {} must be <= {} (value: {})",
                key, max, raw
            )));
        }
    }
    Ok(value)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let raw = match optional_setting(settings, key) {
        Some(raw) => raw,
        None => return Ok(default),
    };
    let value = raw.parse::<f64>().map_err(|_| {
        EngineError::validation(format!("Setting {} must be a number (value: {})", key, raw))
    })?;
    if !value.is_finite() {
        return Err(EngineError::validation(format!(
            "Setting {} must be finite (value: {})",
            key, raw
        )));
    }
    if value.fract() != 0.0 {
        return Err(EngineError::validation(format!(
            "Setting {} must be an integer (value: {})",
            key, raw
        )));
    }
    if value < min as f64 {
        return Err(EngineError::validation(format!(
            "Setting {} must be >= {} (value: {})",
            key, min, raw
        )));
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_map_yields_defaults() {
        let parsed = EngineSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(parsed.transaction_cost_rate, 0.001);
        assert_eq!(parsed.borrow_cost_annual_rate, 0.02);
        assert_eq!(parsed.shrinkage_intensity, 0.3);
        assert_eq!(parsed.solver.max_iterations, 20_000);
        assert!(parsed.worker_threads >= 1);
    }

    #[test]
    fn overrides_are_parsed_and_bounded() {
        let parsed = EngineSettings::from_settings_map(&settings(&[
            ("TRANSACTION_COST_RATE", "0.0005"),
            ("WORKER_THREADS", "3"),
        ]))
        .unwrap();
        assert_eq!(parsed.transaction_cost_rate, 0.0005);
        assert_eq!(parsed.worker_threads, 3);

        let err = EngineSettings::from_settings_map(&settings(&[("SHRINKAGE_INTENSITY", "1.5")]))
            .unwrap_err();
        assert!(err.to_string().contains("SHRINKAGE_INTENSITY must be <= 1"));

        let err = EngineSettings::from_settings_map(&settings(&[("WORKER_THREADS", "2.5")]))
            .unwrap_err();
        assert!(err.to_string().contains("must be an integer"));

        let err = EngineSettings::from_settings_map(&settings(&[("RISK_FREE_RATE", "abc")]))
            .unwrap_err();
        assert!(err.to_string().contains("must be a number"));
    }
}
