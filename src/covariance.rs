use crate::config::DEFAULT_SHRINKAGE_INTENSITY;
use crate::error::{EngineError, Result, SolverStatus};
use crate::panel::AssetPanel;
use crate::stats::TRADING_DAYS_PER_YEAR;
use chrono::NaiveDate;
use log::debug;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};

/// How the sample matrix is blended toward the constant-correlation target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShrinkageConfig {
    Disabled,
    Fixed(f64),
    /// Intensity estimated from the data (Ledoit and Wolf, constant correlation).
    LedoitWolf,
}

impl Default for ShrinkageConfig {
    fn default() -> Self {
        ShrinkageConfig::Fixed(DEFAULT_SHRINKAGE_INTENSITY)
    }
}

/// Annualized covariance of daily returns indexed by symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceMatrix {
    pub symbols: Vec<String>,
    pub matrix: DMatrix<f64>,
    pub shrinkage_intensity: f64,
    pub observations: usize,
    pub as_of: Option<NaiveDate>,
}

impl CovarianceMatrix {
    pub fn from_matrix(symbols: Vec<String>, matrix: DMatrix<f64>) -> Result<Self> {
        let n = symbols.len();
        if matrix.nrows() != n || matrix.ncols() != n {
            return Err(EngineError::validation(format!(
                "covariance matrix is {}x{} but {} symbols were given",
                matrix.nrows(),
                matrix.ncols(),
                n
            )));
        }
        for (i, symbol) in symbols.iter().enumerate() {
            let variance = matrix[(i, i)];
            if !variance.is_finite() || variance <= 0.0 {
                return Err(EngineError::numerical(
                    SolverStatus::Singular,
                    format!("asset {} has non-positive variance ({})", symbol, variance),
                ));
            }
        }
        let symmetric = (&matrix + matrix.transpose()) * 0.5;
        Ok(Self {
            symbols,
            matrix: symmetric,
            shrinkage_intensity: 0.0,
            observations: 0,
            as_of: None,
        })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s == symbol)
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        Some(self.matrix[(self.index_of(a)?, self.index_of(b)?)])
    }

    pub fn variance(&self, symbol: &str) -> Option<f64> {
        self.get(symbol, symbol)
    }

    pub fn min_eigenvalue(&self) -> f64 {
        SymmetricEigen::new(self.matrix.clone())
            .eigenvalues
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    /// Restricts to a subset of symbols, in the given order.
    pub fn subset(&self, symbols: &[String]) -> Result<Self> {
        let indices: Vec<usize> = symbols
            .iter()
            .map(|s| {
                self.index_of(s).ok_or_else(|| {
                    EngineError::validation(format!("symbol {} is not in the covariance matrix", s))
                })
            })
            .collect::<Result<_>>()?;
        let matrix = DMatrix::from_fn(indices.len(), indices.len(), |i, j| {
            self.matrix[(indices[i], indices[j])]
        });
        Ok(Self {
            symbols: symbols.to_vec(),
            matrix,
            shrinkage_intensity: self.shrinkage_intensity,
            observations: self.observations,
            as_of: self.as_of,
        })
    }

    /// Blends toward the constant-correlation target built from this matrix.
    ///
    /// Blending keeps the variances and the average correlation, so the target
    /// is unchanged and repeated passes compose: the recorded intensity is
    /// `1 - (1 - previous)(1 - intensity)`.
    pub fn shrunk(&self, intensity: f64) -> Self {
        let target = constant_correlation_target(&self.matrix);
        let blended = &self.matrix * (1.0 - intensity) + target * intensity;
        Self {
            symbols: self.symbols.clone(),
            matrix: (&blended + blended.transpose()) * 0.5,
            shrinkage_intensity: 1.0 - (1.0 - self.shrinkage_intensity) * (1.0 - intensity),
            observations: self.observations,
            as_of: self.as_of,
        }
    }

    pub fn portfolio_variance(&self, weights: &DVector<f64>) -> f64 {
        (weights.transpose() * &self.matrix * weights)[(0, 0)]
    }
}

pub struct CovarianceEstimator;

impl CovarianceEstimator {
    /// Covariance of every panel symbol over the trailing `window` ending at the last date.
    pub fn estimate(
        panel: &AssetPanel,
        window: usize,
        shrinkage: ShrinkageConfig,
    ) -> Result<CovarianceMatrix> {
        let as_of = panel.last_date().ok_or_else(EngineError::no_data)?;
        Self::estimate_for(panel, panel.symbols(), as_of, window, shrinkage)
    }

    pub fn estimate_for(
        panel: &AssetPanel,
        symbols: &[String],
        as_of: NaiveDate,
        window: usize,
        shrinkage: ShrinkageConfig,
    ) -> Result<CovarianceMatrix> {
        if panel.is_empty() || symbols.is_empty() {
            return Err(EngineError::no_data());
        }
        if window < 2 {
            return Err(EngineError::validation(format!(
                "covariance window must be at least 2 (value: {})",
                window
            )));
        }
        let rows = panel.aligned_returns(symbols, as_of, window);
        if rows.len() < 2 {
            return Err(EngineError::validation(format!(
                "need at least two aligned return observations as of {} (found {})",
                as_of,
                rows.len()
            )));
        }

        let t = rows.len();
        let n = symbols.len();
        let mut returns = DMatrix::from_fn(t, n, |i, j| rows[i].1[j]);
        for j in 0..n {
            let column_mean = returns.column(j).mean();
            returns.column_mut(j).add_scalar_mut(-column_mean);
        }
        let centered = returns;
        let cross = centered.transpose() * &centered;
        let daily_sample = &cross / (t as f64 - 1.0);

        for (i, symbol) in symbols.iter().enumerate() {
            if daily_sample[(i, i)] <= f64::EPSILON * f64::EPSILON {
                return Err(EngineError::numerical(
                    SolverStatus::Singular,
                    format!("asset {} has zero return variance over the window", symbol),
                ));
            }
        }

        let intensity = match shrinkage {
            ShrinkageConfig::Disabled => 0.0,
            ShrinkageConfig::Fixed(lambda) => {
                if !(0.0..=1.0).contains(&lambda) {
                    return Err(EngineError::validation(format!(
                        "shrinkage intensity must be within [0, 1] (value: {})",
                        lambda
                    )));
                }
                lambda
            }
            ShrinkageConfig::LedoitWolf => ledoit_wolf_intensity(&centered, &(&cross / t as f64)),
        };

        let target = constant_correlation_target(&daily_sample);
        let blended = &daily_sample * (1.0 - intensity) + &target * intensity;
        let annualized = blended * TRADING_DAYS_PER_YEAR;
        let symmetric = (&annualized + annualized.transpose()) * 0.5;

        debug!(
            "Estimated covariance for {} symbols over {} observations (shrinkage {:.4})",
            n, t, intensity
        );

        Ok(CovarianceMatrix {
            symbols: symbols.to_vec(),
            matrix: symmetric,
            shrinkage_intensity: intensity,
            observations: t,
            as_of: Some(as_of),
        })
    }
}

fn average_correlation(sample: &DMatrix<f64>) -> f64 {
    let n = sample.nrows();
    if n < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut count = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            total += sample[(i, j)] / (sample[(i, i)] * sample[(j, j)]).sqrt();
            count += 1;
        }
    }
    total / count as f64
}

/// Sample variances on the diagonal, average correlation off the diagonal.
fn constant_correlation_target(sample: &DMatrix<f64>) -> DMatrix<f64> {
    let n = sample.nrows();
    let r_bar = average_correlation(sample);
    DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            sample[(i, i)]
        } else {
            r_bar * (sample[(i, i)] * sample[(j, j)]).sqrt()
        }
    })
}

/// Optimal intensity toward the constant-correlation target from centered
/// returns and their biased sample covariance.
fn ledoit_wolf_intensity(centered: &DMatrix<f64>, sample: &DMatrix<f64>) -> f64 {
    let t = centered.nrows();
    let n = centered.ncols();
    if n < 2 || t < 2 {
        return 0.0;
    }
    let r_bar = average_correlation(sample);
    let target = constant_correlation_target(sample);

    let mut pi = DMatrix::<f64>::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            let s_ij = sample[(i, j)];
            let mut acc = 0.0;
            for row in 0..t {
                let d = centered[(row, i)] * centered[(row, j)] - s_ij;
                acc += d * d;
            }
            pi[(i, j)] = acc / t as f64;
        }
    }
    let pi_hat = pi.sum();

    let theta = |k: usize, i: usize, j: usize| -> f64 {
        let s_kk = sample[(k, k)];
        let s_ij = sample[(i, j)];
        let mut acc = 0.0;
        for row in 0..t {
            let x_k = centered[(row, k)];
            acc += (x_k * x_k - s_kk) * (centered[(row, i)] * centered[(row, j)] - s_ij);
        }
        acc / t as f64
    };

    let mut rho_hat = (0..n).map(|i| pi[(i, i)]).sum::<f64>();
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let s_ii = sample[(i, i)];
            let s_jj = sample[(j, j)];
            rho_hat += 0.5
                * r_bar
                * ((s_jj / s_ii).sqrt() * theta(i, i, j) + (s_ii / s_jj).sqrt() * theta(j, i, j));
        }
    }

    let gamma_hat = (&target - sample).map(|v| v * v).sum();
    if gamma_hat <= f64::EPSILON * f64::EPSILON {
        return 0.0;
    }
    let kappa = (pi_hat - rho_hat) / gamma_hat;
    (kappa / t as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetObservation, Fundamentals};
    use chrono::Duration;

    fn panel_from_returns(series: &[(&str, Vec<f64>)]) -> AssetPanel {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut rows = Vec::new();
        for (symbol, returns) in series {
            for (i, r) in returns.iter().enumerate() {
                rows.push(AssetObservation {
                    symbol: symbol.to_string(),
                    date: start + Duration::days(i as i64),
                    close: 100.0,
                    daily_return: Some(*r),
                    volume: 0.0,
                    market_cap: 0.0,
                    sector: None,
                    country: None,
                    fundamentals: Fundamentals::default(),
                    betas: None,
                    esg_score: None,
                    adv_ratio: None,
                });
            }
        }
        AssetPanel::new(rows).unwrap()
    }

    fn three_asset_panel() -> AssetPanel {
        panel_from_returns(&[
            ("A", vec![0.01, -0.02, 0.015, 0.003, -0.007, 0.012]),
            ("B", vec![0.004, -0.01, 0.02, -0.006, 0.001, 0.008]),
            ("C", vec![-0.003, 0.006, 0.002, 0.011, -0.012, 0.004]),
        ])
    }

    #[test]
    fn sample_covariance_is_annualized() {
        let a = vec![0.01, -0.01, 0.02, -0.02];
        let b: Vec<f64> = a.iter().map(|r| 2.0 * r).collect();
        let panel = panel_from_returns(&[("A", a), ("B", b)]);
        let cov = CovarianceEstimator::estimate(&panel, 10, ShrinkageConfig::Disabled).unwrap();
        assert!((cov.variance("A").unwrap() - 0.084).abs() < 1e-12);
        assert!((cov.get("A", "B").unwrap() - 0.168).abs() < 1e-12);
        assert!((cov.variance("B").unwrap() - 0.336).abs() < 1e-12);
        assert_eq!(cov.observations, 4);
    }

    #[test]
    fn window_limits_observations() {
        let panel = three_asset_panel();
        let cov = CovarianceEstimator::estimate(&panel, 3, ShrinkageConfig::Disabled).unwrap();
        assert_eq!(cov.observations, 3);
    }

    #[test]
    fn fixed_shrinkage_keeps_diagonal_and_blends_off_diagonal() {
        let panel = three_asset_panel();
        let sample = CovarianceEstimator::estimate(&panel, 10, ShrinkageConfig::Disabled).unwrap();
        let shrunk = CovarianceEstimator::estimate(&panel, 10, ShrinkageConfig::Fixed(0.3)).unwrap();
        let r_bar = average_correlation(&sample.matrix);
        for i in 0..3 {
            assert!((shrunk.matrix[(i, i)] - sample.matrix[(i, i)]).abs() < 1e-12);
            for j in 0..3 {
                if i != j {
                    let target =
                        r_bar * (sample.matrix[(i, i)] * sample.matrix[(j, j)]).sqrt();
                    let expected = 0.7 * sample.matrix[(i, j)] + 0.3 * target;
                    assert!((shrunk.matrix[(i, j)] - expected).abs() < 1e-12);
                }
            }
        }
        assert_eq!(shrunk.shrinkage_intensity, 0.3);
    }

    #[test]
    fn repeated_shrinkage_reports_the_combined_intensity() {
        let panel = three_asset_panel();
        let sample = CovarianceEstimator::estimate(&panel, 10, ShrinkageConfig::Disabled).unwrap();
        let twice = sample.shrunk(0.3).shrunk(0.3);
        let once = sample.shrunk(0.51);
        assert!((twice.shrinkage_intensity - 0.51).abs() < 1e-12);
        for (a, b) in twice.matrix.iter().zip(once.matrix.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn estimated_shrinkage_is_bounded_and_symmetric() {
        let panel = three_asset_panel();
        let cov = CovarianceEstimator::estimate(&panel, 10, ShrinkageConfig::LedoitWolf).unwrap();
        assert!((0.0..=1.0).contains(&cov.shrinkage_intensity));
        assert_eq!(cov.matrix, cov.matrix.transpose());
        assert!(cov.min_eigenvalue() > -1e-12);
    }

    #[test]
    fn zero_variance_asset_is_singular() {
        let panel = panel_from_returns(&[
            ("A", vec![0.01, -0.01, 0.02]),
            ("FLAT", vec![0.0, 0.0, 0.0]),
        ]);
        match CovarianceEstimator::estimate(&panel, 10, ShrinkageConfig::default()) {
            Err(EngineError::Numerical { status, message }) => {
                assert_eq!(status, SolverStatus::Singular);
                assert!(message.contains("FLAT"));
            }
            other => panic!("expected singular error, got {:?}", other),
        }
    }

    #[test]
    fn invalid_fixed_intensity_is_rejected() {
        let panel = three_asset_panel();
        assert!(
            CovarianceEstimator::estimate(&panel, 10, ShrinkageConfig::Fixed(1.5)).is_err()
        );
    }
}
