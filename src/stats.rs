use statrs::statistics::Statistics;
use std::cmp::Ordering;

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().mean()
}

/// Sample standard deviation (n - 1 denominator); zero for fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let std = values.iter().std_dev();
    if std.is_finite() {
        std
    } else {
        0.0
    }
}

/// Biased skewness, m3 / m2^1.5.
pub fn skewness(values: &[f64]) -> f64 {
    let (m2, m3, _) = central_moments(values);
    if m2 <= f64::EPSILON {
        return 0.0;
    }
    m3 / m2.powf(1.5)
}

/// Biased excess kurtosis, m4 / m2^2 - 3.
pub fn excess_kurtosis(values: &[f64]) -> f64 {
    let (m2, _, m4) = central_moments(values);
    if m2 <= f64::EPSILON {
        return 0.0;
    }
    m4 / (m2 * m2) - 3.0
}

fn central_moments(values: &[f64]) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let n = values.len() as f64;
    let avg = mean(values);
    let mut m2 = 0.0;
    let mut m3 = 0.0;
    let mut m4 = 0.0;
    for value in values {
        let d = value - avg;
        let d2 = d * d;
        m2 += d2;
        m3 += d2 * d;
        m4 += d2 * d2;
    }
    (m2 / n, m3 / n, m4 / n)
}

pub fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    sorted
}

/// Percentile with linear interpolation between closest ranks (`q` in [0, 1]).
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sorted = sorted_copy(values);
    quantile_sorted(&sorted, q)
}

pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let q = q.clamp(0.0, 1.0);
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Clips every value to the order statistics bracketing the `[p, 1 - p]` range.
///
/// Bounds are taken from existing sample points rather than interpolated so a
/// second pass at the same percentile leaves the series unchanged.
pub fn winsorize(values: &[f64], percentile: f64) -> Vec<f64> {
    if values.len() < 2 || percentile <= 0.0 {
        return values.to_vec();
    }
    let p = percentile.min(0.5);
    let sorted = sorted_copy(values);
    let last = (sorted.len() - 1) as f64;
    let lower_index = (p * last).round() as usize;
    let upper_index = ((1.0 - p) * last).round() as usize;
    let lower = sorted[lower_index];
    let upper = sorted[upper_index.min(sorted.len() - 1)];
    values.iter().map(|v| v.clamp(lower, upper)).collect()
}

/// Standard score with the sample standard deviation; a constant series maps to zeros.
pub fn zscore(values: &[f64]) -> Vec<f64> {
    let avg = mean(values);
    let std = sample_std(values);
    if std <= f64::EPSILON {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - avg) / std).collect()
}

pub fn pearson_correlation(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() != ys.len() || xs.len() < 2 {
        return 0.0;
    }
    let mx = mean(xs);
    let my = mean(ys);
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mx;
        let dy = y - my;
        cov += dx * dy;
        vx += dx * dx;
        vy += dy * dy;
    }
    if vx <= f64::EPSILON || vy <= f64::EPSILON {
        return 0.0;
    }
    cov / (vx.sqrt() * vy.sqrt())
}

pub fn pct_change(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|pair| {
            if pair[0].abs() > f64::EPSILON {
                pair[1] / pair[0] - 1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Largest peak-to-trough decline of a value series, as a positive fraction.
pub fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for &value in values {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            let drawdown = (peak - value) / peak;
            worst = worst.max(drawdown);
        }
    }
    worst
}

/// Sum of squared shares of the absolute values.
pub fn herfindahl_of_abs(values: &[f64]) -> f64 {
    let total: f64 = values.iter().map(|v| v.abs()).sum();
    if total <= f64::EPSILON {
        return 0.0;
    }
    values
        .iter()
        .map(|v| {
            let share = v.abs() / total;
            share * share
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantile_interpolates_between_ranks() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert!((quantile(&values, 0.5) - 2.5).abs() < 1e-12);
        assert!((quantile(&values, 0.0) - 1.0).abs() < 1e-12);
        assert!((quantile(&values, 1.0) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn winsorize_clips_tails_to_sample_points() {
        let mut values: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        values[0] = -1000.0;
        values[19] = 1000.0;
        let clipped = winsorize(&values, 0.05);
        assert_eq!(clipped[0], 2.0);
        assert_eq!(clipped[19], 19.0);
        assert_eq!(clipped[10], values[10]);
        assert_eq!(winsorize(&clipped, 0.05), clipped);
    }

    #[test]
    fn zscore_of_constant_series_is_zero() {
        assert_eq!(zscore(&[3.0, 3.0, 3.0]), vec![0.0, 0.0, 0.0]);
        let scores = zscore(&[1.0, 2.0, 3.0]);
        assert!((scores[0] + 1.0).abs() < 1e-12);
        assert!((scores[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn max_drawdown_tracks_peak_to_trough() {
        let values = vec![100.0, 120.0, 90.0, 130.0, 117.0];
        assert!((max_drawdown(&values) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn moments_of_symmetric_series() {
        let values = vec![-2.0, -1.0, 0.0, 1.0, 2.0];
        assert!(skewness(&values).abs() < 1e-12);
        assert!((excess_kurtosis(&values) - (-1.3)).abs() < 1e-12);
        assert!((sample_std(&values) - 2.5_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn herfindahl_uses_absolute_shares() {
        assert!((herfindahl_of_abs(&[0.5, -0.5]) - 0.5).abs() < 1e-12);
        assert_eq!(herfindahl_of_abs(&[0.0, 0.0]), 0.0);
    }
}
