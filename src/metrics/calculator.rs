//! Risk metrics engine: VaR, CVaR, Sortino, moments, volatility, drawdown.
//!
//! All functions are pure. Returns are signed fractions (a 2% loss is
//! `-0.02`), so tail metrics come out negative for losing tails.

use statrs::statistics::Statistics;

use crate::error::{PortfolioError, PortfolioResult};
use crate::models::RiskMetrics;

/// Fewest returns the engine accepts.
pub const MIN_OBSERVATIONS: usize = 2;

/// Slack for floating point error when converting a tail fraction to a rank.
const RANK_EPSILON: f64 = 1e-9;

/// Calculator for tail-risk metrics.
#[derive(Debug, Clone)]
pub struct RiskCalculator {
    /// Threshold below which returns count as downside for Sortino
    pub min_acceptable_return: f64,

    /// Used to annualize volatility (252 for daily returns)
    pub periods_per_year: f64,
}

impl Default for RiskCalculator {
    fn default() -> Self {
        Self {
            min_acceptable_return: 0.0,
            periods_per_year: 252.0,
        }
    }
}

impl RiskCalculator {
    pub fn new(min_acceptable_return: f64, periods_per_year: f64) -> Self {
        Self {
            min_acceptable_return,
            periods_per_year,
        }
    }

    /// Compute all risk metrics for an ordered return series.
    pub fn compute(&self, returns: &[f64], confidence: f64) -> PortfolioResult<RiskMetrics> {
        check_confidence(confidence)?;
        if returns.len() < MIN_OBSERVATIONS {
            return Err(PortfolioError::InsufficientData {
                required: MIN_OBSERVATIONS,
                actual: returns.len(),
            });
        }

        let var = value_at_risk(returns, confidence)?;
        let cvar = conditional_value_at_risk(returns, confidence)?;
        let (skewness, kurtosis) = standardized_moments(returns);

        Ok(RiskMetrics {
            confidence,
            observations: returns.len(),
            var_95: var,
            cvar_95: cvar,
            skewness,
            kurtosis,
            sortino_ratio: self.sortino_ratio(returns),
            volatility_annualized: returns.iter().std_dev() * self.periods_per_year.sqrt(),
            max_drawdown: max_drawdown(&cumulative_values(returns)),
        })
    }

    /// Mean excess return over the MAR divided by downside deviation.
    ///
    /// `None` when no return falls below the MAR (downside deviation is zero).
    pub fn sortino_ratio(&self, returns: &[f64]) -> Option<f64> {
        if returns.is_empty() {
            return None;
        }
        let mar = self.min_acceptable_return;

        let shortfalls: Vec<f64> = returns
            .iter()
            .filter(|&&r| r < mar)
            .map(|r| (r - mar).powi(2))
            .collect();
        if shortfalls.is_empty() {
            return None;
        }

        let downside_dev = (shortfalls.iter().sum::<f64>() / shortfalls.len() as f64).sqrt();
        if downside_dev <= 0.0 {
            return None;
        }

        let mean_excess = returns.iter().map(|r| r - mar).sum::<f64>() / returns.len() as f64;
        Some(mean_excess / downside_dev)
    }
}

/// Empirical (1 - confidence) quantile, nearest rank from below.
pub fn value_at_risk(returns: &[f64], confidence: f64) -> PortfolioResult<f64> {
    check_confidence(confidence)?;
    let sorted = sorted_returns(returns)?;
    Ok(sorted[tail_rank(sorted.len(), confidence) - 1])
}

/// Mean of all returns at or below VaR.
pub fn conditional_value_at_risk(returns: &[f64], confidence: f64) -> PortfolioResult<f64> {
    let var = value_at_risk(returns, confidence)?;

    // Non-empty: VaR itself is one of the returns.
    let tail: Vec<f64> = returns.iter().copied().filter(|&r| r <= var).collect();
    Ok(tail.iter().sum::<f64>() / tail.len() as f64)
}

/// Largest peak-to-trough decline of a value series, as a positive fraction.
pub fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0f64;

    for &value in values {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            let dd = (peak - value) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd
}

/// Period-over-period simple returns, skipping non-positive bases.
pub fn returns_from_values(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Compounded value path starting at 1.0.
fn cumulative_values(returns: &[f64]) -> Vec<f64> {
    let mut values = Vec::with_capacity(returns.len() + 1);
    let mut value = 1.0;
    values.push(value);
    for r in returns {
        value *= 1.0 + r;
        values.push(value);
    }
    values
}

/// Population skewness and (non-excess) kurtosis.
fn standardized_moments(returns: &[f64]) -> (Option<f64>, Option<f64>) {
    let n = returns.len() as f64;
    let mean = returns.iter().mean();
    let m2 = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    if m2 <= f64::EPSILON * f64::EPSILON {
        return (None, None);
    }
    let m3 = returns.iter().map(|r| (r - mean).powi(3)).sum::<f64>() / n;
    let m4 = returns.iter().map(|r| (r - mean).powi(4)).sum::<f64>() / n;

    (Some(m3 / m2.powf(1.5)), Some(m4 / (m2 * m2)))
}

fn sorted_returns(returns: &[f64]) -> PortfolioResult<Vec<f64>> {
    if returns.len() < MIN_OBSERVATIONS {
        return Err(PortfolioError::InsufficientData {
            required: MIN_OBSERVATIONS,
            actual: returns.len(),
        });
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Ok(sorted)
}

/// 1-based rank of the VaR observation in an ascending sample of size `n`.
fn tail_rank(n: usize, confidence: f64) -> usize {
    let rank = ((1.0 - confidence) * n as f64 - RANK_EPSILON).ceil() as usize;
    rank.clamp(1, n)
}

fn check_confidence(confidence: f64) -> PortfolioResult<()> {
    if confidence > 0.0 && confidence < 1.0 {
        Ok(())
    } else {
        Err(PortfolioError::Configuration(format!(
            "confidence must be in (0, 1), got {}",
            confidence
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_returns() -> Vec<f64> {
        vec![
            0.012, -0.008, 0.004, -0.021, 0.015, 0.003, -0.035, 0.009, 0.001, -0.004,
            0.007, -0.012, 0.018, -0.002, 0.006, -0.017, 0.011, 0.002, -0.006, 0.010,
        ]
    }

    #[test]
    fn test_var_is_empirical_quantile() {
        let returns = sample_returns();
        // 20 observations at 95%: one observation in the tail, the worst.
        assert_eq!(value_at_risk(&returns, 0.95).unwrap(), -0.035);
        // 90%: two observations, VaR is the second worst.
        assert_eq!(value_at_risk(&returns, 0.90).unwrap(), -0.021);
    }

    #[test]
    fn test_cvar_averages_the_tail() {
        let returns = sample_returns();
        let cvar = conditional_value_at_risk(&returns, 0.90).unwrap();
        assert!((cvar - (-0.035 + -0.021) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_cvar_never_exceeds_var() {
        let series: Vec<Vec<f64>> = vec![
            sample_returns(),
            vec![0.01, -0.01],
            vec![-0.05, -0.05, 0.02, 0.03],
            vec![0.02, 0.03, 0.04, 0.05, 0.06],
            vec![-0.2, 0.1, -0.1, 0.05, 0.0, 0.0, -0.3],
            (0..100).map(|i| ((i * 37 % 101) as f64 - 50.0) / 1000.0).collect(),
        ];

        for returns in &series {
            for &confidence in &[0.5, 0.9, 0.95, 0.99] {
                let var = value_at_risk(returns, confidence).unwrap();
                let cvar = conditional_value_at_risk(returns, confidence).unwrap();
                assert!(cvar <= var, "cvar {} > var {} for {:?}", cvar, var, returns);
            }
        }
    }

    #[test]
    fn test_insufficient_data() {
        let calc = RiskCalculator::default();
        assert_eq!(
            calc.compute(&[0.01], 0.95),
            Err(PortfolioError::InsufficientData { required: 2, actual: 1 })
        );
        assert!(calc.compute(&[], 0.95).is_err());
    }

    #[test]
    fn test_invalid_confidence() {
        let calc = RiskCalculator::default();
        assert!(matches!(
            calc.compute(&sample_returns(), 1.0),
            Err(PortfolioError::Configuration(_))
        ));
    }

    #[test]
    fn test_sortino_undefined_without_losses() {
        let calc = RiskCalculator::default();
        assert_eq!(calc.sortino_ratio(&[0.01, 0.02, 0.005]), None);

        let metrics = calc.compute(&[0.01, 0.02, 0.005], 0.95).unwrap();
        assert!(metrics.sortino_ratio.is_none());
    }

    #[test]
    fn test_sortino_value() {
        let calc = RiskCalculator::default();
        // mean = 0.0025, downside dev = sqrt((0.01^2) / 1) = 0.01
        let sortino = calc.sortino_ratio(&[0.02, -0.01, 0.0, 0.0]).unwrap();
        assert!((sortino - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_sortino_respects_mar() {
        let calc = RiskCalculator::new(0.015, 252.0);
        // returns below 1.5%: 0.01 only
        let sortino = calc.sortino_ratio(&[0.02, 0.01, 0.03]).unwrap();
        // mean excess = (0.005 - 0.005 + 0.015) / 3 = 0.005, downside dev = 0.005
        assert!((sortino - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_moments() {
        let (skew, kurt) = standardized_moments(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(skew.unwrap().abs() < 1e-12);
        // population kurtosis of a discrete uniform over 5 points = 1.7
        assert!((kurt.unwrap() - 1.7).abs() < 1e-12);

        let (skew, kurt) = standardized_moments(&[0.01, 0.01, 0.01]);
        assert!(skew.is_none() && kurt.is_none());

        // long right tail is positively skewed
        let (skew, _) = standardized_moments(&[0.0, 0.0, 0.0, 0.0, 0.1]);
        assert!(skew.unwrap() > 0.0);
    }

    #[test]
    fn test_max_drawdown_single_pass() {
        let values = [100.0, 110.0, 99.0, 120.0, 90.0, 95.0];
        // peak 120 -> trough 90
        assert!((max_drawdown(&values) - 0.25).abs() < 1e-12);
        assert_eq!(max_drawdown(&[100.0, 101.0, 102.0]), 0.0);
        assert_eq!(max_drawdown(&[]), 0.0);
    }

    #[test]
    fn test_compute_drawdown_from_returns() {
        let calc = RiskCalculator::default();
        let metrics = calc.compute(&[0.10, -0.5, 0.2], 0.95).unwrap();
        // 1.0 -> 1.1 -> 0.55 -> 0.66: drawdown 50% from 1.1
        assert!((metrics.max_drawdown - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_volatility_annualized() {
        let calc = RiskCalculator::new(0.0, 4.0);
        let metrics = calc.compute(&[0.01, -0.01, 0.01, -0.01], 0.95).unwrap();
        // sample std dev = sqrt(0.0004 / 3), times sqrt(4)
        let expected = (0.0004f64 / 3.0).sqrt() * 2.0;
        assert!((metrics.volatility_annualized - expected).abs() < 1e-12);
    }

    #[test]
    fn test_returns_from_values() {
        let r = returns_from_values(&[100.0, 110.0, 99.0]);
        assert_eq!(r.len(), 2);
        assert!((r[0] - 0.1).abs() < 1e-12);
        assert!((r[1] + 0.1).abs() < 1e-12);
    }
}
