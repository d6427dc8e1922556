//! Performance statistics over an equity curve.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use super::calculator::{max_drawdown, returns_from_values};

/// Return and risk-adjusted performance of one equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_return: f64,
    pub annualized_return: f64,

    /// Annualized population standard deviation of period returns
    pub volatility: f64,

    pub sharpe_ratio: f64,

    /// Excess annual return over annualized downside deviation
    pub sortino_ratio: f64,

    pub max_drawdown: f64,

    /// Annualized return over max drawdown (0 without drawdown)
    pub calmar_ratio: f64,

    /// Gains above the threshold over losses below it
    pub omega_ratio: f64,

    /// Fraction of periods with a positive return
    pub win_rate: f64,

    /// Sum of positive returns over sum of negative returns
    pub profit_factor: f64,

    /// Sensitivity to the benchmark (None without a matching benchmark)
    pub beta: Option<f64>,

    /// Jensen's alpha, annualized
    pub alpha: Option<f64>,

    pub periods: usize,
}

#[derive(Debug, Clone)]
pub struct PerformanceCalculator {
    /// Annual risk-free rate used by Sharpe, Sortino and alpha
    pub risk_free_rate: f64,

    /// Threshold return for Omega
    pub omega_threshold: f64,

    pub periods_per_year: f64,
}

impl Default for PerformanceCalculator {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.02,
            omega_threshold: 0.0,
            periods_per_year: 252.0,
        }
    }
}

impl PerformanceCalculator {
    /// Compute statistics from an equity curve and optional benchmark returns.
    ///
    /// Beta and alpha are only reported when the benchmark has exactly one
    /// return per period of the curve.
    pub fn calculate(&self, values: &[f64], benchmark: Option<&[f64]>) -> PerformanceStats {
        let returns = returns_from_values(values);
        let first = values.first().copied().unwrap_or(0.0);
        let last = values.last().copied().unwrap_or(0.0);

        let total_return = if first > 0.0 { last / first - 1.0 } else { 0.0 };
        let annualized_return = if !returns.is_empty() && total_return > -1.0 {
            (1.0 + total_return).powf(self.periods_per_year / returns.len() as f64) - 1.0
        } else {
            total_return
        };

        let volatility = if returns.len() > 1 {
            returns.iter().population_std_dev() * self.periods_per_year.sqrt()
        } else {
            0.0
        };

        let excess = annualized_return - self.risk_free_rate;
        let sharpe_ratio = if volatility > 0.0 { excess / volatility } else { 0.0 };

        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        let downside_dev = if downside.len() > 1 {
            downside.iter().population_std_dev() * self.periods_per_year.sqrt()
        } else {
            0.0
        };
        let sortino_ratio = if downside_dev > 0.0 { excess / downside_dev } else { 0.0 };

        let max_dd = max_drawdown(values);
        let calmar_ratio = if max_dd > 0.0 { annualized_return / max_dd } else { 0.0 };

        let above: f64 = returns
            .iter()
            .map(|r| (r - self.omega_threshold).max(0.0))
            .sum();
        let below: f64 = returns
            .iter()
            .map(|r| (self.omega_threshold - r).max(0.0))
            .sum();
        let omega_ratio = ratio_or_infinite(above, below);

        let gross_profit: f64 = returns.iter().filter(|r| **r > 0.0).sum();
        let gross_loss: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
        let profit_factor = ratio_or_infinite(gross_profit, gross_loss);

        let win_rate = if returns.is_empty() {
            0.0
        } else {
            returns.iter().filter(|r| **r > 0.0).count() as f64 / returns.len() as f64
        };

        let (beta, alpha) = match benchmark {
            Some(bench) if bench.len() == returns.len() && returns.len() > 1 => {
                self.beta_alpha(&returns, bench, annualized_return)
            }
            _ => (None, None),
        };

        PerformanceStats {
            total_return,
            annualized_return,
            volatility,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown: max_dd,
            calmar_ratio,
            omega_ratio,
            win_rate,
            profit_factor,
            beta,
            alpha,
            periods: returns.len(),
        }
    }

    fn beta_alpha(
        &self,
        returns: &[f64],
        benchmark: &[f64],
        annualized_return: f64,
    ) -> (Option<f64>, Option<f64>) {
        let bench_var = benchmark.iter().population_variance();
        if bench_var <= 0.0 {
            return (None, None);
        }

        let cov = returns.iter().population_covariance(benchmark.iter());
        let beta = cov / bench_var;

        let bench_annual = benchmark.iter().mean() * self.periods_per_year;
        let alpha =
            annualized_return - (self.risk_free_rate + beta * (bench_annual - self.risk_free_rate));

        (Some(beta), Some(alpha))
    }
}

fn ratio_or_infinite(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else if num > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_curve() {
        let stats = PerformanceCalculator::default().calculate(&[100.0, 100.0, 100.0], None);
        assert_eq!(stats.total_return, 0.0);
        assert_eq!(stats.max_drawdown, 0.0);
        assert_eq!(stats.win_rate, 0.0);
        assert_eq!(stats.profit_factor, 0.0);
        assert_eq!(stats.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_basic_curve() {
        let values = [100.0, 110.0, 99.0, 108.9];
        let stats = PerformanceCalculator::default().calculate(&values, None);

        assert!((stats.total_return - 0.089).abs() < 1e-9);
        assert!((stats.max_drawdown - 0.1).abs() < 1e-9);
        assert!((stats.win_rate - 2.0 / 3.0).abs() < 1e-9);
        // gains 0.1 + 0.1 over loss 0.1
        assert!((stats.profit_factor - 2.0).abs() < 1e-9);
        assert!((stats.omega_ratio - 2.0).abs() < 1e-9);
        assert!(stats.calmar_ratio > 0.0);
        assert!(stats.beta.is_none());
    }

    #[test]
    fn test_no_losses_is_infinite() {
        let stats = PerformanceCalculator::default().calculate(&[100.0, 101.0, 102.0], None);
        assert!(stats.profit_factor.is_infinite());
        assert!(stats.omega_ratio.is_infinite());
    }

    #[test]
    fn test_beta_of_benchmark_itself() {
        let values = [100.0, 102.0, 100.98, 103.0, 101.0];
        let returns = returns_from_values(&values);
        let calc = PerformanceCalculator::default();
        let stats = calc.calculate(&values, Some(&returns));

        assert!((stats.beta.unwrap() - 1.0).abs() < 1e-9);

        // mismatched benchmark length is ignored
        let stats = calc.calculate(&values, Some(&returns[1..]));
        assert!(stats.beta.is_none());
    }
}
