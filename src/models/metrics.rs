//! Risk metrics result computed from a return series.

use serde::{Deserialize, Serialize};

/// Tail-risk and dispersion metrics for one return series.
///
/// Returns are signed fractions, so losses are negative: `cvar_95 <= var_95`.
/// Field names keep the conventional `_95` suffix; `confidence` records the
/// level actually used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Confidence level the tail metrics were computed at
    pub confidence: f64,

    /// Number of returns in the series
    pub observations: usize,

    /// Empirical (1 - confidence) quantile of returns
    pub var_95: f64,

    /// Mean of returns at or below VaR
    pub cvar_95: f64,

    /// Third standardized moment (None when variance is zero)
    pub skewness: Option<f64>,

    /// Fourth standardized moment, not excess-adjusted (None when variance is zero)
    pub kurtosis: Option<f64>,

    /// Mean excess return over downside deviation (None when no downside)
    pub sortino_ratio: Option<f64>,

    /// Sample standard deviation scaled to a year
    pub volatility_annualized: f64,

    /// Largest peak-to-trough decline as a positive fraction
    pub max_drawdown: f64,
}

impl std::fmt::Display for RiskMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pct = self.confidence * 100.0;
        writeln!(f, "--- Risk Metrics ({} obs, {:.0}%) ---", self.observations, pct)?;
        writeln!(f, "VaR:            {:.2}%", self.var_95 * 100.0)?;
        writeln!(f, "CVaR:           {:.2}%", self.cvar_95 * 100.0)?;
        writeln!(f, "Volatility:     {:.2}%", self.volatility_annualized * 100.0)?;
        writeln!(f, "Max Drawdown:   {:.2}%", self.max_drawdown * 100.0)?;
        match self.sortino_ratio {
            Some(s) => writeln!(f, "Sortino Ratio:  {:.2}", s)?,
            None => writeln!(f, "Sortino Ratio:  undefined (no downside)")?,
        }
        match (self.skewness, self.kurtosis) {
            (Some(s), Some(k)) => {
                writeln!(f, "Skewness:       {:.3}", s)?;
                writeln!(f, "Kurtosis:       {:.3}", k)?;
            }
            _ => writeln!(f, "Skew/Kurtosis:  undefined (zero variance)")?,
        }
        Ok(())
    }
}
