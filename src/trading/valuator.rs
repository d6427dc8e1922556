//! Portfolio valuation: risk over the value history, concentration, drawdown.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::PortfolioResult;
use crate::metrics::{returns_from_values, RiskCalculator};
use crate::models::{PortfolioSnapshot, RiskMetrics};

use super::AgentConfig;

/// Share of total value held in one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concentration {
    pub ticker: String,
    pub value: Decimal,
    pub ratio: Decimal,
    pub exceeds_limit: bool,
}

pub struct PortfolioValuator {
    calculator: RiskCalculator,
    confidence: f64,
    concentration_limit: Decimal,
}

impl PortfolioValuator {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            calculator: RiskCalculator::new(config.min_acceptable_return, config.periods_per_year),
            confidence: config.confidence_level,
            concentration_limit: config.concentration_limit,
        }
    }

    /// Risk metrics over the last `window` returns of a snapshot history.
    ///
    /// History must be ordered oldest first.
    pub fn value(&self, history: &[PortfolioSnapshot], window: usize) -> PortfolioResult<RiskMetrics> {
        let values: Vec<f64> = history
            .iter()
            .filter_map(|s| s.total_value.to_f64())
            .collect();

        let returns = returns_from_values(&values);
        let start = returns.len().saturating_sub(window);
        self.calculator.compute(&returns[start..], self.confidence)
    }

    /// Position value over total value for each holding, largest first.
    pub fn concentration(&self, snapshot: &PortfolioSnapshot) -> Vec<Concentration> {
        let mut result: Vec<Concentration> = snapshot
            .positions
            .iter()
            .map(|p| {
                let ratio = if snapshot.total_value > Decimal::ZERO {
                    p.market_value / snapshot.total_value
                } else {
                    Decimal::ZERO
                };
                Concentration {
                    ticker: p.ticker.clone(),
                    value: p.market_value,
                    ratio,
                    exceeds_limit: ratio > self.concentration_limit,
                }
            })
            .collect();

        result.sort_by(|a, b| b.ratio.cmp(&a.ratio));
        result
    }
}

/// Decline of the latest total value from the highest value seen.
pub fn current_drawdown(history: &[PortfolioSnapshot]) -> Decimal {
    let peak = history
        .iter()
        .map(|s| s.total_value)
        .max()
        .unwrap_or(Decimal::ZERO);

    match history.last() {
        Some(latest) if peak > Decimal::ZERO => {
            ((peak - latest.total_value) / peak).max(Decimal::ZERO)
        }
        _ => Decimal::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortfolioError;
    use crate::ledger::Ledger;
    use crate::models::TradeSide;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn history(values: &[Decimal]) -> Vec<PortfolioSnapshot> {
        let start = Utc::now() - Duration::days(values.len() as i64);
        values
            .iter()
            .enumerate()
            .map(|(i, v)| PortfolioSnapshot::cash_only(start + Duration::days(i as i64), *v))
            .collect()
    }

    #[test]
    fn test_value_uses_window() {
        let valuator = PortfolioValuator::new(&AgentConfig::default());
        let hist = history(&[dec!(100), dec!(50), dec!(55), dec!(60.5), dec!(54.45)]);

        let all = valuator.value(&hist, 30).unwrap();
        assert_eq!(all.observations, 4);
        assert!((all.max_drawdown - 0.5).abs() < 1e-9);

        // last two returns: +10%, -10%
        let recent = valuator.value(&hist, 2).unwrap();
        assert_eq!(recent.observations, 2);
        assert!((recent.var_95 + 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_value_needs_history() {
        let valuator = PortfolioValuator::new(&AgentConfig::default());
        let err = valuator.value(&history(&[dec!(100), dec!(101)]), 30).unwrap_err();
        assert_eq!(err, PortfolioError::InsufficientData { required: 2, actual: 1 });
    }

    #[test]
    fn test_concentration_flags() {
        let mut ledger = Ledger::new(dec!(10000)).unwrap();
        ledger.apply_trade("X", TradeSide::Buy, dec!(30), dec!(100)).unwrap();
        ledger.apply_trade("Y", TradeSide::Buy, dec!(10), dec!(100)).unwrap();
        let prices: HashMap<String, Decimal> =
            [("X".to_string(), dec!(100)), ("Y".to_string(), dec!(100))].into();
        let snapshot = ledger.get_snapshot(&prices);

        let valuator = PortfolioValuator::new(&AgentConfig::default());
        let conc = valuator.concentration(&snapshot);

        assert_eq!(conc[0].ticker, "X");
        assert_eq!(conc[0].ratio, dec!(0.3));
        assert!(conc[0].exceeds_limit);
        assert_eq!(conc[1].ratio, dec!(0.1));
        assert!(!conc[1].exceeds_limit);
    }

    #[test]
    fn test_current_drawdown() {
        assert_eq!(current_drawdown(&history(&[dec!(100), dec!(120), dec!(90)])), dec!(0.25));
        assert_eq!(current_drawdown(&history(&[dec!(100), dec!(120)])), Decimal::ZERO);
        assert_eq!(current_drawdown(&[]), Decimal::ZERO);
    }
}
