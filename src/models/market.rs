//! Market data bars and derived indicators.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Daily OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: u64,
}

/// Summary indicators handed to the decision source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketIndicators {
    pub last_close: Decimal,
    pub return_1d: Option<f64>,
    pub return_5d: Option<f64>,
    pub return_20d: Option<f64>,
    pub sma_20: Option<Decimal>,

    /// Annualized volatility of the last 20 daily returns
    pub volatility_20d: Option<f64>,
}

impl MarketIndicators {
    /// Compute indicators from bars ordered oldest first.
    pub fn from_bars(bars: &[Bar]) -> Option<Self> {
        let last = bars.last()?;
        let closes: Vec<Decimal> = bars.iter().map(|b| b.close).collect();

        let sma_20 = if closes.len() >= 20 {
            let window = &closes[closes.len() - 20..];
            Some(window.iter().copied().sum::<Decimal>() / Decimal::from(20))
        } else {
            None
        };

        let daily: Vec<f64> = closes
            .windows(2)
            .filter_map(|w| simple_return(w[0], w[1]))
            .collect();
        let volatility_20d = if daily.len() >= 20 {
            let window = &daily[daily.len() - 20..];
            let mean = window.iter().sum::<f64>() / window.len() as f64;
            let var = window.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / (window.len() - 1) as f64;
            Some(var.sqrt() * 252f64.sqrt())
        } else {
            None
        };

        Some(Self {
            last_close: last.close,
            return_1d: lookback_return(&closes, 1),
            return_5d: lookback_return(&closes, 5),
            return_20d: lookback_return(&closes, 20),
            sma_20,
            volatility_20d,
        })
    }
}

fn lookback_return(closes: &[Decimal], days: usize) -> Option<f64> {
    if closes.len() <= days {
        return None;
    }
    let last = closes[closes.len() - 1];
    let base = closes[closes.len() - 1 - days];
    simple_return(base, last)
}

fn simple_return(from: Decimal, to: Decimal) -> Option<f64> {
    if from.is_zero() {
        return None;
    }
    ((to - from) / from).to_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bars(closes: &[Decimal]) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                date: start + chrono::Duration::days(i as i64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: 1000,
            })
            .collect()
    }

    #[test]
    fn test_short_history() {
        let ind = MarketIndicators::from_bars(&bars(&[dec!(100), dec!(102)])).unwrap();
        assert_eq!(ind.last_close, dec!(102));
        assert!((ind.return_1d.unwrap() - 0.02).abs() < 1e-12);
        assert!(ind.return_5d.is_none());
        assert!(ind.sma_20.is_none());
        assert!(ind.volatility_20d.is_none());
    }

    #[test]
    fn test_full_window() {
        let closes: Vec<Decimal> = (0..21).map(|i| Decimal::from(100 + i)).collect();
        let ind = MarketIndicators::from_bars(&bars(&closes)).unwrap();
        // last 20 closes are 101..=120
        assert_eq!(ind.sma_20, Some(dec!(110.5)));
        assert!((ind.return_20d.unwrap() - 0.2).abs() < 1e-12);
        assert!(ind.volatility_20d.unwrap() > 0.0);
    }

    #[test]
    fn test_empty() {
        assert!(MarketIndicators::from_bars(&[]).is_none());
    }
}
