//! Derived mark-to-market view of the portfolio.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One position valued at a market price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionValuation {
    pub ticker: String,
    pub quantity: Decimal,
    pub average_cost: Decimal,

    /// Price used for valuation (average cost when no quote was available)
    pub price: Decimal,

    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,

    /// Unrealized return as a fraction of average cost
    pub unrealized_return: Decimal,

    /// True when `price` fell back to average cost
    #[serde(default)]
    pub stale: bool,
}

/// Portfolio state at a point in time, recomputed from the ledger and prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,

    /// Cash plus market value of all positions
    pub total_value: Decimal,

    pub cash: Decimal,

    /// Positions ordered by ticker
    pub positions: Vec<PositionValuation>,

    pub unrealized_pnl_by_ticker: BTreeMap<String, Decimal>,

    /// Sum of realized P&L over the whole trade log
    pub realized_pnl_cumulative: Decimal,
}

impl PortfolioSnapshot {
    /// Snapshot of an all-cash account.
    #[cfg(test)]
    pub fn cash_only(timestamp: DateTime<Utc>, cash: Decimal) -> Self {
        Self {
            timestamp,
            total_value: cash,
            cash,
            positions: Vec::new(),
            unrealized_pnl_by_ticker: BTreeMap::new(),
            realized_pnl_cumulative: Decimal::ZERO,
        }
    }

    pub fn position(&self, ticker: &str) -> Option<&PositionValuation> {
        self.positions.iter().find(|p| p.ticker == ticker)
    }

    /// Market value held in `ticker` (zero if not held).
    pub fn position_value(&self, ticker: &str) -> Decimal {
        self.position(ticker)
            .map(|p| p.market_value)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn positions_value(&self) -> Decimal {
        self.positions.iter().map(|p| p.market_value).sum()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.unrealized_pnl_by_ticker.values().copied().sum()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Tickers valued at average cost for lack of a price.
    pub fn stale_tickers(&self) -> Vec<&str> {
        self.positions
            .iter()
            .filter(|p| p.stale)
            .map(|p| p.ticker.as_str())
            .collect()
    }
}

impl std::fmt::Display for PortfolioSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^64}", " PORTFOLIO ")?;
        writeln!(f, "As of:            {}", self.timestamp.format("%Y-%m-%d %H:%M"))?;
        writeln!(f, "Total Value:      ${:.2}", self.total_value)?;
        writeln!(f, "Cash:             ${:.2}", self.cash)?;
        writeln!(f, "Unrealized P&L:   ${:.2}", self.unrealized_pnl())?;
        writeln!(f, "Realized P&L:     ${:.2}", self.realized_pnl_cumulative)?;

        if !self.positions.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "{:<8} {:>12} {:>10} {:>10} {:>12} {:>8}",
                "TICKER", "QTY", "AVG", "PRICE", "VALUE", "P&L%"
            )?;
            for p in &self.positions {
                writeln!(
                    f,
                    "{:<8} {:>12} {:>10.2} {:>10.2} {:>12.2} {:>7.2}%{}",
                    p.ticker,
                    p.quantity,
                    p.average_cost,
                    p.price,
                    p.market_value,
                    p.unrealized_return * Decimal::ONE_HUNDRED,
                    if p.stale { " (stale)" } else { "" }
                )?;
            }
        }
        writeln!(f, "{:=^64}", "")?;
        Ok(())
    }
}
