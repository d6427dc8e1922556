//! Position model: current holdings of one ticker.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Long-only holding in a single ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument symbol
    pub ticker: String,

    /// Shares held (never negative)
    pub quantity: Decimal,

    /// Weighted average purchase price per share
    pub average_cost: Decimal,
}

impl Position {
    /// Open a position from its first buy.
    pub fn new(ticker: String, quantity: Decimal, price: Decimal) -> Self {
        Self {
            ticker,
            quantity,
            average_cost: price,
        }
    }

    /// Add to position (averaging in).
    pub fn add(&mut self, quantity: Decimal, price: Decimal) {
        let total_cost = self.cost_basis() + quantity * price;
        let new_quantity = self.quantity + quantity;

        if !new_quantity.is_zero() {
            self.average_cost = total_cost / new_quantity;
        }

        self.quantity = new_quantity;
    }

    /// Reduce position size, returning the realized P&L at `price`.
    ///
    /// Average cost of the remainder is left untouched.
    pub fn reduce(&mut self, quantity: Decimal, price: Decimal) -> Decimal {
        let realized_pnl = quantity * (price - self.average_cost);
        self.quantity -= quantity;
        realized_pnl
    }

    /// Total amount paid for the shares still held.
    pub fn cost_basis(&self) -> Decimal {
        self.quantity * self.average_cost
    }

    pub fn market_value(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.quantity * (price - self.average_cost)
    }

    /// Unrealized return as a fraction of average cost.
    pub fn unrealized_return(&self, price: Decimal) -> Decimal {
        if self.average_cost.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.average_cost) / self.average_cost
    }

    /// A position is closed only when its quantity is exactly zero.
    pub fn is_closed(&self) -> bool {
        self.quantity.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_averaging() {
        let mut pos = Position::new("QQQ".to_string(), dec!(10), dec!(100));

        pos.add(dec!(10), dec!(120));

        assert_eq!(pos.quantity, dec!(20));
        // (1000 + 1200) / 20 = 110
        assert_eq!(pos.average_cost, dec!(110));
        assert_eq!(pos.cost_basis(), dec!(2200));
    }

    #[test]
    fn test_reduce_keeps_average_cost() {
        let mut pos = Position::new("GLD".to_string(), dec!(10), dec!(200));

        let realized = pos.reduce(dec!(4), dec!(190));

        assert_eq!(realized, dec!(-40));
        assert_eq!(pos.quantity, dec!(6));
        assert_eq!(pos.average_cost, dec!(200));
        assert!(!pos.is_closed());

        pos.reduce(dec!(6), dec!(210));
        assert!(pos.is_closed());
    }

    #[test]
    fn test_unrealized() {
        let pos = Position::new("SPY".to_string(), dec!(4), dec!(500));
        assert_eq!(pos.unrealized_pnl(dec!(470)), dec!(-120));
        assert_eq!(pos.unrealized_return(dec!(470)), dec!(-0.06));
        assert_eq!(pos.market_value(dec!(470)), dec!(1880));
    }
}
