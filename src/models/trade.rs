//! Trade events recorded by the ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of an executed paper trade.
///
/// Appended to the ledger's log and never changed afterwards; realized P&L
/// history is read from these records only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Unique event identifier
    pub id: Uuid,

    /// When the trade was applied
    pub timestamp: DateTime<Utc>,

    /// Instrument symbol
    pub ticker: String,

    /// Trade direction
    pub side: TradeSide,

    /// Number of shares
    pub quantity: Decimal,

    /// Execution price per share
    pub price: Decimal,

    /// Realized P&L, present on sells only
    #[serde(default)]
    pub realized_pnl: Option<Decimal>,
}

impl TradeEvent {
    /// Cash moved by this trade (always positive).
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }

    /// Signed cash impact: negative for buys, positive for sells.
    #[cfg(test)]
    pub fn cash_delta(&self) -> Decimal {
        match self.side {
            TradeSide::Buy => -self.notional(),
            TradeSide::Sell => self.notional(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_cash_delta() {
        let mut event = TradeEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            ticker: "SPY".to_string(),
            side: TradeSide::Buy,
            quantity: dec!(2),
            price: dec!(450.25),
            realized_pnl: None,
        };
        assert_eq!(event.notional(), dec!(900.50));
        assert_eq!(event.cash_delta(), dec!(-900.50));

        event.side = TradeSide::Sell;
        assert_eq!(event.cash_delta(), dec!(900.50));
    }

    #[test]
    fn test_side_parse() {
        assert_eq!(TradeSide::parse(" BUY "), Some(TradeSide::Buy));
        assert_eq!(TradeSide::parse("sell"), Some(TradeSide::Sell));
        assert_eq!(TradeSide::parse("short"), None);
    }
}
