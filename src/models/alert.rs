//! Price movement alerts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How significant a price move is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            _ => None,
        }
    }
}

/// A significant move of a ticker against its reference price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub ticker: String,
    pub timestamp: DateTime<Utc>,

    /// (price - reference_price) / reference_price
    pub movement_pct: Decimal,

    pub severity: Severity,

    /// Baseline the move is measured against (e.g. previous close)
    pub reference_price: Decimal,

    /// Price observed when the alert fired
    pub price: Decimal,
}

impl Alert {
    pub fn is_drop(&self) -> bool {
        self.movement_pct < Decimal::ZERO
    }
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {} {:+.2}% ({:.2} -> {:.2}) at {}",
            self.severity.as_str(),
            self.ticker,
            if self.is_drop() { "down" } else { "up" },
            self.movement_pct * Decimal::ONE_HUNDRED,
            self.reference_price,
            self.price,
            self.timestamp.format("%Y-%m-%d %H:%M")
        )
    }
}
