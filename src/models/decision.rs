//! Allocation decisions and their wire schema.
//!
//! A decision document is JSON of the form
//!
//! ```json
//! {
//!   "reasoning": "optional free text",
//!   "actions": [
//!     {"ticker": "SPY", "action": "buy",  "notional": 1000},
//!     {"ticker": "QQQ", "action": "buy",  "pct": 20},
//!     {"ticker": "GLD", "action": "sell", "quantity": 3},
//!     {"ticker": "IWM", "action": "sell"},
//!     {"ticker": "TLT", "action": "hold"}
//!   ]
//! }
//! ```
//!
//! Buys carry exactly one of `quantity`, `notional` or `pct` (percent of
//! available cash). Sells carry at most one; `pct` is percent of the held
//! shares and no amount means the whole position. Holds carry none. Anything
//! else is rejected with `InvalidDecisionFormat`.

use std::collections::HashSet;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{PortfolioError, PortfolioResult};

/// Largest share count or notional a decision may carry.
const MAX_AMOUNT: Decimal = dec!(1000000000000000);

/// Size of a buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amount {
    /// Number of shares
    Quantity(Decimal),
    /// Currency value at the current price
    Notional(Decimal),
    /// Percent (0-100] of cash for buys, of held shares for sells
    Percent(Decimal),
}

/// What to do with one ticker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy(Amount),
    /// `None` sells the entire position
    Sell(Option<Amount>),
    Hold,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Buy(_) => "buy",
            Action::Sell(_) => "sell",
            Action::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub ticker: String,
    pub action: Action,
}

impl Instruction {
    pub fn new(ticker: impl Into<String>, action: Action) -> Self {
        Self {
            ticker: ticker.into(),
            action,
        }
    }
}

/// Validated, ordered set of per-ticker instructions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Wire form as produced by the decision source.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDecision {
    #[serde(default)]
    reasoning: Option<String>,
    actions: Vec<RawAction>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    ticker: String,
    action: String,
    #[serde(default)]
    quantity: Option<Decimal>,
    #[serde(default)]
    notional: Option<Decimal>,
    #[serde(default)]
    pct: Option<Decimal>,
}

impl Decision {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self {
            instructions,
            reasoning: None,
        }
    }

    /// Parse and validate a decision document.
    pub fn from_json(raw: &str) -> PortfolioResult<Self> {
        let parsed: RawDecision = serde_json::from_str(raw)
            .map_err(|e| invalid(format!("malformed decision document: {}", e)))?;
        Self::from_raw(parsed)
    }

    /// Validate an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> PortfolioResult<Self> {
        let parsed: RawDecision = serde_json::from_value(value)
            .map_err(|e| invalid(format!("malformed decision document: {}", e)))?;
        Self::from_raw(parsed)
    }

    fn from_raw(raw: RawDecision) -> PortfolioResult<Self> {
        let mut seen = HashSet::new();
        let mut instructions = Vec::with_capacity(raw.actions.len());

        for (idx, item) in raw.actions.into_iter().enumerate() {
            let ticker = item.ticker.trim().to_uppercase();
            if ticker.is_empty() {
                return Err(invalid(format!("action #{} has an empty ticker", idx)));
            }
            if !seen.insert(ticker.clone()) {
                return Err(invalid(format!("ticker {} appears more than once", ticker)));
            }

            let amount = parse_amount(&ticker, &item)?;
            let action = match item.action.trim().to_lowercase().as_str() {
                "buy" => Action::Buy(amount.ok_or_else(|| {
                    invalid(format!("buy of {} needs quantity, notional or pct", ticker))
                })?),
                "sell" => Action::Sell(amount),
                "hold" => {
                    if amount.is_some() {
                        return Err(invalid(format!("hold of {} must not carry an amount", ticker)));
                    }
                    Action::Hold
                }
                other => {
                    return Err(invalid(format!(
                        "unknown action '{}' for {} (expected buy, sell or hold)",
                        other, ticker
                    )))
                }
            };

            instructions.push(Instruction { ticker, action });
        }

        Ok(Self {
            instructions,
            reasoning: raw.reasoning,
        })
    }

    pub fn instruction_for(&self, ticker: &str) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.ticker == ticker)
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

fn parse_amount(ticker: &str, item: &RawAction) -> PortfolioResult<Option<Amount>> {
    let given = [item.quantity, item.notional, item.pct]
        .iter()
        .filter(|v| v.is_some())
        .count();
    if given > 1 {
        return Err(invalid(format!(
            "{} gives more than one of quantity, notional, pct",
            ticker
        )));
    }

    let amount = match (item.quantity, item.notional, item.pct) {
        (Some(q), _, _) => Amount::Quantity(q),
        (_, Some(n), _) => Amount::Notional(n),
        (_, _, Some(p)) => {
            if p > Decimal::ONE_HUNDRED {
                return Err(invalid(format!("{} pct {} exceeds 100", ticker, p)));
            }
            Amount::Percent(p)
        }
        _ => return Ok(None),
    };

    let value = match amount {
        Amount::Quantity(v) | Amount::Notional(v) | Amount::Percent(v) => v,
    };
    if value <= Decimal::ZERO {
        return Err(invalid(format!("{} amount must be positive, got {}", ticker, value)));
    }
    if value > MAX_AMOUNT {
        return Err(invalid(format!("{} amount {} exceeds {}", ticker, value, MAX_AMOUNT)));
    }

    Ok(Some(amount))
}

fn invalid(msg: String) -> PortfolioError {
    PortfolioError::InvalidDecisionFormat(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_full_document() {
        let raw = r#"{
            "reasoning": "trim tech, add gold",
            "actions": [
                {"ticker": "spy", "action": "buy", "notional": 1000},
                {"ticker": "QQQ", "action": "BUY", "pct": "20"},
                {"ticker": "GLD", "action": "sell", "quantity": 3},
                {"ticker": "IWM", "action": "sell"},
                {"ticker": "TLT", "action": "hold"}
            ]
        }"#;

        let decision = Decision::from_json(raw).unwrap();
        assert_eq!(decision.instructions.len(), 5);
        assert_eq!(decision.reasoning.as_deref(), Some("trim tech, add gold"));
        assert_eq!(
            decision.instructions[0],
            Instruction::new("SPY", Action::Buy(Amount::Notional(dec!(1000))))
        );
        assert_eq!(
            decision.instructions[1].action,
            Action::Buy(Amount::Percent(dec!(20)))
        );
        assert_eq!(
            decision.instructions[2].action,
            Action::Sell(Some(Amount::Quantity(dec!(3))))
        );
        assert_eq!(decision.instructions[3].action, Action::Sell(None));
        assert_eq!(decision.instructions[4].action, Action::Hold);
    }

    #[test]
    fn test_rejects_unknown_shapes() {
        let cases = [
            "not json",
            r#"{"actions": [{"ticker": "SPY", "action": "short", "quantity": 1}]}"#,
            r#"{"actions": [{"ticker": "SPY", "action": "buy"}]}"#,
            r#"{"actions": [{"ticker": "SPY", "action": "buy", "quantity": 1, "pct": 5}]}"#,
            r#"{"actions": [{"ticker": "SPY", "action": "buy", "quantity": -1}]}"#,
            r#"{"actions": [{"ticker": "SPY", "action": "hold", "quantity": 1}]}"#,
            r#"{"actions": [{"ticker": "SPY", "action": "buy", "pct": 150}]}"#,
            r#"{"actions": [{"ticker": "", "action": "hold"}]}"#,
            r#"{"actions": [{"ticker": "SPY", "action": "hold", "leverage": 3}]}"#,
            r#"{"actions": [{"ticker": "SPY", "action": "hold"}, {"ticker": "spy", "action": "sell"}]}"#,
            r#"{"decisions": []}"#,
        ];

        for raw in cases {
            let result = Decision::from_json(raw);
            assert!(
                matches!(result, Err(PortfolioError::InvalidDecisionFormat(_))),
                "expected rejection for {}",
                raw
            );
        }
    }

    #[test]
    fn test_rejects_oversized_amounts() {
        let raw = r#"{"actions": [{"ticker": "SPY", "action": "buy", "quantity": "10000000000000000000000000000"}]}"#;
        let err = Decision::from_json(raw).unwrap_err();
        assert!(matches!(err, PortfolioError::InvalidDecisionFormat(ref msg) if msg.contains("exceeds")));

        let raw = r#"{"actions": [{"ticker": "SPY", "action": "sell", "notional": "1000000000000001"}]}"#;
        assert!(Decision::from_json(raw).is_err());

        let raw = r#"{"actions": [{"ticker": "SPY", "action": "buy", "notional": "1000000000000000"}]}"#;
        let decision = Decision::from_json(raw).unwrap();
        assert_eq!(decision.instructions[0].action, Action::Buy(Amount::Notional(MAX_AMOUNT)));
    }

    #[test]
    fn test_empty_actions_is_valid() {
        let decision = Decision::from_json(r#"{"actions": []}"#).unwrap();
        assert!(decision.is_empty());
    }
}
