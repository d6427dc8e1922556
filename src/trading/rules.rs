//! Constraint rules applied to each instruction before execution.
//!
//! Rules run in a fixed order. A clamp shrinks the quantity and evaluation
//! continues with the smaller size; the first rejection ends evaluation for
//! that ticker only.
//!
//! Buy:  concentration -> cash -> position limit -> drawdown halt
//! Sell: share sufficiency
//!
//! The stop-loss override is evaluated by the executor before any
//! instruction, since it applies to held positions whatever was requested.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::models::{PortfolioSnapshot, PositionValuation};

use super::AgentConfig;

/// Constraint that produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Concentration,
    CashSufficiency,
    ShareSufficiency,
    PositionLimit,
    StopLoss,
    DrawdownHalt,
    /// No current price for the ticker
    MissingPrice,
    /// Quantity rounds to zero shares
    MinimumQuantity,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::Concentration => "concentration",
            Rule::CashSufficiency => "cash_sufficiency",
            Rule::ShareSufficiency => "share_sufficiency",
            Rule::PositionLimit => "position_limit",
            Rule::StopLoss => "stop_loss",
            Rule::DrawdownHalt => "drawdown_halt",
            Rule::MissingPrice => "missing_price",
            Rule::MinimumQuantity => "minimum_quantity",
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Clamp { quantity: Decimal, reason: String },
    Reject(String),
}

/// Outcome of running every applicable rule over one instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    /// Final quantity to trade (zero when rejected)
    pub quantity: Decimal,

    /// Last clamping rule, or the rejecting rule
    pub rule: Option<Rule>,

    pub rejected: bool,
    pub reason: String,
}

impl Validation {
    fn accept(quantity: Decimal) -> Self {
        Self {
            quantity,
            rule: None,
            rejected: false,
            reason: "all rules passed".to_string(),
        }
    }

    fn reject(rule: Rule, reason: String) -> Self {
        Self {
            quantity: Decimal::ZERO,
            rule: Some(rule),
            rejected: true,
            reason,
        }
    }

    pub fn is_clamped(&self) -> bool {
        !self.rejected && self.rule.is_some()
    }
}

/// Validation rules parameterized by the agent configuration.
#[derive(Debug, Clone)]
pub struct RuleSet {
    concentration_limit: Decimal,
    max_positions: usize,
    stop_loss_threshold: Decimal,
    max_drawdown_halt: Decimal,
    quantity_decimals: u32,
}

impl RuleSet {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            concentration_limit: config.concentration_limit,
            max_positions: config.max_positions,
            stop_loss_threshold: config.stop_loss_threshold,
            max_drawdown_halt: config.max_drawdown_halt,
            quantity_decimals: config.quantity_decimals,
        }
    }

    /// Round a quantity down to the tradable precision.
    pub fn round_quantity(&self, quantity: Decimal) -> Decimal {
        quantity
            .round_dp_with_strategy(self.quantity_decimals, RoundingStrategy::ToZero)
            .normalize()
    }

    /// Shares that `value` buys at `price`, rounded down (zero when out of range).
    fn shares_for(&self, value: Decimal, price: Decimal) -> Decimal {
        value
            .checked_div(price)
            .map(|q| self.round_quantity(q))
            .unwrap_or(Decimal::ZERO)
    }

    /// Run the buy rules for `quantity` shares of `ticker` at `price`.
    pub fn validate_buy(
        &self,
        snapshot: &PortfolioSnapshot,
        ticker: &str,
        quantity: Decimal,
        price: Decimal,
        current_drawdown: Decimal,
    ) -> Validation {
        let mut quantity = self.round_quantity(quantity);
        if quantity <= Decimal::ZERO {
            return Validation::reject(
                Rule::MinimumQuantity,
                "quantity rounds to zero shares".to_string(),
            );
        }

        let mut last_clamp: Option<(Rule, String)> = None;

        for rule in [Rule::Concentration, Rule::CashSufficiency] {
            let verdict = match rule {
                Rule::Concentration => self.check_concentration(snapshot, ticker, quantity, price),
                _ => self.check_cash(snapshot, quantity, price),
            };
            match verdict {
                Verdict::Pass => {}
                Verdict::Clamp { quantity: q, reason } => {
                    quantity = q;
                    last_clamp = Some((rule, reason));
                }
                Verdict::Reject(reason) => return Validation::reject(rule, reason),
            }
        }

        if let Verdict::Reject(reason) = self.check_position_limit(snapshot, ticker) {
            return Validation::reject(Rule::PositionLimit, reason);
        }
        if let Verdict::Reject(reason) = self.check_drawdown(current_drawdown) {
            return Validation::reject(Rule::DrawdownHalt, reason);
        }

        match last_clamp {
            Some((rule, reason)) => Validation {
                quantity,
                rule: Some(rule),
                rejected: false,
                reason,
            },
            None => Validation::accept(quantity),
        }
    }

    /// Run the sell rules. `quantity` is already resolved against the position.
    pub fn validate_sell(
        &self,
        snapshot: &PortfolioSnapshot,
        ticker: &str,
        quantity: Decimal,
    ) -> Validation {
        let held = snapshot
            .position(ticker)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);

        // A full exit keeps the exact held quantity, even below the tradable precision.
        let quantity = if quantity >= held {
            quantity
        } else {
            self.round_quantity(quantity)
        };

        match self.check_shares(held, quantity) {
            Verdict::Reject(reason) => Validation::reject(Rule::ShareSufficiency, reason),
            Verdict::Clamp { quantity, reason } => Validation {
                quantity,
                rule: Some(Rule::ShareSufficiency),
                rejected: false,
                reason,
            },
            Verdict::Pass if quantity <= Decimal::ZERO => Validation::reject(
                Rule::MinimumQuantity,
                "quantity rounds to zero shares".to_string(),
            ),
            Verdict::Pass => Validation::accept(quantity),
        }
    }

    /// Post-trade position value must stay within the concentration limit.
    pub fn check_concentration(
        &self,
        snapshot: &PortfolioSnapshot,
        ticker: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Verdict {
        let limit_value = self.concentration_limit * snapshot.total_value;
        let existing = snapshot.position_value(ticker);
        let headroom = limit_value - existing;

        // An overflowing cost is past any limit.
        let after = quantity.checked_mul(price).and_then(|cost| cost.checked_add(existing));
        if matches!(after, Some(value) if value <= limit_value) {
            return Verdict::Pass;
        }

        let allowed = if headroom > Decimal::ZERO {
            self.shares_for(headroom, price)
        } else {
            Decimal::ZERO
        };
        if allowed <= Decimal::ZERO {
            return Verdict::Reject(format!(
                "{} already at {:.2} of {:.2} allowed ({}% of {:.2})",
                ticker,
                existing,
                limit_value,
                self.concentration_limit * Decimal::ONE_HUNDRED,
                snapshot.total_value
            ));
        }

        Verdict::Clamp {
            quantity: allowed,
            reason: format!(
                "clamped {} -> {} shares to keep {} within {}% of portfolio",
                quantity,
                allowed,
                ticker,
                self.concentration_limit * Decimal::ONE_HUNDRED
            ),
        }
    }

    pub fn check_cash(&self, snapshot: &PortfolioSnapshot, quantity: Decimal, price: Decimal) -> Verdict {
        let cost = quantity.checked_mul(price);
        if matches!(cost, Some(cost) if cost <= snapshot.cash) {
            return Verdict::Pass;
        }

        let allowed = self.shares_for(snapshot.cash, price);
        if allowed <= Decimal::ZERO {
            return Verdict::Reject(match cost {
                Some(cost) => format!(
                    "insufficient cash: {:.2} needed, {:.2} available",
                    cost, snapshot.cash
                ),
                None => format!(
                    "insufficient cash: {} shares at {:.2} is out of range, {:.2} available",
                    quantity, price, snapshot.cash
                ),
            });
        }

        Verdict::Clamp {
            quantity: allowed,
            reason: format!(
                "clamped {} -> {} shares to available cash {:.2}",
                quantity, allowed, snapshot.cash
            ),
        }
    }

    pub fn check_shares(&self, held: Decimal, quantity: Decimal) -> Verdict {
        if held <= Decimal::ZERO {
            return Verdict::Reject("no shares held".to_string());
        }
        if quantity > held {
            return Verdict::Clamp {
                quantity: held,
                reason: format!("clamped {} -> {} held shares", quantity, held),
            };
        }
        Verdict::Pass
    }

    /// A new ticker may not push open positions past the ceiling.
    pub fn check_position_limit(&self, snapshot: &PortfolioSnapshot, ticker: &str) -> Verdict {
        if snapshot.position(ticker).is_some() {
            return Verdict::Pass;
        }
        if snapshot.position_count() >= self.max_positions {
            return Verdict::Reject(format!(
                "position limit reached: {} >= {}",
                snapshot.position_count(),
                self.max_positions
            ));
        }
        Verdict::Pass
    }

    pub fn check_drawdown(&self, current_drawdown: Decimal) -> Verdict {
        if current_drawdown >= self.max_drawdown_halt {
            return Verdict::Reject(format!(
                "buys halted: drawdown {:.2}% >= {:.2}%",
                current_drawdown * Decimal::ONE_HUNDRED,
                self.max_drawdown_halt * Decimal::ONE_HUNDRED
            ));
        }
        Verdict::Pass
    }

    /// True when a valued position has fallen past the stop-loss.
    ///
    /// Stale valuations (no current price) never trigger.
    pub fn stop_loss_triggered(&self, valuation: &PositionValuation) -> bool {
        !valuation.stale && valuation.unrealized_return < self.stop_loss_threshold
    }
}
