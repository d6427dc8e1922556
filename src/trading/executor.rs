//! Decision validation and execution against the ledger.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ledger::Ledger;
use crate::models::{Action, Amount, Decision, Instruction, PortfolioSnapshot, TradeEvent, TradeSide};

use super::rules::{Rule, RuleSet};
use super::AgentConfig;

/// How an instruction was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Executed as requested
    Accepted,
    /// Executed with a smaller quantity
    Clamped,
    /// Refused by a rule
    Rejected,
    /// Hold instruction, nothing to do
    Held,
    /// Not evaluated (e.g. no current price)
    Skipped,
    /// Sold by the stop-loss override
    Forced,
    /// Passed the rules but the ledger refused it
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Clamped => "clamped",
            Self::Rejected => "rejected",
            Self::Held => "held",
            Self::Skipped => "skipped",
            Self::Forced => "forced",
            Self::Failed => "failed",
        }
    }

    pub fn executed(&self) -> bool {
        matches!(self, Self::Accepted | Self::Clamped | Self::Forced)
    }
}

/// Result for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionOutcome {
    pub ticker: String,

    /// What the decision source asked for (None for a forced sell without instruction)
    pub requested: Option<Action>,

    pub status: OutcomeStatus,
    pub rule: Option<Rule>,
    pub reason: String,

    pub price: Option<Decimal>,
    pub requested_quantity: Option<Decimal>,
    pub executed_quantity: Decimal,

    pub trade: Option<TradeEvent>,
}

impl InstructionOutcome {
    fn unexecuted(
        instruction: &Instruction,
        status: OutcomeStatus,
        rule: Option<Rule>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            ticker: instruction.ticker.clone(),
            requested: Some(instruction.action),
            status,
            rule,
            reason: reason.into(),
            price: None,
            requested_quantity: None,
            executed_quantity: Decimal::ZERO,
            trade: None,
        }
    }
}

/// Outcomes of a whole decision, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcomes: Vec<InstructionOutcome>,
}

impl ExecutionResult {
    pub fn trades(&self) -> impl Iterator<Item = &TradeEvent> {
        self.outcomes.iter().filter_map(|o| o.trade.as_ref())
    }

    #[cfg(test)]
    pub fn outcome_for(&self, ticker: &str) -> Option<&InstructionOutcome> {
        self.outcomes.iter().find(|o| o.ticker == ticker)
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "--- Execution ---")?;
        if self.outcomes.is_empty() {
            writeln!(f, "(no instructions)")?;
        }
        for o in &self.outcomes {
            let action = o.requested.map(|a| a.name()).unwrap_or("-");
            write!(f, "{:<8} {:<5} {:<9}", o.ticker, action, o.status.as_str())?;
            if o.executed_quantity > Decimal::ZERO {
                write!(f, " qty={}", o.executed_quantity)?;
            }
            if let Some(price) = o.price {
                write!(f, " @ {:.2}", price)?;
            }
            if let Some(rule) = o.rule {
                write!(f, " [{}]", rule)?;
            }
            writeln!(f, " {}", o.reason)?;
        }
        Ok(())
    }
}

/// Validates decisions against the rule set and applies them to a ledger.
pub struct DecisionExecutor {
    rules: RuleSet,
}

impl DecisionExecutor {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            rules: RuleSet::new(config),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Execute a decision now.
    pub fn execute(
        &self,
        decision: &Decision,
        prices: &HashMap<String, Decimal>,
        current_drawdown: Decimal,
        ledger: &mut Ledger,
    ) -> ExecutionResult {
        self.execute_at(decision, prices, current_drawdown, ledger, Utc::now())
    }

    /// Execute a decision with trades stamped at `timestamp`.
    ///
    /// Stop-loss exits run first, then instructions in decision order. The
    /// snapshot is re-taken after every trade, so later instructions see the
    /// cash and positions left by earlier ones.
    pub fn execute_at(
        &self,
        decision: &Decision,
        prices: &HashMap<String, Decimal>,
        current_drawdown: Decimal,
        ledger: &mut Ledger,
        timestamp: DateTime<Utc>,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::default();
        let mut forced = HashSet::new();

        // === Stop-loss override ===
        let snapshot = ledger.get_snapshot_at(prices, timestamp);
        for valuation in snapshot.positions.iter().filter(|v| self.rules.stop_loss_triggered(v)) {
            let requested = decision.instruction_for(&valuation.ticker).map(|i| i.action);
            let reason = format!(
                "stop-loss: unrealized {:.2}% at {:.2} (avg cost {:.2})",
                valuation.unrealized_return * Decimal::ONE_HUNDRED,
                valuation.price,
                valuation.average_cost
            );

            warn!(
                ticker = %valuation.ticker,
                unrealized_return = %valuation.unrealized_return,
                requested = requested.map(|a| a.name()).unwrap_or("none"),
                "Stop-loss triggered, forcing full exit"
            );

            let outcome = match ledger.apply_trade_at(
                &valuation.ticker,
                TradeSide::Sell,
                valuation.quantity,
                valuation.price,
                timestamp,
            ) {
                Ok(trade) => InstructionOutcome {
                    ticker: valuation.ticker.clone(),
                    requested,
                    status: OutcomeStatus::Forced,
                    rule: Some(Rule::StopLoss),
                    reason,
                    price: Some(valuation.price),
                    requested_quantity: Some(valuation.quantity),
                    executed_quantity: trade.quantity,
                    trade: Some(trade),
                },
                Err(e) => InstructionOutcome {
                    ticker: valuation.ticker.clone(),
                    requested,
                    status: OutcomeStatus::Failed,
                    rule: Some(Rule::StopLoss),
                    reason: e.to_string(),
                    price: Some(valuation.price),
                    requested_quantity: Some(valuation.quantity),
                    executed_quantity: Decimal::ZERO,
                    trade: None,
                },
            };

            forced.insert(valuation.ticker.clone());
            result.outcomes.push(outcome);
        }

        // === Instructions ===
        for instruction in &decision.instructions {
            if forced.contains(&instruction.ticker) {
                continue;
            }

            let outcome = self.execute_instruction(instruction, prices, current_drawdown, ledger, timestamp);
            match outcome.status {
                OutcomeStatus::Rejected | OutcomeStatus::Clamped | OutcomeStatus::Skipped => info!(
                    ticker = %outcome.ticker,
                    status = outcome.status.as_str(),
                    rule = outcome.rule.map(|r| r.as_str()).unwrap_or("-"),
                    reason = %outcome.reason,
                    "Instruction constrained"
                ),
                OutcomeStatus::Failed => warn!(
                    ticker = %outcome.ticker,
                    reason = %outcome.reason,
                    "Instruction failed at ledger"
                ),
                _ => debug!(
                    ticker = %outcome.ticker,
                    status = outcome.status.as_str(),
                    "Instruction resolved"
                ),
            }
            result.outcomes.push(outcome);
        }

        result
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        prices: &HashMap<String, Decimal>,
        current_drawdown: Decimal,
        ledger: &mut Ledger,
        timestamp: DateTime<Utc>,
    ) -> InstructionOutcome {
        if instruction.action == Action::Hold {
            return InstructionOutcome::unexecuted(instruction, OutcomeStatus::Held, None, "hold");
        }

        let price = match prices.get(&instruction.ticker) {
            Some(p) if *p > Decimal::ZERO => *p,
            _ => {
                return InstructionOutcome::unexecuted(
                    instruction,
                    OutcomeStatus::Skipped,
                    Some(Rule::MissingPrice),
                    format!("no current price for {}, holding", instruction.ticker),
                )
            }
        };

        let snapshot = ledger.get_snapshot_at(prices, timestamp);
        let (side, requested_quantity, validation) = match instruction.action {
            Action::Buy(amount) => {
                let qty = buy_quantity(amount, price, &snapshot);
                let v = self.rules.validate_buy(&snapshot, &instruction.ticker, qty, price, current_drawdown);
                (TradeSide::Buy, qty, v)
            }
            Action::Sell(amount) => {
                let held = snapshot
                    .position(&instruction.ticker)
                    .map(|p| p.quantity)
                    .unwrap_or(Decimal::ZERO);
                let qty = sell_quantity(amount, price, held);
                let v = self.rules.validate_sell(&snapshot, &instruction.ticker, qty);
                (TradeSide::Sell, qty, v)
            }
            Action::Hold => {
                return InstructionOutcome::unexecuted(instruction, OutcomeStatus::Held, None, "hold")
            }
        };

        let mut outcome = InstructionOutcome {
            ticker: instruction.ticker.clone(),
            requested: Some(instruction.action),
            status: OutcomeStatus::Rejected,
            rule: validation.rule,
            reason: validation.reason.clone(),
            price: Some(price),
            requested_quantity: Some(requested_quantity),
            executed_quantity: Decimal::ZERO,
            trade: None,
        };

        if validation.rejected {
            return outcome;
        }

        match ledger.apply_trade_at(&instruction.ticker, side, validation.quantity, price, timestamp) {
            Ok(trade) => {
                outcome.status = if validation.is_clamped() {
                    OutcomeStatus::Clamped
                } else {
                    OutcomeStatus::Accepted
                };
                outcome.executed_quantity = trade.quantity;
                outcome.trade = Some(trade);
            }
            Err(e) => {
                outcome.status = OutcomeStatus::Failed;
                outcome.reason = e.to_string();
            }
        }

        outcome
    }
}

/// Shares requested by a buy. Percent is of available cash.
///
/// A size too large to represent saturates, so the cash and concentration
/// rules clamp or reject it.
fn buy_quantity(amount: Amount, price: Decimal, snapshot: &PortfolioSnapshot) -> Decimal {
    let quantity = match amount {
        Amount::Quantity(q) => Some(q),
        Amount::Notional(n) => n.checked_div(price),
        Amount::Percent(p) => snapshot
            .cash
            .checked_mul(p)
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .and_then(|v| v.checked_div(price)),
    };
    quantity.unwrap_or(Decimal::MAX)
}

/// Shares requested by a sell. Percent is of held shares; no amount sells all.
fn sell_quantity(amount: Option<Amount>, price: Decimal, held: Decimal) -> Decimal {
    match amount {
        None => held,
        Some(Amount::Quantity(q)) => q,
        Some(Amount::Notional(n)) => n.checked_div(price).unwrap_or(Decimal::MAX),
        Some(Amount::Percent(p)) if p >= Decimal::ONE_HUNDRED => held,
        Some(Amount::Percent(p)) => held * p / Decimal::ONE_HUNDRED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn prices(pairs: &[(&str, Decimal)]) -> HashMap<String, Decimal> {
        pairs.iter().map(|(t, p)| (t.to_string(), *p)).collect()
    }

    fn executor() -> DecisionExecutor {
        DecisionExecutor::new(&AgentConfig::default())
    }

    #[test]
    fn test_end_to_end_buy_sell() {
        let config = AgentConfig {
            concentration_limit: dec!(1),
            ..AgentConfig::default()
        };
        let exec = DecisionExecutor::new(&config);
        let mut ledger = Ledger::new(dec!(10000)).unwrap();

        let buy = Decision::new(vec![Instruction::new("X", Action::Buy(Amount::Quantity(dec!(1))))]);
        let result = exec.execute(&buy, &prices(&[("X", dec!(500))]), Decimal::ZERO, &mut ledger);
        assert_eq!(result.outcomes[0].status, OutcomeStatus::Accepted);
        assert_eq!(ledger.cash(), dec!(9500));
        assert_eq!(ledger.position("X").unwrap().average_cost, dec!(500));

        let sell = Decision::new(vec![Instruction::new("X", Action::Sell(None))]);
        let result = exec.execute(&sell, &prices(&[("X", dec!(525))]), Decimal::ZERO, &mut ledger);
        let outcome = result.outcome_for("X").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Accepted);
        assert_eq!(outcome.trade.as_ref().unwrap().realized_pnl, Some(dec!(25)));
        assert_eq!(ledger.cash(), dec!(10025));
        assert!(ledger.position("X").is_none());
    }

    #[test]
    fn test_concentration_clamps_notional_buy() {
        let mut ledger = Ledger::new(dec!(10000)).unwrap();
        ledger.apply_trade("X", TradeSide::Buy, dec!(20), dec!(100)).unwrap();

        let decision = Decision::new(vec![Instruction::new(
            "X",
            Action::Buy(Amount::Notional(dec!(1000))),
        )]);
        let result = executor().execute(&decision, &prices(&[("X", dec!(100))]), Decimal::ZERO, &mut ledger);

        let outcome = result.outcome_for("X").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Clamped);
        assert_eq!(outcome.rule, Some(Rule::Concentration));
        assert_eq!(outcome.executed_quantity * dec!(100), dec!(500));
        assert_eq!(ledger.position("X").unwrap().quantity, dec!(25));
        assert_eq!(ledger.cash(), dec!(7500));
    }

    #[test]
    fn test_stop_loss_overrides_hold() {
        let mut ledger = Ledger::new(dec!(10000)).unwrap();
        ledger.apply_trade("X", TradeSide::Buy, dec!(10), dec!(100)).unwrap();

        let decision = Decision::new(vec![Instruction::new("X", Action::Hold)]);
        let result = executor().execute(&decision, &prices(&[("X", dec!(94))]), Decimal::ZERO, &mut ledger);

        assert_eq!(result.outcomes.len(), 1);
        let outcome = &result.outcomes[0];
        assert_eq!(outcome.status, OutcomeStatus::Forced);
        assert_eq!(outcome.rule, Some(Rule::StopLoss));
        assert_eq!(outcome.requested, Some(Action::Hold));
        assert!(ledger.position("X").is_none());
        assert_eq!(ledger.cash(), dec!(9000) + dec!(940));
    }

    #[test]
    fn test_stop_loss_without_instruction() {
        let mut ledger = Ledger::new(dec!(10000)).unwrap();
        ledger.apply_trade("X", TradeSide::Buy, dec!(10), dec!(100)).unwrap();
        ledger.apply_trade("Y", TradeSide::Buy, dec!(10), dec!(100)).unwrap();

        let result = executor().execute(
            &Decision::default(),
            &prices(&[("X", dec!(90)), ("Y", dec!(99))]),
            Decimal::ZERO,
            &mut ledger,
        );

        assert_eq!(result.count(OutcomeStatus::Forced), 1);
        assert_eq!(result.outcomes[0].requested, None);
        assert!(ledger.position("X").is_none());
        assert!(ledger.position("Y").is_some());
    }

    #[test]
    fn test_missing_price_skips() {
        let mut ledger = Ledger::new(dec!(10000)).unwrap();
        let decision = Decision::new(vec![Instruction::new(
            "TLT",
            Action::Buy(Amount::Quantity(dec!(1))),
        )]);

        let result = executor().execute(&decision, &HashMap::new(), Decimal::ZERO, &mut ledger);
        assert_eq!(result.outcomes[0].status, OutcomeStatus::Skipped);
        assert_eq!(result.outcomes[0].rule, Some(Rule::MissingPrice));
        assert!(ledger.get_trade_log().is_empty());
    }

    #[test]
    fn test_rejection_is_per_ticker() {
        let config = AgentConfig {
            max_positions: 1,
            ..AgentConfig::default()
        };
        let exec = DecisionExecutor::new(&config);
        let mut ledger = Ledger::new(dec!(10000)).unwrap();

        let decision = Decision::new(vec![
            Instruction::new("A", Action::Buy(Amount::Notional(dec!(1000)))),
            Instruction::new("B", Action::Buy(Amount::Notional(dec!(1000)))),
            Instruction::new("C", Action::Hold),
        ]);
        let p = prices(&[("A", dec!(100)), ("B", dec!(50)), ("C", dec!(10))]);
        let result = exec.execute(&decision, &p, Decimal::ZERO, &mut ledger);

        assert_eq!(result.outcome_for("A").unwrap().status, OutcomeStatus::Accepted);
        let b = result.outcome_for("B").unwrap();
        assert_eq!(b.status, OutcomeStatus::Rejected);
        assert_eq!(b.rule, Some(Rule::PositionLimit));
        assert_eq!(result.outcome_for("C").unwrap().status, OutcomeStatus::Held);
        assert_eq!(ledger.cash(), dec!(9000));
    }

    #[test]
    fn test_percent_semantics() {
        let mut ledger = Ledger::new(dec!(10000)).unwrap();
        let p = prices(&[("SPY", dec!(100))]);

        // 20% of cash
        let buy = Decision::new(vec![Instruction::new("SPY", Action::Buy(Amount::Percent(dec!(20))))]);
        executor().execute(&buy, &p, Decimal::ZERO, &mut ledger);
        assert_eq!(ledger.position("SPY").unwrap().quantity, dec!(20));

        // half the held shares
        let sell = Decision::new(vec![Instruction::new(
            "SPY",
            Action::Sell(Some(Amount::Percent(dec!(50)))),
        )]);
        executor().execute(&sell, &p, Decimal::ZERO, &mut ledger);
        assert_eq!(ledger.position("SPY").unwrap().quantity, dec!(10));
    }

    #[test]
    fn test_full_percent_sell_closes_position() {
        let mut ledger = Ledger::new(dec!(10000)).unwrap();
        ledger.apply_trade("SPY", TradeSide::Buy, dec!(2.5), dec!(100)).unwrap();

        let sell = Decision::new(vec![Instruction::new(
            "SPY",
            Action::Sell(Some(Amount::Percent(dec!(100)))),
        )]);
        let result = executor().execute(&sell, &prices(&[("SPY", dec!(100))]), Decimal::ZERO, &mut ledger);

        let outcome = result.outcome_for("SPY").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Accepted);
        assert_eq!(outcome.executed_quantity, dec!(2.5));
        assert!(ledger.position("SPY").is_none());
        assert_eq!(ledger.cash(), dec!(10000));

        assert_eq!(
            sell_quantity(Some(Amount::Percent(dec!(150))), dec!(100), dec!(3)),
            dec!(3)
        );
    }

    #[test]
    fn test_oversized_quantity_is_clamped() {
        let mut ledger = Ledger::new(dec!(10000)).unwrap();
        let huge = Decimal::from_str_exact("10000000000000000000000000000").unwrap();

        let decision = Decision::new(vec![Instruction::new("SPY", Action::Buy(Amount::Quantity(huge)))]);
        let result = executor().execute(&decision, &prices(&[("SPY", dec!(500))]), Decimal::ZERO, &mut ledger);

        let outcome = result.outcome_for("SPY").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Clamped);
        assert_eq!(outcome.rule, Some(Rule::Concentration));
        assert_eq!(outcome.executed_quantity, dec!(5));
        assert_eq!(ledger.cash(), dec!(7500));

        // a notional at a price near zero saturates instead of overflowing
        let tiny = Decimal::new(1, 27);
        assert_eq!(
            buy_quantity(Amount::Notional(dec!(1000)), tiny, &ledger.get_snapshot(&HashMap::new())),
            Decimal::MAX
        );
    }

    #[test]
    fn test_snapshot_refreshed_between_instructions() {
        let config = AgentConfig {
            concentration_limit: dec!(1),
            ..AgentConfig::default()
        };
        let exec = DecisionExecutor::new(&config);
        let mut ledger = Ledger::new(dec!(1000)).unwrap();

        let decision = Decision::new(vec![
            Instruction::new("A", Action::Buy(Amount::Notional(dec!(800)))),
            Instruction::new("B", Action::Buy(Amount::Notional(dec!(800)))),
        ]);
        let p = prices(&[("A", dec!(100)), ("B", dec!(100))]);
        let result = exec.execute(&decision, &p, Decimal::ZERO, &mut ledger);

        let b = result.outcome_for("B").unwrap();
        assert_eq!(b.status, OutcomeStatus::Clamped);
        assert_eq!(b.rule, Some(Rule::CashSufficiency));
        assert_eq!(b.executed_quantity, dec!(2));
        assert_eq!(ledger.cash(), Decimal::ZERO);
    }
}
