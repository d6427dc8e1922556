//! Decision sources: the context handed to them and the sources themselves.
//!
//! A source receives a [`DecisionContext`] and returns a validated
//! [`Decision`]. Anything malformed comes back as `InvalidDecisionFormat`
//! and is never applied.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{PortfolioError, PortfolioResult};
use crate::models::{Action, Amount, Decision, Instruction, MarketIndicators, PortfolioSnapshot, RiskMetrics};
use crate::trading::Concentration;

/// Everything a decision source sees for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub generated_at: DateTime<Utc>,
    pub universe: Vec<String>,
    pub portfolio_snapshot: PortfolioSnapshot,

    /// None until enough history exists
    pub risk_metrics: Option<RiskMetrics>,

    pub concentration: Vec<Concentration>,
    pub market_indicators: BTreeMap<String, MarketIndicators>,
    pub current_drawdown: Decimal,
}

impl DecisionContext {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn last_close(&self, ticker: &str) -> Option<Decimal> {
        self.market_indicators.get(ticker).map(|i| i.last_close)
    }
}

#[async_trait]
pub trait DecisionSource: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, context: &DecisionContext) -> PortfolioResult<Decision>;
}

// ============== External documents ==============

/// Reads a decision document written by an external model.
pub struct FileDecisionSource {
    path: PathBuf,
}

impl FileDecisionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DecisionSource for FileDecisionSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn decide(&self, _context: &DecisionContext) -> PortfolioResult<Decision> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            PortfolioError::InvalidDecisionFormat(format!(
                "cannot read {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Decision::from_json(&raw)
    }
}

/// Runs a command with the context JSON on stdin and parses its stdout.
///
/// Non-zero exits and timeouts are retried with exponential backoff. A
/// program that cannot be spawned, or output that is not a decision, fails
/// at once.
pub struct CommandDecisionSource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    retry_window: Duration,
}

impl CommandDecisionSource {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            retry_window: timeout * 2,
        }
    }

    #[cfg(test)]
    fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }

    async fn run(&self, input: &str) -> Result<String, backoff::Error<PortfolioError>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| backoff::Error::permanent(command_error(&self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| backoff::Error::transient(command_error(&self.program, e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| backoff::Error::transient(command_error(&self.program, e)))?;
        if !output.status.success() {
            return Err(backoff::Error::transient(command_error(
                &self.program,
                format!("exited with {}", output.status),
            )));
        }

        String::from_utf8(output.stdout).map_err(|e| {
            backoff::Error::permanent(PortfolioError::InvalidDecisionFormat(format!(
                "decision output is not UTF-8: {}",
                e
            )))
        })
    }
}

fn command_error(program: &str, reason: impl std::fmt::Display) -> PortfolioError {
    PortfolioError::DecisionSource {
        source_name: program.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl DecisionSource for CommandDecisionSource {
    fn name(&self) -> &str {
        "command"
    }

    async fn decide(&self, context: &DecisionContext) -> PortfolioResult<Decision> {
        let input = context.to_json().map_err(|e| {
            PortfolioError::InvalidDecisionFormat(format!("cannot encode context: {}", e))
        })?;

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_elapsed_time(Some(self.retry_window))
            .build();

        let input = input.as_str();
        let stdout = backoff::future::retry(policy, || async move {
            debug!(program = %self.program, bytes = input.len(), "Requesting decision");

            let attempt = tokio::time::timeout(self.timeout, self.run(input))
                .await
                .unwrap_or_else(|_| {
                    Err(backoff::Error::transient(command_error(&self.program, "timed out")))
                });
            if let Err(backoff::Error::Transient { err, .. }) = &attempt {
                warn!(program = %self.program, error = %err, "Decision command failed, retrying");
            }
            attempt
        })
        .await?;

        Decision::from_json(&stdout)
    }
}

// ============== Rule engines ==============

/// Fraction of total value a rule engine keeps invested.
const INVESTED_FRACTION: Decimal = dec!(0.9);

/// Buys an equal split of the universe once, then holds.
#[derive(Debug, Default)]
pub struct BuyAndHold;

#[async_trait]
impl DecisionSource for BuyAndHold {
    fn name(&self) -> &str {
        "buy_and_hold"
    }

    async fn decide(&self, context: &DecisionContext) -> PortfolioResult<Decision> {
        let snapshot = &context.portfolio_snapshot;
        let priced: Vec<&String> = context
            .universe
            .iter()
            .filter(|t| context.last_close(t).is_some())
            .collect();

        if snapshot.position_count() > 0 || priced.is_empty() {
            return Ok(Decision {
                instructions: priced
                    .into_iter()
                    .map(|t| Instruction::new(t.clone(), Action::Hold))
                    .collect(),
                reasoning: Some("holding initial allocation".to_string()),
            });
        }

        let per_ticker = snapshot.total_value * INVESTED_FRACTION / Decimal::from(priced.len());
        info!(tickers = priced.len(), notional = %per_ticker, "Initial buy-and-hold allocation");

        Ok(Decision {
            instructions: priced
                .into_iter()
                .map(|t| Instruction::new(t.clone(), Action::Buy(Amount::Notional(per_ticker))))
                .collect(),
            reasoning: Some("equal initial allocation, then hold".to_string()),
        })
    }
}

/// Rebalances every priced ticker towards an equal target weight.
#[derive(Debug)]
pub struct EqualWeight {
    /// Deviation from target (fraction of total value) tolerated before trading
    pub tolerance: Decimal,
}

impl Default for EqualWeight {
    fn default() -> Self {
        Self {
            tolerance: dec!(0.01),
        }
    }
}

#[async_trait]
impl DecisionSource for EqualWeight {
    fn name(&self) -> &str {
        "equal_weight"
    }

    async fn decide(&self, context: &DecisionContext) -> PortfolioResult<Decision> {
        let snapshot = &context.portfolio_snapshot;
        let priced: Vec<&String> = context
            .universe
            .iter()
            .filter(|t| context.last_close(t).is_some())
            .collect();
        if priced.is_empty() || snapshot.total_value <= Decimal::ZERO {
            return Ok(Decision::default());
        }

        let target = snapshot.total_value * INVESTED_FRACTION / Decimal::from(priced.len());
        let band = snapshot.total_value * self.tolerance;

        // Sells first so their cash is available to the buys.
        let mut sells = Vec::new();
        let mut buys = Vec::new();
        for ticker in priced {
            let diff = target - snapshot.position_value(ticker);
            if diff > band {
                buys.push(Instruction::new(ticker.clone(), Action::Buy(Amount::Notional(diff))));
            } else if diff < -band {
                sells.push(Instruction::new(
                    ticker.clone(),
                    Action::Sell(Some(Amount::Notional(-diff))),
                ));
            } else {
                sells.push(Instruction::new(ticker.clone(), Action::Hold));
            }
        }
        sells.extend(buys);

        Ok(Decision {
            instructions: sells,
            reasoning: Some(format!("rebalance to {:.2} per ticker", target)),
        })
    }
}

/// Build a rule-engine source by name.
pub fn rule_engine(name: &str) -> Option<Box<dyn DecisionSource>> {
    match name {
        "buy_and_hold" | "buy-and-hold" => Some(Box::new(BuyAndHold)),
        "equal_weight" | "equal-weight" => Some(Box::new(EqualWeight::default())),
        _ => None,
    }
}
