//! Agent configuration: risk limits, alert thresholds and metric settings.

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{PortfolioError, PortfolioResult};

/// Configuration for risk accounting, validation and alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // === Risk Metrics ===
    /// Confidence level for VaR/CVaR (0.0 to 1.0, exclusive)
    pub confidence_level: f64,

    /// Minimum acceptable return per period for the Sortino ratio
    pub min_acceptable_return: f64,

    /// Periods per year used to annualize volatility
    pub periods_per_year: f64,

    /// Number of most recent returns fed to the risk engine
    pub risk_window: usize,

    // === Decision Validation ===
    /// Maximum fraction of total value in a single position
    pub concentration_limit: Decimal,

    /// Maximum number of distinct open positions
    pub max_positions: usize,

    /// Unrealized return at or below which a position is force-sold (negative)
    pub stop_loss_threshold: Decimal,

    /// Current drawdown at or beyond which new buys are refused
    pub max_drawdown_halt: Decimal,

    /// Decimal places allowed in share quantities (0 = whole shares)
    pub quantity_decimals: u32,

    // === Alerts ===
    /// Absolute movement that triggers a MEDIUM alert
    pub alert_threshold: Decimal,

    /// Absolute movement that escalates an alert to HIGH
    pub alert_high_threshold: Decimal,

    /// Price change below which a repeat alert is suppressed
    pub alert_epsilon: Decimal,

    // === Account & Data ===
    /// Starting cash for a fresh paper account
    pub initial_cash: Decimal,

    /// Tickers the agent watches and may trade
    pub universe: Vec<String>,

    /// Timeout for a single market data or decision call (seconds)
    pub data_timeout_secs: u64,

    /// Days of history fetched for indicators and alert references
    pub lookback_days: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            min_acceptable_return: 0.0,
            periods_per_year: 252.0,
            risk_window: 30,

            concentration_limit: dec!(0.25),    // 25% per ticker
            max_positions: 5,
            stop_loss_threshold: dec!(-0.05),   // -5% unrealized
            max_drawdown_halt: dec!(0.20),      // no new buys past 20% DD
            quantity_decimals: 4,

            alert_threshold: dec!(0.02),        // MEDIUM at 2%
            alert_high_threshold: dec!(0.04),   // HIGH at 4%
            alert_epsilon: dec!(0.0001),

            initial_cash: dec!(10000),
            universe: vec!["SPY".to_string(), "QQQ".to_string(), "GLD".to_string()],
            data_timeout_secs: 30,
            lookback_days: 60,
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by `PAPER_*` environment variables.
    pub fn from_env() -> PortfolioResult<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("PAPER_CONFIDENCE_LEVEL")? {
            config.confidence_level = v;
        }
        if let Some(v) = env_parse("PAPER_MIN_ACCEPTABLE_RETURN")? {
            config.min_acceptable_return = v;
        }
        if let Some(v) = env_parse("PAPER_PERIODS_PER_YEAR")? {
            config.periods_per_year = v;
        }
        if let Some(v) = env_parse("PAPER_RISK_WINDOW")? {
            config.risk_window = v;
        }
        if let Some(v) = env_parse("PAPER_CONCENTRATION_LIMIT")? {
            config.concentration_limit = v;
        }
        if let Some(v) = env_parse("PAPER_MAX_POSITIONS")? {
            config.max_positions = v;
        }
        if let Some(v) = env_parse("PAPER_STOP_LOSS_THRESHOLD")? {
            config.stop_loss_threshold = v;
        }
        if let Some(v) = env_parse("PAPER_MAX_DRAWDOWN_HALT")? {
            config.max_drawdown_halt = v;
        }
        if let Some(v) = env_parse("PAPER_QUANTITY_DECIMALS")? {
            config.quantity_decimals = v;
        }
        if let Some(v) = env_parse("PAPER_ALERT_THRESHOLD")? {
            config.alert_threshold = v;
        }
        if let Some(v) = env_parse("PAPER_ALERT_HIGH_THRESHOLD")? {
            config.alert_high_threshold = v;
        }
        if let Some(v) = env_parse("PAPER_ALERT_EPSILON")? {
            config.alert_epsilon = v;
        }
        if let Some(v) = env_parse("PAPER_INITIAL_CASH")? {
            config.initial_cash = v;
        }
        if let Some(v) = env_parse("PAPER_DATA_TIMEOUT_SECS")? {
            config.data_timeout_secs = v;
        }
        if let Some(v) = env_parse("PAPER_LOOKBACK_DAYS")? {
            config.lookback_days = v;
        }
        if let Ok(universe) = std::env::var("PAPER_UNIVERSE") {
            config.universe = parse_universe(&universe);
        }

        Ok(config)
    }

    /// Reject thresholds that would make the rules meaningless.
    pub fn validate(&self) -> PortfolioResult<()> {
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(config_error(format!(
                "confidence_level must be in (0, 1), got {}",
                self.confidence_level
            )));
        }
        if self.periods_per_year <= 0.0 {
            return Err(config_error("periods_per_year must be positive"));
        }
        if self.risk_window < 2 {
            return Err(config_error("risk_window must be at least 2"));
        }
        if self.concentration_limit <= Decimal::ZERO || self.concentration_limit > Decimal::ONE {
            return Err(config_error(format!(
                "concentration_limit must be in (0, 1], got {}",
                self.concentration_limit
            )));
        }
        if self.max_positions == 0 {
            return Err(config_error("max_positions must be at least 1"));
        }
        if self.stop_loss_threshold >= Decimal::ZERO || self.stop_loss_threshold <= -Decimal::ONE {
            return Err(config_error(format!(
                "stop_loss_threshold must be in (-1, 0), got {}",
                self.stop_loss_threshold
            )));
        }
        if self.max_drawdown_halt <= Decimal::ZERO || self.max_drawdown_halt > Decimal::ONE {
            return Err(config_error("max_drawdown_halt must be in (0, 1]"));
        }
        if self.quantity_decimals > 8 {
            return Err(config_error("quantity_decimals must be at most 8"));
        }
        if self.alert_threshold <= Decimal::ZERO {
            return Err(config_error("alert_threshold must be positive"));
        }
        if self.alert_high_threshold < self.alert_threshold {
            return Err(config_error(
                "alert_high_threshold must not be below alert_threshold",
            ));
        }
        if self.alert_epsilon < Decimal::ZERO {
            return Err(config_error("alert_epsilon must not be negative"));
        }
        if self.initial_cash <= Decimal::ZERO {
            return Err(config_error("initial_cash must be positive"));
        }
        if self.universe.is_empty() {
            return Err(config_error("universe must contain at least one ticker"));
        }
        Ok(())
    }
}

/// Split a comma-separated ticker list, normalizing case.
pub fn parse_universe(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn env_parse<T: FromStr>(key: &str) -> PortfolioResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| config_error(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

fn config_error(msg: impl Into<String>) -> PortfolioError {
    PortfolioError::Configuration(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_positions, 5);
        assert_eq!(config.concentration_limit, dec!(0.25));
        assert_eq!(config.stop_loss_threshold, dec!(-0.05));
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        let config = AgentConfig {
            confidence_level: 1.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PortfolioError::Configuration(_))));

        let config = AgentConfig {
            stop_loss_threshold: dec!(0.05),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            alert_high_threshold: dec!(0.01),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_universe() {
        assert_eq!(parse_universe(" spy, qqq ,,gld"), vec!["SPY", "QQQ", "GLD"]);
    }
}
