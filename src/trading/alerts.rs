//! Price movement alerts with per-ticker deduplication.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::models::{Alert, Severity};

use super::AgentConfig;

/// Stateless alert rule.
#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    threshold: Decimal,
    high_threshold: Decimal,
    epsilon: Decimal,
}

impl AlertEvaluator {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            threshold: config.alert_threshold,
            high_threshold: config.alert_high_threshold,
            epsilon: config.alert_epsilon,
        }
    }

    /// Relative move of `current` against `reference`.
    pub fn movement(current: Decimal, reference: Decimal) -> Option<Decimal> {
        if reference <= Decimal::ZERO {
            return None;
        }
        Some((current - reference) / reference)
    }

    pub fn severity(&self, movement: Decimal) -> Option<Severity> {
        let magnitude = movement.abs();
        if magnitude >= self.high_threshold {
            Some(Severity::High)
        } else if magnitude >= self.threshold {
            Some(Severity::Medium)
        } else {
            None
        }
    }

    /// Emit an alert when the move crosses the threshold, unless the price
    /// has not moved since `last_alert` for the same ticker.
    pub fn evaluate(
        &self,
        ticker: &str,
        current: Decimal,
        reference: Decimal,
        last_alert: Option<&Alert>,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let movement = Self::movement(current, reference)?;
        let severity = self.severity(movement)?;

        if let Some(last) = last_alert {
            if (current - last.price).abs() < self.epsilon {
                debug!(ticker = %ticker, price = %current, "Alert suppressed, price unchanged");
                return None;
            }
        }

        Some(Alert {
            ticker: ticker.to_string(),
            timestamp: now,
            movement_pct: movement,
            severity,
            reference_price: reference,
            price: current,
        })
    }
}

/// Most recent unresolved alert per ticker.
#[derive(Debug, Default)]
pub struct AlertBook {
    active: HashMap<String, Alert>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from previously persisted alerts (oldest first).
    pub fn from_alerts(alerts: impl IntoIterator<Item = Alert>) -> Self {
        let mut book = Self::new();
        for alert in alerts {
            book.active.insert(alert.ticker.clone(), alert);
        }
        book
    }

    pub fn last(&self, ticker: &str) -> Option<&Alert> {
        self.active.get(ticker)
    }

    pub fn active(&self) -> impl Iterator<Item = &Alert> {
        self.active.values()
    }

    /// Evaluate one observation and update the book.
    ///
    /// A move back under the threshold resolves the ticker's alert, so a
    /// later crossing at the same price alerts again.
    pub fn observe(
        &mut self,
        evaluator: &AlertEvaluator,
        ticker: &str,
        current: Decimal,
        reference: Decimal,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let below_threshold = AlertEvaluator::movement(current, reference)
            .map(|m| evaluator.severity(m).is_none())
            .unwrap_or(false);
        if below_threshold {
            if self.active.remove(ticker).is_some() {
                debug!(ticker = %ticker, "Alert resolved");
            }
            return None;
        }

        let alert = evaluator.evaluate(ticker, current, reference, self.last(ticker), now)?;
        info!(
            ticker = %alert.ticker,
            severity = alert.severity.as_str(),
            movement = %alert.movement_pct,
            "Price alert"
        );
        self.active.insert(ticker.to_string(), alert.clone());
        Some(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn evaluator() -> AlertEvaluator {
        AlertEvaluator::new(&AgentConfig::default())
    }

    #[test]
    fn test_threshold_and_severity() {
        let e = evaluator();
        let now = Utc::now();

        assert!(e.evaluate("SPY", dec!(101.99), dec!(100), None, now).is_none());

        let medium = e.evaluate("SPY", dec!(98), dec!(100), None, now).unwrap();
        assert_eq!(medium.severity, Severity::Medium);
        assert_eq!(medium.movement_pct, dec!(-0.02));
        assert!(medium.is_drop());

        let high = e.evaluate("SPY", dec!(104), dec!(100), None, now).unwrap();
        assert_eq!(high.severity, Severity::High);
        assert_eq!(high.price, dec!(104));
    }

    #[test]
    fn test_dedup_on_unchanged_price() {
        let e = evaluator();
        let t0 = Utc::now();

        let first = e.evaluate("QQQ", dec!(97), dec!(100), None, t0).unwrap();
        let second = e.evaluate("QQQ", dec!(97), dec!(100), Some(&first), t0 + Duration::hours(6));
        assert!(second.is_none());

        let moved = e.evaluate("QQQ", dec!(96.5), dec!(100), Some(&first), t0 + Duration::hours(8));
        assert!(moved.is_some());
    }

    #[test]
    fn test_zero_reference_is_ignored() {
        assert!(evaluator()
            .evaluate("GLD", dec!(10), Decimal::ZERO, None, Utc::now())
            .is_none());
    }

    #[test]
    fn test_book_resolves_and_realerts() {
        let e = evaluator();
        let mut book = AlertBook::new();
        let t0 = Utc::now();

        assert!(book.observe(&e, "GLD", dec!(95), dec!(100), t0).is_some());
        assert!(book.observe(&e, "GLD", dec!(95), dec!(100), t0 + Duration::hours(2)).is_none());
        assert_eq!(book.last("GLD").unwrap().price, dec!(95));

        // recovery resolves
        assert!(book.observe(&e, "GLD", dec!(99), dec!(100), t0 + Duration::hours(4)).is_none());
        assert!(book.last("GLD").is_none());

        // same drop again is a fresh alert
        assert!(book.observe(&e, "GLD", dec!(95), dec!(100), t0 + Duration::hours(6)).is_some());
        assert_eq!(book.active().count(), 1);
    }
}
