//! Agent runner: decision and monitoring cycles over one paper account.
//!
//! Handles:
//! - Restoring the ledger by replaying the stored trade log
//! - Daily decision cycles (prices, risk metrics, decision, execution)
//! - Bi-hourly monitoring cycles (price alerts against the previous close)
//! - Persisting trades, snapshots and alerts after each cycle

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{fetch_prices, DecisionContext, DecisionSource, MarketDataProvider};
use crate::db::Database;
use crate::error::PortfolioError;
use crate::ledger::Ledger;
use crate::models::{Alert, Bar, MarketIndicators, PortfolioSnapshot, RiskMetrics, TradeEvent};
use crate::trading::{
    current_drawdown, AgentConfig, AlertBook, AlertEvaluator, DecisionExecutor, ExecutionResult,
    PortfolioValuator,
};

/// Snapshots kept in memory for risk metrics and drawdown.
const HISTORY_LIMIT: i64 = 1000;

/// Calendar days of bars fetched for the monitoring reference close.
const MONITOR_LOOKBACK_DAYS: u32 = 7;

/// Loop cadence for `Agent::run`.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Time between monitoring cycles
    pub monitor_interval: Duration,

    /// Run a decision cycle every N monitoring ticks (the first tick always decides)
    pub decision_every: u32,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(2 * 60 * 60),
            decision_every: 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Decision,
    Monitor,
}

/// Summary of one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub kind: CycleKind,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
    pub snapshot: PortfolioSnapshot,
    pub risk_metrics: Option<RiskMetrics>,
    pub execution: Option<ExecutionResult>,
    pub alerts: Vec<Alert>,

    /// Tickers held or tracked with no price this cycle
    pub missing_prices: Vec<String>,
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let title = match self.kind {
            CycleKind::Decision => "Decision Cycle",
            CycleKind::Monitor => "Monitoring Cycle",
        };
        writeln!(f, "=== {} @ {} ===", title, self.timestamp.format("%Y-%m-%d %H:%M"))?;
        if let Some(source) = &self.source {
            writeln!(f, "Decision source: {}", source)?;
        }
        if !self.missing_prices.is_empty() {
            writeln!(f, "Missing prices:  {}", self.missing_prices.join(", "))?;
        }
        if let Some(execution) = &self.execution {
            write!(f, "{}", execution)?;
        }
        if self.kind == CycleKind::Monitor {
            if self.alerts.is_empty() {
                writeln!(f, "No new alerts")?;
            }
            for alert in &self.alerts {
                writeln!(f, "{}", alert)?;
            }
        }
        write!(f, "{}", self.snapshot)?;
        if let Some(metrics) = &self.risk_metrics {
            write!(f, "{}", metrics)?;
        }
        Ok(())
    }
}

/// Main agent runner.
pub struct Agent {
    config: AgentConfig,
    db: Database,
    market: Box<dyn MarketDataProvider>,

    /// Needed only for decision cycles
    source: Option<Box<dyn DecisionSource>>,

    valuator: PortfolioValuator,
    executor: DecisionExecutor,
    alert_evaluator: AlertEvaluator,

    // Runtime state
    ledger: Ledger,
    history: Vec<PortfolioSnapshot>,
    alerts: AlertBook,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Agent {
    /// Create an agent, restoring account state from the database.
    ///
    /// A fresh database is initialized with `config.initial_cash`.
    pub async fn new(
        config: AgentConfig,
        db: Database,
        market: Box<dyn MarketDataProvider>,
    ) -> Result<Self> {
        config.validate().context("Invalid agent configuration")?;

        let ledger = match db.load_ledger().await? {
            Some(ledger) => {
                info!(
                    trades = ledger.get_trade_log().len(),
                    cash = %ledger.cash(),
                    positions = ledger.position_count(),
                    "Resuming from stored trade log"
                );
                ledger
            }
            None => {
                let cash = db.init_account(config.initial_cash).await?;
                info!(initial_cash = %cash, "Initialized new paper account");
                Ledger::new(cash)?
            }
        };

        let history = db.get_snapshot_history(HISTORY_LIMIT).await?;
        let alerts = AlertBook::from_alerts(db.get_active_alerts().await?);

        Ok(Self {
            valuator: PortfolioValuator::new(&config),
            executor: DecisionExecutor::new(&config),
            alert_evaluator: AlertEvaluator::new(&config),
            config,
            db,
            market,
            source: None,
            ledger,
            history,
            alerts,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_source(mut self, source: Box<dyn DecisionSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // ==================== Queries ====================

    /// Current snapshot at live prices.
    pub async fn get_snapshot(&self) -> PortfolioSnapshot {
        let prices = fetch_prices(self.market.as_ref(), &self.ledger.tickers()).await;
        self.ledger.get_snapshot(&prices)
    }

    pub fn get_trade_log(&self) -> &[TradeEvent] {
        self.ledger.get_trade_log()
    }

    /// Risk metrics over the configured window of the stored equity curve.
    pub fn get_risk_metrics(&self) -> Result<RiskMetrics, PortfolioError> {
        self.valuator.value(&self.history, self.config.risk_window)
    }

    // ==================== Cycles ====================

    /// Universe plus anything currently held.
    fn tracked_tickers(&self) -> Vec<String> {
        let mut tickers = self.config.universe.clone();
        for ticker in self.ledger.tickers() {
            if !tickers.contains(&ticker) {
                tickers.push(ticker);
            }
        }
        tickers
    }

    async fn fetch_histories(&self, tickers: &[String], lookback_days: u32) -> HashMap<String, Vec<Bar>> {
        let market = self.market.as_ref();
        let results = futures::future::join_all(tickers.iter().map(|t| async move {
            (t.clone(), market.get_history(t, lookback_days).await)
        }))
        .await;

        let mut histories = HashMap::new();
        for (ticker, result) in results {
            match result {
                Ok(bars) if !bars.is_empty() => {
                    histories.insert(ticker, bars);
                }
                Ok(_) => warn!(ticker = %ticker, "History empty"),
                Err(e) => warn!(ticker = %ticker, error = %e, "History unavailable"),
            }
        }
        histories
    }

    /// One decision cycle: value, ask the decision source, execute, persist.
    ///
    /// Failures before execution leave the ledger untouched.
    pub async fn run_decision_cycle(&mut self) -> Result<CycleReport> {
        let source_name = match &self.source {
            Some(source) => source.name().to_string(),
            None => bail!("no decision source configured"),
        };
        let now = Utc::now();
        let tickers = self.tracked_tickers();
        info!(tickers = tickers.len(), source = %source_name, "Starting decision cycle");

        // 1. Market data
        let prices = fetch_prices(self.market.as_ref(), &tickers).await;
        let histories = self.fetch_histories(&tickers, self.config.lookback_days).await;
        let market_indicators: BTreeMap<String, MarketIndicators> = histories
            .iter()
            .filter_map(|(t, bars)| MarketIndicators::from_bars(bars).map(|i| (t.clone(), i)))
            .collect();
        let missing_prices: Vec<String> = tickers
            .iter()
            .filter(|t| !prices.contains_key(*t))
            .cloned()
            .collect();

        // 2. Valuation and risk against the curve including this moment
        let snapshot = self.ledger.get_snapshot_at(&prices, now);
        let mut curve = self.history.clone();
        curve.push(snapshot.clone());

        let risk_metrics = match self.valuator.value(&curve, self.config.risk_window) {
            Ok(metrics) => Some(metrics),
            Err(PortfolioError::InsufficientData { required, actual }) => {
                debug!(required, actual, "Not enough history for risk metrics");
                None
            }
            Err(e) => return Err(e).context("Risk metrics failed"),
        };
        let drawdown = current_drawdown(&curve);

        let context = DecisionContext {
            generated_at: now,
            universe: self.config.universe.clone(),
            concentration: self.valuator.concentration(&snapshot),
            portfolio_snapshot: snapshot,
            risk_metrics: risk_metrics.clone(),
            market_indicators,
            current_drawdown: drawdown,
        };

        // 3. Decision
        let source = self.source.as_ref().context("no decision source configured")?;
        let decision = source
            .decide(&context)
            .await
            .with_context(|| format!("Decision source '{}' failed", source_name))?;
        if let Some(reasoning) = &decision.reasoning {
            debug!(reasoning = %reasoning, "Decision received");
        }

        // 4. Execution
        let execution = self
            .executor
            .execute_at(&decision, &prices, drawdown, &mut self.ledger, now);

        // 5. Persist
        let written = self
            .db
            .append_trades(execution.trades())
            .await
            .context("Failed to persist trade events")?;

        let post_trade = self.ledger.get_snapshot_at(&prices, now);
        self.db.save_snapshot(&post_trade).await?;
        self.record_history(post_trade.clone());

        info!(
            trades = written,
            total_value = %post_trade.total_value,
            cash = %post_trade.cash,
            "Decision cycle complete"
        );

        Ok(CycleReport {
            kind: CycleKind::Decision,
            timestamp: now,
            source: Some(source_name),
            snapshot: post_trade,
            risk_metrics,
            execution: Some(execution),
            alerts: Vec::new(),
            missing_prices,
        })
    }

    /// One monitoring cycle: compare each tracked ticker against its previous close.
    pub async fn run_monitor_cycle(&mut self) -> Result<CycleReport> {
        let now = Utc::now();
        let tickers = self.tracked_tickers();
        debug!(tickers = tickers.len(), "Starting monitoring cycle");

        let prices = fetch_prices(self.market.as_ref(), &tickers).await;
        let histories = self.fetch_histories(&tickers, MONITOR_LOOKBACK_DAYS).await;

        let mut emitted = Vec::new();
        let mut missing_prices = Vec::new();

        for ticker in &tickers {
            let Some(current) = prices.get(ticker).copied() else {
                missing_prices.push(ticker.clone());
                continue;
            };
            let Some(reference) = histories.get(ticker).and_then(|bars| previous_close(bars)) else {
                debug!(ticker = %ticker, "No reference close, skipping");
                continue;
            };

            let was_active = self.alerts.last(ticker).is_some();
            match self.alerts.observe(&self.alert_evaluator, ticker, current, reference, now) {
                Some(alert) => {
                    self.db.save_alert(&alert).await?;
                    emitted.push(alert);
                }
                None if was_active && self.alerts.last(ticker).is_none() => {
                    self.db.resolve_alert(ticker).await?;
                }
                None => {}
            }
        }

        if !emitted.is_empty() {
            info!(alerts = emitted.len(), "Monitoring cycle raised alerts");
        }

        Ok(CycleReport {
            kind: CycleKind::Monitor,
            timestamp: now,
            source: None,
            snapshot: self.ledger.get_snapshot_at(&prices, now),
            risk_metrics: self.get_risk_metrics().ok(),
            execution: None,
            alerts: emitted,
            missing_prices,
        })
    }

    fn record_history(&mut self, snapshot: PortfolioSnapshot) {
        self.history.push(snapshot);
        let limit = HISTORY_LIMIT as usize;
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }

    /// Main run loop. Cycle errors are logged and the next cycle proceeds.
    pub async fn run(&mut self, schedule: Schedule) -> Result<()> {
        info!(
            monitor_interval_secs = schedule.monitor_interval.as_secs(),
            decision_every = schedule.decision_every,
            source = self.source.as_ref().map(|s| s.name()).unwrap_or("none"),
            "Starting agent run loop"
        );

        let mut ticker = interval(schedule.monitor_interval);
        let decision_every = schedule.decision_every.max(1);
        let mut tick: u32 = 0;

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let result = if tick % decision_every == 0 {
                self.run_decision_cycle().await
            } else {
                self.run_monitor_cycle().await
            };
            tick = tick.wrapping_add(1);

            match result {
                Ok(report) => println!("{}", report),
                Err(e) => {
                    let transient = e
                        .chain()
                        .filter_map(|c| c.downcast_ref::<PortfolioError>())
                        .any(PortfolioError::is_transient);
                    if transient {
                        warn!(error = format!("{:#}", e), "Cycle skipped, data unavailable");
                    } else {
                        error!(error = format!("{:#}", e), "Cycle failed");
                    }
                }
            }
        }

        info!(
            trades = self.ledger.get_trade_log().len(),
            cash = %self.ledger.cash(),
            "Agent shutdown complete"
        );
        Ok(())
    }
}

/// Close of the bar before the latest one.
fn previous_close(bars: &[Bar]) -> Option<Decimal> {
    match bars {
        [.., previous, _] => Some(previous.close),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{rule_engine, FileDecisionSource, InMemoryMarketData};
    use crate::models::Severity;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn bars(closes: &[Decimal]) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                date: start + chrono::Duration::days(i as i64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: 1_000,
            })
            .collect()
    }

    fn market() -> InMemoryMarketData {
        let mut data = InMemoryMarketData::new();
        data.insert_bars("SPY", bars(&[dec!(500), dec!(505), dec!(510)]));
        data.insert_bars("QQQ", bars(&[dec!(400), dec!(402), dec!(404)]));
        data.insert_bars("GLD", bars(&[dec!(200), dec!(199), dec!(200)]));
        data
    }

    async fn agent(db: &Database, data: InMemoryMarketData, source: Box<dyn DecisionSource>) -> Agent {
        Agent::new(AgentConfig::default(), db.clone(), Box::new(data))
            .await
            .unwrap()
            .with_source(source)
    }

    #[tokio::test]
    async fn test_decision_cycle_executes_and_persists() {
        let db = Database::in_memory().await.unwrap();
        let source = rule_engine("equal_weight").unwrap();
        let mut agent = agent(&db, market(), source).await;

        let report = assert_ok!(agent.run_decision_cycle().await);
        let execution = report.execution.unwrap();
        assert_eq!(execution.trades().count(), 3);
        assert!(report.risk_metrics.is_none());

        // 90% invested, capped at 25% each by concentration: 3 x 2500
        assert_eq!(agent.ledger().position_count(), 3);
        assert!(report.snapshot.cash >= dec!(2400));

        assert_eq!(db.get_trade_events().await.unwrap(), agent.get_trade_log());
        assert_eq!(db.get_snapshot_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decision_cycle_needs_source() {
        let db = Database::in_memory().await.unwrap();
        let mut agent = Agent::new(AgentConfig::default(), db, Box::new(market()))
            .await
            .unwrap();

        assert_err!(agent.run_decision_cycle().await);
        assert_ok!(agent.run_monitor_cycle().await);
    }

    #[tokio::test]
    async fn test_restart_replays_ledger() {
        let db = Database::in_memory().await.unwrap();
        let mut first = agent(&db, market(), rule_engine("buy_and_hold").unwrap()).await;
        first.run_decision_cycle().await.unwrap();

        let restored = agent(&db, market(), rule_engine("buy_and_hold").unwrap()).await;
        assert_eq!(restored.ledger(), first.ledger());
        assert_eq!(restored.history.len(), 1);

        // a second cycle holds, so no new trades
        let mut restored = restored;
        let report = restored.run_decision_cycle().await.unwrap();
        assert_eq!(report.execution.unwrap().trades().count(), 0);
        assert_eq!(restored.history.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_decision_leaves_ledger_untouched() {
        let dir = std::env::temp_dir().join(format!("paper-agent-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("decision.json");
        std::fs::write(&path, r#"{"actions": [{"ticker": "SPY", "action": "short"}]}"#).unwrap();

        let db = Database::in_memory().await.unwrap();
        let mut agent = agent(&db, market(), Box::new(FileDecisionSource::new(path))).await;

        let err = assert_err!(agent.run_decision_cycle().await);
        assert!(format!("{:#}", err).contains("Decision source"));
        assert_eq!(agent.ledger().cash(), dec!(10000));
        assert!(db.get_trade_events().await.unwrap().is_empty());
        assert!(db.get_snapshot_history(10).await.unwrap().is_empty());

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_risk_metrics_after_enough_cycles() {
        let db = Database::in_memory().await.unwrap();
        let mut agent = agent(&db, market(), rule_engine("buy_and_hold").unwrap()).await;
        assert!(matches!(
            agent.get_risk_metrics(),
            Err(PortfolioError::InsufficientData { .. })
        ));

        for _ in 0..3 {
            agent.run_decision_cycle().await.unwrap();
        }
        let metrics = agent.get_risk_metrics().unwrap();
        assert_eq!(metrics.observations, 2);
        assert!(metrics.cvar_95 <= metrics.var_95);
    }

    #[tokio::test]
    async fn test_monitor_cycle_alerts_once() {
        let db = Database::in_memory().await.unwrap();
        let mut data = market();
        // previous close 505, now 484.8: -4%
        data.set_price("SPY", dec!(484.8));
        let mut agent = agent(&db, data, rule_engine("buy_and_hold").unwrap()).await;

        let report = agent.run_monitor_cycle().await.unwrap();
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].ticker, "SPY");
        assert_eq!(report.alerts[0].severity, Severity::High);
        assert_eq!(report.alerts[0].reference_price, dec!(505));

        let repeat = agent.run_monitor_cycle().await.unwrap();
        assert!(repeat.alerts.is_empty());

        let stored = db.get_active_alerts().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].price, dec!(484.8));
    }

    #[tokio::test]
    async fn test_missing_price_is_reported() {
        let db = Database::in_memory().await.unwrap();
        let mut data = InMemoryMarketData::new();
        data.insert_bars("SPY", bars(&[dec!(500), dec!(510)]));
        let mut agent = agent(&db, data, rule_engine("buy_and_hold").unwrap()).await;

        let report = agent.run_decision_cycle().await.unwrap();
        assert_eq!(report.missing_prices, vec!["QQQ".to_string(), "GLD".to_string()]);
        assert_eq!(agent.ledger().tickers(), vec!["SPY".to_string()]);
    }

    #[test]
    fn test_previous_close() {
        assert_eq!(previous_close(&bars(&[dec!(1), dec!(2), dec!(3)])), Some(dec!(2)));
        assert_eq!(previous_close(&bars(&[dec!(1)])), None);
    }
}
