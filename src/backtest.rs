//! Backtesting engine for rule-engine allocations over historical daily closes.
//!
//! Features:
//! - Replays daily closes through the same executor, rules and ledger as live cycles
//! - Buy-and-hold and equal-weight strategies with daily or weekly rebalancing
//! - Stop-loss exits evaluated every day, rebalance day or not
//! - Performance statistics against an optional benchmark

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::api::{rule_engine, DecisionContext, InMemoryMarketData, MarketDataProvider};
use crate::ledger::Ledger;
use crate::metrics::{returns_from_values, PerformanceCalculator, PerformanceStats};
use crate::models::{Bar, Decision, MarketIndicators, PortfolioSnapshot, RiskMetrics, TradeEvent};
use crate::trading::{current_drawdown, AgentConfig, DecisionExecutor, OutcomeStatus, PortfolioValuator};

/// Trading days between weekly rebalances.
const WEEKLY_STEP: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebalance {
    Daily,
    Weekly,
}

impl Rebalance {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Some(Rebalance::Daily),
            "weekly" => Some(Rebalance::Weekly),
            _ => None,
        }
    }

    fn step(&self) -> usize {
        match self {
            Rebalance::Daily => 1,
            Rebalance::Weekly => WEEKLY_STEP,
        }
    }
}

/// Backtesting configuration.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Starting cash
    pub initial_capital: Decimal,

    /// Tickers the strategy allocates across
    pub tickers: Vec<String>,

    /// First and last day simulated (inclusive; None = all data)
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,

    /// Rule engine name (`buy_and_hold` or `equal_weight`)
    pub strategy: String,

    pub rebalance: Rebalance,

    /// Ticker whose closes beta and alpha are measured against
    pub benchmark: Option<String>,

    /// Rules and risk settings shared with the live agent
    pub agent: AgentConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        let agent = AgentConfig::default();
        Self {
            initial_capital: dec!(10000),
            tickers: agent.universe.clone(),
            start: None,
            end: None,
            strategy: "equal_weight".to_string(),
            rebalance: Rebalance::Weekly,
            benchmark: Some("SPY".to_string()),
            agent,
        }
    }
}

/// Backtest results.
#[derive(Debug, Clone)]
pub struct BacktestResults {
    pub strategy: String,
    pub rebalance: Rebalance,
    pub start: NaiveDate,
    pub end: NaiveDate,

    pub initial_capital: Decimal,
    pub final_value: Decimal,
    pub final_snapshot: PortfolioSnapshot,

    pub total_trades: usize,
    pub forced_exits: usize,
    pub rejected: usize,
    pub clamped: usize,

    pub performance: PerformanceStats,

    /// Tail-risk metrics over all daily returns (None for fewer than 2)
    pub risk: Option<RiskMetrics>,

    pub benchmark: Option<String>,
    pub equity_curve: Vec<(NaiveDate, Decimal)>,
    pub trades: Vec<TradeEvent>,
}

impl std::fmt::Display for BacktestResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let p = &self.performance;
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Strategy: {} ({:?} rebalance)", self.strategy, self.rebalance)?;
        writeln!(f, "Period:   {} to {} ({} days)", self.start, self.end, self.equity_curve.len())?;
        writeln!(f)?;
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", self.initial_capital)?;
        writeln!(f, "Final:       ${:.2}", self.final_value)?;
        writeln!(f, "Return:      {:.2}%", p.total_return * 100.0)?;
        writeln!(f, "Annualized:  {:.2}%", p.annualized_return * 100.0)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Total:       {}", self.total_trades)?;
        writeln!(f, "Stop-loss:   {}", self.forced_exits)?;
        writeln!(f, "Clamped:     {}", self.clamped)?;
        writeln!(f, "Rejected:    {}", self.rejected)?;
        writeln!(f)?;
        writeln!(f, "--- Performance ---")?;
        writeln!(f, "Volatility:    {:.2}%", p.volatility * 100.0)?;
        writeln!(f, "Sharpe Ratio:  {:.2}", p.sharpe_ratio)?;
        writeln!(f, "Sortino Ratio: {:.2}", p.sortino_ratio)?;
        writeln!(f, "Max Drawdown:  {:.2}%", p.max_drawdown * 100.0)?;
        writeln!(f, "Calmar Ratio:  {:.2}", p.calmar_ratio)?;
        writeln!(f, "Omega Ratio:   {:.2}", p.omega_ratio)?;
        writeln!(f, "Win Rate:      {:.1}%", p.win_rate * 100.0)?;
        writeln!(f, "Profit Factor: {:.2}", p.profit_factor)?;
        if let (Some(beta), Some(alpha), Some(bench)) = (p.beta, p.alpha, &self.benchmark) {
            writeln!(f, "Beta ({}):    {:.2}", bench, beta)?;
            writeln!(f, "Alpha:         {:.2}%", alpha * 100.0)?;
        }
        writeln!(f)?;
        match &self.risk {
            Some(risk) => write!(f, "{}", risk)?,
            None => writeln!(f, "--- Risk Metrics ---\n(not enough history)")?,
        }
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Daily close lookup with forward fill.
struct CloseTable {
    closes: HashMap<String, BTreeMap<NaiveDate, Decimal>>,
}

impl CloseTable {
    fn new(data: &InMemoryMarketData, tickers: &[String]) -> Self {
        let closes = tickers
            .iter()
            .map(|t| {
                let series = data.bars(t).iter().map(|b| (b.date, b.close)).collect();
                (t.clone(), series)
            })
            .collect();
        Self { closes }
    }

    fn close_on(&self, ticker: &str, date: NaiveDate) -> Option<Decimal> {
        self.closes
            .get(ticker)?
            .range(..=date)
            .next_back()
            .map(|(_, close)| *close)
    }

    fn prices_on(&self, date: NaiveDate) -> HashMap<String, Decimal> {
        self.closes
            .keys()
            .filter_map(|t| self.close_on(t, date).map(|p| (t.clone(), p)))
            .collect()
    }
}

pub struct Backtester {
    config: BacktestConfig,
    data: InMemoryMarketData,
}

impl Backtester {
    pub fn new(config: BacktestConfig, data: InMemoryMarketData) -> Result<Self> {
        config.agent.validate().context("Invalid rule configuration")?;
        if config.initial_capital <= Decimal::ZERO {
            bail!("initial capital must be positive");
        }
        if config.tickers.is_empty() {
            bail!("backtest needs at least one ticker");
        }
        if rule_engine(&config.strategy).is_none() {
            bail!("unknown strategy '{}'", config.strategy);
        }

        Ok(Self { config, data })
    }

    /// Download daily bars for the tickers and benchmark since `start`.
    pub async fn load_market_data(
        provider: &dyn MarketDataProvider,
        config: &BacktestConfig,
    ) -> Result<InMemoryMarketData> {
        let today = Utc::now().date_naive();
        let start = config.start.unwrap_or(today - chrono::Duration::days(365));
        let lookback_days = u32::try_from((today - start).num_days().max(1))
            .context("start date too far in the past")?;

        let mut tickers = config.tickers.clone();
        if let Some(bench) = &config.benchmark {
            if !tickers.contains(bench) {
                tickers.push(bench.clone());
            }
        }

        let mut data = InMemoryMarketData::new();
        for ticker in &tickers {
            match provider.get_history(ticker, lookback_days).await {
                Ok(bars) => {
                    info!(ticker = %ticker, bars = bars.len(), "Loaded history");
                    data.insert_bars(ticker, bars);
                }
                Err(e) => warn!(ticker = %ticker, error = %e, "History unavailable, ticker excluded"),
            }
        }
        Ok(data)
    }

    /// Trading days in range: every date with a close for any strategy ticker.
    fn trading_days(&self) -> Vec<NaiveDate> {
        let days: BTreeSet<NaiveDate> = self
            .config
            .tickers
            .iter()
            .flat_map(|t| self.data.bars(t).iter().map(|b| b.date))
            .filter(|d| self.config.start.map_or(true, |s| *d >= s))
            .filter(|d| self.config.end.map_or(true, |e| *d <= e))
            .collect();
        days.into_iter().collect()
    }

    fn bars_until(&self, ticker: &str, date: NaiveDate) -> &[Bar] {
        let bars = self.data.bars(ticker);
        &bars[..bars.partition_point(|b| b.date <= date)]
    }

    /// Run the simulation.
    pub async fn run(&self) -> Result<BacktestResults> {
        let cfg = &self.config;
        let days = self.trading_days();
        let (Some(&start), Some(&end)) = (days.first(), days.last()) else {
            bail!("no market data in the backtest range");
        };

        let source = rule_engine(&cfg.strategy)
            .with_context(|| format!("unknown strategy '{}'", cfg.strategy))?;
        let executor = DecisionExecutor::new(&cfg.agent);
        let valuator = PortfolioValuator::new(&cfg.agent);
        let table = CloseTable::new(&self.data, &cfg.tickers);

        info!(
            strategy = %cfg.strategy,
            days = days.len(),
            start = %start,
            end = %end,
            "Running backtest"
        );

        let mut ledger = Ledger::new(cfg.initial_capital)?;
        let mut history: Vec<PortfolioSnapshot> = Vec::with_capacity(days.len());
        let (mut forced, mut rejected, mut clamped) = (0, 0, 0);

        for (i, date) in days.iter().enumerate() {
            let timestamp = close_of(*date);
            let prices = table.prices_on(*date);

            // Today's entry holds the pre-trade value until execution finishes.
            let snapshot = ledger.get_snapshot_at(&prices, timestamp);
            history.push(snapshot.clone());
            let drawdown = current_drawdown(&history);

            // Non-rebalance days still run the executor for stop-loss exits.
            let decision = if i % cfg.rebalance.step() == 0 {
                let context = DecisionContext {
                    generated_at: timestamp,
                    universe: cfg.tickers.clone(),
                    concentration: valuator.concentration(&snapshot),
                    portfolio_snapshot: snapshot,
                    risk_metrics: valuator.value(&history, cfg.agent.risk_window).ok(),
                    market_indicators: cfg
                        .tickers
                        .iter()
                        .filter_map(|t| {
                            MarketIndicators::from_bars(self.bars_until(t, *date)).map(|m| (t.clone(), m))
                        })
                        .collect(),
                    current_drawdown: drawdown,
                };
                source.decide(&context).await.context("Strategy failed")?
            } else {
                Decision::default()
            };

            let execution = executor.execute_at(&decision, &prices, drawdown, &mut ledger, timestamp);
            forced += execution.count(OutcomeStatus::Forced);
            rejected += execution.count(OutcomeStatus::Rejected);
            clamped += execution.count(OutcomeStatus::Clamped);

            let post = ledger.get_snapshot_at(&prices, timestamp);
            debug!(date = %date, value = %post.total_value, "Backtest day");
            if let Some(today) = history.last_mut() {
                *today = post;
            }
        }

        let values: Vec<f64> = history
            .iter()
            .filter_map(|s| s.total_value.to_f64())
            .collect();
        let benchmark = cfg.benchmark.as_deref().and_then(|bench| {
            let closes: Option<Vec<f64>> = days
                .iter()
                .map(|d| self.data_close(bench, *d))
                .collect();
            closes.map(|c| returns_from_values(&c))
        });
        if cfg.benchmark.is_some() && benchmark.is_none() {
            warn!("Benchmark closes incomplete, beta and alpha omitted");
        }

        let calculator = PerformanceCalculator {
            periods_per_year: cfg.agent.periods_per_year,
            ..PerformanceCalculator::default()
        };
        let performance = calculator.calculate(&values, benchmark.as_deref());
        let risk = valuator.value(&history, history.len()).ok();

        let equity_curve: Vec<(NaiveDate, Decimal)> = days
            .iter()
            .zip(&history)
            .map(|(d, s)| (*d, s.total_value))
            .collect();
        let final_snapshot = history
            .last()
            .cloned()
            .context("backtest produced no snapshots")?;

        Ok(BacktestResults {
            strategy: source.name().to_string(),
            rebalance: cfg.rebalance,
            start,
            end,
            initial_capital: cfg.initial_capital,
            final_value: final_snapshot.total_value,
            final_snapshot,
            total_trades: ledger.get_trade_log().len(),
            forced_exits: forced,
            rejected,
            clamped,
            performance,
            risk,
            benchmark: cfg.benchmark.clone(),
            equity_curve,
            trades: ledger.get_trade_log().to_vec(),
        })
    }

    fn data_close(&self, ticker: &str, date: NaiveDate) -> Option<f64> {
        self.bars_until(ticker, date).last()?.close.to_f64()
    }
}

/// Trades on a backtest day are stamped at midnight UTC of that day.
fn close_of(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::default()).and_utc()
}
