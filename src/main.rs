//! Paper Allocator
//!
//! Runs daily allocation decisions from a language model or a rule engine
//! against a simulated brokerage account, with CVaR / Sortino risk accounting
//! fed back into every decision cycle.

mod agent;
mod api;
mod backtest;
mod db;
mod error;
mod ledger;
mod metrics;
mod models;
mod trading;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::agent::{Agent, Schedule};
use crate::api::{
    fetch_prices, rule_engine, CommandDecisionSource, DecisionSource, FileDecisionSource,
    InMemoryMarketData, MarketDataProvider, YahooClient,
};
use crate::backtest::{BacktestConfig, Backtester, Rebalance};
use crate::db::Database;
use crate::models::{Action, Amount, Decision, Instruction, TradeSide};
use crate::trading::{current_drawdown, parse_universe, AgentConfig, DecisionExecutor, PortfolioValuator};

/// Paper-portfolio allocation agent CLI.
#[derive(Parser)]
#[command(name = "paper-allocator")]
#[command(about = "Simulated portfolio driven by LLM or rule-engine allocation decisions", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "PAPER_DATABASE_URL", default_value = "sqlite:./paper_allocator.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Where decisions come from. Exactly one must be given.
#[derive(Args, Debug)]
struct SourceArgs {
    /// JSON decision document written by an external model
    #[arg(long, conflicts_with_all = ["command", "strategy"])]
    decision_file: Option<PathBuf>,

    /// Command that reads the context JSON on stdin and prints a decision
    #[arg(long, conflicts_with = "strategy")]
    command: Option<String>,

    /// Rule engine (buy_and_hold, equal_weight)
    #[arg(long)]
    strategy: Option<String>,

    /// Timeout for the decision command in seconds
    #[arg(long, default_value = "120")]
    command_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the paper account
    Init {
        /// Starting cash (defaults to PAPER_INITIAL_CASH or 10000)
        #[arg(short, long)]
        cash: Option<Decimal>,

        /// Wipe an existing account first
        #[arg(long)]
        force: bool,
    },

    /// Show holdings and P&L at current prices
    Status,

    /// Place a single manual trade through the rule checks
    Trade {
        /// buy or sell
        side: String,

        ticker: String,

        /// Number of shares (sell without quantity exits the position)
        quantity: Option<Decimal>,

        /// Fill price instead of the current market price
        #[arg(long)]
        price: Option<Decimal>,
    },

    /// Run one decision cycle
    Decide {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Run one monitoring cycle (price alerts)
    Monitor,

    /// Run monitoring and decision cycles until ctrl-c
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Minutes between monitoring cycles
        #[arg(short, long, default_value = "120")]
        interval: u64,

        /// Decide every N monitoring cycles
        #[arg(long, default_value = "12")]
        decide_every: u32,
    },

    /// Show risk metrics over the stored equity curve
    Metrics {
        /// Number of most recent returns (defaults to PAPER_RISK_WINDOW)
        #[arg(short, long)]
        window: Option<usize>,
    },

    /// Show the trade log
    Trades {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show recent alerts
    Alerts {
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Only unresolved alerts
        #[arg(long)]
        active: bool,
    },

    /// Backtest a rule engine over historical closes
    Backtest {
        /// buy_and_hold or equal_weight
        #[arg(short, long, default_value = "equal_weight")]
        strategy: String,

        /// daily or weekly
        #[arg(short, long, default_value = "weekly")]
        rebalance: String,

        /// Starting cash
        #[arg(short, long, default_value = "10000")]
        capital: Decimal,

        /// Comma-separated tickers (defaults to the configured universe)
        #[arg(short, long)]
        tickers: Option<String>,

        /// First day (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// Last day (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Benchmark ticker for beta and alpha
        #[arg(long, default_value = "SPY")]
        benchmark: String,

        /// Offline bars `{"TICKER": [bar, ...]}` instead of downloading
        #[arg(long)]
        data_file: Option<PathBuf>,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli.log_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Configuration errors are fatal
    let config = AgentConfig::from_env()?;
    config.validate()?;

    // Initialize database
    let db = Database::new(&cli.database).await?;

    match cli.command {
        Commands::Init { cash, force } => {
            if force {
                db.reset().await?;
            } else if let Some(existing) = db.get_initial_cash().await? {
                println!("Account already exists (initial cash ${:.2}). Use --force to reset.", existing);
                return Ok(());
            }
            let cash = db.init_account(cash.unwrap_or(config.initial_cash)).await?;
            info!(initial_cash = %cash, "Paper account created");
            println!("Paper account created with ${:.2}", cash);
        }

        Commands::Status => {
            if db.get_initial_cash().await?.is_none() {
                println!("No paper account found. Run 'paper-allocator init' first.");
                return Ok(());
            }
            let agent = new_agent(db, config).await?;
            let snapshot = agent.get_snapshot().await;

            println!("{}", snapshot);
            let initial = agent.ledger().initial_cash();
            println!("Initial Cash:     ${:.2}", initial);
            if initial > Decimal::ZERO {
                println!(
                    "Total Return:     {:.2}%",
                    (snapshot.total_value - initial) / initial * dec!(100)
                );
            }
            let stale = snapshot.stale_tickers();
            if !stale.is_empty() {
                println!("Valued at cost:   {}", stale.join(", "));
            }
            println!("Trades:           {}", agent.get_trade_log().len());
            match agent.get_risk_metrics() {
                Ok(metrics) => print!("{}", metrics),
                Err(e) => println!("Risk metrics:     {}", e),
            }
        }

        Commands::Trade {
            side,
            ticker,
            quantity,
            price,
        } => {
            let side = TradeSide::parse(&side).with_context(|| format!("side must be buy or sell, got '{}'", side))?;
            let ticker = ticker.to_uppercase();
            let action = match (side, quantity) {
                (TradeSide::Buy, Some(q)) => Action::Buy(Amount::Quantity(q)),
                (TradeSide::Buy, None) => bail!("a buy needs a quantity"),
                (TradeSide::Sell, q) => Action::Sell(q.map(Amount::Quantity)),
            };

            let Some(mut ledger) = db.load_ledger().await? else {
                bail!("no paper account found; run 'paper-allocator init' first");
            };

            let client = yahoo(&config)?;
            let mut prices = fetch_prices(&client, &ledger.tickers()).await;
            match price {
                Some(p) => {
                    prices.insert(ticker.clone(), p);
                }
                None => {
                    let p = client.get_current_price(&ticker).await?;
                    prices.insert(ticker.clone(), p);
                }
            }

            let history = db.get_snapshot_history(1000).await?;
            let decision = Decision::new(vec![Instruction::new(ticker, action)]);
            let executor = DecisionExecutor::new(&config);
            let result = executor.execute(&decision, &prices, current_drawdown(&history), &mut ledger);

            db.append_trades(result.trades()).await?;
            let snapshot = ledger.get_snapshot(&prices);
            db.save_snapshot(&snapshot).await?;

            print!("{}", result);
            println!("{}", snapshot);
        }

        Commands::Decide { source } => {
            let source = build_source(&source)?;
            let mut agent = new_agent(db, config).await?.with_source(source);
            let report = agent.run_decision_cycle().await?;
            println!("{}", report);
        }

        Commands::Monitor => {
            let mut agent = new_agent(db, config).await?;
            let report = agent.run_monitor_cycle().await?;
            println!("{}", report);
        }

        Commands::Run {
            source,
            interval,
            decide_every,
        } => {
            if interval == 0 {
                bail!("interval must be at least one minute");
            }
            let source = build_source(&source)?;
            let mut agent = new_agent(db, config).await?.with_source(source);
            agent
                .run(Schedule {
                    monitor_interval: Duration::from_secs(interval * 60),
                    decision_every: decide_every,
                })
                .await?;
        }

        Commands::Metrics { window } => {
            let history = db.get_snapshot_history(1000).await?;
            let window = window.unwrap_or(config.risk_window);
            let valuator = PortfolioValuator::new(&config);

            println!("\n=== Risk ({} snapshots stored) ===", history.len());
            match valuator.value(&history, window) {
                Ok(metrics) => print!("{}", metrics),
                Err(e) => println!("{}", e),
            }
            println!("Current Drawdown: {:.2}%", current_drawdown(&history) * dec!(100));

            if let Some(latest) = history.last() {
                println!("\n=== Concentration (last snapshot) ===");
                for c in valuator.concentration(latest) {
                    println!(
                        "  {:<8} ${:>12.2} {:>6.2}%{}",
                        c.ticker,
                        c.value,
                        c.ratio * dec!(100),
                        if c.exceeds_limit { "  over limit" } else { "" }
                    );
                }
            }
        }

        Commands::Trades { limit } => {
            let events = db.get_trade_events().await?;
            if events.is_empty() {
                println!("No trades yet.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<4} {:<8} {:>12} {:>10} {:>10}",
                "TIME", "SIDE", "TICKER", "QUANTITY", "PRICE", "REALIZED"
            );
            println!("{}", "-".repeat(70));
            let skip = events.len().saturating_sub(limit);
            for e in &events[skip..] {
                println!(
                    "{:<20} {:<4} {:<8} {:>12} {:>10.2} {:>10}",
                    e.timestamp.format("%Y-%m-%d %H:%M"),
                    e.side.as_str(),
                    e.ticker,
                    e.quantity,
                    e.price,
                    e.realized_pnl.map(|p| format!("{:.2}", p)).unwrap_or_default()
                );
            }
        }

        Commands::Alerts { limit, active } => {
            let alerts = if active {
                db.get_active_alerts().await?
            } else {
                db.get_recent_alerts(limit).await?
            };
            if alerts.is_empty() {
                println!("No alerts.");
            }
            for alert in alerts {
                println!("{}", alert);
            }
        }

        Commands::Config => print_config(&config),

        Commands::Backtest {
            strategy,
            rebalance,
            capital,
            tickers,
            start,
            end,
            benchmark,
            data_file,
        } => {
            let rebalance = Rebalance::parse(&rebalance)
                .with_context(|| format!("unknown rebalance frequency '{}'", rebalance))?;
            let bt_config = BacktestConfig {
                initial_capital: capital,
                tickers: tickers
                    .as_deref()
                    .map(parse_universe)
                    .unwrap_or_else(|| config.universe.clone()),
                start,
                end,
                strategy,
                rebalance,
                benchmark: Some(benchmark.to_uppercase()),
                agent: config.clone(),
            };

            let data = match data_file {
                Some(path) => InMemoryMarketData::from_json_file(&path)?,
                None => {
                    let client = yahoo(&config)?;
                    Backtester::load_market_data(&client, &bt_config).await?
                }
            };

            let results = Backtester::new(bt_config, data)?.run().await?;
            println!("{}", results);
        }
    }

    Ok(())
}

async fn new_agent(db: Database, config: AgentConfig) -> Result<Agent> {
    let market = Box::new(yahoo(&config)?);
    Agent::new(config, db, market).await
}

fn yahoo(config: &AgentConfig) -> Result<YahooClient> {
    YahooClient::new(Duration::from_secs(config.data_timeout_secs))
}

fn build_source(args: &SourceArgs) -> Result<Box<dyn DecisionSource>> {
    if let Some(path) = &args.decision_file {
        return Ok(Box::new(FileDecisionSource::new(path.clone())));
    }
    if let Some(command) = &args.command {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().context("--command is empty")?;
        return Ok(Box::new(CommandDecisionSource::new(
            program,
            parts.collect(),
            Duration::from_secs(args.command_timeout),
        )));
    }
    if let Some(name) = &args.strategy {
        return rule_engine(name).with_context(|| format!("unknown strategy '{}'", name));
    }
    bail!("give one of --decision-file, --command or --strategy")
}

fn print_config(config: &AgentConfig) {
    println!("\n=== Risk Metrics ===\n");
    println!("  Confidence Level:     {:.0}%", config.confidence_level * 100.0);
    println!("  Min Acceptable Ret:   {}", config.min_acceptable_return);
    println!("  Periods per Year:     {}", config.periods_per_year);
    println!("  Risk Window:          {} returns", config.risk_window);

    println!("\n=== Execution Rules ===\n");
    println!("  Concentration Limit:  {}%", config.concentration_limit * dec!(100));
    println!("  Max Positions:        {}", config.max_positions);
    println!("  Stop Loss:            {}%", config.stop_loss_threshold * dec!(100));
    println!("  Drawdown Halt:        {}%", config.max_drawdown_halt * dec!(100));
    println!("  Quantity Decimals:    {}", config.quantity_decimals);

    println!("\n=== Alerts ===\n");
    println!("  Threshold (MEDIUM):   {}%", config.alert_threshold * dec!(100));
    println!("  Threshold (HIGH):     {}%", config.alert_high_threshold * dec!(100));
    println!("  Price Epsilon:        {}", config.alert_epsilon);

    println!("\n=== Account ===\n");
    println!("  Initial Cash:         ${}", config.initial_cash);
    println!("  Universe:             {}", config.universe.join(", "));
    println!("  Lookback:             {} days", config.lookback_days);
    println!("  Data Timeout:         {}s", config.data_timeout_secs);
}
