//! External interfaces: market data providers and decision sources.

mod decision_source;
mod market_data;
mod types;

pub use decision_source::{
    rule_engine, CommandDecisionSource, DecisionContext, DecisionSource, FileDecisionSource,
};
pub use market_data::{fetch_prices, InMemoryMarketData, MarketDataProvider, YahooClient};
