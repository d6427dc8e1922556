//! Data models for positions, trades, snapshots, decisions, alerts and metrics.

mod alert;
mod decision;
mod market;
mod metrics;
mod position;
mod snapshot;
mod trade;

pub use alert::{Alert, Severity};
pub use decision::{Action, Amount, Decision, Instruction};
pub use market::{Bar, MarketIndicators};
pub use metrics::RiskMetrics;
pub use position::Position;
pub use snapshot::{PortfolioSnapshot, PositionValuation};
pub use trade::{TradeEvent, TradeSide};
