//! Decision validation, execution, valuation and alerting.

mod alerts;
mod config;
mod executor;
mod rules;
mod valuator;

pub use alerts::{AlertBook, AlertEvaluator};
pub use config::{parse_universe, AgentConfig};
pub use executor::{DecisionExecutor, ExecutionResult, OutcomeStatus};
pub use valuator::{current_drawdown, Concentration, PortfolioValuator};
