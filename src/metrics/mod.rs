//! Risk and performance metrics over return series.

mod calculator;
mod performance;

pub use calculator::{returns_from_values, RiskCalculator};
pub use performance::{PerformanceCalculator, PerformanceStats};
