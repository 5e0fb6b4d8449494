//! Log/trace/metric correlation.

mod engine;
mod store;
mod strategy;

pub use engine::CorrelationEngine;
pub use store::{SweepReport, TelemetryStore};
