//! Error clustering.

pub mod algorithms;
mod engine;
pub mod stats;

pub use engine::ClusterEngine;
