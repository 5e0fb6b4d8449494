//! Insight Engine: time-indexed telemetry correlation and adaptive error
//! clustering for the debugging toolkit.
//!
//! Correlates log lines with traces, metrics and sibling logs through four
//! ranked strategies, and groups error reports into near-duplicate clusters
//! that can be merged, queried and periodically rebuilt.
//!
//! In-memory only; no persistence, no network.

pub mod background;
pub mod cache;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod features;
pub mod similarity;
pub mod text;
pub mod time_index;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::ClusterEngine;
pub use config::{ClusteringAlgorithm, ClusteringConfig, CorrelationConfig, FeatureStrategy, SimilarityWeights};
pub use correlation::{CorrelationEngine, SweepReport};
pub use error::EngineError;
pub use events::{ClusterEvent, CorrelationEvent};
pub use similarity::SimilarityCalculator;
pub use text::{PatternTokenExtractor, TextSimilarity, TokenExtractor, WordDiffSimilarity};
