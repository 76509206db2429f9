//! Discovery of source-subscription resources and their dependencies.
//!
//! The engine pages through the resource graph, enriches each resource with
//! its API version, persists in batches, then runs the dependency analyzer
//! and the level calculator over the full resource set.

pub mod analyzer;
pub mod engine;
pub mod extractors;
pub mod levels;

pub use analyzer::DependencyAnalyzer;
pub use engine::{DiscoveryEngine, StartDiscoveryRequest};
pub use levels::compute_levels;
