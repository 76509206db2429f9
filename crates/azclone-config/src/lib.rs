//! KDL configuration parsing for the azclone engine.
//!
//! This crate handles parsing of:
//! - Engine tuning options (azclone.kdl)
//! - Per-service rate limits

pub mod engine;
pub mod error;

pub use engine::{EngineConfig, ServiceRateLimits};
pub use error::{ConfigError, ConfigResult};
