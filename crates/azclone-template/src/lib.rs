//! ARM template synthesis.
//!
//! Turns one resource group's discovered resources into a deployment
//! template: parameterized names and locations, type-aware resource
//! declarations with `dependsOn` edges, and per-resource id outputs. A
//! pre-validation pass catches malformed templates before any cloud call.

pub mod emitters;
pub mod naming;
pub mod synthesizer;
pub mod validate;

pub use synthesizer::{GroupTemplate, TemplateSynthesizer};
pub use validate::{ValidationIssue, prevalidate};
