//! Deployment of synthesized templates into a target subscription.
//!
//! A deployment session is created from a completed discovery, carries one
//! template per resource group, and is driven through validate and deploy
//! phases. Templates deploy in ascending dependency-level waves; a level
//! starts only after the previous one finished, and the first failure in a
//! level stops the session.

pub mod engine;

pub use engine::{
    CreateDeploymentRequest, DeployOutcome, DeploymentEngine, SessionValidationResult,
    ValidationResult,
};
