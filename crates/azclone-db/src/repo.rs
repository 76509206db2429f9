//! Repository traits and PostgreSQL implementations.

pub mod deployment;
pub mod discovery;

pub use deployment::{
    DeploymentRepo, DeploymentSession, PgDeploymentRepo, TemplateCounts, TemplateDeployment,
};
pub use discovery::{
    DiscoveredResource, DiscoveryRepo, DiscoverySession, PgDiscoveryRepo, ResourceEdge,
};
