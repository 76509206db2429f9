//! The cloud client trait and its request/response types.
//!
//! Implementations talk to the ARM REST surface; the engines only ever see
//! this trait, so tests substitute in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::DeploymentMode;

/// Supplies subscription-scoped bearer tokens.
///
/// Credential acquisition (tenant/client/secret exchange) lives outside the
/// engine; this is the seam it is injected through.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn bearer_token(&self, subscription_id: &str) -> Result<String, CloudError>;
}

/// Discriminant for cloud-call failures. Drives the retry policy: only
/// `Transient` errors are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudErrorKind {
    /// 429 / 5xx / network timeout.
    Transient,
    /// 401 / 403.
    Auth,
    /// 404.
    NotFound,
    /// Deployment validation rejected the template.
    Validation,
    Unknown,
}

/// One node of the error tree ARM returns. Nested `details` carry the
/// actionable messages for preflight-style compound errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<CloudErrorBody>,
}

impl CloudErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            target: None,
            details: Vec::new(),
        }
    }

    /// Flatten the tree into its leaves. A node with details is only a
    /// wrapper; the leaves hold the messages worth surfacing.
    pub fn leaves(&self) -> Vec<&CloudErrorBody> {
        if self.details.is_empty() {
            return vec![self];
        }
        self.details.iter().flat_map(|d| d.leaves()).collect()
    }
}

/// A failed cloud call, classified and carrying the flattened error leaves.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CloudError {
    pub kind: CloudErrorKind,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Vec<CloudErrorBody>,
}

impl CloudError {
    pub fn new(kind: CloudErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Build from a parsed ARM error body, flattening nested details.
    pub fn from_body(kind: CloudErrorKind, body: &CloudErrorBody) -> Self {
        let leaves = body.leaves();
        let message = if leaves.len() == 1 && leaves[0].message == body.message {
            body.message.clone()
        } else {
            leaves
                .iter()
                .map(|l| l.message.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };
        Self {
            kind,
            code: body.code.clone(),
            message,
            details: leaves.into_iter().cloned().collect(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Transient, "Transient", message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Auth, "AuthorizationFailed", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::NotFound, "NotFound", message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == CloudErrorKind::Transient
    }
}

/// Filters applied to the resource-graph query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    /// Resource-group names. A trailing `*` matches by prefix.
    pub resource_groups: Vec<String>,
    /// Resource types, matched exactly (case-insensitively).
    pub resource_types: Vec<String>,
}

/// One resource row as returned by the resource-graph query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(rename = "resourceGroup")]
    pub resource_group: String,
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<serde_json::Value>,
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub tags: serde_json::Value,
}

/// One page of resource-graph results.
#[derive(Debug, Clone, Default)]
pub struct ResourcePage {
    pub resources: Vec<ResourceRecord>,
    /// Skip token for the next page, if any.
    pub continuation: Option<String>,
}

/// Body for deployment validate/submit calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub template: serde_json::Value,
    pub parameters: serde_json::Value,
    pub mode: DeploymentMode,
}

/// Result of a deployment validation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    /// Flattened error leaves when invalid.
    #[serde(default)]
    pub errors: Vec<CloudErrorBody>,
    /// Raw response document, persisted verbatim.
    pub raw: serde_json::Value,
}

/// Handle to a submitted cloud-side deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHandle {
    /// Cloud-side deployment id.
    pub deployment_id: String,
    pub correlation_id: Option<String>,
}

/// Cloud-side provisioning state of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ProvisioningState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Map ARM's free-form `provisioningState` string. Anything in flight
    /// ("Accepted", "Deleting", ...) counts as running.
    pub fn from_arm(s: &str) -> Self {
        match s {
            s if s.eq_ignore_ascii_case("succeeded") => Self::Succeeded,
            s if s.eq_ignore_ascii_case("failed") => Self::Failed,
            s if s.eq_ignore_ascii_case("canceled") || s.eq_ignore_ascii_case("cancelled") => {
                Self::Canceled
            }
            s if s.eq_ignore_ascii_case("notstarted") => Self::NotStarted,
            _ => Self::Running,
        }
    }
}

/// Point-in-time view of a cloud-side deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    pub state: ProvisioningState,
    /// The `properties.outputs` document, `null` until succeeded.
    pub outputs: serde_json::Value,
    #[serde(default)]
    pub errors: Vec<CloudErrorBody>,
    pub raw: serde_json::Value,
}

/// Typed calls against the cloud management surface.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Run one page of the resource-graph query.
    async fn query_resources(
        &self,
        subscription_id: &str,
        filters: &QueryFilters,
        continuation: Option<&str>,
    ) -> Result<ResourcePage, CloudError>;

    /// Resolve the API version for a resource type in a region. `None` means
    /// the type is not supported there; discovery proceeds without it.
    async fn get_api_version(
        &self,
        subscription_id: &str,
        provider: &str,
        resource_type: &str,
        location: &str,
    ) -> Result<Option<String>, CloudError>;

    /// Idempotent resource-group create-or-update.
    async fn ensure_resource_group(
        &self,
        subscription_id: &str,
        name: &str,
        location: &str,
    ) -> Result<(), CloudError>;

    /// Preflight-validate a deployment without applying it.
    async fn validate_deployment(
        &self,
        subscription_id: &str,
        resource_group: &str,
        name: &str,
        request: &DeploymentRequest,
    ) -> Result<ValidationOutcome, CloudError>;

    /// Submit a deployment and return its cloud-side handle.
    async fn submit_deployment(
        &self,
        subscription_id: &str,
        resource_group: &str,
        name: &str,
        request: &DeploymentRequest,
    ) -> Result<DeploymentHandle, CloudError>;

    /// Fetch the current state of a submitted deployment.
    async fn get_deployment(
        &self,
        subscription_id: &str,
        resource_group: &str,
        name: &str,
    ) -> Result<DeploymentSnapshot, CloudError>;

    /// Best-effort cancel of a running deployment. Returns whether the
    /// cloud accepted the cancel.
    async fn cancel_deployment(
        &self,
        subscription_id: &str,
        resource_group: &str,
        name: &str,
    ) -> Result<bool, CloudError>;
}
