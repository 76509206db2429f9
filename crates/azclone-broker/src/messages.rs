//! Workflow message payloads.

use azclone_core::{EntityId, Result};
use azclone_db::{DeploymentSession, TemplateDeployment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::{RESOURCE_DISCOVERY, TEMPLATE_CREATED, WorkflowQueue};

/// Ask a worker to run discovery for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRequested {
    pub session_id: EntityId,
}

/// A template row exists and wants validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateCreated {
    pub template_id: EntityId,
    pub deployment_session_id: EntityId,
    pub discovery_session_id: EntityId,
    pub name: String,
    pub resource_group: String,
    pub dependency_level: i32,
    pub created_at: DateTime<Utc>,
}

/// Validation finished for a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateValidated {
    pub template_id: EntityId,
    pub deployment_session_id: EntityId,
    pub is_valid: bool,
    pub validation_json: serde_json::Value,
    pub validated_at: DateTime<Utc>,
}

/// A validated template wants deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDeploymentRequested {
    pub template_id: EntityId,
    pub deployment_session_id: EntityId,
    pub requested_at: DateTime<Utc>,
}

/// A deployment reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDeploymentCompleted {
    pub template_id: EntityId,
    pub deployment_session_id: EntityId,
    pub is_success: bool,
    pub deployment_json: Option<serde_json::Value>,
    pub completed_at: DateTime<Utc>,
}

/// Publish the start-discovery event for a session.
pub async fn publish_discovery_requested(
    queue: &dyn WorkflowQueue,
    session_id: EntityId,
) -> Result<()> {
    let payload = serde_json::to_value(DiscoveryRequested { session_id })
        .map_err(|e| azclone_core::Error::Internal(e.to_string()))?;
    queue.enqueue(RESOURCE_DISCOVERY, &payload).await?;
    Ok(())
}

/// Publish one template-created event per template of a fresh deployment
/// session, which sets the rest of the workflow in motion.
pub async fn publish_session_templates(
    queue: &dyn WorkflowQueue,
    session: &DeploymentSession,
    templates: &[TemplateDeployment],
) -> Result<()> {
    for template in templates {
        let message = TemplateCreated {
            template_id: EntityId::from_uuid(template.id),
            deployment_session_id: EntityId::from_uuid(template.deployment_session_id),
            discovery_session_id: EntityId::from_uuid(session.discovery_session_id),
            name: template.name.clone(),
            resource_group: template.resource_group.clone(),
            dependency_level: template.dependency_level,
            created_at: template.created_at,
        };
        let payload = serde_json::to_value(&message)
            .map_err(|e| azclone_core::Error::Internal(e.to_string()))?;
        queue.enqueue(TEMPLATE_CREATED, &payload).await?;
    }
    Ok(())
}
