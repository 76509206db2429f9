//! Queue handlers wiring the engines into the workflow.
//!
//! A handler returning `Ok` completes its message; an `Err` abandons it for
//! redelivery. Every state change behind a handler is a guarded transition,
//! so replaying a message converges on the same terminal state.

use std::sync::Arc;

use async_trait::async_trait;
use azclone_core::status::{DeploymentStatus, TemplateStatus};
use azclone_core::{EntityId, Error, Result};
use azclone_db::DeploymentRepo;
use azclone_deploy::DeploymentEngine;
use azclone_discovery::DiscoveryEngine;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::messages::{
    DiscoveryRequested, TemplateCreated, TemplateDeploymentCompleted, TemplateDeploymentRequested,
    TemplateValidated,
};
use crate::queue::{
    RESOURCE_DISCOVERY, TEMPLATE_CREATED, TEMPLATE_DEPLOYMENT, TEMPLATE_DEPLOYMENT_RESULT,
    TEMPLATE_VALIDATION, WorkflowQueue,
};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The queue this handler drains.
    fn queue(&self) -> &'static str;
    async fn handle(&self, payload: &Value) -> Result<()>;
}

fn parse<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| Error::InvalidInput(format!("malformed message payload: {}", e)))
}

/// `resource-discovery`: run the discovery pipeline for a session.
pub struct DiscoveryHandler {
    pub engine: Arc<DiscoveryEngine>,
}

#[async_trait]
impl MessageHandler for DiscoveryHandler {
    fn queue(&self) -> &'static str {
        RESOURCE_DISCOVERY
    }

    async fn handle(&self, payload: &Value) -> Result<()> {
        let message: DiscoveryRequested = parse(payload)?;
        self.engine.run(message.session_id).await?;
        Ok(())
    }
}

/// `template-created`: validate the template and report the result.
pub struct TemplateCreatedHandler {
    pub engine: Arc<DeploymentEngine>,
    pub queue: Arc<dyn WorkflowQueue>,
}

#[async_trait]
impl MessageHandler for TemplateCreatedHandler {
    fn queue(&self) -> &'static str {
        TEMPLATE_CREATED
    }

    async fn handle(&self, payload: &Value) -> Result<()> {
        let message: TemplateCreated = parse(payload)?;
        let result = self.engine.validate_template(message.template_id).await?;

        let follow_up = TemplateValidated {
            template_id: message.template_id,
            deployment_session_id: message.deployment_session_id,
            is_valid: result.is_valid,
            validation_json: json!({"errors": result.errors}),
            validated_at: result.at,
        };
        self.queue
            .enqueue(
                TEMPLATE_VALIDATION,
                &serde_json::to_value(&follow_up)
                    .map_err(|e| Error::Internal(e.to_string()))?,
            )
            .await?;
        Ok(())
    }
}

/// `template-validation`: queue valid templates for deployment.
pub struct TemplateValidationHandler {
    pub repo: Arc<dyn DeploymentRepo>,
    pub queue: Arc<dyn WorkflowQueue>,
}

#[async_trait]
impl MessageHandler for TemplateValidationHandler {
    fn queue(&self) -> &'static str {
        TEMPLATE_VALIDATION
    }

    async fn handle(&self, payload: &Value) -> Result<()> {
        let message: TemplateValidated = parse(payload)?;
        if !message.is_valid {
            info!(template_id = %message.template_id, "Template invalid, workflow ends here");
            return Ok(());
        }

        // Guarded transition: only a freshly validated template moves to
        // Queued, so a redelivered message does not enqueue twice.
        let queued = self
            .repo
            .transition_template(
                message.template_id,
                &[TemplateStatus::ValidationPassed],
                TemplateStatus::Queued,
                None,
            )
            .await?;
        if !queued {
            info!(template_id = %message.template_id, "Template already queued, skipping");
            return Ok(());
        }

        let follow_up = TemplateDeploymentRequested {
            template_id: message.template_id,
            deployment_session_id: message.deployment_session_id,
            requested_at: Utc::now(),
        };
        self.queue
            .enqueue(
                TEMPLATE_DEPLOYMENT,
                &serde_json::to_value(&follow_up)
                    .map_err(|e| Error::Internal(e.to_string()))?,
            )
            .await?;
        Ok(())
    }
}

/// `template-deployment`: deploy the template and report the outcome.
pub struct TemplateDeploymentHandler {
    pub engine: Arc<DeploymentEngine>,
    pub queue: Arc<dyn WorkflowQueue>,
}

#[async_trait]
impl MessageHandler for TemplateDeploymentHandler {
    fn queue(&self) -> &'static str {
        TEMPLATE_DEPLOYMENT
    }

    async fn handle(&self, payload: &Value) -> Result<()> {
        let message: TemplateDeploymentRequested = parse(payload)?;
        let outcome = self.engine.deploy_template(message.template_id).await?;

        let follow_up = TemplateDeploymentCompleted {
            template_id: message.template_id,
            deployment_session_id: message.deployment_session_id,
            is_success: outcome.is_success,
            deployment_json: outcome.deployment_json,
            completed_at: Utc::now(),
        };
        self.queue
            .enqueue(
                TEMPLATE_DEPLOYMENT_RESULT,
                &serde_json::to_value(&follow_up)
                    .map_err(|e| Error::Internal(e.to_string()))?,
            )
            .await?;
        Ok(())
    }
}

/// `template-deployment-result`: close the session once every template is
/// terminal.
pub struct DeploymentResultHandler {
    pub repo: Arc<dyn DeploymentRepo>,
}

#[async_trait]
impl MessageHandler for DeploymentResultHandler {
    fn queue(&self) -> &'static str {
        TEMPLATE_DEPLOYMENT_RESULT
    }

    async fn handle(&self, payload: &Value) -> Result<()> {
        let message: TemplateDeploymentCompleted = parse(payload)?;
        let session_id = message.deployment_session_id;

        let counts = self.repo.template_counts(session_id).await?;
        if counts.terminal < counts.total {
            info!(
                session_id = %session_id,
                terminal = counts.terminal,
                total = counts.total,
                "Session still has templates in flight"
            );
            return Ok(());
        }

        let session = self.repo.get_session(session_id).await?;
        if let Ok(status) = session.status.parse::<DeploymentStatus>() {
            if status.is_terminal() {
                // Replay after the session already closed.
                return Ok(());
            }
        }

        // Aggregate outputs of every deployed template.
        let mut outputs = serde_json::Map::new();
        for template in self.repo.list_templates(session_id).await? {
            if template.status != TemplateStatus::Deployed.as_str() {
                continue;
            }
            let deployed_outputs = template
                .deployment_json
                .as_ref()
                .and_then(|doc| doc.pointer("/properties/outputs"))
                .and_then(Value::as_object)
                .cloned();
            if let Some(map) = deployed_outputs {
                outputs.extend(map);
            }
        }
        self.repo
            .record_session_outcome(
                session_id,
                counts.deployed as i32,
                counts.failed as i32,
                &Value::Object(outputs),
            )
            .await?;

        let status = if counts.failed == 0 {
            DeploymentStatus::Deployed
        } else {
            DeploymentStatus::Failed
        };
        let message = (counts.failed > 0)
            .then(|| format!("{} of {} template(s) failed", counts.failed, counts.total));
        self.repo
            .update_session_status(session_id, status, message.as_deref())
            .await?;
        info!(session_id = %session_id, status = %status, "Deployment session closed");
        Ok(())
    }
}

/// Convenience: detect a poisoned payload that will never parse, so the
/// worker can drop it instead of redelivering forever.
pub fn is_parse_failure(error: &Error) -> bool {
    matches!(error, Error::InvalidInput(message) if message.starts_with("malformed message payload"))
}

/// Log-and-classify helper shared by workers.
pub(crate) fn log_handler_error(queue: &str, message_id: EntityId, error: &Error) {
    warn!(
        queue,
        message_id = %message_id,
        error = %error,
        "Handler failed, message will be redelivered"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryQueue, MemoryDeployments};
    use azclone_core::status::DeploymentMode;
    use azclone_db::{DeploymentSession, TemplateDeployment};

    async fn seed_session(repo: &MemoryDeployments) -> EntityId {
        let session = DeploymentSession::new(
            "clone",
            EntityId::new(),
            "sub-dst",
            None,
            DeploymentMode::Incremental,
        );
        repo.insert_session(&session).await.unwrap();
        EntityId::from_uuid(session.id)
    }

    async fn seed_template(
        repo: &MemoryDeployments,
        session_id: EntityId,
        name: &str,
        status: TemplateStatus,
    ) -> EntityId {
        let mut template =
            TemplateDeployment::new(session_id, name, "rg-a", json!({}), json!({}), 0);
        template.status = status.to_string();
        if status == TemplateStatus::Deployed {
            template.deployment_json = Some(json!({
                "properties": {"outputs": {format!("{}Id", name): {"value": "ok"}}}
            }));
        }
        let id = EntityId::from_uuid(template.id);
        repo.insert_template(&template).await.unwrap();
        id
    }

    fn validated_payload(template_id: EntityId, session_id: EntityId, is_valid: bool) -> Value {
        serde_json::to_value(TemplateValidated {
            template_id,
            deployment_session_id: session_id,
            is_valid,
            validation_json: json!({"errors": []}),
            validated_at: Utc::now(),
        })
        .unwrap()
    }

    fn completed_payload(template_id: EntityId, session_id: EntityId, is_success: bool) -> Value {
        serde_json::to_value(TemplateDeploymentCompleted {
            template_id,
            deployment_session_id: session_id,
            is_success,
            deployment_json: None,
            completed_at: Utc::now(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn valid_template_moves_to_queued_and_emits_deployment() {
        let repo = Arc::new(MemoryDeployments::default());
        let queue = Arc::new(InMemoryQueue::default());
        let session_id = seed_session(&repo).await;
        let template_id =
            seed_template(&repo, session_id, "t0", TemplateStatus::ValidationPassed).await;

        let handler = TemplateValidationHandler {
            repo: repo.clone(),
            queue: queue.clone(),
        };
        handler
            .handle(&validated_payload(template_id, session_id, true))
            .await
            .unwrap();

        assert_eq!(
            repo.get_template(template_id).await.unwrap().status,
            "Queued"
        );
        assert_eq!(queue.pending(TEMPLATE_DEPLOYMENT), 1);

        // Redelivery finds the template already queued and emits nothing.
        handler
            .handle(&validated_payload(template_id, session_id, true))
            .await
            .unwrap();
        assert_eq!(queue.pending(TEMPLATE_DEPLOYMENT), 1);
    }

    #[tokio::test]
    async fn invalid_template_ends_the_workflow() {
        let repo = Arc::new(MemoryDeployments::default());
        let queue = Arc::new(InMemoryQueue::default());
        let session_id = seed_session(&repo).await;
        let template_id =
            seed_template(&repo, session_id, "t0", TemplateStatus::ValidationFailed).await;

        let handler = TemplateValidationHandler {
            repo: repo.clone(),
            queue: queue.clone(),
        };
        handler
            .handle(&validated_payload(template_id, session_id, false))
            .await
            .unwrap();

        assert_eq!(queue.pending(TEMPLATE_DEPLOYMENT), 0);
        assert_eq!(
            repo.get_template(template_id).await.unwrap().status,
            "ValidationFailed"
        );
    }

    #[tokio::test]
    async fn session_closes_only_when_every_template_is_terminal() {
        let repo = Arc::new(MemoryDeployments::default());
        let session_id = seed_session(&repo).await;
        let done = seed_template(&repo, session_id, "done", TemplateStatus::Deployed).await;
        let pending = seed_template(&repo, session_id, "pending", TemplateStatus::Queued).await;

        let handler = DeploymentResultHandler { repo: repo.clone() };
        handler
            .handle(&completed_payload(done, session_id, true))
            .await
            .unwrap();
        assert_eq!(repo.get_session(session_id).await.unwrap().status, "Created");

        // Second template finishes; the session closes and aggregates.
        repo.record_deployment(
            pending,
            TemplateStatus::Deployed,
            Some(&json!({
                "properties": {"outputs": {"pendingId": {"value": "ok"}}}
            })),
            None,
        )
        .await
        .unwrap();
        handler
            .handle(&completed_payload(pending, session_id, true))
            .await
            .unwrap();

        let session = repo.get_session(session_id).await.unwrap();
        assert_eq!(session.status, "Deployed");
        assert_eq!(session.deployed, 2);
        assert_eq!(session.failed, 0);
        let outputs = session.outputs.as_object().unwrap();
        assert!(outputs.contains_key("doneId"));
        assert!(outputs.contains_key("pendingId"));

        // Replaying the result message leaves the closed session untouched.
        handler
            .handle(&completed_payload(pending, session_id, true))
            .await
            .unwrap();
        assert_eq!(repo.get_session(session_id).await.unwrap().status, "Deployed");
    }

    #[tokio::test]
    async fn failed_template_closes_the_session_as_failed() {
        let repo = Arc::new(MemoryDeployments::default());
        let session_id = seed_session(&repo).await;
        seed_template(&repo, session_id, "ok", TemplateStatus::Deployed).await;
        let failed = seed_template(&repo, session_id, "broken", TemplateStatus::Failed).await;

        let handler = DeploymentResultHandler { repo: repo.clone() };
        handler
            .handle(&completed_payload(failed, session_id, false))
            .await
            .unwrap();

        let session = repo.get_session(session_id).await.unwrap();
        assert_eq!(session.status, "Failed");
        assert_eq!(session.deployed, 1);
        assert_eq!(session.failed, 1);
        assert!(session.error_message.unwrap().contains("1 of 2"));
    }

    #[tokio::test]
    async fn malformed_payloads_are_reported_as_parse_failures() {
        let repo = Arc::new(MemoryDeployments::default());
        let handler = DeploymentResultHandler { repo };
        let err = handler.handle(&json!({"garbage": true})).await.unwrap_err();
        assert!(is_parse_failure(&err));
    }
}
