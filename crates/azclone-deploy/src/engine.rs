//! The deployment engine: session creation, validation, level-wise deploy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use azclone_config::EngineConfig;
use azclone_core::cloud::{CloudClient, CloudErrorBody, DeploymentRequest, ProvisioningState};
use azclone_core::status::{
    DeploymentMode, DeploymentStatus, DiscoveryStatus, ResourceStatus, TemplateStatus,
};
use azclone_core::{EntityId, Error, Result};
use azclone_db::{
    DeploymentRepo, DeploymentSession, DiscoveryRepo, TemplateDeployment,
};
use azclone_template::{TemplateSynthesizer, prevalidate};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const MAX_POLL_ATTEMPTS: u32 = 60;
const DEFAULT_RG_LOCATION: &str = "eastus";

/// Request to clone a completed discovery into a target subscription.
#[derive(Debug, Clone)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub discovery_session_id: EntityId,
    pub target_subscription_id: String,
    /// Deploy every template into this group instead of mirroring the
    /// source layout.
    pub target_resource_group: Option<String>,
    pub mode: DeploymentMode,
}

/// Outcome of validating one template.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub template_id: EntityId,
    pub is_valid: bool,
    pub errors: Vec<CloudErrorBody>,
    pub duration: Duration,
    pub at: DateTime<Utc>,
}

/// Session-level aggregation of template validations.
#[derive(Debug, Clone)]
pub struct SessionValidationResult {
    pub session_id: EntityId,
    pub is_valid: bool,
    pub results: Vec<ValidationResult>,
}

/// Outcome of deploying one template.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub template_id: EntityId,
    pub is_success: bool,
    pub deployment_json: Option<Value>,
    pub outputs: Value,
    pub error_message: Option<String>,
}

pub struct DeploymentEngine {
    client: Arc<dyn CloudClient>,
    discovery_repo: Arc<dyn DiscoveryRepo>,
    deployment_repo: Arc<dyn DeploymentRepo>,
    synthesizer: TemplateSynthesizer,
    config: EngineConfig,
}

impl DeploymentEngine {
    pub fn new(
        client: Arc<dyn CloudClient>,
        discovery_repo: Arc<dyn DiscoveryRepo>,
        deployment_repo: Arc<dyn DeploymentRepo>,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            discovery_repo,
            deployment_repo,
            synthesizer: TemplateSynthesizer::new(),
            config,
        }
    }

    /// Create a deployment session and synthesize one template per resource
    /// group of the discovery.
    pub async fn create_session(
        &self,
        request: CreateDeploymentRequest,
    ) -> Result<DeploymentSession> {
        let discovery = self
            .discovery_repo
            .get_session(request.discovery_session_id)
            .await?;
        if discovery.status != DiscoveryStatus::Completed.as_str() {
            return Err(Error::InvalidState(format!(
                "discovery session {} is {}, deployment requires Completed",
                request.discovery_session_id, discovery.status
            )));
        }

        let session = DeploymentSession::new(
            request.name,
            request.discovery_session_id,
            request.target_subscription_id,
            request.target_resource_group.clone(),
            request.mode,
        );
        self.deployment_repo.insert_session(&session).await?;
        let session_id = EntityId::from_uuid(session.id);

        let resources = self
            .discovery_repo
            .list_resources(request.discovery_session_id)
            .await?;
        let edges = self
            .discovery_repo
            .list_edges(request.discovery_session_id)
            .await?;
        let groups = self.synthesizer.synthesize_session(&resources, &edges);

        for group in &groups {
            let target_group = request
                .target_resource_group
                .clone()
                .unwrap_or_else(|| group.resource_group.clone());
            let template = TemplateDeployment::new(
                session_id,
                format!("{}-{}", session.name, group.resource_group),
                target_group,
                group.template.clone(),
                group.parameters.clone(),
                group.max_level,
            );
            self.deployment_repo.insert_template(&template).await?;
            self.discovery_repo
                .set_group_resource_status(
                    request.discovery_session_id,
                    &group.resource_group,
                    ResourceStatus::TemplateGenerated,
                )
                .await?;
        }
        self.deployment_repo
            .set_session_totals(session_id, groups.len() as i32)
            .await?;

        info!(
            session_id = %session_id,
            templates = groups.len(),
            "Deployment session created"
        );
        Ok(self.deployment_repo.get_session(session_id).await?)
    }

    pub async fn get_session(&self, session_id: EntityId) -> Result<DeploymentSession> {
        Ok(self.deployment_repo.get_session(session_id).await?)
    }

    pub async fn list_templates(&self, session_id: EntityId) -> Result<Vec<TemplateDeployment>> {
        Ok(self.deployment_repo.list_templates(session_id).await?)
    }

    /// Validate one template: the local pre-validation pass first, then the
    /// cloud preflight. Replays on already-validated templates return the
    /// stored outcome.
    pub async fn validate_template(&self, template_id: EntityId) -> Result<ValidationResult> {
        let started = std::time::Instant::now();
        let template = self.deployment_repo.get_template(template_id).await?;

        let transitioned = self
            .deployment_repo
            .transition_template(
                template_id,
                &[TemplateStatus::Created, TemplateStatus::Validating],
                TemplateStatus::Validating,
                None,
            )
            .await?;
        if !transitioned {
            // Already past validation; report what the store knows.
            let current = self.deployment_repo.get_template(template_id).await?;
            let failed = current.status == TemplateStatus::ValidationFailed.as_str();
            return Ok(ValidationResult {
                template_id,
                is_valid: !failed,
                errors: Vec::new(),
                duration: started.elapsed(),
                at: Utc::now(),
            });
        }

        // Local pass: catch malformed templates without a cloud round-trip.
        let issues = prevalidate(&template.template_content);
        if !issues.is_empty() {
            let errors: Vec<CloudErrorBody> = issues
                .iter()
                .map(|issue| CloudErrorBody {
                    code: issue.code.clone(),
                    message: issue.message.clone(),
                    target: issue.target.clone(),
                    details: Vec::new(),
                })
                .collect();
            let summary = issues
                .iter()
                .map(|i| i.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            self.deployment_repo
                .record_validation(
                    template_id,
                    TemplateStatus::ValidationFailed,
                    &json!({"preValidation": errors}),
                    Some(&summary),
                )
                .await?;
            warn!(template_id = %template_id, issues = issues.len(), "Template failed pre-validation");
            return Ok(ValidationResult {
                template_id,
                is_valid: false,
                errors,
                duration: started.elapsed(),
                at: Utc::now(),
            });
        }

        let session = self
            .deployment_repo
            .get_session(EntityId::from_uuid(template.deployment_session_id))
            .await?;
        let request = DeploymentRequest {
            template: template.template_content.clone(),
            parameters: template.parameters_content.clone(),
            mode: DeploymentMode::Incremental,
        };
        match self
            .client
            .validate_deployment(
                &session.target_subscription_id,
                &template.resource_group,
                &template.name,
                &request,
            )
            .await
        {
            Ok(outcome) => {
                let status = if outcome.is_valid {
                    TemplateStatus::ValidationPassed
                } else {
                    TemplateStatus::ValidationFailed
                };
                let summary = outcome.errors.first().map(|e| e.message.clone());
                self.deployment_repo
                    .record_validation(template_id, status, &outcome.raw, summary.as_deref())
                    .await?;
                if outcome.is_valid {
                    self.mark_source_group(&session, &template, ResourceStatus::ReadyForCloning)
                        .await;
                }
                Ok(ValidationResult {
                    template_id,
                    is_valid: outcome.is_valid,
                    errors: outcome.errors,
                    duration: started.elapsed(),
                    at: Utc::now(),
                })
            }
            Err(err) => {
                let message = err.to_string();
                error!(template_id = %template_id, error = %message, "Validation call failed");
                self.deployment_repo
                    .record_validation(
                        template_id,
                        TemplateStatus::ValidationFailed,
                        &json!({"error": err}),
                        Some(&message),
                    )
                    .await?;
                Ok(ValidationResult {
                    template_id,
                    is_valid: false,
                    errors: err.details,
                    duration: started.elapsed(),
                    at: Utc::now(),
                })
            }
        }
    }

    /// Validate every template of a session sequentially and set the
    /// session-level outcome.
    pub async fn validate_all_templates(
        &self,
        session_id: EntityId,
    ) -> Result<SessionValidationResult> {
        let session = self.deployment_repo.get_session(session_id).await?;
        if session.status == DeploymentStatus::Cancelled.as_str() {
            return Err(Error::Cancelled);
        }
        self.deployment_repo
            .update_session_status(session_id, DeploymentStatus::Validating, None)
            .await?;

        let templates = self.deployment_repo.list_templates(session_id).await?;
        let mut results = Vec::with_capacity(templates.len());
        for template in &templates {
            let session = self.deployment_repo.get_session(session_id).await?;
            if session.status == DeploymentStatus::Cancelled.as_str() {
                return Err(Error::Cancelled);
            }
            results.push(
                self.validate_template(EntityId::from_uuid(template.id))
                    .await?,
            );
        }

        let failed = results.iter().filter(|r| !r.is_valid).count();
        let is_valid = failed == 0;
        let status = if is_valid {
            DeploymentStatus::ValidationPassed
        } else {
            DeploymentStatus::ValidationFailed
        };
        let message = (!is_valid).then(|| format!("{} template(s) failed validation", failed));
        self.deployment_repo
            .update_session_status(session_id, status, message.as_deref())
            .await?;

        Ok(SessionValidationResult {
            session_id,
            is_valid,
            results,
        })
    }

    /// Deploy one template and poll the cloud-side deployment to a terminal
    /// state. Replays on terminal templates return the stored outcome
    /// without resubmitting.
    pub async fn deploy_template(&self, template_id: EntityId) -> Result<DeployOutcome> {
        let template = self.deployment_repo.get_template(template_id).await?;
        let session = self
            .deployment_repo
            .get_session(EntityId::from_uuid(template.deployment_session_id))
            .await?;

        let transitioned = self
            .deployment_repo
            .transition_template(
                template_id,
                &[
                    TemplateStatus::ValidationPassed,
                    TemplateStatus::Queued,
                    TemplateStatus::Deploying,
                ],
                TemplateStatus::Deploying,
                None,
            )
            .await?;
        if !transitioned {
            let current = self.deployment_repo.get_template(template_id).await?;
            return match current.status.parse::<TemplateStatus>() {
                Ok(status) if status.is_terminal() => Ok(DeployOutcome {
                    template_id,
                    is_success: status == TemplateStatus::Deployed,
                    deployment_json: current.deployment_json.clone(),
                    outputs: extract_outputs(&current.deployment_json),
                    error_message: current.error_message.clone(),
                }),
                _ => Err(Error::InvalidState(format!(
                    "template {} is {}, not ready to deploy",
                    template_id, current.status
                ))),
            };
        }

        self.client
            .ensure_resource_group(
                &session.target_subscription_id,
                &template.resource_group,
                DEFAULT_RG_LOCATION,
            )
            .await
            .map_err(Error::Cloud)?;

        self.mark_source_group(&session, &template, ResourceStatus::Cloning)
            .await;

        let request = DeploymentRequest {
            template: template.template_content.clone(),
            parameters: template.parameters_content.clone(),
            mode: session
                .mode
                .parse::<DeploymentMode>()
                .unwrap_or(DeploymentMode::Incremental),
        };
        info!(
            template_id = %template_id,
            resource_group = %template.resource_group,
            "Submitting deployment"
        );
        let outcome = match self
            .client
            .submit_deployment(
                &session.target_subscription_id,
                &template.resource_group,
                &template.name,
                &request,
            )
            .await
        {
            Ok(_handle) => self.monitor(&session, &template).await,
            Err(err) => Ok(DeployOutcome {
                template_id,
                is_success: false,
                deployment_json: Some(json!({"error": err})),
                outputs: Value::Null,
                error_message: Some(err.to_string()),
            }),
        };

        match outcome {
            Ok(outcome) => {
                let status = if outcome.is_success {
                    TemplateStatus::Deployed
                } else {
                    TemplateStatus::Failed
                };
                self.deployment_repo
                    .record_deployment(
                        template_id,
                        status,
                        outcome.deployment_json.as_ref(),
                        outcome.error_message.as_deref(),
                    )
                    .await?;
                let resource_status = if outcome.is_success {
                    ResourceStatus::Cloned
                } else {
                    ResourceStatus::Failed
                };
                self.mark_source_group(&session, &template, resource_status)
                    .await;
                Ok(outcome)
            }
            // The monitoring budget ran out: fail the template with a
            // structured timeout code and surface the typed error.
            Err(err) => {
                let message = err.to_string();
                let timeout_json =
                    json!({"error": {"code": "DeploymentTimeout", "message": message}});
                self.deployment_repo
                    .record_deployment(
                        template_id,
                        TemplateStatus::Failed,
                        Some(&timeout_json),
                        Some(&message),
                    )
                    .await?;
                self.mark_source_group(&session, &template, ResourceStatus::Failed)
                    .await;
                Err(err)
            }
        }
    }

    /// Poll the deployment every 30 seconds until terminal, bounded at 60
    /// attempts (30 minutes). Exceeding the budget is an
    /// [`Error::DeploymentTimeout`].
    async fn monitor(
        &self,
        session: &DeploymentSession,
        template: &TemplateDeployment,
    ) -> Result<DeployOutcome> {
        let template_id = EntityId::from_uuid(template.id);
        for _ in 0..MAX_POLL_ATTEMPTS {
            match self
                .client
                .get_deployment(
                    &session.target_subscription_id,
                    &template.resource_group,
                    &template.name,
                )
                .await
            {
                Ok(snapshot) if snapshot.state.is_terminal() => {
                    let is_success = snapshot.state == ProvisioningState::Succeeded;
                    let error_message = (!is_success).then(|| {
                        snapshot
                            .errors
                            .first()
                            .map(|e| e.message.clone())
                            .unwrap_or_else(|| format!("deployment ended {:?}", snapshot.state))
                    });
                    return Ok(DeployOutcome {
                        template_id,
                        is_success,
                        deployment_json: Some(snapshot.raw.clone()),
                        outputs: snapshot.outputs,
                        error_message,
                    });
                }
                Ok(_) => {}
                Err(err) if err.is_transient() => {
                    warn!(template_id = %template_id, error = %err, "Polling hiccup, retrying");
                }
                Err(err) => {
                    return Ok(DeployOutcome {
                        template_id,
                        is_success: false,
                        deployment_json: Some(json!({"error": err})),
                        outputs: Value::Null,
                        error_message: Some(err.to_string()),
                    });
                }
            }
            sleep(POLL_INTERVAL).await;
        }

        Err(Error::DeploymentTimeout(format!(
            "{} polling attempts exhausted for deployment '{}'",
            MAX_POLL_ATTEMPTS, template.name
        )))
    }

    /// Deploy all templates of a session in ascending dependency-level
    /// waves. Within a level, templates deploy sequentially; the first
    /// failure stops the session.
    pub async fn deploy_all_templates(&self, session_id: EntityId) -> Result<DeploymentSession> {
        let session = self.deployment_repo.get_session(session_id).await?;
        if session.status == DeploymentStatus::Cancelled.as_str() {
            info!(session_id = %session_id, "Session cancelled, nothing to deploy");
            return Ok(session);
        }
        self.deployment_repo
            .update_session_status(session_id, DeploymentStatus::Deploying, None)
            .await?;

        let templates = self.deployment_repo.list_templates(session_id).await?;
        let mut waves: BTreeMap<i32, Vec<&TemplateDeployment>> = BTreeMap::new();
        for template in &templates {
            waves
                .entry(template.dependency_level)
                .or_default()
                .push(template);
        }

        let mut outputs = serde_json::Map::new();
        let mut stopped = false;
        let mut cancelled = false;
        let wave_count = waves.len();

        for (index, (level, wave)) in waves.into_iter().enumerate() {
            let session = self.deployment_repo.get_session(session_id).await?;
            if session.status == DeploymentStatus::Cancelled.as_str() {
                cancelled = true;
                break;
            }
            if stopped {
                break;
            }
            info!(session_id = %session_id, level, templates = wave.len(), "Deploying level");

            for template in wave {
                let template_id = EntityId::from_uuid(template.id);
                match template.status.parse::<TemplateStatus>() {
                    Ok(TemplateStatus::ValidationFailed)
                    | Ok(TemplateStatus::Failed)
                    | Ok(TemplateStatus::Skipped) => {
                        warn!(
                            template_id = %template_id,
                            status = %template.status,
                            "Template not deployable, stopping session"
                        );
                        stopped = true;
                        break;
                    }
                    Ok(TemplateStatus::Deployed) => continue,
                    _ => {}
                }

                match self.deploy_template(template_id).await {
                    Ok(outcome) if outcome.is_success => {
                        if let Some(map) = outcome.outputs.as_object() {
                            outputs.extend(map.clone());
                        }
                    }
                    Ok(_) => {
                        stopped = true;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            template_id = %template_id,
                            error = %err,
                            "Deployment errored, stopping session"
                        );
                        stopped = true;
                        break;
                    }
                }
            }

            if !stopped && index + 1 < wave_count {
                sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }

        if stopped || cancelled {
            let skipped = self
                .deployment_repo
                .skip_active_templates(session_id, "session stopped before this template")
                .await?;
            if skipped > 0 {
                info!(session_id = %session_id, skipped, "Skipped remaining templates");
            }
        }

        let counts = self.deployment_repo.template_counts(session_id).await?;
        self.deployment_repo
            .record_session_outcome(
                session_id,
                counts.deployed as i32,
                counts.failed as i32,
                &Value::Object(outputs),
            )
            .await?;

        if !cancelled {
            let status = if counts.failed == 0 {
                DeploymentStatus::Deployed
            } else if counts.deployed > 0 {
                DeploymentStatus::PartiallyDeployed
            } else {
                DeploymentStatus::Failed
            };
            let message = (counts.failed > 0)
                .then(|| format!("{} of {} template(s) failed", counts.failed, counts.total));
            self.deployment_repo
                .update_session_status(session_id, status, message.as_deref())
                .await?;
        }

        Ok(self.deployment_repo.get_session(session_id).await?)
    }

    /// Cancel a session: no further templates are submitted, in-flight
    /// cloud deployments get a best-effort cancel.
    pub async fn cancel(&self, session_id: EntityId) -> Result<()> {
        let session = self.deployment_repo.get_session(session_id).await?;
        if let Ok(status) = session.status.parse::<DeploymentStatus>() {
            if status.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "deployment session {} is already {}",
                    session_id, session.status
                )));
            }
        }

        let templates = self.deployment_repo.list_templates(session_id).await?;
        self.deployment_repo
            .update_session_status(session_id, DeploymentStatus::Cancelled, None)
            .await?;
        let skipped = self
            .deployment_repo
            .skip_active_templates(session_id, "cancelled by user")
            .await?;
        info!(session_id = %session_id, skipped, "Deployment session cancelled");

        for template in templates {
            if template.status == TemplateStatus::Deploying.as_str() {
                match self
                    .client
                    .cancel_deployment(
                        &session.target_subscription_id,
                        &template.resource_group,
                        &template.name,
                    )
                    .await
                {
                    Ok(accepted) => info!(
                        template = %template.name,
                        accepted,
                        "Requested cloud-side cancel"
                    ),
                    Err(err) => {
                        warn!(template = %template.name, error = %err, "Cloud-side cancel failed")
                    }
                }
            }
        }
        Ok(())
    }

    /// Propagate a lifecycle status to the source resources behind a
    /// template. Group-targeted sessions can remap groups, in which case the
    /// source group may not match and the update is a no-op.
    async fn mark_source_group(
        &self,
        session: &DeploymentSession,
        template: &TemplateDeployment,
        status: ResourceStatus,
    ) {
        let discovery_id = EntityId::from_uuid(session.discovery_session_id);
        if let Err(err) = self
            .discovery_repo
            .set_group_resource_status(discovery_id, &template.resource_group, status)
            .await
        {
            warn!(
                template = %template.name,
                error = %err,
                "Failed to propagate resource status"
            );
        }
    }
}

fn extract_outputs(deployment_json: &Option<Value>) -> Value {
    deployment_json
        .as_ref()
        .and_then(|doc| doc.pointer("/properties/outputs"))
        .cloned()
        .unwrap_or(Value::Null)
}
