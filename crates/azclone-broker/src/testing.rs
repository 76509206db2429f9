//! In-memory fakes shared by the broker's test modules.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use azclone_core::EntityId;
use azclone_core::status::{DeploymentStatus, TemplateStatus};
use azclone_db::{
    DbError, DbResult, DeploymentRepo, DeploymentSession, TemplateCounts, TemplateDeployment,
};
use chrono::Utc;
use serde_json::Value;

use crate::queue::{QueuedMessage, WorkflowQueue};

#[derive(Default)]
pub struct InMemoryQueue {
    messages: Mutex<Vec<QueuedMessage>>,
}

impl InMemoryQueue {
    pub fn pending(&self, queue: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.queue == queue && m.status == "pending")
            .count()
    }

    pub fn dead(&self, queue: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.queue == queue && m.status == "dead")
            .count()
    }
}

#[async_trait]
impl WorkflowQueue for InMemoryQueue {
    async fn enqueue(&self, queue: &str, payload: &Value) -> DbResult<QueuedMessage> {
        let message = QueuedMessage {
            id: uuid::Uuid::now_v7(),
            queue: queue.to_string(),
            payload: payload.clone(),
            status: "pending".to_string(),
            attempts: 0,
            claimed_by: None,
            claimed_at: None,
            created_at: Utc::now(),
        };
        self.messages.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> DbResult<Option<QueuedMessage>> {
        let mut messages = self.messages.lock().unwrap();
        let next = messages
            .iter_mut()
            .filter(|m| m.queue == queue && m.status == "pending")
            .min_by_key(|m| m.created_at);
        Ok(next.map(|message| {
            message.status = "claimed".to_string();
            message.attempts += 1;
            message.claimed_by = Some(worker_id.to_string());
            message.claimed_at = Some(Utc::now());
            message.clone()
        }))
    }

    async fn complete(&self, message_id: uuid::Uuid) -> DbResult<()> {
        self.messages.lock().unwrap().retain(|m| m.id != message_id);
        Ok(())
    }

    async fn abandon(&self, message_id: uuid::Uuid, max_attempts: i32) -> DbResult<()> {
        let mut messages = self.messages.lock().unwrap();
        if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
            message.status = if message.attempts >= max_attempts {
                "dead".to_string()
            } else {
                "pending".to_string()
            };
            message.claimed_by = None;
            message.claimed_at = None;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDeployments {
    pub sessions: Mutex<HashMap<uuid::Uuid, DeploymentSession>>,
    pub templates: Mutex<HashMap<uuid::Uuid, TemplateDeployment>>,
}

#[async_trait]
impl DeploymentRepo for MemoryDeployments {
    async fn insert_session(&self, session: &DeploymentSession) -> DbResult<()> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: EntityId) -> DbResult<DeploymentSession> {
        self.sessions
            .lock()
            .unwrap()
            .get(id.as_uuid())
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("deployment session {}", id)))
    }

    async fn list_sessions(
        &self,
        _discovery_session_id: EntityId,
    ) -> DbResult<Vec<DeploymentSession>> {
        unimplemented!()
    }

    async fn update_session_status(
        &self,
        id: EntityId,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(id.as_uuid()) {
            session.status = status.to_string();
            session.error_message = error_message.map(String::from);
            if status.is_terminal() {
                session.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn set_session_totals(&self, id: EntityId, total_templates: i32) -> DbResult<()> {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(id.as_uuid()) {
            session.total_templates = total_templates;
        }
        Ok(())
    }

    async fn record_session_outcome(
        &self,
        id: EntityId,
        deployed: i32,
        failed: i32,
        outputs: &Value,
    ) -> DbResult<()> {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(id.as_uuid()) {
            session.deployed = deployed;
            session.failed = failed;
            session.outputs = outputs.clone();
        }
        Ok(())
    }

    async fn delete_session(&self, _id: EntityId) -> DbResult<()> {
        unimplemented!()
    }

    async fn insert_template(&self, template: &TemplateDeployment) -> DbResult<()> {
        self.templates
            .lock()
            .unwrap()
            .insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: EntityId) -> DbResult<TemplateDeployment> {
        self.templates
            .lock()
            .unwrap()
            .get(id.as_uuid())
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("template deployment {}", id)))
    }

    async fn list_templates(&self, session_id: EntityId) -> DbResult<Vec<TemplateDeployment>> {
        let mut templates: Vec<TemplateDeployment> = self
            .templates
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.deployment_session_id == *session_id.as_uuid())
            .cloned()
            .collect();
        templates.sort_by(|a, b| {
            (a.dependency_level, a.created_at).cmp(&(b.dependency_level, b.created_at))
        });
        Ok(templates)
    }

    async fn transition_template(
        &self,
        id: EntityId,
        expected: &[TemplateStatus],
        to: TemplateStatus,
        error_message: Option<&str>,
    ) -> DbResult<bool> {
        let mut templates = self.templates.lock().unwrap();
        let Some(template) = templates.get_mut(id.as_uuid()) else {
            return Ok(false);
        };
        if !expected.iter().any(|s| s.as_str() == template.status) {
            return Ok(false);
        }
        template.status = to.to_string();
        if error_message.is_some() {
            template.error_message = error_message.map(String::from);
        }
        Ok(true)
    }

    async fn record_validation(
        &self,
        id: EntityId,
        status: TemplateStatus,
        validation_json: &Value,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        if let Some(template) = self.templates.lock().unwrap().get_mut(id.as_uuid()) {
            template.status = status.to_string();
            template.validation_json = Some(validation_json.clone());
            template.error_message = error_message.map(String::from);
            template.validated_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_deployment(
        &self,
        id: EntityId,
        status: TemplateStatus,
        deployment_json: Option<&Value>,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        if let Some(template) = self.templates.lock().unwrap().get_mut(id.as_uuid()) {
            template.status = status.to_string();
            template.deployment_json = deployment_json.cloned();
            template.error_message = error_message.map(String::from);
            template.deployed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn template_counts(&self, session_id: EntityId) -> DbResult<TemplateCounts> {
        let templates = self.templates.lock().unwrap();
        let mut counts = TemplateCounts::default();
        for template in templates
            .values()
            .filter(|t| t.deployment_session_id == *session_id.as_uuid())
        {
            counts.total += 1;
            match template.status.as_str() {
                "Deployed" => {
                    counts.deployed += 1;
                    counts.terminal += 1;
                }
                "Failed" | "ValidationFailed" => {
                    counts.failed += 1;
                    counts.terminal += 1;
                }
                "Skipped" => counts.terminal += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn skip_active_templates(&self, _session_id: EntityId, _reason: &str) -> DbResult<u64> {
        unimplemented!()
    }
}
