//! Deployment repository - deployment sessions and template deployments.

use async_trait::async_trait;
use azclone_core::EntityId;
use azclone_core::status::{DeploymentMode, DeploymentStatus, TemplateStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A deployment session against a target subscription.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeploymentSession {
    pub id: uuid::Uuid,
    pub name: String,
    pub discovery_session_id: uuid::Uuid,
    pub target_subscription_id: String,
    /// Override: deploy everything into this group instead of mirroring the
    /// source layout.
    pub target_resource_group: Option<String>,
    pub mode: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_templates: i32,
    pub deployed: i32,
    pub failed: i32,
    pub error_message: Option<String>,
    /// Aggregated outputs of all succeeded templates.
    pub outputs: serde_json::Value,
}

impl DeploymentSession {
    pub fn new(
        name: impl Into<String>,
        discovery_session_id: EntityId,
        target_subscription_id: impl Into<String>,
        target_resource_group: Option<String>,
        mode: DeploymentMode,
    ) -> Self {
        Self {
            id: *EntityId::new().as_uuid(),
            name: name.into(),
            discovery_session_id: *discovery_session_id.as_uuid(),
            target_subscription_id: target_subscription_id.into(),
            target_resource_group,
            mode: mode.to_string(),
            status: DeploymentStatus::Created.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            total_templates: 0,
            deployed: 0,
            failed: 0,
            error_message: None,
            outputs: serde_json::json!({}),
        }
    }
}

/// One synthesized template, deployed into one resource group.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TemplateDeployment {
    pub id: uuid::Uuid,
    pub deployment_session_id: uuid::Uuid,
    pub name: String,
    pub resource_group: String,
    pub template_content: serde_json::Value,
    pub parameters_content: serde_json::Value,
    pub status: String,
    pub dependency_level: i32,
    pub created_at: DateTime<Utc>,
    pub validated_at: Option<DateTime<Utc>>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub validation_json: Option<serde_json::Value>,
    pub deployment_json: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl TemplateDeployment {
    pub fn new(
        deployment_session_id: EntityId,
        name: impl Into<String>,
        resource_group: impl Into<String>,
        template_content: serde_json::Value,
        parameters_content: serde_json::Value,
        dependency_level: i32,
    ) -> Self {
        Self {
            id: *EntityId::new().as_uuid(),
            deployment_session_id: *deployment_session_id.as_uuid(),
            name: name.into(),
            resource_group: resource_group.into(),
            template_content,
            parameters_content,
            status: TemplateStatus::Created.to_string(),
            dependency_level,
            created_at: Utc::now(),
            validated_at: None,
            deployed_at: None,
            validation_json: None,
            deployment_json: None,
            error_message: None,
        }
    }
}

/// Per-session template tallies for outcome aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemplateCounts {
    pub total: i64,
    pub deployed: i64,
    pub failed: i64,
    /// Templates in any terminal status (deployed, failed, validation
    /// failed, skipped).
    pub terminal: i64,
}

#[async_trait]
pub trait DeploymentRepo: Send + Sync {
    // Sessions
    async fn insert_session(&self, session: &DeploymentSession) -> DbResult<()>;
    async fn get_session(&self, id: EntityId) -> DbResult<DeploymentSession>;
    async fn list_sessions(
        &self,
        discovery_session_id: EntityId,
    ) -> DbResult<Vec<DeploymentSession>>;
    async fn update_session_status(
        &self,
        id: EntityId,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) -> DbResult<()>;
    async fn set_session_totals(&self, id: EntityId, total_templates: i32) -> DbResult<()>;
    async fn record_session_outcome(
        &self,
        id: EntityId,
        deployed: i32,
        failed: i32,
        outputs: &serde_json::Value,
    ) -> DbResult<()>;
    async fn delete_session(&self, id: EntityId) -> DbResult<()>;

    // Templates
    async fn insert_template(&self, template: &TemplateDeployment) -> DbResult<()>;
    async fn get_template(&self, id: EntityId) -> DbResult<TemplateDeployment>;
    /// Templates of a session, ordered by `(dependency_level, created_at)`.
    async fn list_templates(&self, session_id: EntityId) -> DbResult<Vec<TemplateDeployment>>;
    /// Compare-and-set status transition. Returns false (and writes nothing)
    /// when the template is not in one of the expected states, which makes
    /// redelivered broker messages no-ops.
    async fn transition_template(
        &self,
        id: EntityId,
        expected: &[TemplateStatus],
        to: TemplateStatus,
        error_message: Option<&str>,
    ) -> DbResult<bool>;
    async fn record_validation(
        &self,
        id: EntityId,
        status: TemplateStatus,
        validation_json: &serde_json::Value,
        error_message: Option<&str>,
    ) -> DbResult<()>;
    async fn record_deployment(
        &self,
        id: EntityId,
        status: TemplateStatus,
        deployment_json: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> DbResult<()>;
    async fn template_counts(&self, session_id: EntityId) -> DbResult<TemplateCounts>;
    /// Move still-active templates to `Skipped` (session cancel / stop).
    /// Returns the number of templates skipped.
    async fn skip_active_templates(&self, session_id: EntityId, reason: &str) -> DbResult<u64>;
}

/// PostgreSQL implementation of DeploymentRepo.
pub struct PgDeploymentRepo {
    pool: PgPool,
}

impl PgDeploymentRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeploymentRepo for PgDeploymentRepo {
    async fn insert_session(&self, session: &DeploymentSession) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deployment_sessions
                (id, name, discovery_session_id, target_subscription_id, target_resource_group,
                 mode, status, started_at, total_templates, deployed, failed, error_message, outputs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(session.id)
        .bind(&session.name)
        .bind(session.discovery_session_id)
        .bind(&session.target_subscription_id)
        .bind(&session.target_resource_group)
        .bind(&session.mode)
        .bind(&session.status)
        .bind(session.started_at)
        .bind(session.total_templates)
        .bind(session.deployed)
        .bind(session.failed)
        .bind(&session.error_message)
        .bind(&session.outputs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: EntityId) -> DbResult<DeploymentSession> {
        let session = sqlx::query_as::<_, DeploymentSession>(
            "SELECT * FROM deployment_sessions WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("deployment session {}", id)))?;
        Ok(session)
    }

    async fn list_sessions(
        &self,
        discovery_session_id: EntityId,
    ) -> DbResult<Vec<DeploymentSession>> {
        let sessions = sqlx::query_as::<_, DeploymentSession>(
            r#"
            SELECT * FROM deployment_sessions
            WHERE discovery_session_id = $1
            ORDER BY started_at DESC
            "#,
        )
        .bind(discovery_session_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn update_session_status(
        &self,
        id: EntityId,
        status: DeploymentStatus,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        if status.is_terminal() {
            sqlx::query(
                r#"
                UPDATE deployment_sessions
                SET status = $2, error_message = $3, completed_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id.as_uuid())
            .bind(status.as_str())
            .bind(error_message)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE deployment_sessions SET status = $2, error_message = $3 WHERE id = $1",
            )
            .bind(id.as_uuid())
            .bind(status.as_str())
            .bind(error_message)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn set_session_totals(&self, id: EntityId, total_templates: i32) -> DbResult<()> {
        sqlx::query("UPDATE deployment_sessions SET total_templates = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(total_templates)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_session_outcome(
        &self,
        id: EntityId,
        deployed: i32,
        failed: i32,
        outputs: &serde_json::Value,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE deployment_sessions SET deployed = $2, failed = $3, outputs = $4 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(deployed)
        .bind(failed)
        .bind(outputs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, id: EntityId) -> DbResult<()> {
        sqlx::query("DELETE FROM deployment_sessions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_template(&self, template: &TemplateDeployment) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO template_deployments
                (id, deployment_session_id, name, resource_group, template_content,
                 parameters_content, status, dependency_level, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(template.id)
        .bind(template.deployment_session_id)
        .bind(&template.name)
        .bind(&template.resource_group)
        .bind(&template.template_content)
        .bind(&template.parameters_content)
        .bind(&template.status)
        .bind(template.dependency_level)
        .bind(template.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_template(&self, id: EntityId) -> DbResult<TemplateDeployment> {
        let template = sqlx::query_as::<_, TemplateDeployment>(
            "SELECT * FROM template_deployments WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("template deployment {}", id)))?;
        Ok(template)
    }

    async fn list_templates(&self, session_id: EntityId) -> DbResult<Vec<TemplateDeployment>> {
        let templates = sqlx::query_as::<_, TemplateDeployment>(
            r#"
            SELECT * FROM template_deployments
            WHERE deployment_session_id = $1
            ORDER BY dependency_level, created_at
            "#,
        )
        .bind(session_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(templates)
    }

    async fn transition_template(
        &self,
        id: EntityId,
        expected: &[TemplateStatus],
        to: TemplateStatus,
        error_message: Option<&str>,
    ) -> DbResult<bool> {
        let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE template_deployments
            SET status = $2, error_message = COALESCE($3, error_message)
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(error_message)
        .bind(&expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_validation(
        &self,
        id: EntityId,
        status: TemplateStatus,
        validation_json: &serde_json::Value,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE template_deployments
            SET status = $2, validation_json = $3, error_message = $4, validated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(validation_json)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_deployment(
        &self,
        id: EntityId,
        status: TemplateStatus,
        deployment_json: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE template_deployments
            SET status = $2, deployment_json = $3, error_message = $4, deployed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(deployment_json)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn template_counts(&self, session_id: EntityId) -> DbResult<TemplateCounts> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'Deployed'),
                COUNT(*) FILTER (WHERE status IN ('Failed', 'ValidationFailed')),
                COUNT(*) FILTER (WHERE status IN ('Deployed', 'Failed', 'ValidationFailed', 'Skipped'))
            FROM template_deployments
            WHERE deployment_session_id = $1
            "#,
        )
        .bind(session_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(TemplateCounts {
            total: row.0,
            deployed: row.1,
            failed: row.2,
            terminal: row.3,
        })
    }

    async fn skip_active_templates(&self, session_id: EntityId, reason: &str) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE template_deployments
            SET status = 'Skipped', error_message = $2
            WHERE deployment_session_id = $1
              AND status IN ('Created', 'Validating', 'ValidationPassed', 'Queued', 'Deploying')
            "#,
        )
        .bind(session_id.as_uuid())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
