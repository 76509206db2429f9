//! Durable workflow queues backed by PostgreSQL.
//!
//! Uses SKIP LOCKED claiming so several workers can drain one queue without
//! contention. Delivery is at-least-once: a completed message is gone, an
//! abandoned one returns to pending until its attempt budget runs out, then
//! it is marked dead.

use async_trait::async_trait;
use azclone_db::DbResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Queue names of the deployment workflow.
pub const RESOURCE_DISCOVERY: &str = "resource-discovery";
pub const TEMPLATE_CREATED: &str = "template-created";
pub const TEMPLATE_VALIDATION: &str = "template-validation";
pub const TEMPLATE_DEPLOYMENT: &str = "template-deployment";
pub const TEMPLATE_DEPLOYMENT_RESULT: &str = "template-deployment-result";

/// A queued workflow message.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedMessage {
    pub id: uuid::Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait WorkflowQueue: Send + Sync {
    /// Append a message to a queue.
    async fn enqueue(&self, queue: &str, payload: &serde_json::Value) -> DbResult<QueuedMessage>;
    /// Claim the oldest pending message of a queue, if any. Claiming counts
    /// as a delivery attempt.
    async fn claim(&self, queue: &str, worker_id: &str) -> DbResult<Option<QueuedMessage>>;
    /// Remove a successfully handled message.
    async fn complete(&self, message_id: uuid::Uuid) -> DbResult<()>;
    /// Release a message for redelivery; past `max_attempts` it is marked
    /// dead instead.
    async fn abandon(&self, message_id: uuid::Uuid, max_attempts: i32) -> DbResult<()>;
}

/// PostgreSQL implementation of the workflow queue.
pub struct PgWorkflowQueue {
    pool: PgPool,
}

impl PgWorkflowQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowQueue for PgWorkflowQueue {
    async fn enqueue(&self, queue: &str, payload: &serde_json::Value) -> DbResult<QueuedMessage> {
        let message = sqlx::query_as::<_, QueuedMessage>(
            r#"
            INSERT INTO workflow_messages (id, queue, payload, status, attempts, created_at)
            VALUES ($1, $2, $3, 'pending', 0, NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(queue)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(message)
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> DbResult<Option<QueuedMessage>> {
        let message = sqlx::query_as::<_, QueuedMessage>(
            r#"
            UPDATE workflow_messages
            SET status = 'claimed', claimed_by = $2, claimed_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM workflow_messages
                WHERE queue = $1 AND status = 'pending'
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }

    async fn complete(&self, message_id: uuid::Uuid) -> DbResult<()> {
        sqlx::query("DELETE FROM workflow_messages WHERE id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn abandon(&self, message_id: uuid::Uuid, max_attempts: i32) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_messages
            SET status = CASE WHEN attempts >= $2 THEN 'dead' ELSE 'pending' END,
                claimed_by = NULL,
                claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
