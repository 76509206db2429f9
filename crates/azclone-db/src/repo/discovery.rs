//! Discovery repository - sessions, discovered resources, dependency edges.

use async_trait::async_trait;
use azclone_core::cloud::{QueryFilters, ResourceRecord};
use azclone_core::status::{DiscoveryStatus, EdgeType, ResourceStatus};
use azclone_core::{EntityId, id::resource_row_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A discovery session over a source subscription.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DiscoverySession {
    pub id: uuid::Uuid,
    pub name: String,
    pub connection_id: uuid::Uuid,
    pub source_subscription_id: String,
    pub target_subscription_id: String,
    /// JSON array of resource-group filters (`*` suffix = prefix match).
    pub resource_group_filters: serde_json::Value,
    /// JSON array of exact resource-type filters.
    pub resource_type_filters: serde_json::Value,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_discovered: i32,
    pub processed: i32,
    pub error_message: Option<String>,
}

impl DiscoverySession {
    pub fn new(
        name: impl Into<String>,
        connection_id: EntityId,
        source_subscription_id: impl Into<String>,
        target_subscription_id: impl Into<String>,
        filters: &QueryFilters,
    ) -> Self {
        Self {
            id: *EntityId::new().as_uuid(),
            name: name.into(),
            connection_id: *connection_id.as_uuid(),
            source_subscription_id: source_subscription_id.into(),
            target_subscription_id: target_subscription_id.into(),
            resource_group_filters: serde_json::json!(filters.resource_groups),
            resource_type_filters: serde_json::json!(filters.resource_types),
            status: DiscoveryStatus::InProgress.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            total_discovered: 0,
            processed: 0,
            error_message: None,
        }
    }

    /// Reconstruct the query filters from the stored JSON arrays.
    pub fn filters(&self) -> QueryFilters {
        let strings = |v: &serde_json::Value| -> Vec<String> {
            serde_json::from_value(v.clone()).unwrap_or_default()
        };
        QueryFilters {
            resource_groups: strings(&self.resource_group_filters),
            resource_types: strings(&self.resource_type_filters),
        }
    }
}

/// A resource discovered in the source subscription. Keyed by the composite
/// `"{session_id}/{azure_id}"` so the same cloud resource can belong to many
/// sessions.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DiscoveredResource {
    pub id: String,
    pub session_id: uuid::Uuid,
    pub azure_id: String,
    pub name: String,
    pub resource_type: String,
    pub resource_group: String,
    pub subscription_id: String,
    pub location: String,
    pub kind: Option<String>,
    pub sku: Option<serde_json::Value>,
    pub identity: Option<serde_json::Value>,
    pub plan: Option<serde_json::Value>,
    pub properties: serde_json::Value,
    pub tags: serde_json::Value,
    pub api_version: Option<String>,
    pub parent_id: Option<String>,
    pub dependency_level: i32,
    pub status: String,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredResource {
    /// Build a row from a resource-graph record.
    pub fn from_record(
        session_id: EntityId,
        record: ResourceRecord,
        api_version: Option<String>,
    ) -> Self {
        Self {
            id: resource_row_id(session_id, &record.id),
            session_id: *session_id.as_uuid(),
            azure_id: record.id,
            name: record.name,
            resource_type: record.resource_type,
            resource_group: record.resource_group,
            subscription_id: record.subscription_id,
            location: record.location,
            kind: record.kind,
            sku: record.sku,
            identity: record.identity,
            plan: record.plan,
            properties: record.properties,
            tags: record.tags,
            api_version,
            parent_id: None,
            dependency_level: 0,
            status: ResourceStatus::Discovered.to_string(),
            discovered_at: Utc::now(),
        }
    }
}

/// A directed dependency edge between two resources of the same session.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResourceEdge {
    pub id: uuid::Uuid,
    pub session_id: uuid::Uuid,
    pub source_id: String,
    pub target_id: String,
    pub edge_type: String,
    pub required: bool,
}

impl ResourceEdge {
    pub fn new(
        session_id: EntityId,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        edge_type: EdgeType,
        required: bool,
    ) -> Self {
        Self {
            id: *EntityId::new().as_uuid(),
            session_id: *session_id.as_uuid(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            edge_type: edge_type.to_string(),
            required,
        }
    }
}

#[async_trait]
pub trait DiscoveryRepo: Send + Sync {
    // Sessions
    async fn insert_session(&self, session: &DiscoverySession) -> DbResult<()>;
    async fn get_session(&self, id: EntityId) -> DbResult<DiscoverySession>;
    async fn list_sessions(&self, connection_id: EntityId) -> DbResult<Vec<DiscoverySession>>;
    /// Most recent completed session for a connection, used to skip
    /// rediscovery.
    async fn latest_completed_for_connection(
        &self,
        connection_id: EntityId,
    ) -> DbResult<Option<DiscoverySession>>;
    async fn update_session_status(
        &self,
        id: EntityId,
        status: DiscoveryStatus,
        error_message: Option<&str>,
    ) -> DbResult<()>;
    async fn set_session_progress(
        &self,
        id: EntityId,
        total_discovered: i32,
        processed: i32,
    ) -> DbResult<()>;
    async fn delete_session(&self, id: EntityId) -> DbResult<()>;

    // Resources
    async fn upsert_resources(&self, resources: &[DiscoveredResource]) -> DbResult<()>;
    /// Resources of a session, ordered by `(dependency_level, azure_id)`.
    async fn list_resources(&self, session_id: EntityId) -> DbResult<Vec<DiscoveredResource>>;
    /// Write computed dependency levels and mark the resources `Analyzed`.
    async fn apply_levels(&self, session_id: EntityId, levels: &[(String, i32)]) -> DbResult<()>;
    /// Move every resource of a resource group to a new lifecycle status.
    async fn set_group_resource_status(
        &self,
        session_id: EntityId,
        resource_group: &str,
        status: ResourceStatus,
    ) -> DbResult<()>;

    // Edges
    /// Insert edges, ignoring `(source, target)` pairs that already exist.
    /// Returns the number of rows actually inserted.
    async fn insert_edges(&self, edges: &[ResourceEdge]) -> DbResult<u64>;
    async fn list_edges(&self, session_id: EntityId) -> DbResult<Vec<ResourceEdge>>;
}

/// PostgreSQL implementation of DiscoveryRepo.
pub struct PgDiscoveryRepo {
    pool: PgPool,
}

impl PgDiscoveryRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DiscoveryRepo for PgDiscoveryRepo {
    async fn insert_session(&self, session: &DiscoverySession) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO discovery_sessions
                (id, name, connection_id, source_subscription_id, target_subscription_id,
                 resource_group_filters, resource_type_filters, status, started_at,
                 total_discovered, processed, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(session.id)
        .bind(&session.name)
        .bind(session.connection_id)
        .bind(&session.source_subscription_id)
        .bind(&session.target_subscription_id)
        .bind(&session.resource_group_filters)
        .bind(&session.resource_type_filters)
        .bind(&session.status)
        .bind(session.started_at)
        .bind(session.total_discovered)
        .bind(session.processed)
        .bind(&session.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: EntityId) -> DbResult<DiscoverySession> {
        let session = sqlx::query_as::<_, DiscoverySession>(
            "SELECT * FROM discovery_sessions WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("discovery session {}", id)))?;
        Ok(session)
    }

    async fn list_sessions(&self, connection_id: EntityId) -> DbResult<Vec<DiscoverySession>> {
        let sessions = sqlx::query_as::<_, DiscoverySession>(
            "SELECT * FROM discovery_sessions WHERE connection_id = $1 ORDER BY started_at DESC",
        )
        .bind(connection_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn latest_completed_for_connection(
        &self,
        connection_id: EntityId,
    ) -> DbResult<Option<DiscoverySession>> {
        let session = sqlx::query_as::<_, DiscoverySession>(
            r#"
            SELECT * FROM discovery_sessions
            WHERE connection_id = $1 AND status = 'Completed'
            ORDER BY completed_at DESC
            LIMIT 1
            "#,
        )
        .bind(connection_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn update_session_status(
        &self,
        id: EntityId,
        status: DiscoveryStatus,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        if status.is_terminal() {
            sqlx::query(
                r#"
                UPDATE discovery_sessions
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
            sqlx::query("UPDATE discovery_sessions SET status = $2, error_message = $3 WHERE id = $1")
                .bind(id.as_uuid())
                .bind(status.as_str())
                .bind(error_message)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn set_session_progress(
        &self,
        id: EntityId,
        total_discovered: i32,
        processed: i32,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE discovery_sessions SET total_discovered = $2, processed = $3 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(total_discovered)
        .bind(processed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, id: EntityId) -> DbResult<()> {
        sqlx::query("DELETE FROM discovery_sessions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_resources(&self, resources: &[DiscoveredResource]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for resource in resources {
            sqlx::query(
                r#"
                INSERT INTO discovered_resources
                    (id, session_id, azure_id, name, resource_type, resource_group,
                     subscription_id, location, kind, sku, identity, plan, properties,
                     tags, api_version, parent_id, dependency_level, status, discovered_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                        $15, $16, $17, $18, $19)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    resource_type = EXCLUDED.resource_type,
                    resource_group = EXCLUDED.resource_group,
                    location = EXCLUDED.location,
                    kind = EXCLUDED.kind,
                    sku = EXCLUDED.sku,
                    identity = EXCLUDED.identity,
                    plan = EXCLUDED.plan,
                    properties = EXCLUDED.properties,
                    tags = EXCLUDED.tags,
                    api_version = EXCLUDED.api_version
                "#,
            )
            .bind(&resource.id)
            .bind(resource.session_id)
            .bind(&resource.azure_id)
            .bind(&resource.name)
            .bind(&resource.resource_type)
            .bind(&resource.resource_group)
            .bind(&resource.subscription_id)
            .bind(&resource.location)
            .bind(&resource.kind)
            .bind(&resource.sku)
            .bind(&resource.identity)
            .bind(&resource.plan)
            .bind(&resource.properties)
            .bind(&resource.tags)
            .bind(&resource.api_version)
            .bind(&resource.parent_id)
            .bind(resource.dependency_level)
            .bind(&resource.status)
            .bind(resource.discovered_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_resources(&self, session_id: EntityId) -> DbResult<Vec<DiscoveredResource>> {
        let resources = sqlx::query_as::<_, DiscoveredResource>(
            r#"
            SELECT * FROM discovered_resources
            WHERE session_id = $1
            ORDER BY dependency_level, azure_id
            "#,
        )
        .bind(session_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(resources)
    }

    async fn apply_levels(&self, session_id: EntityId, levels: &[(String, i32)]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for (resource_id, level) in levels {
            sqlx::query(
                r#"
                UPDATE discovered_resources
                SET dependency_level = $3, status = $4
                WHERE session_id = $1 AND id = $2
                "#,
            )
            .bind(session_id.as_uuid())
            .bind(resource_id)
            .bind(level)
            .bind(ResourceStatus::Analyzed.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_group_resource_status(
        &self,
        session_id: EntityId,
        resource_group: &str,
        status: ResourceStatus,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE discovered_resources
            SET status = $3
            WHERE session_id = $1 AND resource_group = $2
            "#,
        )
        .bind(session_id.as_uuid())
        .bind(resource_group)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_edges(&self, edges: &[ResourceEdge]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for edge in edges {
            let result = sqlx::query(
                r#"
                INSERT INTO resource_edges (id, session_id, source_id, target_id, edge_type, required)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (source_id, target_id) DO NOTHING
                "#,
            )
            .bind(edge.id)
            .bind(edge.session_id)
            .bind(&edge.source_id)
            .bind(&edge.target_id)
            .bind(&edge.edge_type)
            .bind(edge.required)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_edges(&self, session_id: EntityId) -> DbResult<Vec<ResourceEdge>> {
        let edges = sqlx::query_as::<_, ResourceEdge>(
            "SELECT * FROM resource_edges WHERE session_id = $1 ORDER BY source_id, target_id",
        )
        .bind(session_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(edges)
    }
}
