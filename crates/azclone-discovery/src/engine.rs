//! Discovery orchestration: enumerate, enrich, persist, analyze, level.

use std::sync::Arc;
use std::time::Duration;

use azclone_config::EngineConfig;
use azclone_core::cloud::{CloudClient, CloudError, QueryFilters, ResourcePage, ResourceRecord};
use azclone_core::status::DiscoveryStatus;
use azclone_core::{EntityId, Error, Result};
use azclone_db::{DiscoveredResource, DiscoveryRepo, DiscoverySession};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::analyzer::DependencyAnalyzer;
use crate::levels::compute_levels;

/// Request to discover a source subscription.
#[derive(Debug, Clone)]
pub struct StartDiscoveryRequest {
    pub name: String,
    pub connection_id: EntityId,
    pub source_subscription_id: String,
    pub target_subscription_id: String,
    pub filters: QueryFilters,
}

/// Runs discovery sessions end to end.
pub struct DiscoveryEngine {
    client: Arc<dyn CloudClient>,
    repo: Arc<dyn DiscoveryRepo>,
    analyzer: DependencyAnalyzer,
    config: EngineConfig,
}

impl DiscoveryEngine {
    pub fn new(
        client: Arc<dyn CloudClient>,
        repo: Arc<dyn DiscoveryRepo>,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            repo,
            analyzer: DependencyAnalyzer::new(),
            config,
        }
    }

    /// Create a discovery session. The caller (normally the broker) invokes
    /// [`DiscoveryEngine::run`] afterwards.
    pub async fn start(&self, request: StartDiscoveryRequest) -> Result<DiscoverySession> {
        if request.source_subscription_id.is_empty() {
            return Err(Error::InvalidInput(
                "source subscription id is required".into(),
            ));
        }
        let session = DiscoverySession::new(
            request.name,
            request.connection_id,
            request.source_subscription_id,
            request.target_subscription_id,
            &request.filters,
        );
        self.repo.insert_session(&session).await?;
        info!(session_id = %session.id, "Discovery session created");
        Ok(session)
    }

    pub async fn get(&self, session_id: EntityId) -> Result<DiscoverySession> {
        Ok(self.repo.get_session(session_id).await?)
    }

    /// Most recent completed discovery for a connection, if any. Used to
    /// skip rediscovery of an unchanged subscription.
    pub async fn existing_discovery(
        &self,
        connection_id: EntityId,
    ) -> Result<Option<DiscoverySession>> {
        Ok(self
            .repo
            .latest_completed_for_connection(connection_id)
            .await?)
    }

    /// Request cancellation. The run loop observes the status between
    /// batches and stops without submitting further work.
    pub async fn cancel(&self, session_id: EntityId) -> Result<()> {
        let session = self.repo.get_session(session_id).await?;
        if let Ok(status) = session.status.parse::<DiscoveryStatus>() {
            if status.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "discovery session {} is already {}",
                    session_id, session.status
                )));
            }
        }
        self.repo
            .update_session_status(session_id, DiscoveryStatus::Cancelled, None)
            .await?;
        Ok(())
    }

    /// Delete a session and, through cascades, everything it owns.
    pub async fn delete(&self, session_id: EntityId) -> Result<()> {
        self.repo.delete_session(session_id).await?;
        Ok(())
    }

    /// Execute the discovery pipeline for a session. Terminal sessions are
    /// left untouched, which makes redelivered broker messages no-ops.
    pub async fn run(&self, session_id: EntityId) -> Result<()> {
        let session = self.repo.get_session(session_id).await?;
        if let Ok(status) = session.status.parse::<DiscoveryStatus>() {
            if status.is_terminal() {
                info!(
                    session_id = %session_id,
                    status = %session.status,
                    "Discovery already terminal, skipping"
                );
                return Ok(());
            }
        }

        self.repo
            .update_session_status(session_id, DiscoveryStatus::InProgress, None)
            .await?;
        info!(
            session_id = %session_id,
            subscription = %session.source_subscription_id,
            "Starting discovery"
        );

        match self.run_inner(session_id, &session).await {
            Ok(()) => {
                self.repo
                    .update_session_status(session_id, DiscoveryStatus::Completed, None)
                    .await?;
                info!(session_id = %session_id, "Discovery completed");
                Ok(())
            }
            Err(Error::Cancelled) => {
                info!(session_id = %session_id, "Discovery cancelled");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                error!(session_id = %session_id, error = %message, "Discovery failed");
                self.repo
                    .update_session_status(session_id, DiscoveryStatus::Failed, Some(&message))
                    .await?;
                Err(err)
            }
        }
    }

    async fn run_inner(&self, session_id: EntityId, session: &DiscoverySession) -> Result<()> {
        let filters = session.filters();
        let subscription = &session.source_subscription_id;

        let mut batch: Vec<DiscoveredResource> = Vec::new();
        let mut total = 0i32;
        let mut processed = 0i32;

        let mut pages = resource_pages(self.client.as_ref(), subscription, &filters);
        while let Some(page) = pages.try_next().await? {
            let has_more = page.continuation.is_some();
            total += page.resources.len() as i32;

            for record in page.resources {
                let api_version = self.lookup_api_version(subscription, &record).await;
                batch.push(DiscoveredResource::from_record(
                    session_id,
                    record,
                    api_version,
                ));
                if batch.len() >= self.config.processing_batch_size {
                    processed = self.flush(session_id, &mut batch, total, processed).await?;
                    self.check_cancelled(session_id).await?;
                    sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }

            if has_more {
                sleep(Duration::from_millis(self.config.resource_graph_delay_ms)).await;
            }
        }

        if !batch.is_empty() {
            processed = self.flush(session_id, &mut batch, total, processed).await?;
        }
        self.repo
            .set_session_progress(session_id, total, processed)
            .await?;

        // Analyze the full resource set.
        let resources = self.repo.list_resources(session_id).await?;
        let edges = self.analyzer.analyze(session_id, &resources);
        let inserted = self.repo.insert_edges(&edges).await?;
        info!(
            session_id = %session_id,
            resources = resources.len(),
            edges = edges.len(),
            inserted,
            "Dependency analysis complete"
        );

        // Level the graph and mark resources analyzed.
        let node_ids: Vec<String> = resources.iter().map(|r| r.id.clone()).collect();
        let pairs: Vec<(String, String)> = self
            .repo
            .list_edges(session_id)
            .await?
            .into_iter()
            .map(|e| (e.source_id, e.target_id))
            .collect();
        let levels: Vec<(String, i32)> = compute_levels(&node_ids, &pairs).into_iter().collect();
        self.repo.apply_levels(session_id, &levels).await?;

        Ok(())
    }

    /// Persist one batch and advance the progress counter.
    async fn flush(
        &self,
        session_id: EntityId,
        batch: &mut Vec<DiscoveredResource>,
        total: i32,
        processed: i32,
    ) -> Result<i32> {
        let processed = processed + batch.len() as i32;
        self.repo.upsert_resources(batch).await?;
        batch.clear();
        self.repo
            .set_session_progress(session_id, total, processed)
            .await?;
        Ok(processed)
    }

    async fn check_cancelled(&self, session_id: EntityId) -> Result<()> {
        let current = self.repo.get_session(session_id).await?;
        if current.status == DiscoveryStatus::Cancelled.as_str() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Best-effort API-version lookup; a failure is logged and the resource
    /// is persisted without one.
    async fn lookup_api_version(
        &self,
        subscription: &str,
        record: &ResourceRecord,
    ) -> Option<String> {
        let (provider, kind) = record.resource_type.split_once('/')?;
        match self
            .client
            .get_api_version(subscription, provider, kind, &record.location)
            .await
        {
            Ok(version) => version,
            Err(err) => {
                warn!(
                    resource = %record.id,
                    error = %err,
                    "API version lookup failed, continuing without"
                );
                None
            }
        }
    }
}

/// Lazily page through the resource graph, following skip tokens until the
/// cloud stops handing them out.
fn resource_pages<'a>(
    client: &'a dyn CloudClient,
    subscription_id: &'a str,
    filters: &'a QueryFilters,
) -> BoxStream<'a, std::result::Result<ResourcePage, CloudError>> {
    stream::try_unfold(
        Some(None),
        move |state: Option<Option<String>>| async move {
            let Some(continuation) = state else {
                return Ok(None);
            };
            let page = client
                .query_resources(subscription_id, filters, continuation.as_deref())
                .await?;
            let next = page.continuation.clone().map(Some);
            Ok(Some((page, next)))
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use azclone_core::cloud::{
        CloudError, CloudErrorKind, DeploymentHandle, DeploymentRequest, DeploymentSnapshot,
        ResourcePage, ValidationOutcome,
    };
    use azclone_core::status::ResourceStatus;
    use azclone_db::{DbError, DbResult, ResourceEdge};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockCloud {
        pages: Vec<ResourcePage>,
        api_versions: HashMap<String, String>,
        query_error: Option<CloudError>,
        api_version_error: bool,
    }

    impl MockCloud {
        fn with_pages(pages: Vec<ResourcePage>) -> Self {
            Self {
                pages,
                api_versions: HashMap::new(),
                query_error: None,
                api_version_error: false,
            }
        }
    }

    #[async_trait]
    impl CloudClient for MockCloud {
        async fn query_resources(
            &self,
            _subscription_id: &str,
            _filters: &QueryFilters,
            continuation: Option<&str>,
        ) -> std::result::Result<ResourcePage, CloudError> {
            if let Some(err) = &self.query_error {
                return Err(err.clone());
            }
            let index: usize = continuation.map(|c| c.parse().unwrap()).unwrap_or(0);
            Ok(self.pages[index].clone())
        }

        async fn get_api_version(
            &self,
            _subscription_id: &str,
            provider: &str,
            resource_type: &str,
            _location: &str,
        ) -> std::result::Result<Option<String>, CloudError> {
            if self.api_version_error {
                return Err(CloudError::transient("provider metadata unavailable"));
            }
            Ok(self
                .api_versions
                .get(&format!("{}/{}", provider, resource_type).to_ascii_lowercase())
                .cloned())
        }

        async fn ensure_resource_group(
            &self,
            _subscription_id: &str,
            _name: &str,
            _location: &str,
        ) -> std::result::Result<(), CloudError> {
            unimplemented!()
        }

        async fn validate_deployment(
            &self,
            _subscription_id: &str,
            _resource_group: &str,
            _name: &str,
            _request: &DeploymentRequest,
        ) -> std::result::Result<ValidationOutcome, CloudError> {
            unimplemented!()
        }

        async fn submit_deployment(
            &self,
            _subscription_id: &str,
            _resource_group: &str,
            _name: &str,
            _request: &DeploymentRequest,
        ) -> std::result::Result<DeploymentHandle, CloudError> {
            unimplemented!()
        }

        async fn get_deployment(
            &self,
            _subscription_id: &str,
            _resource_group: &str,
            _name: &str,
        ) -> std::result::Result<DeploymentSnapshot, CloudError> {
            unimplemented!()
        }

        async fn cancel_deployment(
            &self,
            _subscription_id: &str,
            _resource_group: &str,
            _name: &str,
        ) -> std::result::Result<bool, CloudError> {
            unimplemented!()
        }
    }

    #[derive(Default)]
    struct MemoryRepo {
        sessions: Mutex<HashMap<uuid::Uuid, DiscoverySession>>,
        resources: Mutex<HashMap<String, DiscoveredResource>>,
        edges: Mutex<Vec<ResourceEdge>>,
        upsert_calls: Mutex<u32>,
    }

    #[async_trait]
    impl DiscoveryRepo for MemoryRepo {
        async fn insert_session(&self, session: &DiscoverySession) -> DbResult<()> {
            self.sessions
                .lock()
                .unwrap()
                .insert(session.id, session.clone());
            Ok(())
        }

        async fn get_session(&self, id: EntityId) -> DbResult<DiscoverySession> {
            self.sessions
                .lock()
                .unwrap()
                .get(id.as_uuid())
                .cloned()
                .ok_or_else(|| DbError::NotFound(format!("discovery session {}", id)))
        }

        async fn list_sessions(&self, connection_id: EntityId) -> DbResult<Vec<DiscoverySession>> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.connection_id == *connection_id.as_uuid())
                .cloned()
                .collect())
        }

        async fn latest_completed_for_connection(
            &self,
            connection_id: EntityId,
        ) -> DbResult<Option<DiscoverySession>> {
            let sessions = self.sessions.lock().unwrap();
            let mut completed: Vec<&DiscoverySession> = sessions
                .values()
                .filter(|s| {
                    s.connection_id == *connection_id.as_uuid() && s.status == "Completed"
                })
                .collect();
            completed.sort_by_key(|s| s.completed_at);
            Ok(completed.last().map(|s| (*s).clone()))
        }

        async fn update_session_status(
            &self,
            id: EntityId,
            status: DiscoveryStatus,
            error_message: Option<&str>,
        ) -> DbResult<()> {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.get_mut(id.as_uuid()) {
                session.status = status.to_string();
                session.error_message = error_message.map(String::from);
                if status.is_terminal() {
                    session.completed_at = Some(chrono::Utc::now());
                }
            }
            Ok(())
        }

        async fn set_session_progress(
            &self,
            id: EntityId,
            total_discovered: i32,
            processed: i32,
        ) -> DbResult<()> {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.get_mut(id.as_uuid()) {
                session.total_discovered = total_discovered;
                session.processed = processed;
            }
            Ok(())
        }

        async fn delete_session(&self, id: EntityId) -> DbResult<()> {
            self.sessions.lock().unwrap().remove(id.as_uuid());
            self.resources
                .lock()
                .unwrap()
                .retain(|_, r| r.session_id != *id.as_uuid());
            self.edges
                .lock()
                .unwrap()
                .retain(|e| e.session_id != *id.as_uuid());
            Ok(())
        }

        async fn upsert_resources(&self, resources: &[DiscoveredResource]) -> DbResult<()> {
            *self.upsert_calls.lock().unwrap() += 1;
            let mut map = self.resources.lock().unwrap();
            for resource in resources {
                map.insert(resource.id.clone(), resource.clone());
            }
            Ok(())
        }

        async fn list_resources(&self, session_id: EntityId) -> DbResult<Vec<DiscoveredResource>> {
            let mut resources: Vec<DiscoveredResource> = self
                .resources
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.session_id == *session_id.as_uuid())
                .cloned()
                .collect();
            resources.sort_by(|a, b| {
                (a.dependency_level, &a.azure_id).cmp(&(b.dependency_level, &b.azure_id))
            });
            Ok(resources)
        }

        async fn apply_levels(
            &self,
            _session_id: EntityId,
            levels: &[(String, i32)],
        ) -> DbResult<()> {
            let mut resources = self.resources.lock().unwrap();
            for (id, level) in levels {
                if let Some(resource) = resources.get_mut(id) {
                    resource.dependency_level = *level;
                    resource.status = ResourceStatus::Analyzed.to_string();
                }
            }
            Ok(())
        }

        async fn set_group_resource_status(
            &self,
            session_id: EntityId,
            resource_group: &str,
            status: ResourceStatus,
        ) -> DbResult<()> {
            let mut resources = self.resources.lock().unwrap();
            for resource in resources.values_mut() {
                if resource.session_id == *session_id.as_uuid()
                    && resource.resource_group == resource_group
                {
                    resource.status = status.to_string();
                }
            }
            Ok(())
        }

        async fn insert_edges(&self, edges: &[ResourceEdge]) -> DbResult<u64> {
            let mut stored = self.edges.lock().unwrap();
            let mut inserted = 0;
            for edge in edges {
                let duplicate = stored.iter().any(|e| {
                    e.source_id.eq_ignore_ascii_case(&edge.source_id)
                        && e.target_id.eq_ignore_ascii_case(&edge.target_id)
                });
                if !duplicate {
                    stored.push(edge.clone());
                    inserted += 1;
                }
            }
            Ok(inserted)
        }

        async fn list_edges(&self, session_id: EntityId) -> DbResult<Vec<ResourceEdge>> {
            Ok(self
                .edges
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.session_id == *session_id.as_uuid())
                .cloned()
                .collect())
        }
    }

    fn record(rg: &str, full_type: &str, name: &str, properties: serde_json::Value) -> ResourceRecord {
        let (provider, kind) = full_type.split_once('/').unwrap();
        ResourceRecord {
            id: format!(
                "/subscriptions/sub-src/resourceGroups/{}/providers/{}/{}/{}",
                rg, provider, kind, name
            ),
            name: name.to_string(),
            resource_type: full_type.to_string(),
            resource_group: rg.to_string(),
            subscription_id: "sub-src".to_string(),
            location: "eastus".to_string(),
            kind: None,
            sku: None,
            identity: None,
            plan: None,
            properties,
            tags: serde_json::Value::Null,
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            resource_graph_delay_ms: 0,
            retry_delay_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn engine(client: MockCloud, repo: Arc<MemoryRepo>) -> DiscoveryEngine {
        DiscoveryEngine::new(Arc::new(client), repo, test_config())
    }

    async fn started_session(engine: &DiscoveryEngine) -> DiscoverySession {
        engine
            .start(StartDiscoveryRequest {
                name: "test".into(),
                connection_id: EntityId::new(),
                source_subscription_id: "sub-src".into(),
                target_subscription_id: "sub-dst".into(),
                filters: QueryFilters::default(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pagination_persists_every_resource_in_batches() {
        // 2500 resources over three pages: 1000 + 1000 + 500.
        let mut pages = Vec::new();
        let mut n = 0;
        for (index, size) in [(0usize, 1000usize), (1, 1000), (2, 500)] {
            let resources = (0..size)
                .map(|_| {
                    n += 1;
                    record(
                        "rg-bulk",
                        "Microsoft.Storage/storageAccounts",
                        &format!("account{:04}", n),
                        serde_json::Value::Null,
                    )
                })
                .collect();
            pages.push(ResourcePage {
                resources,
                continuation: if index < 2 {
                    Some((index + 1).to_string())
                } else {
                    None
                },
            });
        }

        let repo = Arc::new(MemoryRepo::default());
        let engine = engine(MockCloud::with_pages(pages), repo.clone());
        let session = started_session(&engine).await;
        let session_id = EntityId::from_uuid(session.id);

        engine.run(session_id).await.unwrap();

        let session = engine.get(session_id).await.unwrap();
        assert_eq!(session.status, "Completed");
        assert_eq!(session.total_discovered, 2500);
        assert_eq!(session.processed, 2500);

        let resources = repo.list_resources(session_id).await.unwrap();
        assert_eq!(resources.len(), 2500);
        // 2500 resources at the default batch size of 50 is exactly 50
        // persistence transactions.
        assert_eq!(*repo.upsert_calls.lock().unwrap(), 50);
    }

    #[tokio::test]
    async fn vnet_and_nic_produce_edge_and_levels() {
        let vnet = record(
            "rg-a",
            "Microsoft.Network/virtualNetworks",
            "vnet-a",
            serde_json::json!({"addressSpace": {"addressPrefixes": ["10.0.0.0/16"]}}),
        );
        let nic = record(
            "rg-a",
            "Microsoft.Network/networkInterfaces",
            "nic-a",
            serde_json::json!({
                "ipConfigurations": [{
                    "properties": {"subnet": {"id": format!("{}/subnets/s0", vnet.id)}}
                }]
            }),
        );
        let vnet_azure_id = vnet.id.clone();
        let nic_azure_id = nic.id.clone();

        let repo = Arc::new(MemoryRepo::default());
        let engine = engine(
            MockCloud::with_pages(vec![ResourcePage {
                resources: vec![vnet, nic],
                continuation: None,
            }]),
            repo.clone(),
        );
        let session = started_session(&engine).await;
        let session_id = EntityId::from_uuid(session.id);

        engine.run(session_id).await.unwrap();

        let edges = repo.list_edges(session_id).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].source_id.ends_with(&nic_azure_id));
        assert!(edges[0].target_id.ends_with(&vnet_azure_id));
        assert_eq!(edges[0].edge_type, "Network");

        let resources = repo.list_resources(session_id).await.unwrap();
        let level_of = |azure_id: &str| {
            resources
                .iter()
                .find(|r| r.azure_id == azure_id)
                .unwrap()
                .dependency_level
        };
        assert_eq!(level_of(&vnet_azure_id), 0);
        assert_eq!(level_of(&nic_azure_id), 1);
        assert!(resources.iter().all(|r| r.status == "Analyzed"));
    }

    #[tokio::test]
    async fn peered_vnets_level_finitely() {
        let make_vnet = |name: &str, remote: &str| {
            record(
                "rg-a",
                "Microsoft.Network/virtualNetworks",
                name,
                serde_json::json!({
                    "virtualNetworkPeerings": [{
                        "properties": {"remoteVirtualNetwork": {
                            "id": format!("/subscriptions/sub-src/resourceGroups/rg-a/providers/Microsoft.Network/virtualNetworks/{}", remote)
                        }}
                    }]
                }),
            )
        };
        let repo = Arc::new(MemoryRepo::default());
        let engine = engine(
            MockCloud::with_pages(vec![ResourcePage {
                resources: vec![make_vnet("v1", "v2"), make_vnet("v2", "v1")],
                continuation: None,
            }]),
            repo.clone(),
        );
        let session = started_session(&engine).await;
        let session_id = EntityId::from_uuid(session.id);

        engine.run(session_id).await.unwrap();

        let edges = repo.list_edges(session_id).await.unwrap();
        assert_eq!(edges.len(), 2);
        let resources = repo.list_resources(session_id).await.unwrap();
        assert!(resources.iter().all(|r| r.dependency_level >= 0));
        assert_eq!(
            engine.get(session_id).await.unwrap().status,
            "Completed"
        );
    }

    #[tokio::test]
    async fn auth_failure_marks_session_failed() {
        let mut client = MockCloud::with_pages(vec![]);
        client.query_error = Some(CloudError::new(
            CloudErrorKind::Auth,
            "AuthorizationFailed",
            "the client does not have authorization",
        ));

        let repo = Arc::new(MemoryRepo::default());
        let engine = engine(client, repo);
        let session = started_session(&engine).await;
        let session_id = EntityId::from_uuid(session.id);

        let result = engine.run(session_id).await;
        assert!(result.is_err());

        let session = engine.get(session_id).await.unwrap();
        assert_eq!(session.status, "Failed");
        assert!(
            session
                .error_message
                .unwrap()
                .contains("does not have authorization")
        );
    }

    #[tokio::test]
    async fn api_version_lookup_failure_does_not_abort() {
        let mut client = MockCloud::with_pages(vec![ResourcePage {
            resources: vec![record(
                "rg-a",
                "Microsoft.Storage/storageAccounts",
                "stg01",
                serde_json::Value::Null,
            )],
            continuation: None,
        }]);
        client.api_version_error = true;

        let repo = Arc::new(MemoryRepo::default());
        let engine = engine(client, repo.clone());
        let session = started_session(&engine).await;
        let session_id = EntityId::from_uuid(session.id);

        engine.run(session_id).await.unwrap();

        let resources = repo.list_resources(session_id).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].api_version, None);
        assert_eq!(engine.get(session_id).await.unwrap().status, "Completed");
    }

    #[tokio::test]
    async fn api_versions_enrich_resources() {
        let mut client = MockCloud::with_pages(vec![ResourcePage {
            resources: vec![record(
                "rg-a",
                "Microsoft.Storage/storageAccounts",
                "stg01",
                serde_json::Value::Null,
            )],
            continuation: None,
        }]);
        client.api_versions.insert(
            "microsoft.storage/storageaccounts".into(),
            "2023-01-01".into(),
        );

        let repo = Arc::new(MemoryRepo::default());
        let engine = engine(client, repo.clone());
        let session = started_session(&engine).await;
        let session_id = EntityId::from_uuid(session.id);

        engine.run(session_id).await.unwrap();

        let resources = repo.list_resources(session_id).await.unwrap();
        assert_eq!(resources[0].api_version.as_deref(), Some("2023-01-01"));
    }

    #[tokio::test]
    async fn rerunning_a_completed_session_is_a_noop() {
        let repo = Arc::new(MemoryRepo::default());
        let engine = engine(
            MockCloud::with_pages(vec![ResourcePage::default()]),
            repo.clone(),
        );
        let session = started_session(&engine).await;
        let session_id = EntityId::from_uuid(session.id);

        engine.run(session_id).await.unwrap();
        let calls_after_first = *repo.upsert_calls.lock().unwrap();

        engine.run(session_id).await.unwrap();
        assert_eq!(*repo.upsert_calls.lock().unwrap(), calls_after_first);
    }

    #[tokio::test]
    async fn cancelled_session_is_not_rerun() {
        let repo = Arc::new(MemoryRepo::default());
        let engine = engine(
            MockCloud::with_pages(vec![ResourcePage::default()]),
            repo.clone(),
        );
        let session = started_session(&engine).await;
        let session_id = EntityId::from_uuid(session.id);

        engine.cancel(session_id).await.unwrap();
        engine.run(session_id).await.unwrap();

        let session = engine.get(session_id).await.unwrap();
        assert_eq!(session.status, "Cancelled");
        assert_eq!(session.total_discovered, 0);

        // Cancelling a terminal session is an invalid state transition.
        assert!(matches!(
            engine.cancel(session_id).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn existing_discovery_returns_latest_completed() {
        let repo = Arc::new(MemoryRepo::default());
        let engine = engine(
            MockCloud::with_pages(vec![ResourcePage::default()]),
            repo.clone(),
        );
        let connection_id = EntityId::new();

        assert!(
            engine
                .existing_discovery(connection_id)
                .await
                .unwrap()
                .is_none()
        );

        let session = engine
            .start(StartDiscoveryRequest {
                name: "snapshot".into(),
                connection_id,
                source_subscription_id: "sub-src".into(),
                target_subscription_id: "sub-dst".into(),
                filters: QueryFilters::default(),
            })
            .await
            .unwrap();
        engine.run(EntityId::from_uuid(session.id)).await.unwrap();

        let existing = engine.existing_discovery(connection_id).await.unwrap();
        assert_eq!(existing.unwrap().id, session.id);
    }
}
