//! Workers that drain the workflow queues.

use std::sync::Arc;
use std::time::Duration;

use azclone_config::EngineConfig;
use azclone_core::EntityId;
use azclone_db::{DbResult, DeploymentRepo};
use azclone_deploy::DeploymentEngine;
use azclone_discovery::DiscoveryEngine;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::handlers::{
    DeploymentResultHandler, DiscoveryHandler, MessageHandler, TemplateCreatedHandler,
    TemplateDeploymentHandler, TemplateValidationHandler, is_parse_failure, log_handler_error,
};
use crate::queue::WorkflowQueue;

const IDLE_POLL: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// A worker that claims and handles messages from one queue.
pub struct Worker {
    id: String,
    queue: Arc<dyn WorkflowQueue>,
    handler: Arc<dyn MessageHandler>,
    max_attempts: i32,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn WorkflowQueue>,
        handler: Arc<dyn MessageHandler>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            handler,
            max_attempts: config.retry_attempts as i32,
        }
    }

    /// Run the worker loop.
    pub async fn run(&self) {
        info!(worker_id = %self.id, queue = self.handler.queue(), "Starting worker");
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(IDLE_POLL).await,
                Err(err) => {
                    warn!(worker_id = %self.id, error = %err, "Queue access failed");
                    sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Claim and process at most one message. Returns whether one was
    /// processed. Success completes the message; a handler error abandons it
    /// for redelivery, except payloads that can never parse, which are
    /// dropped.
    pub async fn tick(&self) -> DbResult<bool> {
        let Some(message) = self.queue.claim(self.handler.queue(), &self.id).await? else {
            return Ok(false);
        };

        match self.handler.handle(&message.payload).await {
            Ok(()) => self.queue.complete(message.id).await?,
            Err(err) if is_parse_failure(&err) => {
                warn!(
                    queue = self.handler.queue(),
                    message_id = %message.id,
                    error = %err,
                    "Dropping unparseable message"
                );
                self.queue.complete(message.id).await?;
            }
            Err(err) => {
                log_handler_error(
                    self.handler.queue(),
                    EntityId::from_uuid(message.id),
                    &err,
                );
                self.queue.abandon(message.id, self.max_attempts).await?;
            }
        }
        Ok(true)
    }
}

/// Owns the five workflow handlers and spawns their workers.
pub struct Broker {
    queue: Arc<dyn WorkflowQueue>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    config: EngineConfig,
}

impl Broker {
    pub fn new(
        queue: Arc<dyn WorkflowQueue>,
        discovery_engine: Arc<DiscoveryEngine>,
        deployment_engine: Arc<DeploymentEngine>,
        deployment_repo: Arc<dyn DeploymentRepo>,
        config: EngineConfig,
    ) -> Self {
        let handlers: Vec<Arc<dyn MessageHandler>> = vec![
            Arc::new(DiscoveryHandler {
                engine: discovery_engine,
            }),
            Arc::new(TemplateCreatedHandler {
                engine: deployment_engine.clone(),
                queue: queue.clone(),
            }),
            Arc::new(TemplateValidationHandler {
                repo: deployment_repo.clone(),
                queue: queue.clone(),
            }),
            Arc::new(TemplateDeploymentHandler {
                engine: deployment_engine,
                queue: queue.clone(),
            }),
            Arc::new(DeploymentResultHandler {
                repo: deployment_repo,
            }),
        ];
        Self {
            queue,
            handlers,
            config,
        }
    }

    /// Spawn the worker pool: the concurrency cap is spread across the
    /// queues, with at least one worker each.
    pub fn spawn(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let per_queue = (self.config.max_concurrent_operations / self.handlers.len()).max(1);
        let mut tasks = Vec::new();
        for handler in &self.handlers {
            for index in 0..per_queue {
                let worker = Worker::new(
                    format!("{}-{}", handler.queue(), index),
                    self.queue.clone(),
                    handler.clone(),
                    &self.config,
                );
                tasks.push(tokio::spawn(async move { worker.run().await }));
            }
        }
        tasks
    }
}
