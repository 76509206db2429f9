//! Message-driven deployment workflow.
//!
//! Five durable queues carry a template from created through validated and
//! deployed to its session-level result. Messages are claimed with
//! `SKIP LOCKED`, completed on success, and released for redelivery on
//! failure, so handlers are written to be idempotent.

pub mod handlers;
pub mod messages;
pub mod queue;
#[cfg(test)]
pub(crate) mod testing;
pub mod worker;

pub use handlers::MessageHandler;
pub use queue::{PgWorkflowQueue, QueuedMessage, WorkflowQueue};
pub use worker::{Broker, Worker};
