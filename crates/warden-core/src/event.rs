use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::CompanyId;

/// Outbox topics emitted by the runtime.
pub mod topics {
    pub const RUN_QUEUED: &str = "ops.run.queued";
    pub const RUN_APPROVED: &str = "ops.run.approved";
    pub const RUN_REJECTED: &str = "ops.run.rejected";
    pub const RUN_CANCELLED: &str = "ops.run.cancelled";
    pub const RUN_COMPLETED: &str = "ops.run.completed";
    pub const VERIFICATION_COMPLETED: &str = "ops.verification.completed";
    pub const ATTESTATION_RECORDED: &str = "ops.attestation.recorded";
}

/// An append-only fact for downstream consumers. Never mutated or deleted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub company_id: CompanyId,
    pub topic: String,
    /// Partition key, usually the run id.
    pub key: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(company_id: CompanyId, topic: &str, key: impl ToString, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            company_id,
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Anywhere outbox events can be appended to.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OutboxEvent) -> crate::Result<()>;
}

/// In-process outbox: an append-only log plus a broadcast feed for live subscribers.
#[derive(Clone)]
pub struct Outbox {
    log: Arc<RwLock<Vec<OutboxEvent>>>,
    sender: Arc<broadcast::Sender<OutboxEvent>>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            log: Arc::new(RwLock::new(Vec::new())),
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
        self.sender.subscribe()
    }

    /// Every event appended so far, oldest first.
    pub fn events(&self) -> Vec<OutboxEvent> {
        self.log.read().clone()
    }

    pub fn events_for(&self, topic: &str) -> Vec<OutboxEvent> {
        self.log
            .read()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }
}

impl EventSink for Outbox {
    fn emit(&self, event: OutboxEvent) -> crate::Result<()> {
        self.log.write().push(event.clone());
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(1024)
    }
}
