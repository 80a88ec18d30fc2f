//! Append-only activity log sink.

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::actor::ActorContext;

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEntry {
    pub actor_id: Uuid,
    pub action: String,
    pub description: String,
    pub subject_type: &'static str,
    pub subject_id: Uuid,
    pub metadata: serde_json::Value,
    pub ip: Option<IpAddr>,
    pub request_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        actor: &ActorContext,
        action: impl Into<String>,
        description: impl Into<String>,
        subject_type: &'static str,
        subject_id: Uuid,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            actor_id: actor.actor_id,
            action: action.into(),
            description: description.into(),
            subject_type,
            subject_id,
            metadata: serde_json::Value::Null,
            ip: actor.ip,
            request_id: actor.request_id.clone(),
            occurred_at,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Where activity entries go. Callers treat failures as non-fatal.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn record(&self, entry: ActivityEntry) -> anyhow::Result<()>;
}

/// Emits entries as structured `tracing` events on the `activity` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn record(&self, entry: ActivityEntry) -> anyhow::Result<()> {
        tracing::info!(
            target: "activity",
            actor_id = %entry.actor_id,
            action = %entry.action,
            subject_type = entry.subject_type,
            subject_id = %entry.subject_id,
            ip = ?entry.ip,
            request_id = ?entry.request_id,
            metadata = %entry.metadata,
            occurred_at = %entry.occurred_at,
            "{}",
            entry.description
        );
        Ok(())
    }
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn actions(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }
}

#[async_trait]
impl ActivityLog for MemoryActivityLog {
    async fn record(&self, entry: ActivityEntry) -> anyhow::Result<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}
