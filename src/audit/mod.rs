use chrono::{DateTime, Utc};
use serde::Serialize;

/// What an operator (or the API on their behalf) did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    DeviceRegistered,
    DeviceUpdated,
    DeviceDeactivated,
    DeviceStateSet,
    CommandIssued,
    CommandCancelled,
    ContentRegistered,
    ContentAssigned,
    SyncRetried,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub actor: String,
    pub action: AuditAction,
    pub device_id: Option<String>,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Fire-and-forget audit trail. Implementations must not block the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            target: "audit",
            actor = %event.actor,
            action = ?event.action,
            device = event.device_id.as_deref().unwrap_or("-"),
            detail = %event.detail,
            "audit"
        );
    }
}

#[cfg(test)]
pub use memory::MemoryAuditSink;

#[cfg(test)]
mod memory {
    use super::{AuditAction, AuditEvent, AuditSink};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryAuditSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl MemoryAuditSink {
        pub fn actions(&self) -> Vec<AuditAction> {
            self.events.lock().unwrap().iter().map(|e| e.action).collect()
        }
    }

    impl AuditSink for MemoryAuditSink {
        fn record(&self, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
