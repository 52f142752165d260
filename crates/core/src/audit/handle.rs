use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::AuditEvent;

/// An event stamped with the moment it was emitted, not the moment the
/// writer gets to it.
#[derive(Debug, Clone)]
pub struct AuditEventEnvelope {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
}

/// Sending side of the audit channel. Clone one into every component that
/// records history (identity manager, scheduler, engine, server).
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditEventEnvelope>,
}

impl AuditHandle {
    pub fn new(tx: mpsc::Sender<AuditEventEnvelope>) -> Self {
        Self { tx }
    }

    /// Queue an event for the writer. Waits for channel capacity; a closed
    /// channel is logged and otherwise ignored so auditing never fails a
    /// transfer or an identity operation.
    pub async fn emit(&self, event: AuditEvent) {
        let event_type = event.event_type();
        let envelope = AuditEventEnvelope {
            timestamp: Utc::now(),
            event,
        };
        if self.tx.send(envelope).await.is_err() {
            tracing::error!(event_type, "Audit writer is gone, dropping event");
        }
    }
}
