//! Audit trail for broker state changes.
//!
//! Audit writes are best effort: a failed insert is logged and dropped so it
//! never fails the operation that produced it.

use serde_json::Value;
use tracing::{info, warn};

use outpost_core::SharedClock;

use crate::storage::BrokerDatabase;

/// Audit categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditCategory {
    Proxy,
    Tunnel,
    Command,
    Update,
    Node,
    Enrollment,
}

impl AuditCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Tunnel => "tunnel",
            Self::Command => "command",
            Self::Update => "update",
            Self::Node => "node",
            Self::Enrollment => "enrollment",
        }
    }
}

/// One audit entry, built up before it is recorded.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub category: AuditCategory,
    pub message: String,
    pub node_id: Option<i64>,
    pub details: Option<Value>,
}

impl AuditEntry {
    pub fn new(category: AuditCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            node_id: None,
            details: None,
        }
    }

    #[must_use]
    pub const fn with_node(mut self, node_id: i64) -> Self {
        self.node_id = Some(node_id);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Writes audit entries to the `audit_log` table.
#[derive(Clone)]
pub struct AuditLog {
    db: BrokerDatabase,
    clock: SharedClock,
}

impl AuditLog {
    pub fn new(db: BrokerDatabase, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    pub async fn record(&self, entry: AuditEntry) {
        info!(
            category = entry.category.as_str(),
            node_id = ?entry.node_id,
            message = %entry.message,
            "Audit event"
        );

        let details = entry
            .details
            .as_ref()
            .map_or_else(|| "{}".to_string(), Value::to_string);

        if let Err(e) = self
            .db
            .insert_audit(
                entry.category.as_str(),
                &entry.message,
                &details,
                entry.node_id,
                self.clock.now(),
            )
            .await
        {
            warn!(error = %e, category = entry.category.as_str(), "Failed to write audit record");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use outpost_core::ManualClock;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn record_persists_details_and_timestamp() {
        let db = BrokerDatabase::open_in_memory().await.unwrap();
        let log = AuditLog::new(db.clone(), Arc::new(ManualClock::new(1_000)));

        log.record(
            AuditEntry::new(AuditCategory::Tunnel, "Session 3 expired")
                .with_details(json!({ "port": 20000 })),
        )
        .await;

        let rows = db.list_audit(Some("tunnel"), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].created_at, 1_000);
        let details: Value = serde_json::from_str(&rows[0].details).unwrap();
        assert_eq!(details["port"], 20000);
    }
}
