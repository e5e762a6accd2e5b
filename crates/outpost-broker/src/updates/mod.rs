//! Agent update scheduling and delivery.
//!
//! The most recently scheduled pending update wins. Handing it out flips it
//! `pending -> downloading`; the payload is resolved before that flip so a
//! missing or unreadable payload leaves the row untouched.

mod payload;

pub use payload::{PayloadError, PayloadInfo, PayloadStore};

use tracing::{debug, info};

use outpost_core::SharedClock;

use crate::audit::{AuditCategory, AuditEntry, AuditLog};
use crate::error::{BrokerError, Result};
use crate::storage::{AgentUpdate, BrokerDatabase, UpdateStatus};
use crate::telemetry::{self, Event};

/// Fixed contract sent with every offer.
pub const INSTALL_INSTRUCTIONS: &str = "Persist the payload to disk and execute it. \
     The executed payload replaces the running agent and restarts it.";

const MAX_VERSION_LEN: usize = 64;

/// An update handed to a polling node.
#[derive(Debug, Clone)]
pub struct UpdateOffer {
    pub update_id: i64,
    pub target_version: String,
    pub payload_ref: String,
    pub payload: PayloadInfo,
    pub instructions: &'static str,
}

/// Result of an update poll. `current_version` echoes what the node reported.
#[derive(Debug, Clone)]
pub struct UpdatePoll {
    pub current_version: String,
    pub offer: Option<UpdateOffer>,
}

#[derive(Clone)]
pub struct UpdateController {
    db: BrokerDatabase,
    clock: SharedClock,
    audit: AuditLog,
    payloads: PayloadStore,
}

impl UpdateController {
    pub fn new(
        db: BrokerDatabase,
        clock: SharedClock,
        audit: AuditLog,
        payloads: PayloadStore,
    ) -> Self {
        Self {
            db,
            clock,
            audit,
            payloads,
        }
    }

    /// Schedule `version` for a node.
    pub async fn schedule(
        &self,
        node_id: i64,
        version: &str,
        payload_ref: &str,
    ) -> Result<AgentUpdate> {
        let version = version.trim();
        if version.is_empty() || version.len() > MAX_VERSION_LEN {
            return Err(BrokerError::Validation(format!(
                "version must be 1-{MAX_VERSION_LEN} characters"
            )));
        }
        PayloadStore::validate_ref(payload_ref)
            .map_err(|e| BrokerError::Validation(e.to_string()))?;
        if !self.db.node_exists(node_id).await? {
            return Err(BrokerError::NotFound(format!("Node {node_id}")));
        }

        let update = self
            .db
            .insert_update(node_id, version, payload_ref, self.clock.now())
            .await?;
        info!(node_id, update_id = update.id, version, "Update scheduled");
        self.audit
            .record(
                AuditEntry::new(AuditCategory::Update, format!("Update {} scheduled", update.id))
                    .with_node(node_id)
                    .with_details(serde_json::json!({
                        "version": version,
                        "payload_ref": payload_ref,
                    })),
            )
            .await;
        Ok(update)
    }

    /// Offer the newest pending update to a polling node.
    ///
    /// `reported_version` is echoed back and never gates the decision.
    pub async fn poll_next_update(&self, node_id: i64, reported_version: &str) -> Result<UpdatePoll> {
        let current_version = reported_version.to_string();
        let Some(update) = self.db.latest_pending_update(node_id).await? else {
            return Ok(UpdatePoll {
                current_version,
                offer: None,
            });
        };

        let payload = self.payloads.describe(&update.payload_ref).await?;

        if !self
            .db
            .mark_update_downloading(update.id, self.clock.now())
            .await?
        {
            debug!(node_id, update_id = update.id, "Lost update claim race");
            return Ok(UpdatePoll {
                current_version,
                offer: None,
            });
        }

        telemetry::count(Event::UpdateClaimed, 1);
        info!(
            node_id,
            update_id = update.id,
            from = %current_version,
            to = %update.version,
            "Update offered"
        );

        Ok(UpdatePoll {
            current_version,
            offer: Some(UpdateOffer {
                update_id: update.id,
                target_version: update.version,
                payload_ref: update.payload_ref,
                payload,
                instructions: INSTALL_INSTRUCTIONS,
            }),
        })
    }

    /// Close a downloading update as installed or failed.
    pub async fn report_status(
        &self,
        node_id: i64,
        update_id: i64,
        status: UpdateStatus,
    ) -> Result<AgentUpdate> {
        if !matches!(status, UpdateStatus::Installed | UpdateStatus::Failed) {
            return Err(BrokerError::Validation(
                "status must be installed or failed".into(),
            ));
        }
        let update = self.db.get_update(update_id).await?;
        if update.node_id != node_id {
            return Err(BrokerError::NotFound(format!("Update {update_id}")));
        }

        if !self
            .db
            .finish_update(update_id, node_id, status, self.clock.now())
            .await?
        {
            return Err(BrokerError::Conflict(format!(
                "Update {update_id} is {}, not downloading",
                update.status
            )));
        }

        info!(node_id, update_id, %status, version = %update.version, "Update finished");
        self.audit
            .record(
                AuditEntry::new(AuditCategory::Update, format!("Update {update_id} {status}"))
                    .with_node(node_id),
            )
            .await;
        Ok(self.db.get_update(update_id).await?)
    }
}
