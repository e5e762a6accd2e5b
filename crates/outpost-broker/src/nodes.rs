//! Node identity: per-node credentials, checkins and lookups.

use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use outpost_core::SharedClock;

use crate::audit::{AuditCategory, AuditEntry, AuditLog};
use crate::error::{BrokerError, Result};
use crate::storage::{BrokerDatabase, CheckinParams, Node, NodeStatus};

const SECRET_BYTES: usize = 32;

/// Generate a random secret: 32 bytes from the OS RNG, hex-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 hex digest of a secret. Only digests are ever stored.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// What a node reports on checkin. Absent fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct CheckinReport {
    pub lan_ip: Option<String>,
    pub wan_ip: Option<String>,
    pub agent_version: Option<String>,
}

/// Directory of enrolled nodes.
#[derive(Clone)]
pub struct NodeDirectory {
    db: BrokerDatabase,
    clock: SharedClock,
    audit: AuditLog,
}

impl NodeDirectory {
    pub fn new(db: BrokerDatabase, clock: SharedClock, audit: AuditLog) -> Self {
        Self { db, clock, audit }
    }

    /// Resolve a bearer credential to its node.
    pub async fn authenticate(&self, secret: &str) -> Result<Node> {
        if secret.is_empty() {
            return Err(BrokerError::Unauthorized);
        }
        self.db
            .find_node_by_credential(&hash_secret(secret))
            .await?
            .ok_or(BrokerError::Unauthorized)
    }

    /// Issue a fresh credential. The previous one stops working immediately.
    pub async fn rotate_credential(&self, node_id: i64) -> Result<String> {
        let secret = generate_secret();
        if !self.db.set_node_credential(node_id, &hash_secret(&secret)).await? {
            return Err(BrokerError::NotFound(format!("Node {node_id}")));
        }
        info!(node_id, "Node credential rotated");
        self.audit
            .record(AuditEntry::new(AuditCategory::Node, "Credential rotated").with_node(node_id))
            .await;
        Ok(secret)
    }

    /// Record a checkin and mark the node online.
    pub async fn checkin(&self, node_id: i64, report: &CheckinReport) -> Result<Node> {
        let previous = self.db.get_node(node_id).await?;
        let params = CheckinParams {
            lan_ip: non_empty(report.lan_ip.as_deref()),
            wan_ip: non_empty(report.wan_ip.as_deref()),
            agent_version: non_empty(report.agent_version.as_deref()),
        };
        let node = self
            .db
            .record_checkin(node_id, &params, self.clock.now())
            .await?;

        if previous.status == NodeStatus::Online {
            debug!(node_id, "Node checked in");
        } else {
            info!(node_id, from = %previous.status, "Node online");
            self.audit
                .record(
                    AuditEntry::new(AuditCategory::Node, format!("Node {node_id} online"))
                        .with_node(node_id),
                )
                .await;
        }
        Ok(node)
    }

    pub async fn get(&self, node_id: i64) -> Result<Node> {
        Ok(self.db.get_node(node_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Node>> {
        Ok(self.db.list_nodes().await?)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
