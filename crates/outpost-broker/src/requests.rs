//! Proxy job queue.
//!
//! The broker records jobs and tracks their status; the network call itself
//! is carried out by a worker going through the node's tunnel. Rows move
//! `pending -> processing -> completed | failed`, or to `timeout` via the
//! reaper, and never leave a terminal status.

use serde_json::Value;
use tracing::{debug, info};

use outpost_core::SharedClock;

use crate::audit::{AuditCategory, AuditEntry, AuditLog};
use crate::error::{BrokerError, Result};
use crate::storage::{BrokerDatabase, ProxyRequest, RequestStatus};

#[derive(Clone)]
pub struct RequestBroker {
    db: BrokerDatabase,
    clock: SharedClock,
    audit: AuditLog,
}

impl RequestBroker {
    pub fn new(db: BrokerDatabase, clock: SharedClock, audit: AuditLog) -> Self {
        Self { db, clock, audit }
    }

    /// Queue a job against a tunnel port of the node.
    ///
    /// The tunnel need not be up yet. A job whose tunnel never establishes is
    /// left to the reaper.
    pub async fn enqueue(
        &self,
        node_id: i64,
        tunnel_port: i64,
        action: Option<&Value>,
    ) -> Result<ProxyRequest> {
        if !(1..=i64::from(u16::MAX)).contains(&tunnel_port) {
            return Err(BrokerError::Validation(format!(
                "tunnel_port {tunnel_port} is not a valid port"
            )));
        }
        if !self.db.node_exists(node_id).await? {
            return Err(BrokerError::NotFound(format!("Node {node_id}")));
        }

        let now = self.clock.now();
        let action = action.map(Value::to_string);
        let request = self
            .db
            .insert_request(node_id, tunnel_port, action.as_deref(), now)
            .await?;
        info!(request_id = request.id, node_id, tunnel_port, "Proxy request queued");
        self.audit
            .record(
                AuditEntry::new(AuditCategory::Proxy, format!("Request {} queued", request.id))
                    .with_node(node_id)
                    .with_details(serde_json::json!({ "port": tunnel_port })),
            )
            .await;
        Ok(request)
    }

    pub async fn get_status(&self, request_id: i64) -> Result<ProxyRequest> {
        Ok(self.db.get_request(request_id).await?)
    }

    /// Claim the oldest pending job, optionally for one node only.
    pub async fn claim_next(&self, node_id: Option<i64>) -> Result<Option<ProxyRequest>> {
        let Some(request) = self.db.oldest_pending_request(node_id).await? else {
            return Ok(None);
        };
        let claimed = self
            .db
            .transition_request(
                request.id,
                RequestStatus::Pending,
                RequestStatus::Processing,
                None,
                self.clock.now(),
            )
            .await?;
        if !claimed {
            debug!(request_id = request.id, "Lost proxy request claim race");
            return Ok(None);
        }
        info!(request_id = request.id, node_id = request.node_id, "Proxy request claimed");
        Ok(Some(self.db.get_request(request.id).await?))
    }

    /// Finish a processing job.
    pub async fn complete(
        &self,
        request_id: i64,
        success: bool,
        result: Option<&str>,
    ) -> Result<ProxyRequest> {
        let request = self.db.get_request(request_id).await?;
        let to = if success {
            RequestStatus::Completed
        } else {
            RequestStatus::Failed
        };
        let finished = self
            .db
            .transition_request(
                request_id,
                RequestStatus::Processing,
                to,
                result,
                self.clock.now(),
            )
            .await?;
        if !finished {
            return Err(BrokerError::Conflict(format!(
                "Request {request_id} is {}, not processing",
                request.status
            )));
        }

        info!(request_id, status = %to, "Proxy request finished");
        self.audit
            .record(
                AuditEntry::new(AuditCategory::Proxy, format!("Request {request_id} {to}"))
                    .with_node(request.node_id),
            )
            .await;
        Ok(self.db.get_request(request_id).await?)
    }
}
