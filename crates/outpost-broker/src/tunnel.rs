//! Tunnel session manager.
//!
//! Each session holds one pool slot: a primary port and its `port + 1`
//! neighbour. A node holds at most one live session at a time.

use tracing::{info, warn};

use outpost_core::SharedClock;
use outpost_core::config::TunnelConfig;

use crate::audit::{AuditCategory, AuditEntry, AuditLog};
use crate::error::{BrokerError, Result};
use crate::storage::{AllocateTunnelParams, BrokerDatabase, TunnelAllocation, TunnelSession};
use crate::telemetry::{self, Event};

/// A node's current session and whether it has already run past its expiry.
#[derive(Debug, Clone)]
pub struct TunnelLease {
    pub session: TunnelSession,
    pub stale: bool,
}

#[derive(Clone)]
pub struct TunnelSessionManager {
    db: BrokerDatabase,
    clock: SharedClock,
    audit: AuditLog,
    config: TunnelConfig,
}

impl TunnelSessionManager {
    pub fn new(
        db: BrokerDatabase,
        clock: SharedClock,
        audit: AuditLog,
        config: TunnelConfig,
    ) -> Self {
        Self {
            db,
            clock,
            audit,
            config,
        }
    }

    /// Allocate a session for `node_id`. `ttl` defaults to the configured value.
    pub async fn open_session(&self, node_id: i64, ttl: Option<i64>) -> Result<TunnelSession> {
        let ttl = ttl.unwrap_or(self.config.default_ttl_secs);
        if ttl <= 0 || ttl > self.config.max_ttl_secs {
            return Err(BrokerError::Validation(format!(
                "ttl must be between 1 and {} seconds",
                self.config.max_ttl_secs
            )));
        }
        if !self.db.node_exists(node_id).await? {
            return Err(BrokerError::NotFound(format!("Node {node_id}")));
        }

        let now = self.clock.now();
        let params = AllocateTunnelParams {
            node_id,
            port_base: i64::from(self.config.port_base),
            last_port: i64::from(self.config.last_port()),
            now,
            expires_at: now + ttl,
        };
        let (outcome, expired) = self.db.allocate_tunnel_session(&params).await?;
        record_expired(&self.audit, &expired).await;

        match outcome {
            TunnelAllocation::Allocated(session) => {
                telemetry::count(Event::TunnelOpened, 1);
                info!(
                    node_id,
                    session_id = session.id,
                    port = session.port,
                    expires_at = session.expires_at,
                    "Tunnel session opened"
                );
                self.audit
                    .record(
                        AuditEntry::new(
                            AuditCategory::Tunnel,
                            format!("Session {} opened", session.id),
                        )
                        .with_node(node_id)
                        .with_details(serde_json::json!({
                            "port": session.port,
                            "secondary_port": session.secondary_port,
                            "expires_at": session.expires_at,
                        })),
                    )
                    .await;
                Ok(session)
            }
            TunnelAllocation::NodeBusy(existing) => Err(BrokerError::Conflict(format!(
                "Node {node_id} already holds tunnel session {}",
                existing.id
            ))),
            TunnelAllocation::Exhausted => {
                warn!(node_id, slots = self.config.slots, "Tunnel port pool exhausted");
                Err(BrokerError::AllocationExhausted)
            }
        }
    }

    /// The node's session still marked active, flagged stale if past expiry.
    ///
    /// Read-only: a stale session is reported, not expired.
    pub async fn get_active_session(&self, node_id: i64) -> Result<Option<TunnelLease>> {
        let now = self.clock.now();
        Ok(self
            .db
            .active_tunnel_session(node_id)
            .await?
            .map(|session| TunnelLease {
                stale: session.is_stale(now),
                session,
            }))
    }

    pub async fn close_session(&self, session_id: i64) -> Result<TunnelSession> {
        let session = self.db.get_tunnel_session(session_id).await?;
        if !self
            .db
            .close_tunnel_session(session_id, self.clock.now())
            .await?
        {
            return Err(BrokerError::Conflict(format!(
                "Tunnel session {session_id} is already {}",
                session.status
            )));
        }

        info!(session_id, node_id = session.node_id, "Tunnel session closed");
        self.audit
            .record(
                AuditEntry::new(AuditCategory::Tunnel, format!("Session {session_id} closed"))
                    .with_node(session.node_id),
            )
            .await;
        Ok(self.db.get_tunnel_session(session_id).await?)
    }
}

/// One audit record per session moved to `expired`.
pub(crate) async fn record_expired(audit: &AuditLog, sessions: &[TunnelSession]) {
    for session in sessions {
        info!(
            session_id = session.id,
            node_id = session.node_id,
            port = session.port,
            "Tunnel session expired"
        );
        audit
            .record(
                AuditEntry::new(AuditCategory::Tunnel, format!("Session {} expired", session.id))
                    .with_node(session.node_id)
                    .with_details(serde_json::json!({
                        "port": session.port,
                        "expires_at": session.expires_at,
                    })),
            )
            .await;
    }
}
