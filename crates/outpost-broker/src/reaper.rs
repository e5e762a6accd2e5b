//! Periodic sweep that force-terminates abandoned work.
//!
//! Every transition is conditional on the row's prior status, so overlapping
//! sweeps and concurrent claims settle each row exactly once.

use std::time::Duration;

use tracing::{info, warn};

use outpost_core::SharedClock;
use outpost_core::config::ReaperConfig;

use crate::audit::{AuditCategory, AuditEntry, AuditLog};
use crate::error::Result;
use crate::storage::{BrokerDatabase, ProxyRequest};
use crate::telemetry::{self, Event};
use crate::tunnel::record_expired;

/// Counts of rows moved by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out_requests: usize,
    pub expired_tunnels: usize,
    pub offline_nodes: usize,
}

impl SweepReport {
    pub const fn is_empty(&self) -> bool {
        self.timed_out_requests == 0 && self.expired_tunnels == 0 && self.offline_nodes == 0
    }
}

#[derive(Clone)]
pub struct Reaper {
    db: BrokerDatabase,
    clock: SharedClock,
    audit: AuditLog,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(
        db: BrokerDatabase,
        clock: SharedClock,
        audit: AuditLog,
        config: ReaperConfig,
    ) -> Self {
        Self {
            db,
            clock,
            audit,
            config,
        }
    }

    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs)
    }

    /// Run one sweep over proxy jobs, tunnel sessions and node liveness.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        Ok(SweepReport {
            timed_out_requests: self.timeout_requests(now).await?,
            expired_tunnels: self.expire_tunnels(now).await?,
            offline_nodes: self.mark_offline_nodes(now).await?,
        })
    }

    /// Sweep forever on the configured cadence. The first sweep runs one
    /// interval after start.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval());
        interval.tick().await;
        loop {
            interval.tick().await;
            match self.sweep().await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        timed_out_requests = report.timed_out_requests,
                        expired_tunnels = report.expired_tunnels,
                        offline_nodes = report.offline_nodes,
                        "Reaper sweep completed"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Reaper sweep failed");
                }
                _ => {}
            }
        }
    }

    async fn timeout_requests(&self, now: i64) -> Result<usize> {
        let cutoff = now - self.config.request_timeout_secs;
        let mut count = 0;
        for request in self.db.stale_requests(cutoff).await? {
            if self.time_out(&request, now).await? {
                count += 1;
            }
        }
        if count > 0 {
            telemetry::count(Event::ProxyJobTimedOut, count as u64);
        }
        Ok(count)
    }

    /// Flip one scanned job to `timeout`. The status may have moved since the
    /// scan; any non-terminal status still qualifies.
    async fn time_out(&self, request: &ProxyRequest, now: i64) -> Result<bool> {
        let Some(prior) = self.db.time_out_request(request.id, now).await? else {
            return Ok(false);
        };

        let age_minutes = (now - request.created_at) / 60;
        info!(
            request_id = request.id,
            port = request.tunnel_port,
            prior = %prior,
            age_minutes,
            "Proxy request timed out"
        );
        self.audit
            .record(
                AuditEntry::new(
                    AuditCategory::Proxy,
                    format!("Request {} timed out", request.id),
                )
                .with_node(request.node_id)
                .with_details(serde_json::json!({
                    "request_id": request.id,
                    "port": request.tunnel_port,
                    "prior_status": prior.as_str(),
                    "age_minutes": age_minutes,
                })),
            )
            .await;
        Ok(true)
    }

    async fn expire_tunnels(&self, now: i64) -> Result<usize> {
        let expired = self.db.expire_tunnel_sessions(now).await?;
        record_expired(&self.audit, &expired).await;
        Ok(expired.len())
    }

    async fn mark_offline_nodes(&self, now: i64) -> Result<usize> {
        let intervals = self.config.offline_after_intervals;
        let mut count = 0;
        for node in self.db.overdue_online_nodes(now, intervals).await? {
            if !self.db.mark_node_offline(node.id, now, intervals).await? {
                continue;
            }
            count += 1;
            warn!(node_id = node.id, last_checkin = ?node.last_checkin, "Node offline");
            self.audit
                .record(
                    AuditEntry::new(AuditCategory::Node, format!("Node {} offline", node.id))
                        .with_node(node.id)
                        .with_details(serde_json::json!({ "last_checkin": node.last_checkin })),
                )
                .await;
        }
        Ok(count)
    }
}
