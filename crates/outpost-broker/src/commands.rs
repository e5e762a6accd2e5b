//! Per-node command queue.
//!
//! Commands are delivered oldest first, one per poll. Delivery is a
//! conditional `pending -> sent` flip; a poll that loses the flip to a
//! concurrent poll returns nothing and does not retry.

use tracing::{debug, info};

use outpost_core::SharedClock;

use crate::audit::{AuditCategory, AuditEntry, AuditLog};
use crate::error::{BrokerError, Result};
use crate::storage::{BrokerDatabase, Command, CommandStatus};
use crate::telemetry::{self, Event};

/// Upper bound on a queued command payload.
pub const MAX_COMMAND_LEN: usize = 64 * 1024;

#[derive(Clone)]
pub struct CommandQueue {
    db: BrokerDatabase,
    clock: SharedClock,
    audit: AuditLog,
}

impl CommandQueue {
    pub fn new(db: BrokerDatabase, clock: SharedClock, audit: AuditLog) -> Self {
        Self { db, clock, audit }
    }

    /// Queue a command for a node.
    pub async fn enqueue(&self, node_id: i64, payload: &str) -> Result<Command> {
        if payload.trim().is_empty() {
            return Err(BrokerError::Validation("command must not be empty".into()));
        }
        if payload.len() > MAX_COMMAND_LEN {
            return Err(BrokerError::Validation(format!(
                "command exceeds {MAX_COMMAND_LEN} bytes"
            )));
        }
        if !self.db.node_exists(node_id).await? {
            return Err(BrokerError::NotFound(format!("Node {node_id}")));
        }

        let command = self
            .db
            .insert_command(node_id, payload, self.clock.now())
            .await?;
        info!(node_id, command_id = command.id, "Command queued");
        self.audit
            .record(
                AuditEntry::new(AuditCategory::Command, format!("Command {} queued", command.id))
                    .with_node(node_id),
            )
            .await;
        Ok(command)
    }

    /// Hand the oldest pending command to the polling node, if any.
    pub async fn poll_next_command(&self, node_id: i64) -> Result<Option<Command>> {
        let Some(mut command) = self.db.oldest_pending_command(node_id).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        if !self.db.mark_command_sent(command.id, now).await? {
            debug!(node_id, command_id = command.id, "Lost command delivery race");
            return Ok(None);
        }

        command.status = CommandStatus::Sent;
        command.sent_at = Some(now);
        telemetry::count(Event::CommandDelivered, 1);
        info!(node_id, command_id = command.id, "Command delivered");
        Ok(Some(command))
    }

    /// Record the outcome of a delivered command.
    pub async fn report_result(
        &self,
        node_id: i64,
        command_id: i64,
        success: bool,
        output: Option<&str>,
    ) -> Result<Command> {
        let command = self.db.get_command(command_id).await?;
        if command.node_id != node_id {
            return Err(BrokerError::NotFound(format!("Command {command_id}")));
        }

        let status = if success {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };
        let finished = self
            .db
            .finish_command(command_id, node_id, status, output, self.clock.now())
            .await?;
        if !finished {
            return Err(BrokerError::Conflict(format!(
                "Command {command_id} is {}, not sent",
                command.status
            )));
        }

        info!(node_id, command_id, %status, "Command finished");
        self.audit
            .record(
                AuditEntry::new(AuditCategory::Command, format!("Command {command_id} {status}"))
                    .with_node(node_id),
            )
            .await;
        Ok(self.db.get_command(command_id).await?)
    }
}
