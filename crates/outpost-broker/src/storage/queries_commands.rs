//! Command queue queries.

use super::db::{BrokerDatabase, DatabaseError};
use super::models::{Command, CommandStatus};

impl BrokerDatabase {
    /// Queue a command for a node.
    pub async fn insert_command(
        &self,
        node_id: i64,
        command: &str,
        now: i64,
    ) -> Result<Command, DatabaseError> {
        let row = sqlx::query_as::<_, Command>(
            "INSERT INTO commands (node_id, command, status, created_at) VALUES (?, ?, ?, ?) RETURNING *",
        )
        .bind(node_id)
        .bind(command)
        .bind(CommandStatus::Pending)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    /// Get a command by ID.
    pub async fn get_command(&self, id: i64) -> Result<Command, DatabaseError> {
        sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Command {id}")))
    }

    /// Oldest pending command for a node (FIFO by `created_at`, then id).
    pub async fn oldest_pending_command(
        &self,
        node_id: i64,
    ) -> Result<Option<Command>, DatabaseError> {
        let row = sqlx::query_as::<_, Command>(
            "SELECT * FROM commands WHERE node_id = ? AND status = ? \
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(node_id)
        .bind(CommandStatus::Pending)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Flip a command pending -> sent. Returns `false` if another poll got it first.
    pub async fn mark_command_sent(&self, id: i64, now: i64) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE commands SET status = ?, sent_at = ? WHERE id = ? AND status = ?")
                .bind(CommandStatus::Sent)
                .bind(now)
                .bind(id)
                .bind(CommandStatus::Pending)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flip a sent command to a terminal status, scoped to its node.
    pub async fn finish_command(
        &self,
        id: i64,
        node_id: i64,
        status: CommandStatus,
        output: Option<&str>,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE commands SET status = ?, output = ?, completed_at = ? \
             WHERE id = ? AND node_id = ? AND status = ?",
        )
        .bind(status)
        .bind(output)
        .bind(now)
        .bind(id)
        .bind(node_id)
        .bind(CommandStatus::Sent)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Count commands for a node in a given status.
    pub async fn count_commands(
        &self,
        node_id: i64,
        status: CommandStatus,
    ) -> Result<i64, DatabaseError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM commands WHERE node_id = ? AND status = ?")
                .bind(node_id)
                .bind(status)
                .fetch_one(self.pool())
                .await?;
        Ok(row.0)
    }
}
