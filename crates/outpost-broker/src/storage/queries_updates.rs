//! Agent update queries.

use super::db::{BrokerDatabase, DatabaseError};
use super::models::{AgentUpdate, UpdateStatus};

impl BrokerDatabase {
    /// Schedule an update for a node.
    pub async fn insert_update(
        &self,
        node_id: i64,
        version: &str,
        payload_ref: &str,
        now: i64,
    ) -> Result<AgentUpdate, DatabaseError> {
        let row = sqlx::query_as::<_, AgentUpdate>(
            "INSERT INTO agent_updates (node_id, version, payload_ref, status, created_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(node_id)
        .bind(version)
        .bind(payload_ref)
        .bind(UpdateStatus::Pending)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    /// Get an update by ID.
    pub async fn get_update(&self, id: i64) -> Result<AgentUpdate, DatabaseError> {
        sqlx::query_as::<_, AgentUpdate>("SELECT * FROM agent_updates WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Update {id}")))
    }

    /// Most recently scheduled pending update for a node.
    pub async fn latest_pending_update(
        &self,
        node_id: i64,
    ) -> Result<Option<AgentUpdate>, DatabaseError> {
        let row = sqlx::query_as::<_, AgentUpdate>(
            "SELECT * FROM agent_updates WHERE node_id = ? AND status = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(node_id)
        .bind(UpdateStatus::Pending)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Claim an update: pending -> downloading, stamping `started_at`.
    pub async fn mark_update_downloading(&self, id: i64, now: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE agent_updates SET status = ?, started_at = ? WHERE id = ? AND status = ?",
        )
        .bind(UpdateStatus::Downloading)
        .bind(now)
        .bind(id)
        .bind(UpdateStatus::Pending)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Close a downloading update. On `installed` the node's agent version
    /// moves to the update's target in the same transaction.
    pub async fn finish_update(
        &self,
        id: i64,
        node_id: i64,
        status: UpdateStatus,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "UPDATE agent_updates SET status = ?, finished_at = ? \
             WHERE id = ? AND node_id = ? AND status = ?",
        )
        .bind(status)
        .bind(now)
        .bind(id)
        .bind(node_id)
        .bind(UpdateStatus::Downloading)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        if status == UpdateStatus::Installed {
            sqlx::query(
                "UPDATE nodes SET agent_version = \
                 (SELECT version FROM agent_updates WHERE id = ?) WHERE id = ?",
            )
            .bind(id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}
