//! Proxy request queue queries.

use super::db::{BrokerDatabase, DatabaseError};
use super::models::{ProxyRequest, RequestStatus};

impl BrokerDatabase {
    /// Queue a proxy job against a tunnel port.
    pub async fn insert_request(
        &self,
        node_id: i64,
        tunnel_port: i64,
        action: Option<&str>,
        now: i64,
    ) -> Result<ProxyRequest, DatabaseError> {
        let row = sqlx::query_as::<_, ProxyRequest>(
            "INSERT INTO request_queue (node_id, tunnel_port, action, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(node_id)
        .bind(tunnel_port)
        .bind(action)
        .bind(RequestStatus::Pending)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    /// Get a proxy job by ID.
    pub async fn get_request(&self, id: i64) -> Result<ProxyRequest, DatabaseError> {
        sqlx::query_as::<_, ProxyRequest>("SELECT * FROM request_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Proxy request {id}")))
    }

    /// Oldest pending job, optionally restricted to one node.
    pub async fn oldest_pending_request(
        &self,
        node_id: Option<i64>,
    ) -> Result<Option<ProxyRequest>, DatabaseError> {
        let row = sqlx::query_as::<_, ProxyRequest>(
            "SELECT * FROM request_queue WHERE status = ? AND (? IS NULL OR node_id = ?) \
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(RequestStatus::Pending)
        .bind(node_id)
        .bind(node_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Move a job from `from` to `to`, conditional on its current status.
    ///
    /// Terminal targets stamp `completed_at`. Returns `false` when the row was
    /// no longer in `from`.
    pub async fn transition_request(
        &self,
        id: i64,
        from: RequestStatus,
        to: RequestStatus,
        result: Option<&str>,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let completed_at = to.is_terminal().then_some(now);
        let outcome = sqlx::query(
            "UPDATE request_queue SET status = ?, updated_at = ?, \
             completed_at = COALESCE(?, completed_at), result = COALESCE(?, result) \
             WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(now)
        .bind(completed_at)
        .bind(result)
        .bind(id)
        .bind(from)
        .execute(self.pool())
        .await?;
        Ok(outcome.rows_affected() == 1)
    }

    /// Force a job to `timeout` if it is still pending or processing.
    ///
    /// Returns the status the job held when it was flipped. Jobs only move
    /// forward, so trying `pending` before `processing` catches a claim that
    /// lands between the two attempts.
    pub async fn time_out_request(
        &self,
        id: i64,
        now: i64,
    ) -> Result<Option<RequestStatus>, DatabaseError> {
        for prior in [RequestStatus::Pending, RequestStatus::Processing] {
            if self
                .transition_request(id, prior, RequestStatus::Timeout, None, now)
                .await?
            {
                return Ok(Some(prior));
            }
        }
        Ok(None)
    }

    /// Non-terminal jobs created strictly before `cutoff`.
    pub async fn stale_requests(&self, cutoff: i64) -> Result<Vec<ProxyRequest>, DatabaseError> {
        let rows = sqlx::query_as::<_, ProxyRequest>(
            "SELECT * FROM request_queue WHERE status IN (?, ?) AND created_at < ? ORDER BY id",
        )
        .bind(RequestStatus::Pending)
        .bind(RequestStatus::Processing)
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
