//! Tunnel session and port pool queries.

use super::db::{BrokerDatabase, DatabaseError};
use super::models::{TunnelSession, TunnelStatus};

/// Expire active sessions whose deadline has passed.
const EXPIRE_SESSIONS_SQL: &str = "UPDATE tunnel_sessions SET status = 'expired', closed_at = ? \
     WHERE status = 'active' AND expires_at <= ? RETURNING *";

/// Insert a session on the lowest free slot of the pool.
///
/// Slots start at the pool base and step by two; a slot is free when no
/// active session holds either of its ports, directly or as a secondary.
const ALLOCATE_SLOT_SQL: &str = "WITH RECURSIVE slots(port) AS ( \
         SELECT ? UNION ALL SELECT port + 2 FROM slots WHERE port + 2 <= ? \
     ) \
     INSERT INTO tunnel_sessions (node_id, port, secondary_port, status, created_at, expires_at) \
     SELECT ?, slots.port, slots.port + 1, 'active', ?, ? FROM slots \
     WHERE NOT EXISTS ( \
         SELECT 1 FROM tunnel_sessions t WHERE t.status = 'active' \
         AND (t.port IN (slots.port, slots.port + 1) \
              OR t.secondary_port IN (slots.port, slots.port + 1)) \
     ) \
     ORDER BY slots.port LIMIT 1 \
     RETURNING *";

/// Parameters for allocating a tunnel session.
pub struct AllocateTunnelParams {
    pub node_id: i64,
    /// First primary port of the pool.
    pub port_base: i64,
    /// Last primary port of the pool (inclusive).
    pub last_port: i64,
    pub now: i64,
    pub expires_at: i64,
}

/// Result of an allocation attempt.
#[derive(Debug)]
pub enum TunnelAllocation {
    Allocated(TunnelSession),
    /// The node already holds a live session.
    NodeBusy(TunnelSession),
    /// Every slot is held.
    Exhausted,
}

impl BrokerDatabase {
    /// Allocate a session in one write transaction.
    ///
    /// Past-expiry sessions are expired first so their slots are reusable;
    /// those rows are returned alongside the outcome.
    pub async fn allocate_tunnel_session(
        &self,
        params: &AllocateTunnelParams,
    ) -> Result<(TunnelAllocation, Vec<TunnelSession>), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        // Writing first takes the database write lock for the whole allocation.
        let expired = sqlx::query_as::<_, TunnelSession>(EXPIRE_SESSIONS_SQL)
            .bind(params.now)
            .bind(params.now)
            .fetch_all(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, TunnelSession>(
            "SELECT * FROM tunnel_sessions WHERE node_id = ? AND status = ?",
        )
        .bind(params.node_id)
        .bind(TunnelStatus::Active)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = if let Some(session) = existing {
            TunnelAllocation::NodeBusy(session)
        } else {
            let inserted = sqlx::query_as::<_, TunnelSession>(ALLOCATE_SLOT_SQL)
                .bind(params.port_base)
                .bind(params.last_port)
                .bind(params.node_id)
                .bind(params.now)
                .bind(params.expires_at)
                .fetch_optional(&mut *tx)
                .await?;
            inserted.map_or(TunnelAllocation::Exhausted, TunnelAllocation::Allocated)
        };

        tx.commit().await?;
        Ok((outcome, expired))
    }

    /// Get a tunnel session by ID.
    pub async fn get_tunnel_session(&self, id: i64) -> Result<TunnelSession, DatabaseError> {
        sqlx::query_as::<_, TunnelSession>("SELECT * FROM tunnel_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Tunnel session {id}")))
    }

    /// The session still marked active for a node, whether or not it has expired.
    pub async fn active_tunnel_session(
        &self,
        node_id: i64,
    ) -> Result<Option<TunnelSession>, DatabaseError> {
        let row = sqlx::query_as::<_, TunnelSession>(
            "SELECT * FROM tunnel_sessions WHERE node_id = ? AND status = ?",
        )
        .bind(node_id)
        .bind(TunnelStatus::Active)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Close an active session. Returns `false` if it was no longer active.
    pub async fn close_tunnel_session(&self, id: i64, now: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE tunnel_sessions SET status = ?, closed_at = ? WHERE id = ? AND status = ?",
        )
        .bind(TunnelStatus::Closed)
        .bind(now)
        .bind(id)
        .bind(TunnelStatus::Active)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Expire every active session past its deadline, returning the rows moved.
    pub async fn expire_tunnel_sessions(
        &self,
        now: i64,
    ) -> Result<Vec<TunnelSession>, DatabaseError> {
        let rows = sqlx::query_as::<_, TunnelSession>(EXPIRE_SESSIONS_SQL)
            .bind(now)
            .bind(now)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Number of sessions currently marked active.
    pub async fn count_active_tunnels(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tunnel_sessions WHERE status = ?")
            .bind(TunnelStatus::Active)
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}
