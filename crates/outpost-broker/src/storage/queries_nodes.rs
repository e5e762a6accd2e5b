//! Node identity and checkin queries.

use sqlx::Sqlite;
use sqlx::query::QueryAs;
use sqlx::sqlite::SqliteArguments;

use super::db::{BrokerDatabase, DatabaseError};
use super::models::{Node, NodeStatus};

pub(super) const INSERT_NODE_SQL: &str = "INSERT INTO nodes \
     (hostname, hardware_fingerprint, lan_ip, wan_ip, checkin_interval, credential_hash, status, created_at) \
     VALUES (?, ?, ?, ?, ?, ?, 'pending', ?) RETURNING *";

/// Parameters for creating a node record.
pub struct NewNode<'a> {
    pub hostname: &'a str,
    pub hardware_fingerprint: Option<&'a str>,
    pub lan_ip: Option<&'a str>,
    pub wan_ip: Option<&'a str>,
    pub checkin_interval: i64,
    pub credential_hash: &'a str,
}

impl NewNode<'_> {
    /// Bind all insert columns except `created_at` in [`INSERT_NODE_SQL`] order.
    pub(super) fn bind_to<'q>(
        &'q self,
        query: QueryAs<'q, Sqlite, Node, SqliteArguments<'q>>,
    ) -> QueryAs<'q, Sqlite, Node, SqliteArguments<'q>> {
        query
            .bind(self.hostname)
            .bind(self.hardware_fingerprint)
            .bind(self.lan_ip)
            .bind(self.wan_ip)
            .bind(self.checkin_interval)
            .bind(self.credential_hash)
    }
}

/// Fields a node reports on checkin. `None` keeps the stored value.
pub struct CheckinParams<'a> {
    pub lan_ip: Option<&'a str>,
    pub wan_ip: Option<&'a str>,
    pub agent_version: Option<&'a str>,
}

impl BrokerDatabase {
    /// Create a node outside of enrollment (tests, imports).
    pub async fn create_node(&self, params: &NewNode<'_>, now: i64) -> Result<Node, DatabaseError> {
        let node = params
            .bind_to(sqlx::query_as::<_, Node>(INSERT_NODE_SQL))
            .bind(now)
            .fetch_one(self.pool())
            .await?;
        Ok(node)
    }

    /// Get a node by ID.
    pub async fn get_node(&self, id: i64) -> Result<Node, DatabaseError> {
        sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Node {id}")))
    }

    pub async fn node_exists(&self, id: i64) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Find the node owning a credential digest.
    pub async fn find_node_by_credential(
        &self,
        credential_hash: &str,
    ) -> Result<Option<Node>, DatabaseError> {
        let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE credential_hash = ?")
            .bind(credential_hash)
            .fetch_optional(self.pool())
            .await?;
        Ok(node)
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, DatabaseError> {
        let nodes = sqlx::query_as::<_, Node>("SELECT * FROM nodes ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(nodes)
    }

    /// Replace a node's credential digest.
    pub async fn set_node_credential(
        &self,
        id: i64,
        credential_hash: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE nodes SET credential_hash = ? WHERE id = ?")
            .bind(credential_hash)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store a checkin report and mark the node online.
    pub async fn record_checkin(
        &self,
        id: i64,
        params: &CheckinParams<'_>,
        now: i64,
    ) -> Result<Node, DatabaseError> {
        sqlx::query_as::<_, Node>(
            "UPDATE nodes SET lan_ip = COALESCE(?, lan_ip), wan_ip = COALESCE(?, wan_ip), \
             agent_version = COALESCE(?, agent_version), status = 'online', last_checkin = ? \
             WHERE id = ? RETURNING *",
        )
        .bind(params.lan_ip)
        .bind(params.wan_ip)
        .bind(params.agent_version)
        .bind(now)
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Node {id}")))
    }

    /// Online nodes whose last checkin is older than `intervals` checkin periods.
    pub async fn overdue_online_nodes(
        &self,
        now: i64,
        intervals: i64,
    ) -> Result<Vec<Node>, DatabaseError> {
        let nodes = sqlx::query_as::<_, Node>(
            "SELECT * FROM nodes WHERE status = 'online' \
             AND (last_checkin IS NULL OR last_checkin < ? - checkin_interval * ?) ORDER BY id",
        )
        .bind(now)
        .bind(intervals)
        .fetch_all(self.pool())
        .await?;
        Ok(nodes)
    }

    /// Mark a node offline, conditional on it still being online and overdue
    /// at update time so a concurrent checkin wins.
    pub async fn mark_node_offline(
        &self,
        id: i64,
        now: i64,
        intervals: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE nodes SET status = ? WHERE id = ? AND status = ? \
             AND (last_checkin IS NULL OR last_checkin < ? - checkin_interval * ?)",
        )
        .bind(NodeStatus::Offline)
        .bind(id)
        .bind(NodeStatus::Online)
        .bind(now)
        .bind(intervals)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
