//! Audit log queries.

use super::db::{BrokerDatabase, DatabaseError};
use super::models::AuditRecord;

impl BrokerDatabase {
    /// Append an audit record.
    pub async fn insert_audit(
        &self,
        category: &str,
        message: &str,
        details: &str,
        node_id: Option<i64>,
        now: i64,
    ) -> Result<AuditRecord, DatabaseError> {
        let row = sqlx::query_as::<_, AuditRecord>(
            "INSERT INTO audit_log (category, message, details, node_id, created_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(category)
        .bind(message)
        .bind(details)
        .bind(node_id)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    /// Most recent audit records, newest first, optionally filtered by category.
    pub async fn list_audit(
        &self,
        category: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditRecord>, DatabaseError> {
        let rows = sqlx::query_as::<_, AuditRecord>(
            "SELECT * FROM audit_log WHERE (? IS NULL OR category = ?) \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(category)
        .bind(category)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
