//! Enrollment token queries.

use super::db::{BrokerDatabase, DatabaseError};
use super::models::{EnrollmentToken, Node};
use super::queries_nodes::{INSERT_NODE_SQL, NewNode};

/// Outcome of redeeming an enrollment token.
#[derive(Debug)]
pub enum RedeemOutcome {
    Redeemed(Node),
    NotFound,
    Expired,
    AlreadyUsed,
}

impl BrokerDatabase {
    /// Delete tokens that expired without being used.
    pub async fn purge_expired_tokens(&self, now: i64) -> Result<u64, DatabaseError> {
        let result =
            sqlx::query("DELETE FROM enrollment_tokens WHERE used = 0 AND expires_at <= ?")
                .bind(now)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected())
    }

    /// Store a new token digest.
    pub async fn insert_token(
        &self,
        token_hash: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<EnrollmentToken, DatabaseError> {
        let row = sqlx::query_as::<_, EnrollmentToken>(
            "INSERT INTO enrollment_tokens (token_hash, expires_at, created_at) \
             VALUES (?, ?, ?) RETURNING *",
        )
        .bind(token_hash)
        .bind(expires_at)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn get_token(&self, token_hash: &str) -> Result<EnrollmentToken, DatabaseError> {
        sqlx::query_as::<_, EnrollmentToken>(
            "SELECT * FROM enrollment_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound("Enrollment token".to_string()))
    }

    /// Unused tokens that have not expired.
    pub async fn count_active_tokens(&self, now: i64) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM enrollment_tokens WHERE used = 0 AND expires_at > ?",
        )
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    /// Consume a token and create its node in one transaction.
    ///
    /// The token flip is conditional on `used = 0 AND expires_at > now`, so
    /// of two concurrent redemptions exactly one creates a node.
    pub async fn redeem_enrollment_token(
        &self,
        token_hash: &str,
        node: &NewNode<'_>,
        now: i64,
    ) -> Result<RedeemOutcome, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let claimed = sqlx::query(
            "UPDATE enrollment_tokens SET used = 1, used_at = ? \
             WHERE token_hash = ? AND used = 0 AND expires_at > ?",
        )
        .bind(now)
        .bind(token_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() != 1 {
            let row = sqlx::query_as::<_, EnrollmentToken>(
                "SELECT * FROM enrollment_tokens WHERE token_hash = ?",
            )
            .bind(token_hash)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Ok(match row {
                None => RedeemOutcome::NotFound,
                Some(token) if token.used != 0 => RedeemOutcome::AlreadyUsed,
                Some(_) => RedeemOutcome::Expired,
            });
        }

        let created = node
            .bind_to(sqlx::query_as::<_, Node>(INSERT_NODE_SQL))
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("UPDATE enrollment_tokens SET node_id = ? WHERE token_hash = ?")
            .bind(created.id)
            .bind(token_hash)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(RedeemOutcome::Redeemed(created))
    }
}
