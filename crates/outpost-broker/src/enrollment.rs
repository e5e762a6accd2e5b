//! Enrollment tokens: single-use, time-limited bootstrap credentials.

use tracing::{info, warn};

use outpost_core::SharedClock;

use crate::audit::{AuditCategory, AuditEntry, AuditLog};
use crate::error::{BrokerError, Result};
use crate::nodes::{generate_secret, hash_secret};
use crate::storage::{BrokerDatabase, NewNode, RedeemOutcome};

pub const MIN_TOKEN_TTL_DAYS: i64 = 1;
pub const MAX_TOKEN_TTL_DAYS: i64 = 30;
const SECS_PER_DAY: i64 = 86_400;
const MAX_HOSTNAME_LEN: usize = 253;

/// A freshly issued token. The clear token is only ever returned here.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
    pub active_token_count: i64,
}

/// Identity a node presents when enrolling.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentRequest {
    pub hostname: String,
    pub hardware_fingerprint: Option<String>,
    pub lan_ip: Option<String>,
    pub wan_ip: Option<String>,
}

/// What a newly enrolled node needs to start polling.
#[derive(Debug, Clone)]
pub struct NodeBootstrap {
    pub node_id: i64,
    pub credential: String,
    pub checkin_interval: i64,
}

#[derive(Clone)]
pub struct EnrollmentIssuer {
    db: BrokerDatabase,
    clock: SharedClock,
    audit: AuditLog,
    checkin_interval: i64,
}

impl EnrollmentIssuer {
    pub fn new(
        db: BrokerDatabase,
        clock: SharedClock,
        audit: AuditLog,
        checkin_interval: i64,
    ) -> Self {
        Self {
            db,
            clock,
            audit,
            checkin_interval,
        }
    }

    /// Issue a token valid for `ttl_days`. Expired unused tokens are purged first.
    pub async fn issue(&self, ttl_days: i64) -> Result<IssuedToken> {
        if !(MIN_TOKEN_TTL_DAYS..=MAX_TOKEN_TTL_DAYS).contains(&ttl_days) {
            return Err(BrokerError::Validation(format!(
                "ttl_days must be between {MIN_TOKEN_TTL_DAYS} and {MAX_TOKEN_TTL_DAYS}"
            )));
        }

        let now = self.clock.now();
        let purged = self.db.purge_expired_tokens(now).await?;
        if purged > 0 {
            info!(purged, "Purged expired enrollment tokens");
        }

        let token = generate_secret();
        let expires_at = now + ttl_days * SECS_PER_DAY;
        self.db
            .insert_token(&hash_secret(&token), expires_at, now)
            .await?;
        let active_token_count = self.db.count_active_tokens(now).await?;

        info!(expires_at, active_token_count, "Enrollment token issued");
        self.audit
            .record(
                AuditEntry::new(AuditCategory::Enrollment, "Enrollment token issued")
                    .with_details(serde_json::json!({ "expires_at": expires_at })),
            )
            .await;

        Ok(IssuedToken {
            token,
            expires_at,
            active_token_count,
        })
    }

    /// Redeem a token, creating the node and its credential atomically.
    pub async fn redeem(&self, token: &str, request: &EnrollmentRequest) -> Result<NodeBootstrap> {
        let hostname = request.hostname.trim();
        if token.is_empty() {
            return Err(BrokerError::Validation("token is required".into()));
        }
        if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
            return Err(BrokerError::Validation(format!(
                "hostname must be 1-{MAX_HOSTNAME_LEN} characters"
            )));
        }

        let credential = generate_secret();
        let credential_hash = hash_secret(&credential);
        let params = NewNode {
            hostname,
            hardware_fingerprint: request.hardware_fingerprint.as_deref(),
            lan_ip: request.lan_ip.as_deref(),
            wan_ip: request.wan_ip.as_deref(),
            checkin_interval: self.checkin_interval,
            credential_hash: &credential_hash,
        };

        let outcome = self
            .db
            .redeem_enrollment_token(&hash_secret(token), &params, self.clock.now())
            .await?;

        let node = match outcome {
            RedeemOutcome::Redeemed(node) => node,
            RedeemOutcome::NotFound => {
                warn!(hostname, "Enrollment with unknown token");
                return Err(BrokerError::NotFound("Enrollment token".into()));
            }
            RedeemOutcome::Expired => {
                warn!(hostname, "Enrollment with expired token");
                return Err(BrokerError::TokenExpired);
            }
            RedeemOutcome::AlreadyUsed => {
                warn!(hostname, "Enrollment with used token");
                return Err(BrokerError::TokenAlreadyUsed);
            }
        };

        info!(node_id = node.id, hostname, "Node enrolled");
        self.audit
            .record(
                AuditEntry::new(AuditCategory::Enrollment, format!("Node {} enrolled", node.id))
                    .with_node(node.id)
                    .with_details(serde_json::json!({ "hostname": hostname })),
            )
            .await;

        Ok(NodeBootstrap {
            node_id: node.id,
            credential,
            checkin_interval: node.checkin_interval,
        })
    }
}
