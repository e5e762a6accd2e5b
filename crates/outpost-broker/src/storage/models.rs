//! Data models for Outpost broker storage.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! status_str {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Online,
    Offline,
}

status_str!(NodeStatus { Pending => "pending", Online => "online", Offline => "offline" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

status_str!(CommandStatus {
    Pending => "pending",
    Sent => "sent",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UpdateStatus {
    Pending,
    Downloading,
    Installed,
    Failed,
}

status_str!(UpdateStatus {
    Pending => "pending",
    Downloading => "downloading",
    Installed => "installed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TunnelStatus {
    Active,
    Expired,
    Closed,
}

status_str!(TunnelStatus { Active => "active", Expired => "expired", Closed => "closed" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

status_str!(RequestStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Timeout => "timeout",
});

impl RequestStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Node {
    pub id: i64,
    pub hostname: String,
    pub lan_ip: Option<String>,
    pub wan_ip: Option<String>,
    pub status: NodeStatus,
    pub checkin_interval: i64,
    pub hardware_fingerprint: Option<String>,
    pub agent_version: Option<String>,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub last_checkin: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Command {
    pub id: i64,
    pub node_id: i64,
    pub command: String,
    pub status: CommandStatus,
    pub output: Option<String>,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentUpdate {
    pub id: i64,
    pub node_id: i64,
    pub version: String,
    pub payload_ref: String,
    pub status: UpdateStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TunnelSession {
    pub id: i64,
    pub node_id: i64,
    pub port: i64,
    pub secondary_port: i64,
    pub status: TunnelStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub closed_at: Option<i64>,
}

impl TunnelSession {
    /// Still marked active but already past its expiry.
    pub fn is_stale(&self, now: i64) -> bool {
        self.status == TunnelStatus::Active && self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProxyRequest {
    pub id: i64,
    pub node_id: i64,
    pub tunnel_port: i64,
    pub action: Option<String>,
    pub status: RequestStatus,
    pub result: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EnrollmentToken {
    pub token_hash: String,
    pub expires_at: i64,
    pub used: i64,
    pub used_at: Option<i64>,
    pub node_id: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: i64,
    pub category: String,
    pub message: String,
    pub details: String,
    pub node_id: Option<i64>,
    pub created_at: i64,
}
