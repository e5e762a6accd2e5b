//! Configuration resolution for the Outpost broker.
//!
//! Layers, lowest to highest priority:
//! 1. Built-in defaults
//! 2. TOML config file (`--config` / `OUTPOST_CONFIG`)
//! 3. `OUTPOST_*` environment variables
//! 4. CLI arguments (applied by the binary)
//!
//! The merged result is checked with [`BrokerConfig::validate`] before use.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    pub database_path: Option<PathBuf>,
    /// Bearer token operators present on management routes.
    pub operator_token: Option<String>,
    pub tunnel: TunnelConfig,
    pub reaper: ReaperConfig,
    pub updates: UpdateConfig,
    pub nodes: NodeConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            database_path: None,
            operator_token: None,
            tunnel: TunnelConfig::default(),
            reaper: ReaperConfig::default(),
            updates: UpdateConfig::default(),
            nodes: NodeConfig::default(),
        }
    }
}

/// Tunnel port pool and session lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// First port of the pool. Each slot spans `port` and `port + 1`.
    pub port_base: u16,
    /// Number of (port, secondary port) pairs in the pool.
    pub slots: u16,
    pub default_ttl_secs: i64,
    pub max_ttl_secs: i64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            port_base: 20_000,
            slots: 500,
            default_ttl_secs: 3600,
            max_ttl_secs: 24 * 3600,
        }
    }
}

impl TunnelConfig {
    /// Highest primary port handed out by the pool.
    pub fn last_port(&self) -> u32 {
        u32::from(self.port_base) + 2 * (u32::from(self.slots).saturating_sub(1))
    }
}

/// Reaper cadence and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_secs: u64,
    /// Age after which a non-terminal proxy job is forced to `timeout`.
    pub request_timeout_secs: i64,
    /// Missed checkin intervals before an online node is marked offline.
    pub offline_after_intervals: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            request_timeout_secs: 600, // 10 minutes
            offline_after_intervals: 3,
        }
    }
}

/// Agent update payload storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Directory payload references are resolved against.
    pub payload_dir: PathBuf,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            payload_dir: PathBuf::from("updates"),
        }
    }
}

/// Defaults applied to newly enrolled nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub checkin_interval_secs: i64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            checkin_interval_secs: 300,
        }
    }
}

impl BrokerConfig {
    /// Load defaults, the optional TOML file, then process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => load_config_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `OUTPOST_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("OUTPOST_LISTEN_ADDR") {
            self.listen_addr = parse_env("OUTPOST_LISTEN_ADDR", &val)?;
        }
        if let Some(val) = lookup("OUTPOST_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("OUTPOST_OPERATOR_TOKEN") {
            self.operator_token = Some(val);
        }
        if let Some(val) = lookup("OUTPOST_TUNNEL_PORT_BASE") {
            self.tunnel.port_base = parse_env("OUTPOST_TUNNEL_PORT_BASE", &val)?;
        }
        if let Some(val) = lookup("OUTPOST_TUNNEL_SLOTS") {
            self.tunnel.slots = parse_env("OUTPOST_TUNNEL_SLOTS", &val)?;
        }
        if let Some(val) = lookup("OUTPOST_REQUEST_TIMEOUT_SECS") {
            self.reaper.request_timeout_secs = parse_env("OUTPOST_REQUEST_TIMEOUT_SECS", &val)?;
        }
        if let Some(val) = lookup("OUTPOST_REAPER_INTERVAL_SECS") {
            self.reaper.interval_secs = parse_env("OUTPOST_REAPER_INTERVAL_SECS", &val)?;
        }
        if let Some(val) = lookup("OUTPOST_PAYLOAD_DIR") {
            self.updates.payload_dir = PathBuf::from(val);
        }
        Ok(())
    }

    /// Reject configurations the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        match self.operator_token.as_deref() {
            Some(token) if token.len() >= 16 => {}
            Some(_) => {
                return Err(Error::Config(
                    "operator_token must be at least 16 characters".into(),
                ));
            }
            None => return Err(Error::Config("operator_token is required".into())),
        }
        if self.tunnel.slots == 0 {
            return Err(Error::Config("tunnel.slots must be greater than 0".into()));
        }
        if self.tunnel.port_base < 1024 {
            return Err(Error::Config(
                "tunnel.port_base must not be a privileged port".into(),
            ));
        }
        // The secondary port of the last slot must still be a valid port.
        if self.tunnel.last_port() + 1 > u32::from(u16::MAX) {
            return Err(Error::Config(format!(
                "tunnel pool {}+{} slots exceeds the port range",
                self.tunnel.port_base, self.tunnel.slots
            )));
        }
        if self.tunnel.default_ttl_secs <= 0
            || self.tunnel.default_ttl_secs > self.tunnel.max_ttl_secs
        {
            return Err(Error::Config(
                "tunnel.default_ttl_secs must be in (0, max_ttl_secs]".into(),
            ));
        }
        if self.reaper.interval_secs == 0 {
            return Err(Error::Config("reaper.interval_secs must be greater than 0".into()));
        }
        if self.reaper.request_timeout_secs <= 0 {
            return Err(Error::Config(
                "reaper.request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.reaper.offline_after_intervals <= 0 || self.nodes.checkin_interval_secs <= 0 {
            return Err(Error::Config(
                "node checkin interval and offline threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Default database location under the platform data directory.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("outpost").join("broker.db"))
}

fn load_config_file(path: &Path) -> Result<BrokerConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    Ok(toml::from_str(&content)?)
}

fn parse_env<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.parse()
        .map_err(|_| Error::Config(format!("{key} has an invalid value: {val}")))
}
