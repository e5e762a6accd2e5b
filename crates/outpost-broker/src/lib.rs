//! Outpost Broker Library
//!
//! Control plane for a fleet of NAT-bound appliances that can only reach out:
//! - Per-node command queue and agent update delivery, pulled by polling
//! - Tunnel session and port pool management
//! - Proxy job queue with a reaper for abandoned work
//! - Enrollment tokens and per-node credentials
//! - SQLite storage and the axum HTTP surface

pub mod api;
pub mod audit;
pub mod broker;
pub mod commands;
pub mod enrollment;
pub mod error;
pub mod nodes;
pub mod reaper;
pub mod requests;
pub mod storage;
pub mod telemetry;
pub mod tunnel;
pub mod updates;

pub use broker::Broker;
pub use error::{BrokerError, Result};
