//! `Outpost` Core Library
//!
//! Shared functionality for the Outpost broker:
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Injectable clock
//! - Layered configuration
//! - Tracing and optional `OpenTelemetry` metrics setup

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::BrokerConfig;
pub use error::{Error, Result};
