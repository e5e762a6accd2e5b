//! SQLite storage for the Outpost broker.
//!
//! Persists nodes, command and update queues, tunnel sessions, proxy jobs,
//! enrollment tokens, and the audit log. Every state transition is a
//! conditional update so concurrent callers cannot both win.

mod db;
mod models;
mod queries_audit;
mod queries_commands;
mod queries_nodes;
mod queries_requests;
mod queries_tokens;
mod queries_tunnels;
mod queries_updates;

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests;

pub use db::{BrokerDatabase, DatabaseError};
pub use models::*;
pub use queries_nodes::{CheckinParams, NewNode};
pub use queries_tokens::RedeemOutcome;
pub use queries_tunnels::{AllocateTunnelParams, TunnelAllocation};
