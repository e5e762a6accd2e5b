//! Database connection and initialization.

pub use outpost_core::db::DatabaseError;

outpost_core::define_database!(BrokerDatabase, "Broker database migrations complete");
