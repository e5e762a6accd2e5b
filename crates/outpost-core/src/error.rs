//! Error types for `Outpost` core library.

use thiserror::Error;

/// Result type alias using `Outpost` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Outpost` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML config file could not be parsed
    #[error("Failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
