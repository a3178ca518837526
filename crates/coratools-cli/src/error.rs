//! Error handling for the cora CLI

use thiserror::Error;

use coratools_core::{CoraError, SessionFailure};

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Coratools error: {0}")]
    Core(#[from] CoraError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Could not connect: {0}")]
    Connection(SessionFailure),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// The transaction ended with a failure outcome
    #[error("{command} failed: {outcome}")]
    Transaction { command: &'static str, outcome: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl CliError {
    pub fn transaction(command: &'static str, outcome: impl std::fmt::Debug) -> Self {
        CliError::Transaction {
            command,
            outcome: format!("{outcome:?}"),
        }
    }
}
