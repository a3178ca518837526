//! Coratools CLI library
//!
//! Command parsing, configuration and command handlers for `cora`, a small
//! client that collects station data from a LoggerNet server.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use app::CoraApp;
pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::{AppConfig, CliConfig};
pub use error::{CliError, Result};
