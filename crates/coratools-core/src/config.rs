//! Configuration
//!
//! Configuration structures for the dispatcher, the database worker and the
//! server connection, with presets for production and testing.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{CoraError, Result};

// ----------------------------------------------------------------------------
// Dispatch Configuration
// ----------------------------------------------------------------------------

/// Configuration for the dispatch loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum envelopes delivered by one `dispatch_pending` call (0 = drain all)
    pub max_batch: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { max_batch: 0 }
    }
}

// ----------------------------------------------------------------------------
// Worker Configuration
// ----------------------------------------------------------------------------

/// Configuration for a database worker thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Bounded idle wait between housekeeping passes
    pub idle_wait_ms: u64,
    /// How long the worker waits for a consumer to take a posted batch
    pub batch_ack_timeout_ms: u64,
    /// Rows fetched per streamed batch
    pub batch_size: usize,
    /// Backend connections idle longer than this are closed
    pub connection_idle_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_wait_ms: 10_000,
            batch_ack_timeout_ms: 30_000,
            batch_size: 256,
            connection_idle_timeout_secs: 300,
        }
    }
}

impl WorkerConfig {
    /// Short timeouts so tests exercise housekeeping and ack expiry quickly
    pub fn testing() -> Self {
        Self {
            idle_wait_ms: 20,
            batch_ack_timeout_ms: 200,
            batch_size: 2,
            connection_idle_timeout_secs: 0,
        }
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn batch_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_ack_timeout_ms)
    }

    pub fn connection_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CoraError::config_error("worker batch_size must be positive"));
        }
        if self.idle_wait_ms == 0 {
            return Err(CoraError::config_error("worker idle_wait_ms must be positive"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Server address and logon credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// `host:port` of the server
    pub address: String,
    pub logon_name: String,
    pub logon_password: String,
    /// Reported to the server in the handshake
    pub application_name: String,
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6789".to_string(),
            logon_name: String::new(),
            logon_password: String::new(),
            application_name: "coratools".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(CoraError::config_error("connection address is empty"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(CoraError::config_error("connect_timeout_secs must be positive"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Combined Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for a coratools process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoraConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl CoraConfig {
    pub fn testing() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            worker: WorkerConfig::testing(),
            connection: ConnectionConfig {
                connect_timeout_secs: 2,
                ..ConnectionConfig::default()
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.connection.validate()
    }
}
