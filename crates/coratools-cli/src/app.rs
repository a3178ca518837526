//! Connected cora application
//!
//! Owns the runtime for one server connection and drives the dispatch loop
//! for the command being run.

use std::time::Duration;

use tracing::{info, warn};

use coratools_core::{ConnectionState, InterfaceVersion};
use coratools_runtime::{CoraRuntime, TcpTransport};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

pub struct CoraApp {
    config: AppConfig,
    runtime: CoraRuntime,
}

impl CoraApp {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let runtime = CoraRuntime::new(&config.core);
        Ok(Self { config, runtime })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn runtime(&self) -> &CoraRuntime {
        &self.runtime
    }

    /// Connect and log on; components may be started before or after this
    pub async fn connect(&mut self) -> Result<InterfaceVersion> {
        let connection = self.config.core.connection.clone();
        info!("Connecting to {}", connection.address);
        self.runtime.start(TcpTransport::new(connection))?;
        match self.runtime.wait_connected().await {
            ConnectionState::Ready(version) => {
                info!("Connected, server interface version {}", version);
                Ok(version)
            }
            ConnectionState::Failed(failure) => Err(CliError::Connection(failure)),
            ConnectionState::Connecting => Err(CliError::Config(
                "dispatcher stopped before the connection settled".to_string(),
            )),
        }
    }

    /// Dispatch until `done`, Ctrl-C or the configured transaction timeout
    ///
    /// Returns `false` when interrupted.
    pub async fn run_until<F>(&self, done: F) -> Result<bool>
    where
        F: FnMut() -> bool,
    {
        let timeout_secs = self.config.cli.transaction_timeout_secs;
        let dispatch = self.runtime.run_until(done);
        let bounded = async {
            if timeout_secs == 0 {
                dispatch.await;
                Ok(())
            } else {
                tokio::time::timeout(Duration::from_secs(timeout_secs), dispatch)
                    .await
                    .map_err(|_| CliError::Timeout(timeout_secs))
            }
        };
        tokio::select! {
            result = bounded => result.map(|()| true),
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted");
                Ok(false)
            }
        }
    }

    pub fn stop(&mut self) {
        self.runtime.stop();
    }
}
