//! cora CLI Configuration Management
//!
//! The configuration file is TOML. Sections mirror the core configuration
//! (`[connection]`, `[dispatch]`, `[worker]`) plus a `[cli]` section for
//! settings only the command-line client uses. Missing sections and fields
//! take their defaults; command-line flags override the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use coratools_core::component::FormatOption;
use coratools_core::{ConnectionConfig, CoraConfig};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub core: CoraConfig,

    #[serde(default)]
    pub cli: CliConfig,
}

/// Settings used only by the command-line client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Give up on a transaction after this many seconds (0 = wait forever)
    pub transaction_timeout_secs: u64,

    /// Format used when a command does not name one
    pub default_format: FormatOption,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_secs: 0,
            default_format: FormatOption::Toa5,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load from `path`, or from the default location if it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            info!("Loading configuration from: {}", path.display());
            return Self::load_from_file(path);
        }
        match Self::default_config_path() {
            Some(path) if path.exists() => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            _ => {
                debug!("Using default configuration");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/coratools/cora.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("coratools").join("cora.toml"))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply command-line overrides for the connection
    pub fn with_overrides(
        mut self,
        server: Option<String>,
        logon: Option<String>,
        password: Option<String>,
    ) -> Self {
        let connection = &mut self.core.connection;
        if let Some(server) = server {
            connection.address = server;
        }
        if let Some(logon) = logon {
            connection.logon_name = logon;
        }
        if let Some(password) = password {
            connection.logon_password = password;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.core
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))
    }

    pub fn example_config() -> String {
        let example = AppConfig {
            core: CoraConfig {
                connection: ConnectionConfig {
                    address: "loggernet.example.com:6789".to_string(),
                    logon_name: "operator".to_string(),
                    ..ConnectionConfig::default()
                },
                ..CoraConfig::default()
            },
            cli: CliConfig {
                transaction_timeout_secs: 600,
                default_format: FormatOption::Csv,
            },
        };
        example
            .to_toml()
            .unwrap_or_else(|_| "# Failed to render example configuration\n".to_string())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
