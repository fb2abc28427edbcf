//! TOML configuration for the `buildsync` server.
//!
//! Every field has a default, so an empty file is a valid configuration:
//!
//! ```toml
//! [service]
//! diff_change_threshold = 2048
//! cache_checksums = true
//!
//! [server]
//! listen_addr = "127.0.0.1:47200"
//! store_root = "/srv/builds"
//! max_connections = 256
//! read_timeout_secs = 300
//!
//! [logging]
//! filter = "info"
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BuildSyncError, Result};
use crate::service::ServiceConfig;

/// Complete server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Resolution policy.
    #[serde(default)]
    pub service: ServiceConfig,
    /// Network and storage settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network and storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g. "127.0.0.1:47200")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Root of the directory store
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds a connection may wait for its next message; 0 disables
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            store_root: default_store_root(),
            max_connections: default_max_connections(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:47200".to_string()
}

fn default_store_root() -> PathBuf {
    PathBuf::from("./builds")
}

fn default_max_connections() -> usize {
    256
}

fn default_read_timeout() -> u64 {
    300
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            BuildSyncError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate configuration text.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the text is not valid configuration.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| BuildSyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot work.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        self.listen_addr()?;
        if self.server.max_connections == 0 {
            return Err(BuildSyncError::Config(
                "server.max_connections must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed listen address.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `server.listen_addr` is not a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server.listen_addr.parse().map_err(|e| {
            BuildSyncError::Config(format!(
                "invalid server.listen_addr {:?}: {e}",
                self.server.listen_addr
            ))
        })
    }

    /// Idle timeout for client connections, `None` when disabled.
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        let secs = self.server.read_timeout_secs;
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Render as TOML, e.g. to print the effective configuration.
    ///
    /// # Errors
    ///
    /// Returns `Config` if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BuildSyncError::Config(e.to_string()))
    }
}
