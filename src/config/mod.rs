//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pipe endpoint configuration
    #[serde(default)]
    pub pipe: PipeConfig,
    /// SOCKS engine configuration
    #[serde(default)]
    pub socks: SocksConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Pipe endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Filesystem path of the local pipe endpoint. Defaults to the
    /// executable's name under the system temp directory.
    pub path: Option<String>,
    /// TCP listen address for remote controllers (remote-accept mode).
    pub listen: Option<String>,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            path: None,
            listen: None,
        }
    }
}

impl PipeConfig {
    /// The effective local endpoint path: configured, or derived from the
    /// executable name.
    pub fn effective_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => PathBuf::from(path),
            None => std::env::temp_dir().join(format!("{}.pipe", executable_name())),
        }
    }
}

/// The running executable's stem, used as the default pipe name.
fn executable_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

/// SOCKS engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksConfig {
    /// Bounded wait for target connects, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 6000,
        }
    }
}

impl SocksConfig {
    pub fn engine_config(&self) -> crate::socks::EngineConfig {
        crate::socks::EngineConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}
