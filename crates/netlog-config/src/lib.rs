//! # netlog-config
//!
//! Configuration management for the netlog datagram registry.
//!
//! Loads configuration from:
//! 1. `~/.netlog/config.toml` (global)
//! 2. `.netlog/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::debug;

pub use logging::{init_logging, LogLevel};

/// Process-wide config, loaded from the standard locations on first access.
static SHARED: Lazy<RwLock<Config>> = Lazy::new(|| {
    let config = Config::load().unwrap_or_else(|e| {
        debug!(error = %e, "Config load failed, using defaults");
        Config::default()
    });
    RwLock::new(config)
});

/// Shared config snapshot. Falls back to defaults if the first load failed.
pub fn config() -> RwLockReadGuard<'static, Config> {
    SHARED.read().unwrap_or_else(PoisonError::into_inner)
}

/// Re-read the standard locations and replace the shared config. On error
/// the previous config stays in place.
pub fn reload() -> Result<Config, ConfigError> {
    let fresh = Config::load()?;
    *SHARED.write().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
    Ok(fresh)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub const ENV_ANONYMOUS_SERVICE: &str = "NETLOG_ANONYMOUS_SERVICE";
pub const ENV_HEARTBEAT_MS: &str = "NETLOG_HEARTBEAT_MS";
pub const ENV_RECV_BUFFER: &str = "NETLOG_RECV_BUFFER";
pub const ENV_LOG_LEVEL: &str = "NETLOG_LOG_LEVEL";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub bind: BindConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.netlog/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::read_file(&global_path)?;
            }
        }

        // 2. Load project config (.netlog/config.toml) - overrides global
        let project_path = Path::new(".netlog/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            config = Self::read_file(project_path)?;
        }

        // 3. Apply environment variable overrides
        config.apply_overrides(|key| std::env::var(key).ok());

        Ok(config)
    }

    /// Load a single explicit config file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.netlog/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".netlog/config.toml"))
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    /// Unparseable numeric values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(service) = lookup(ENV_ANONYMOUS_SERVICE) {
            self.registry.anonymous_service = service;
        }
        if let Some(ms) = lookup(ENV_HEARTBEAT_MS).and_then(|v| v.parse().ok()) {
            self.registry.heartbeat_interval_ms = ms;
        }
        if let Some(size) = lookup(ENV_RECV_BUFFER).and_then(|v| v.parse().ok()) {
            self.registry.recv_buffer_size = size;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log.level = level;
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Registry and dispatch loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Service name used for anonymous endpoints. "0" binds an OS-chosen port.
    pub anonymous_service: String,
    /// When true, every anonymous request creates a fresh endpoint instead of
    /// returning an existing one.
    pub allow_duplicates: bool,
    /// Keep-alive timer period in milliseconds (0 disables the timer)
    pub heartbeat_interval_ms: u64,
    /// Bytes read per datagram; longer datagrams are truncated
    pub recv_buffer_size: usize,
    /// Readiness events fetched per poll
    pub event_capacity: usize,
    /// Name of the dispatch thread
    pub dispatch_thread_name: String,
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            anonymous_service: "0".to_string(),
            allow_duplicates: true,
            heartbeat_interval_ms: 1000,
            recv_buffer_size: 256,
            event_capacity: 64,
            dispatch_thread_name: "netlog-dispatch".to_string(),
        }
    }
}

/// Socket binding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    /// Bind an IPv6 socket that also accepts IPv4-mapped traffic
    pub dual_stack: bool,
    /// Set SO_REUSEADDR before binding
    pub reuse_address: bool,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            dual_stack: true,
            reuse_address: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl LogConfig {
    pub fn level(&self) -> LogLevel {
        self.level.parse().unwrap_or(LogLevel::Info)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
