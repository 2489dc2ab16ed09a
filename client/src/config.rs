//! Configuration file parser for Tunnelgate
//!
//! Supports tunnelgate.yml with the listen address, tunnel namespace
//! prefix, fallback endpoint, and health monitor settings.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use tunnelgate_shared::Endpoint;

/// Compiled-in endpoint used when nothing else is configured
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/tunnel";

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Endpoint used when the settings store has none
    #[serde(default = "default_endpoint")]
    pub default_endpoint: String,

    /// Local interception server address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// URL prefix of the tunneled namespace
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Seconds a request waits for the endpoint to be delivered
    #[serde(default = "default_config_wait")]
    pub config_wait_secs: u64,

    /// Seconds to wait for a tunneled response
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Health monitor settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Override for the settings file location
    pub settings_path: Option<PathBuf>,
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between probes
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Seconds a probe may take
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_endpoint: default_endpoint(),
            listen: default_listen(),
            prefix: default_prefix(),
            config_wait_secs: default_config_wait(),
            response_timeout_secs: default_response_timeout(),
            health: HealthConfig::default(),
            settings_path: None,
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_prefix() -> String {
    crate::gateway::DEFAULT_PREFIX.to_string()
}

fn default_config_wait() -> u64 {
    10
}

fn default_response_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> u64 {
    60
}

fn default_health_timeout() -> u64 {
    5
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: GatewayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, the standard locations, or fall back to defaults
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(Self::find_config) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        Endpoint::parse(&self.default_endpoint)
            .with_context(|| format!("Invalid default_endpoint '{}'", self.default_endpoint))?;

        if self.prefix.trim_matches('/').is_empty() {
            anyhow::bail!("Tunnel prefix cannot be empty");
        }
        if self.health.interval_secs == 0 {
            anyhow::bail!("Health interval must be at least one second");
        }
        if self.health.timeout_secs == 0 || self.health.timeout_secs >= self.health.interval_secs {
            anyhow::bail!("Health timeout must be positive and shorter than the interval");
        }

        Ok(())
    }

    pub fn config_wait(&self) -> Duration {
        Duration::from_secs(self.config_wait_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health.timeout_secs)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "tunnelgate.yml",
            "tunnelgate.yaml",
            ".tunnelgate.yml",
            ".tunnelgate.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
