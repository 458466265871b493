//! Core configuration types and loading.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use super::service::ServiceConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Instance identity and listeners.
    pub server: ServerConfig,
    /// Chat service behaviour.
    #[serde(default)]
    pub service: ServiceConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.event_queue == 0 {
            return Err(ConfigError::Invalid("server.event_queue must be positive".into()));
        }
        if let Some(id) = &self.server.instance_id
            && !crate::validation::is_valid_name(id)
        {
            return Err(ConfigError::Invalid(format!("server.instance_id {id:?} is not a valid name")));
        }
        self.service.validate().map_err(ConfigError::Invalid)
    }
}

/// Instance identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Cluster-unique instance id. A random UUID is used when absent.
    pub instance_id: Option<String>,
    /// Gateway listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Prometheus metrics HTTP port (disabled when absent).
    pub metrics_port: Option<u16>,
    /// Outbound event queue depth per socket.
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

impl ServerConfig {
    /// Resolve the configured instance id, generating one if unset.
    pub fn resolve_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8400))
}

fn default_event_queue() -> usize {
    256
}
