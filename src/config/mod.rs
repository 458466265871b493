//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Top-level config, instance identity and listener settings
//! - [`service`]: Chat service behaviour (feature switches, timeouts, history)

mod service;
mod types;

pub use service::{DISCONNECT_CONCURRENCY, ServiceConfig};
pub use types::{Config, ConfigError, ServerConfig};
