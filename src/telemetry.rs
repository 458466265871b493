//! Telemetry utilities for command timing and tracing spans.

use std::time::Instant;

/// Guard for timing command execution and recording metrics.
///
/// Records command latency when dropped.
pub struct CommandTimer {
    command: String,
    start: Instant,
}

impl CommandTimer {
    /// Start timing a command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for CommandTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        crate::metrics::record_command(&self.command, duration);
    }
}

/// Standardized span constructors.
pub mod spans {
    use tracing::{Level, Span, info_span, span};

    /// Span for one gateway connection.
    pub fn connection(socket: &str, peer: &str) -> Span {
        info_span!("connection", socket = %socket, peer = %peer)
    }

    /// Span for one command execution.
    pub fn command(name: &str, user: &str, socket: Option<&str>) -> Span {
        if let Some(socket) = socket {
            span!(Level::DEBUG, "chat.command", command = %name, user = %user, socket = %socket)
        } else {
            span!(Level::DEBUG, "chat.command", command = %name, user = %user)
        }
    }
}
