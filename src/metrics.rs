//! Prometheus metrics for slchatd.
//!
//! Exposed on the optional HTTP endpoint (see [`crate::http`]).
//!
//! - `chat_command_total{command}` - Commands dispatched by name
//! - `chat_command_duration_seconds{command}` - Command latency histogram
//! - `chat_consistency_failures_total{kind,op}` - Store/transport divergences
//! - `chat_bus_requests_total{kind,status}` - Acknowledged bus requests

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Commands
// ========================================================================

/// Commands processed by name.
pub static COMMAND_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();

/// Command processing latency by name.
pub static COMMAND_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Command errors by name and error code.
pub static COMMAND_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

// ========================================================================
// Sockets and events
// ========================================================================

/// Sockets registered on this instance.
pub static CONNECTED_SOCKETS: OnceLock<IntGauge> = OnceLock::new();

/// Events dropped because a socket's outbound queue was full.
pub static EVENTS_DROPPED: OnceLock<IntCounter> = OnceLock::new();

// ========================================================================
// Consistency, bus and lock
// ========================================================================

/// Reported divergences between transport and store state.
pub static CONSISTENCY_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();

/// Acknowledged bus requests by kind and outcome.
pub static BUS_REQUESTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Time spent waiting for the per-user lock.
pub static LOCK_WAIT: OnceLock<Histogram> = OnceLock::new();

/// Lock acquisitions that gave up.
pub static LOCK_TIMEOUTS: OnceLock<IntCounter> = OnceLock::new();

/// Critical sections that outlived their lock.
pub static LOCKS_LOST: OnceLock<IntCounter> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Call once at startup; recording before `init` is a no-op.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            match $init {
                Ok(m) => {
                    if let Err(e) = r.register(Box::new(m.clone())) {
                        tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                    }
                    let _ = $metric.set(m);
                }
                Err(e) => {
                    tracing::error!(error = %e, concat!("Failed to create metric ", stringify!($metric)));
                }
            }
        };
    }

    register!(COMMAND_COUNTER, IntCounterVec::new(Opts::new("chat_command_total", "Commands processed by name"), &["command"]));
    register!(COMMAND_LATENCY, HistogramVec::new(
        HistogramOpts::new("chat_command_duration_seconds", "Command latency by name")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["command"]));
    register!(COMMAND_ERRORS, IntCounterVec::new(Opts::new("chat_command_errors_total", "Command errors by name and code"), &["command", "error"]));
    register!(CONNECTED_SOCKETS, IntGauge::new("chat_connected_sockets", "Sockets registered on this instance"));
    register!(EVENTS_DROPPED, IntCounter::new("chat_events_dropped_total", "Events dropped on full socket queues"));
    register!(CONSISTENCY_FAILURES, IntCounterVec::new(Opts::new("chat_consistency_failures_total", "Transport/store divergences"), &["kind", "op"]));
    register!(BUS_REQUESTS, IntCounterVec::new(Opts::new("chat_bus_requests_total", "Bus requests by kind and status"), &["kind", "status"]));
    register!(LOCK_WAIT, Histogram::with_opts(
        HistogramOpts::new("chat_lock_wait_seconds", "Time spent acquiring the per-user lock")
            .buckets(vec![0.0001, 0.001, 0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 10.0])));
    register!(LOCK_TIMEOUTS, IntCounter::new("chat_lock_timeouts_total", "Lock acquisitions that timed out"));
    register!(LOCKS_LOST, IntCounter::new("chat_locks_lost_total", "Locks released after expiry or takeover"));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Recording helpers
// ============================================================================

/// Record a command execution with latency.
#[inline]
pub fn record_command(command: &str, duration_secs: f64) {
    if let Some(c) = COMMAND_COUNTER.get() {
        c.with_label_values(&[command]).inc();
    }
    if let Some(h) = COMMAND_LATENCY.get() {
        h.with_label_values(&[command]).observe(duration_secs);
    }
}

/// Record a command error.
#[inline]
pub fn record_command_error(command: &str, error: &str) {
    if let Some(c) = COMMAND_ERRORS.get() {
        c.with_label_values(&[command, error]).inc();
    }
}

#[inline]
pub fn socket_registered() {
    if let Some(g) = CONNECTED_SOCKETS.get() {
        g.inc();
    }
}

#[inline]
pub fn socket_unregistered() {
    if let Some(g) = CONNECTED_SOCKETS.get() {
        g.dec();
    }
}

#[inline]
pub fn record_event_dropped() {
    if let Some(c) = EVENTS_DROPPED.get() {
        c.inc();
    }
}

/// Record a consistency failure; `kind` is `store` or `transport`.
#[inline]
pub fn record_consistency_failure(kind: &str, op: &str) {
    if let Some(c) = CONSISTENCY_FAILURES.get() {
        c.with_label_values(&[kind, op]).inc();
    }
}

#[inline]
pub fn record_bus_request(kind: &str, complete: bool) {
    let status = if complete { "acked" } else { "partial" };
    if let Some(c) = BUS_REQUESTS.get() {
        c.with_label_values(&[kind, status]).inc();
    }
}

#[inline]
pub fn record_lock_wait(duration_secs: f64) {
    if let Some(h) = LOCK_WAIT.get() {
        h.observe(duration_secs);
    }
}

#[inline]
pub fn record_lock_timeout() {
    if let Some(c) = LOCK_TIMEOUTS.get() {
        c.inc();
    }
}

#[inline]
pub fn record_lock_lost() {
    if let Some(c) = LOCKS_LOST.get() {
        c.inc();
    }
}
