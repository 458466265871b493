//! The transport contract and the in-process transport.
//!
//! A transport owns the live connections of one instance and their channel
//! memberships. Nothing here is cluster-wide: peers reach another instance's
//! connections only through the cluster bus.

use crate::error::ChatError;
use crate::state::SocketId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// A server-to-client event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub name: String,
    pub args: Vec<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            args,
        })
    }
}

/// Transport failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("no connection for socket {0}")]
    NoConnection(SocketId),
    #[error("channel operation failed: {0}")]
    Channel(String),
}

impl From<TransportError> for ChatError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NoConnection(_) => ChatError::NoSocket("connection".to_string()),
            TransportError::Channel(detail) => ChatError::Internal(detail),
        }
    }
}

/// Per-instance transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the connection object for `socket` still exists.
    fn connection_exists(&self, socket: &str) -> bool;

    async fn disconnect_client(&self, socket: &str) -> Result<(), TransportError>;

    async fn join_channel(&self, socket: &str, channel: &str) -> Result<(), TransportError>;

    async fn leave_channel(&self, socket: &str, channel: &str) -> Result<(), TransportError>;

    fn is_joined(&self, socket: &str, channel: &str) -> bool;

    /// Deliver to every local socket in `channel`; returns the delivery count.
    fn emit_to_channel(&self, channel: &str, event: Arc<Event>) -> usize {
        self.send_to_channel(None, channel, event)
    }

    /// Deliver to every local socket in `channel` except `exclude`.
    fn send_to_channel(&self, exclude: Option<&str>, channel: &str, event: Arc<Event>) -> usize;

    fn local_sockets(&self) -> Vec<SocketId>;
}

struct Connection {
    tx: mpsc::Sender<Arc<Event>>,
    channels: HashSet<String>,
}

/// Transport backed by bounded in-process queues, one per socket.
pub struct MemoryTransport {
    queue_depth: usize,
    connections: DashMap<SocketId, Connection>,
    channels: DashMap<String, HashSet<SocketId>>,
    failing: AtomicBool,
}

impl MemoryTransport {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth,
            connections: DashMap::new(),
            channels: DashMap::new(),
            failing: AtomicBool::new(false),
        }
    }

    /// Open a connection and return its event stream.
    pub fn connect(&self, socket: &str) -> mpsc::Receiver<Arc<Event>> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.connections.insert(
            socket.to_string(),
            Connection {
                tx,
                channels: HashSet::new(),
            },
        );
        rx
    }

    /// Make channel join/leave operations fail (or recover).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Sockets currently in `channel`.
    pub fn channel_members(&self, channel: &str) -> Vec<SocketId> {
        let mut members: Vec<SocketId> = self
            .channels
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    fn check_failing(&self) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TransportError::Channel("transport switched to failing".into()))
        } else {
            Ok(())
        }
    }

    fn detach_channel(&self, socket: &str, channel: &str) {
        let empty = match self.channels.get_mut(channel) {
            Some(mut members) => {
                members.remove(socket);
                members.is_empty()
            }
            None => false,
        };
        if empty {
            self.channels.remove_if(channel, |_, members| members.is_empty());
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn connection_exists(&self, socket: &str) -> bool {
        self.connections.contains_key(socket)
    }

    async fn disconnect_client(&self, socket: &str) -> Result<(), TransportError> {
        // Dropping the sender ends the connection's event stream.
        let Some((_, conn)) = self.connections.remove(socket) else {
            return Ok(());
        };
        for channel in &conn.channels {
            self.detach_channel(socket, channel);
        }
        debug!(socket = %socket, "Transport connection closed");
        Ok(())
    }

    async fn join_channel(&self, socket: &str, channel: &str) -> Result<(), TransportError> {
        self.check_failing()?;
        match self.connections.get_mut(socket) {
            Some(mut conn) => {
                conn.channels.insert(channel.to_string());
            }
            None => return Err(TransportError::NoConnection(socket.to_string())),
        }
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(socket.to_string());
        Ok(())
    }

    async fn leave_channel(&self, socket: &str, channel: &str) -> Result<(), TransportError> {
        self.check_failing()?;
        if let Some(mut conn) = self.connections.get_mut(socket) {
            conn.channels.remove(channel);
        }
        self.detach_channel(socket, channel);
        Ok(())
    }

    fn is_joined(&self, socket: &str, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|members| members.contains(socket))
    }

    fn send_to_channel(&self, exclude: Option<&str>, channel: &str, event: Arc<Event>) -> usize {
        // Snapshot membership first so no channel shard lock is held while
        // touching connection shards.
        let members = self.channel_members(channel);
        let mut delivered = 0;
        for socket in members.iter().filter(|s| Some(s.as_str()) != exclude) {
            let Some(conn) = self.connections.get(socket) else {
                continue;
            };
            match conn.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    crate::metrics::record_event_dropped();
                    debug!(socket = %socket, event = %event.name, "Event queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(socket = %socket, event = %event.name, "Event stream closed");
                }
            }
        }
        delivered
    }

    fn local_sockets(&self) -> Vec<SocketId> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn channel_delivery_and_exclusion() {
        let transport = MemoryTransport::new(8);
        let mut rx1 = transport.connect("s1");
        let mut rx2 = transport.connect("s2");
        transport.join_channel("s1", "echo:alice").await.unwrap();
        transport.join_channel("s2", "echo:alice").await.unwrap();

        let event = Event::new("systemMessage", vec![json!("hi")]);
        assert_eq!(transport.send_to_channel(Some("s1"), "echo:alice", event.clone()), 1);
        assert_eq!(rx2.recv().await.unwrap(), event);
        assert!(rx1.try_recv().is_err());

        assert_eq!(transport.emit_to_channel("echo:alice", event), 2);
    }

    #[tokio::test]
    async fn disconnect_drops_memberships() {
        let transport = MemoryTransport::new(8);
        let mut rx = transport.connect("s1");
        transport.join_channel("s1", "lobby").await.unwrap();
        assert!(transport.is_joined("s1", "lobby"));

        transport.disconnect_client("s1").await.unwrap();
        assert!(!transport.connection_exists("s1"));
        assert!(!transport.is_joined("s1", "lobby"));
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            transport.join_channel("s1", "lobby").await,
            Err(TransportError::NoConnection(_))
        ));
    }

    #[tokio::test]
    async fn full_queue_drops_events() {
        let transport = MemoryTransport::new(1);
        let _rx = transport.connect("s1");
        transport.join_channel("s1", "lobby").await.unwrap();
        let event = Event::new("roomMessage", Vec::new());
        assert_eq!(transport.emit_to_channel("lobby", event.clone()), 1);
        assert_eq!(transport.emit_to_channel("lobby", event), 0);
    }

    #[tokio::test]
    async fn failing_switch() {
        let transport = MemoryTransport::new(1);
        let _rx = transport.connect("s1");
        transport.set_failing(true);
        assert!(transport.join_channel("s1", "lobby").await.is_err());
        transport.set_failing(false);
        assert!(transport.join_channel("s1", "lobby").await.is_ok());
    }
}
