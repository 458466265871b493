//! Integration test common infrastructure.
//!
//! Provides an in-process cluster: several chat instances sharing one store
//! and one bus hub, each with its own transport, plus helpers to read the
//! events a socket receives.

pub mod store;

#[allow(unused_imports)]
pub use store::InstrumentedStore;

use serde_json::Value;
use slchatd::config::ServiceConfig;
use slchatd::network::{Event, MemoryTransport};
use slchatd::server::ChatServer;
use slchatd::sync::BusHub;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Per-socket event queue depth used by the tests.
const EVENT_QUEUE: usize = 64;

/// One instance of the test cluster.
pub struct TestInstance {
    pub server: Arc<ChatServer>,
    pub transport: Arc<MemoryTransport>,
}

impl TestInstance {
    /// Open a transport connection and register it for `user`.
    pub async fn connect(&self, user: &str, socket: &str) -> mpsc::Receiver<Arc<Event>> {
        let rx = self.transport.connect(socket);
        let nconnected = self
            .server
            .register_socket(user, socket)
            .await
            .expect("socket registration");
        assert!(nconnected >= 1);
        rx
    }

    /// Run a command on a registered socket.
    pub async fn cmd(&self, socket: &str, command: &str, args: Vec<Value>) -> slchatd::HandlerResult {
        self.server.dispatch(socket, command, args).await
    }
}

/// Instances sharing a store and a bus hub.
pub struct TestCluster {
    pub store: Arc<InstrumentedStore>,
    pub hub: BusHub,
    pub instances: Vec<TestInstance>,
}

impl TestCluster {
    pub fn new(size: usize, config: ServiceConfig) -> Self {
        let store = Arc::new(InstrumentedStore::new());
        let hub = BusHub::new();
        let instances = (0..size)
            .map(|i| {
                let transport = Arc::new(MemoryTransport::new(EVENT_QUEUE));
                let (bus, inbox) = hub.attach(&format!("instance-{i}"), 256);
                let server = ChatServer::new(
                    config.clone(),
                    store.clone(),
                    transport.clone(),
                    Arc::new(bus),
                    inbox,
                );
                TestInstance {
                    server: Arc::new(server),
                    transport,
                }
            })
            .collect();
        Self { store, hub, instances }
    }

    /// A single instance with every feature enabled.
    pub fn single() -> Self {
        Self::new(1, test_config())
    }

    pub fn instance(&self, index: usize) -> &TestInstance {
        &self.instances[index]
    }
}

/// Every feature on, short timeouts.
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        bus_ack_timeout_ms: 200,
        lock_acquire_timeout_ms: 5000,
        lock_retry_delay_ms: 5,
        ..ServiceConfig::permissive()
    }
}

/// Everything currently queued for a socket.
pub fn drain(rx: &mut mpsc::Receiver<Arc<Event>>) -> Vec<Arc<Event>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Names of everything currently queued for a socket.
pub fn drain_names(rx: &mut mpsc::Receiver<Arc<Event>>) -> Vec<String> {
    drain(rx).into_iter().map(|e| e.name.clone()).collect()
}

/// Wait for the next event named `name`, skipping others.
pub async fn expect_event(rx: &mut mpsc::Receiver<Arc<Event>>, name: &str) -> Arc<Event> {
    let wait = async {
        while let Some(event) = rx.recv().await {
            if event.name == name {
                return Some(event);
            }
        }
        None
    };
    match tokio::time::timeout(Duration::from_secs(2), wait).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream closed before {name}"),
        Err(_) => panic!("timed out waiting for {name}"),
    }
}

/// Wait until the event stream ends (connection closed).
pub async fn expect_closed(rx: &mut mpsc::Receiver<Arc<Event>>) {
    let wait = async { while rx.recv().await.is_some() {} };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("connection should be closed");
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
