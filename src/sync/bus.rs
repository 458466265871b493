//! Cluster bus: fan-out requests between instances.
//!
//! Two delivery modes exist. [`ClusterBus::publish`] is fire-and-forget and
//! carries channel emissions. [`ClusterBus::request`] expects every receiving
//! instance to perform a local action and acknowledge it; it resolves when all
//! acknowledgements arrived or the ack timeout elapsed, whichever comes first.
//! A shortfall is returned as a [`BusReport`], never retried here: redelivery
//! could repeat side effects on an instance that acted but acked late.

use crate::error::ChatError;
use crate::network::Event;
use crate::state::{InstanceId, SocketId};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Which instances a bus message is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceFilter {
    All,
    AllExcept(InstanceId),
    Only(Vec<InstanceId>),
}

impl InstanceFilter {
    pub fn matches(&self, instance: &str) -> bool {
        match self {
            Self::All => true,
            Self::AllExcept(excluded) => excluded != instance,
            Self::Only(ids) => ids.iter().any(|id| id == instance),
        }
    }
}

/// Actions one instance can ask of another.
#[derive(Debug, Clone)]
pub enum BusRequest {
    /// Remove local sockets from a room's transport channel.
    LeaveChannel { room: String, sockets: Vec<SocketId> },
    /// Disconnect local sockets.
    DisconnectSockets { sockets: Vec<SocketId> },
    /// Disconnect every local socket of a user.
    DisconnectUser { user: String },
    /// Emit an event to local members of a channel.
    Emit {
        channel: String,
        exclude: Option<SocketId>,
        event: Arc<Event>,
    },
}

impl BusRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LeaveChannel { .. } => "leaveChannel",
            Self::DisconnectSockets { .. } => "disconnectSockets",
            Self::DisconnectUser { .. } => "disconnectUser",
            Self::Emit { .. } => "emit",
        }
    }
}

/// A request as received by an instance.
#[derive(Debug)]
pub struct BusEnvelope {
    pub origin: InstanceId,
    pub request: BusRequest,
    ack: Option<oneshot::Sender<()>>,
}

impl BusEnvelope {
    pub fn wants_ack(&self) -> bool {
        self.ack.is_some()
    }

    /// Acknowledge the request; no-op for published messages.
    pub fn acknowledge(&mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }
}

/// Acknowledgement count of one bus request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusReport {
    pub expected: usize,
    pub acked: usize,
}

impl BusReport {
    pub fn is_complete(&self) -> bool {
        self.acked >= self.expected
    }

    /// `BusTimeout` when some instance did not acknowledge.
    pub fn check(&self) -> Result<(), ChatError> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(ChatError::BusTimeout {
                expected: self.expected,
                acked: self.acked,
            })
        }
    }
}

/// Cross-instance messaging.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    fn instance_id(&self) -> &str;

    /// Deliver without waiting for acknowledgements; returns the number of
    /// instances the message was handed to.
    async fn publish(&self, filter: InstanceFilter, request: BusRequest) -> usize;

    /// Deliver and collect acknowledgements for at most `ack_timeout`.
    async fn request(
        &self,
        filter: InstanceFilter,
        request: BusRequest,
        ack_timeout: Duration,
    ) -> Result<BusReport, ChatError>;
}

/// In-process bus connecting instances that share one process.
#[derive(Clone, Default)]
pub struct BusHub {
    inboxes: Arc<DashMap<InstanceId, mpsc::Sender<BusEnvelope>>>,
}

impl BusHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an instance; returns its bus handle and inbox.
    pub fn attach(&self, instance_id: &str, capacity: usize) -> (MemoryBus, mpsc::Receiver<BusEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.inboxes.insert(instance_id.to_string(), tx);
        let bus = MemoryBus {
            instance_id: instance_id.to_string(),
            hub: self.clone(),
        };
        (bus, rx)
    }

    pub fn detach(&self, instance_id: &str) {
        self.inboxes.remove(instance_id);
    }

    pub fn instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.inboxes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn targets(&self, filter: &InstanceFilter) -> Vec<(InstanceId, mpsc::Sender<BusEnvelope>)> {
        self.inboxes
            .iter()
            .filter(|e| filter.matches(e.key()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// One instance's handle on a [`BusHub`].
#[derive(Clone)]
pub struct MemoryBus {
    instance_id: InstanceId,
    hub: BusHub,
}

#[async_trait]
impl ClusterBus for MemoryBus {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish(&self, filter: InstanceFilter, request: BusRequest) -> usize {
        let mut delivered = 0;
        for (instance, tx) in self.hub.targets(&filter) {
            let envelope = BusEnvelope {
                origin: self.instance_id.clone(),
                request: request.clone(),
                ack: None,
            };
            match tx.try_send(envelope) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(instance = %instance, kind = request.kind(), error = %e, "Bus publish dropped");
                }
            }
        }
        delivered
    }

    async fn request(
        &self,
        filter: InstanceFilter,
        request: BusRequest,
        ack_timeout: Duration,
    ) -> Result<BusReport, ChatError> {
        let targets = self.hub.targets(&filter);
        let expected = targets.len();
        let deadline = Instant::now() + ack_timeout;

        let mut pending = FuturesUnordered::new();
        for (instance, tx) in targets {
            let (ack_tx, ack_rx) = oneshot::channel();
            let envelope = BusEnvelope {
                origin: self.instance_id.clone(),
                request: request.clone(),
                ack: Some(ack_tx),
            };
            match tokio::time::timeout_at(deadline, tx.send(envelope)).await {
                Ok(Ok(())) => pending.push(ack_rx),
                Ok(Err(_)) => warn!(instance = %instance, kind = request.kind(), "Bus inbox closed"),
                Err(_) => warn!(instance = %instance, kind = request.kind(), "Bus inbox full until ack timeout"),
            }
        }

        let mut acked = 0;
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(Ok(()))) => acked += 1,
                // receiver dropped the envelope without acknowledging
                Ok(Some(Err(_))) => {}
                Ok(None) | Err(_) => break,
            }
        }

        let report = BusReport { expected, acked };
        crate::metrics::record_bus_request(request.kind(), report.is_complete());
        if !report.is_complete() {
            warn!(
                kind = request.kind(),
                expected = report.expected,
                acked = report.acked,
                "Bus request not acknowledged by every instance"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_acker(mut rx: mpsc::Receiver<BusEnvelope>) {
        tokio::spawn(async move {
            while let Some(mut envelope) = rx.recv().await {
                envelope.acknowledge();
            }
        });
    }

    #[test]
    fn filters() {
        assert!(InstanceFilter::All.matches("a"));
        assert!(!InstanceFilter::AllExcept("a".into()).matches("a"));
        assert!(InstanceFilter::AllExcept("a".into()).matches("b"));
        assert!(InstanceFilter::Only(vec!["b".into()]).matches("b"));
        assert!(!InstanceFilter::Only(vec!["b".into()]).matches("c"));
    }

    #[tokio::test]
    async fn request_collects_acks() {
        let hub = BusHub::new();
        let (bus, _own) = hub.attach("a", 8);
        let (_, rx_b) = hub.attach("b", 8);
        let (_, rx_c) = hub.attach("c", 8);
        spawn_acker(rx_b);
        spawn_acker(rx_c);

        let report = bus
            .request(
                InstanceFilter::AllExcept("a".into()),
                BusRequest::DisconnectUser { user: "alice".into() },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(report, BusReport { expected: 2, acked: 2 });
        assert!(report.check().is_ok());
    }

    #[tokio::test]
    async fn silent_instance_times_out() {
        let hub = BusHub::new();
        let (bus, _own) = hub.attach("a", 8);
        let (_, rx_b) = hub.attach("b", 8);
        let (_, _rx_silent) = hub.attach("silent", 8);
        spawn_acker(rx_b);

        let started = Instant::now();
        let report = bus
            .request(
                InstanceFilter::AllExcept("a".into()),
                BusRequest::DisconnectSockets { sockets: vec!["s1".into()] },
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(report, BusReport { expected: 2, acked: 1 });
        assert_eq!(
            report.check(),
            Err(ChatError::BusTimeout { expected: 2, acked: 1 })
        );
    }

    #[tokio::test]
    async fn publish_skips_acks() {
        let hub = BusHub::new();
        let (bus, _own) = hub.attach("a", 8);
        let (_, mut rx_b) = hub.attach("b", 8);
        let event = Event::new("roomMessage", Vec::new());
        let delivered = bus
            .publish(
                InstanceFilter::AllExcept("a".into()),
                BusRequest::Emit { channel: "lobby".into(), exclude: None, event },
            )
            .await;
        assert_eq!(delivered, 1);
        let envelope = rx_b.recv().await.unwrap();
        assert!(!envelope.wants_ack());
        assert_eq!(envelope.origin, "a");

        hub.detach("b");
        assert_eq!(hub.instances(), vec!["a".to_string()]);
    }
}
