//! Out-of-band reporting of transport/store divergence.
//!
//! A consistency failure never fails the operation that found it. It is
//! logged, counted and published on the server event channel for whoever
//! monitors the instance.

use crate::error::ChatError;
use crate::state::SocketId;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// Which side disagrees with the intended state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OpType {
    /// Transport channel membership differs from the store.
    TransportChannel,
    /// A store write sequence stopped halfway.
    Store,
}

/// Context attached to a consistency failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInfo {
    /// Filled in by the reporting session.
    pub user_name: String,
    pub op_type: OpType,
    pub op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<SocketId>,
}

impl OperationInfo {
    pub fn transport(op: &'static str) -> Self {
        Self::new(OpType::TransportChannel, op)
    }

    pub fn store(op: &'static str) -> Self {
        Self::new(OpType::Store, op)
    }

    fn new(op_type: OpType, op: &'static str) -> Self {
        Self {
            user_name: String::new(),
            op_type,
            op,
            room_name: None,
            socket_id: None,
        }
    }

    pub fn room(mut self, room: &str) -> Self {
        self.room_name = Some(room.to_string());
        self
    }

    pub fn socket(mut self, socket: &str) -> Self {
        self.socket_id = Some(socket.to_string());
        self
    }
}

/// Events an instance publishes to its operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    StoreConsistencyFailure { error: ChatError, info: OperationInfo },
    TransportConsistencyFailure { error: ChatError, info: OperationInfo },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StoreConsistencyFailure { .. } => "storeConsistencyFailure",
            Self::TransportConsistencyFailure { .. } => "transportConsistencyFailure",
        }
    }

    pub fn error(&self) -> &ChatError {
        match self {
            Self::StoreConsistencyFailure { error, .. } | Self::TransportConsistencyFailure { error, .. } => error,
        }
    }

    pub fn info(&self) -> &OperationInfo {
        match self {
            Self::StoreConsistencyFailure { info, .. } | Self::TransportConsistencyFailure { info, .. } => info,
        }
    }
}

/// Publish a consistency failure for `user_name`.
pub fn consistency_failure(
    events: &broadcast::Sender<ServerEvent>,
    user_name: &str,
    error: ChatError,
    mut info: OperationInfo,
) {
    info.user_name = user_name.to_string();
    let (kind, event) = match info.op_type {
        OpType::TransportChannel => (
            "transport",
            ServerEvent::TransportConsistencyFailure { error, info },
        ),
        OpType::Store => ("store", ServerEvent::StoreConsistencyFailure { error, info }),
    };
    let info = event.info();
    crate::metrics::record_consistency_failure(kind, info.op);
    warn!(
        user = %info.user_name,
        op = info.op,
        room = info.room_name.as_deref(),
        socket = info.socket_id.as_deref(),
        error = %event.error(),
        event = event.name(),
        "Consistency failure"
    );
    // No subscribers is fine.
    let _ = events.send(event);
}
