//! Unified error handling for slchatd.
//!
//! Every RPC handler resolves with a typed value or exactly one [`ChatError`].
//! Collaborator failures (store, bus, transport) are folded into this closed
//! taxonomy before they reach a caller.

use serde_json::{Value, json};
use thiserror::Error;

// ============================================================================
// Chat Errors (command processing)
// ============================================================================

/// Errors observable by command callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("no such command: {0}")]
    NoCommand(String),

    /// The operation needs a bound socket (context is the command or `connection`).
    #[error("no socket: {0}")]
    NoSocket(String),

    #[error("user {0} is not online")]
    NoUserOnline(String),

    #[error("action is not allowed")]
    NotAllowed,

    #[error("no such room: {0}")]
    NoRoom(String),

    #[error("no such user: {0}")]
    NoUser(String),

    #[error("no such list: {0}")]
    NoList(String),

    #[error("not joined to room: {0}")]
    NotJoined(String),

    #[error("room {0} already exists")]
    RoomExists(String),

    #[error("wrong arguments count: expected {expected}, got {got}")]
    WrongArgumentsCount { expected: usize, got: usize },

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("timed out acquiring lock for {0}")]
    LockTimeout(String),

    /// The lock expired or was taken over before release.
    #[error("lock lost for {0}")]
    LockLost(String),

    #[error("cluster bus timeout: {acked} of {expected} instances acknowledged")]
    BusTimeout { expected: usize, acked: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Get a static error code string for metrics labeling and the wire form.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "invalidName",
            Self::NoCommand(_) => "noCommand",
            Self::NoSocket(_) => "noSocket",
            Self::NoUserOnline(_) => "noUserOnline",
            Self::NotAllowed => "notAllowed",
            Self::NoRoom(_) => "noRoom",
            Self::NoUser(_) => "noUser",
            Self::NoList(_) => "noList",
            Self::NotJoined(_) => "notJoined",
            Self::RoomExists(_) => "roomExists",
            Self::WrongArgumentsCount { .. } => "wrongArgumentsCount",
            Self::BadArgument(_) => "badArgument",
            Self::StoreUnavailable(_) => "storeUnavailable",
            Self::LockTimeout(_) => "lockTimeout",
            Self::LockLost(_) => "lockLost",
            Self::BusTimeout { .. } => "busTimeout",
            Self::Internal(_) => "internalError",
        }
    }

    /// Arguments carried alongside the error code on the wire.
    fn wire_args(&self) -> Vec<Value> {
        match self {
            Self::InvalidName(s)
            | Self::NoCommand(s)
            | Self::NoSocket(s)
            | Self::NoUserOnline(s)
            | Self::NoRoom(s)
            | Self::NoUser(s)
            | Self::NoList(s)
            | Self::NotJoined(s)
            | Self::RoomExists(s)
            | Self::BadArgument(s)
            | Self::StoreUnavailable(s)
            | Self::LockTimeout(s)
            | Self::LockLost(s)
            | Self::Internal(s) => vec![json!(s)],
            Self::WrongArgumentsCount { expected, got } => vec![json!(expected), json!(got)],
            Self::BusTimeout { expected, acked } => vec![json!(expected), json!(acked)],
            Self::NotAllowed => Vec::new(),
        }
    }

    /// Convert to the structured form sent back to RPC callers.
    pub fn to_wire(&self) -> Value {
        json!({ "name": self.error_code(), "args": self.wire_args() })
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Result type for command handlers; handlers may resolve several values.
pub type HandlerResult = Result<Vec<Value>, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ChatError::NotAllowed.error_code(), "notAllowed");
        assert_eq!(ChatError::NoSocket("roomJoin".into()).error_code(), "noSocket");
        assert_eq!(ChatError::Internal("x".into()).error_code(), "internalError");
    }

    #[test]
    fn test_wire_form() {
        let wire = ChatError::NoSocket("connection".into()).to_wire();
        assert_eq!(wire, json!({ "name": "noSocket", "args": ["connection"] }));

        let wire = ChatError::NotAllowed.to_wire();
        assert_eq!(wire["args"], json!([]));

        let wire = ChatError::BusTimeout { expected: 2, acked: 1 }.to_wire();
        assert_eq!(wire["args"], json!([2, 1]));
    }
}
