//! The state store adapter contract.
//!
//! Every method is atomic on its own. Nothing spans two calls: a sequence of
//! store operations can stop halfway, and the session layer is responsible
//! for re-validating and reporting when that happens.

use crate::error::ChatError;
use crate::state::ChatMessage;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Opaque transport connection id.
pub type SocketId = String;

/// Cluster-unique server instance id.
pub type InstanceId = String;

/// Store adapter failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(detail) => ChatError::StoreUnavailable(detail),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A socket together with the instance serving it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketRecord {
    pub socket_id: SocketId,
    pub instance_id: InstanceId,
}

/// Who owns a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOwner {
    pub user_name: String,
    pub instance_id: InstanceId,
}

/// Association counters after a socket joins or leaves a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinCounts {
    /// Logical joins of this socket to the room still outstanding.
    pub socket_refs: u32,
    /// Sockets of the user joined to the room.
    pub joined_sockets: usize,
}

/// A room a removed socket was joined to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomLeft {
    pub room_name: String,
    /// Sockets of the user still joined to the room.
    pub joined_sockets: usize,
}

/// Outcome of removing a socket from a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketRemoval {
    /// Whether the socket was registered for the user.
    pub was_registered: bool,
    pub rooms: Vec<RoomLeft>,
    /// Sockets the user still has connected across the cluster.
    pub connected: usize,
}

/// Room metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMeta {
    pub owner: Option<String>,
    /// Set while the room is being deleted; no new joins are accepted.
    pub removing: bool,
}

/// Whose access list an operation refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccessTarget {
    /// A user's personal (direct messaging) lists.
    User(String),
    Room(String),
}

impl fmt::Display for AccessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(name) => write!(f, "user:{name}"),
            Self::Room(name) => write!(f, "room:{name}"),
        }
    }
}

/// Persisted access lists. The room `userlist` is derived, not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessList {
    Adminlist,
    Whitelist,
    Blacklist,
}

impl AccessList {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adminlist => "adminlist",
            Self::Whitelist => "whitelist",
            Self::Blacklist => "blacklist",
        }
    }
}

/// Last join/leave observation of a user in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UserSeen {
    pub joined: bool,
    pub timestamp: Option<i64>,
}

/// Size counters of a room's message history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryStats {
    pub size: usize,
    pub last_message_id: u64,
}

/// Shared state store.
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Socket ownership
    // ------------------------------------------------------------------

    /// Record `socket → (user, instance)`.
    async fn add_socket(&self, socket: &str, user: &str, instance: &str) -> StoreResult<()>;

    async fn socket_owner(&self, socket: &str) -> StoreResult<Option<SocketOwner>>;

    async fn remove_socket(&self, socket: &str) -> StoreResult<()>;

    // ------------------------------------------------------------------
    // User sockets
    // ------------------------------------------------------------------

    /// Add a socket to the user's socket set; returns the connected count.
    async fn user_add_socket(&self, user: &str, socket: &str, instance: &str) -> StoreResult<usize>;

    async fn user_sockets(&self, user: &str) -> StoreResult<Vec<SocketRecord>>;

    /// True once the user has registered a socket or owns an access record.
    async fn user_exists(&self, user: &str) -> StoreResult<bool>;

    /// Map of the user's sockets to the rooms each is joined to.
    async fn user_sockets_to_rooms(&self, user: &str) -> StoreResult<BTreeMap<SocketId, Vec<String>>>;

    /// Remove a socket from the user together with all its room joins.
    async fn user_remove_socket(&self, user: &str, socket: &str) -> StoreResult<SocketRemoval>;

    // ------------------------------------------------------------------
    // Socket × room
    // ------------------------------------------------------------------

    /// Add one logical join of `socket` to `room`.
    async fn socket_join_room(&self, user: &str, socket: &str, room: &str) -> StoreResult<JoinCounts>;

    /// Drop one logical join. `None` when the socket was not joined.
    async fn socket_leave_room(
        &self,
        user: &str,
        socket: &str,
        room: &str,
    ) -> StoreResult<Option<JoinCounts>>;

    /// Remove every socket of the user from the room; returns the sockets removed.
    async fn user_leave_room(&self, user: &str, room: &str) -> StoreResult<Vec<SocketRecord>>;

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Create a room; returns false if it already exists.
    async fn add_room(&self, room: &str, owner: Option<&str>, whitelist_only: bool) -> StoreResult<bool>;

    async fn room_meta(&self, room: &str) -> StoreResult<Option<RoomMeta>>;

    /// Mark a room as removing; returns false if the room does not exist.
    async fn set_room_removing(&self, room: &str) -> StoreResult<bool>;

    /// Remove a room with its lists, members and history.
    async fn remove_room(&self, room: &str) -> StoreResult<()>;

    /// Add a member; returns false if already a member.
    async fn room_add_user(&self, room: &str, user: &str, now: i64) -> StoreResult<bool>;

    /// Remove a member; returns false if not a member.
    async fn room_remove_user(&self, room: &str, user: &str, now: i64) -> StoreResult<bool>;

    async fn room_users(&self, room: &str) -> StoreResult<Vec<String>>;

    async fn room_user_seen(&self, room: &str, user: &str) -> StoreResult<UserSeen>;

    // ------------------------------------------------------------------
    // Access lists
    // ------------------------------------------------------------------

    async fn list_add(&self, target: &AccessTarget, list: AccessList, values: &[String]) -> StoreResult<()>;

    async fn list_remove(&self, target: &AccessTarget, list: AccessList, values: &[String]) -> StoreResult<()>;

    async fn list_get(&self, target: &AccessTarget, list: AccessList) -> StoreResult<Vec<String>>;

    async fn list_contains(&self, target: &AccessTarget, list: AccessList, value: &str) -> StoreResult<bool>;

    async fn set_whitelist_only(&self, target: &AccessTarget, mode: bool) -> StoreResult<()>;

    async fn whitelist_only(&self, target: &AccessTarget) -> StoreResult<bool>;

    // ------------------------------------------------------------------
    // Room history
    // ------------------------------------------------------------------

    /// Append a message, assigning its id and timestamp and trimming the
    /// history to `max_size`. `None` when the room does not exist.
    async fn history_push(
        &self,
        room: &str,
        msg: ChatMessage,
        max_size: usize,
        now: i64,
    ) -> StoreResult<Option<ChatMessage>>;

    /// Newest messages first.
    async fn history_recent(&self, room: &str, limit: usize) -> StoreResult<Vec<ChatMessage>>;

    /// Messages with ids greater than `after`, oldest first.
    async fn history_after(&self, room: &str, after: u64, limit: usize) -> StoreResult<Vec<ChatMessage>>;

    async fn history_stats(&self, room: &str) -> StoreResult<HistoryStats>;

    // ------------------------------------------------------------------
    // Lock primitives
    // ------------------------------------------------------------------

    /// Claim `resource` for `token` unless a live claim exists.
    async fn lock_acquire(&self, resource: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Release the claim; false when the claim expired or belongs to another token.
    async fn lock_release(&self, resource: &str, token: &str) -> StoreResult<bool>;
}
