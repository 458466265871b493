//! State management module.
//!
//! Contains the store adapter contract, the in-memory store, and the
//! room/direct access-control logic layered over it.

pub mod access;
mod memory;
mod message;
mod room;
pub mod store;

pub use access::{DirectAccess, RoomListName, parse_direct_list};
pub use memory::MemoryStore;
pub use message::{ChatMessage, now_millis};
pub use room::Room;
pub use store::{
    AccessList, AccessTarget, HistoryStats, InstanceId, JoinCounts, RoomLeft, RoomMeta, SocketId,
    SocketOwner, SocketRecord, SocketRemoval, Store, StoreError, StoreResult, UserSeen,
};
