//! User sessions: one user's view of the cluster.
//!
//! A [`UserSession`] is cheap to create and holds no state of its own beyond
//! the user name; everything lives in the store, the instance transport and
//! the per-socket bindings. It is composed of three parts:
//!
//! - [`SocketRegistry`](sockets::SocketRegistry): socket registration,
//!   removal and instance-wide disconnects
//! - [`RoomMembership`](membership::RoomMembership): socket joins and leaves,
//!   and eviction of users that lost access to a room
//! - [`Messaging`](messaging::Messaging): direct and room messages, access
//!   lists, room management and history
//!
//! Mutations of a user's socket and room associations run under that user's
//! distributed lock. Divergence discovered along the way is reported through
//! [`consistency_failure`] and never fails the command.

mod consistency;
mod membership;
mod messaging;
mod sockets;

pub use consistency::{OpType, OperationInfo, ServerEvent, consistency_failure};
pub use messaging::HistoryInfo;

use crate::error::{ChatError, HandlerResult};
use crate::network::{Event, TransportError};
use crate::server::ServerCore;
use crate::state::{ChatMessage, SocketId, StoreResult, UserSeen};
use crate::sync::LockGuard;
use membership::RoomMembership;
use messaging::Messaging;
use serde_json::Value;
use sockets::SocketRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-user transport channel for echoes and system messages.
pub fn echo_channel(user_name: &str) -> String {
    format!("echo:{user_name}")
}

/// Per-call options of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// The socket the command arrived on.
    pub socket: Option<SocketId>,
    /// Skip ownership and access checks (privileged callers only).
    pub bypass_permissions: bool,
}

impl CommandOptions {
    pub fn for_socket(socket: &str) -> Self {
        Self {
            socket: Some(socket.to_string()),
            bypass_permissions: false,
        }
    }

    pub fn bypass() -> Self {
        Self {
            socket: None,
            bypass_permissions: true,
        }
    }

    /// The bound socket, or `NoSocket(command)`.
    pub fn require_socket(&self, command: &str) -> Result<&str, ChatError> {
        self.socket
            .as_deref()
            .ok_or_else(|| ChatError::NoSocket(command.to_string()))
    }
}

/// What every session part shares: the user and the instance.
pub(crate) struct UserCtx {
    pub(crate) name: String,
    pub(crate) echo_channel: String,
    pub(crate) core: Arc<ServerCore>,
}

impl UserCtx {
    pub(crate) fn new(core: Arc<ServerCore>, name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            echo_channel: echo_channel(name),
            core,
        })
    }

    pub(crate) fn report(&self, error: ChatError, info: OperationInfo) {
        consistency_failure(&self.core.events, &self.name, error, info);
    }

    /// Convert a store result of a later step, reporting the partial write.
    pub(crate) fn store_step<T>(&self, result: StoreResult<T>, info: OperationInfo) -> Result<T, ChatError> {
        result.map_err(|e| {
            let error = ChatError::from(e);
            self.report(error.clone(), info);
            error
        })
    }

    /// The command's socket, if it belongs to this user; `NoSocket(command)` otherwise.
    pub(crate) async fn own_socket<'a>(
        &self,
        options: &'a CommandOptions,
        command: &str,
    ) -> Result<&'a str, ChatError> {
        let socket = options.require_socket(command)?;
        let owner = match self.core.bindings.user_of(socket) {
            Some(user) => Some(user),
            None => self
                .core
                .store
                .socket_owner(socket)
                .await?
                .map(|owner| owner.user_name),
        };
        if owner.as_deref() == Some(self.name.as_str()) {
            Ok(socket)
        } else {
            Err(ChatError::NoSocket(command.to_string()))
        }
    }

    pub(crate) async fn lock(&self) -> Result<LockGuard, ChatError> {
        self.core.lock.acquire(&self.name).await
    }

    /// Release the user lock; a lost lock is reported, not returned.
    pub(crate) async fn unlock(&self, guard: LockGuard) {
        if let Err(error) = guard.release().await {
            self.report(error, OperationInfo::store("userLock"));
        }
    }

    /// Emit to this user's echo channel across the cluster.
    pub(crate) async fn emit_echo(&self, exclude: Option<&str>, event: Arc<Event>) {
        self.core.emit(&self.echo_channel, exclude, event).await;
    }

    /// Leave a local transport channel and verify the transport agrees.
    pub(crate) async fn leave_local_channel(&self, socket: &str, channel: &str, op: &'static str) {
        let transport = &self.core.transport;
        match transport.leave_channel(socket, channel).await {
            Ok(()) | Err(TransportError::NoConnection(_)) => {}
            Err(e) => {
                self.report(e.into(), OperationInfo::transport(op).room(channel).socket(socket));
                return;
            }
        }
        if transport.is_joined(socket, channel) {
            self.report(
                ChatError::Internal("socket still joined after leave".into()),
                OperationInfo::transport(op).room(channel).socket(socket),
            );
        }
    }
}

/// One user's command surface.
pub struct UserSession {
    ctx: Arc<UserCtx>,
    sockets: SocketRegistry,
    rooms: RoomMembership,
    messaging: Messaging,
}

impl UserSession {
    pub(crate) fn new(core: Arc<ServerCore>, name: &str) -> Self {
        let ctx = UserCtx::new(core, name);
        Self {
            sockets: SocketRegistry::new(ctx.clone()),
            rooms: RoomMembership::new(ctx.clone()),
            messaging: Messaging::new(ctx.clone()),
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn echo_channel(&self) -> &str {
        &self.ctx.echo_channel
    }

    /// Run an allow-listed command.
    pub async fn exec(&self, command: &str, options: &CommandOptions, args: Vec<Value>) -> HandlerResult {
        let registry = &self.ctx.core.registry;
        registry.dispatch(self, command, options, args).await
    }

    // ------------------------------------------------------------------
    // Sockets
    // ------------------------------------------------------------------

    /// Register a live transport connection for this user; returns the
    /// number of sockets the user has connected across the cluster.
    pub async fn register_socket(&self, socket: &str) -> Result<usize, ChatError> {
        self.sockets.register(socket).await
    }

    /// Drop a socket whose transport connection is gone.
    pub async fn remove_socket(&self, socket: &str) -> Result<(), ChatError> {
        self.sockets.remove(socket).await
    }

    /// Disconnect this user's sockets served by this instance.
    pub async fn disconnect_instance_sockets(&self) -> Result<(), ChatError> {
        self.sockets.disconnect_instance_sockets().await
    }

    /// Fail with `NoUserOnline` when the user has no socket anywhere.
    pub async fn check_online(&self) -> Result<(), ChatError> {
        self.sockets.check_online().await
    }

    pub async fn disconnect(&self, _reason: Option<String>, options: &CommandOptions) -> Result<(), ChatError> {
        let socket = self.ctx.own_socket(options, "disconnect").await?;
        self.sockets.remove_from_server(socket).await
    }

    pub async fn list_own_sockets(&self) -> Result<BTreeMap<SocketId, Vec<String>>, ChatError> {
        self.sockets.list_own_sockets().await
    }

    pub async fn system_message(&self, data: Value, options: &CommandOptions) -> Result<(), ChatError> {
        let event = Event::new("systemMessage", vec![data]);
        self.ctx.emit_echo(options.socket.as_deref(), event).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Room membership
    // ------------------------------------------------------------------

    /// Join the command's socket to a room; returns the user's joined socket count.
    pub async fn room_join(&self, room: &str, options: &CommandOptions) -> Result<usize, ChatError> {
        let socket = self.ctx.own_socket(options, "roomJoin").await?;
        self.rooms.join(socket, room).await
    }

    pub async fn room_leave(&self, room: &str, options: &CommandOptions) -> Result<usize, ChatError> {
        let socket = self.ctx.own_socket(options, "roomLeave").await?;
        self.rooms.leave(socket, room).await
    }

    // ------------------------------------------------------------------
    // Room management
    // ------------------------------------------------------------------

    pub async fn room_create(&self, room: &str, whitelist_only: bool, options: &CommandOptions) -> Result<(), ChatError> {
        self.messaging
            .room_create(room, whitelist_only, options.bypass_permissions)
            .await
    }

    /// Evict every member, then remove the room.
    pub async fn room_delete(&self, room: &str, options: &CommandOptions) -> Result<(), ChatError> {
        let members = self
            .messaging
            .start_room_removal(room, options.bypass_permissions)
            .await?;
        self.rooms.remove_room_users(room, members).await;
        self.messaging.finish_room_removal(room).await
    }

    pub async fn room_add_to_list(
        &self,
        room: &str,
        list: &str,
        values: Vec<String>,
        options: &CommandOptions,
    ) -> Result<(), ChatError> {
        let evicted = self
            .messaging
            .room_add_to_list(room, list, &values, options.bypass_permissions)
            .await?;
        self.rooms.remove_room_users(room, evicted).await;
        Ok(())
    }

    pub async fn room_remove_from_list(
        &self,
        room: &str,
        list: &str,
        values: Vec<String>,
        options: &CommandOptions,
    ) -> Result<(), ChatError> {
        let evicted = self
            .messaging
            .room_remove_from_list(room, list, &values, options.bypass_permissions)
            .await?;
        self.rooms.remove_room_users(room, evicted).await;
        Ok(())
    }

    /// Returns the evicted users and the new mode.
    pub async fn room_set_whitelist_mode(
        &self,
        room: &str,
        mode: bool,
        options: &CommandOptions,
    ) -> Result<(Vec<String>, bool), ChatError> {
        let evicted = self
            .messaging
            .room_set_whitelist_mode(room, mode, options.bypass_permissions)
            .await?;
        self.rooms.remove_room_users(room, evicted.clone()).await;
        Ok((evicted, mode))
    }

    pub async fn room_get_access_list(&self, room: &str, list: &str, options: &CommandOptions) -> Result<Vec<String>, ChatError> {
        self.messaging
            .room_get_access_list(room, list, options.bypass_permissions)
            .await
    }

    pub async fn room_get_owner(&self, room: &str, options: &CommandOptions) -> Result<Option<String>, ChatError> {
        self.messaging.room_get_owner(room, options.bypass_permissions).await
    }

    pub async fn room_get_whitelist_mode(&self, room: &str, options: &CommandOptions) -> Result<bool, ChatError> {
        self.messaging
            .room_get_whitelist_mode(room, options.bypass_permissions)
            .await
    }

    // ------------------------------------------------------------------
    // Room messages and history
    // ------------------------------------------------------------------

    /// Returns the id assigned to the message.
    pub async fn room_message(&self, room: &str, msg: ChatMessage, options: &CommandOptions) -> Result<u64, ChatError> {
        self.messaging
            .room_message(room, msg, options.bypass_permissions)
            .await
    }

    pub async fn room_recent_history(&self, room: &str, options: &CommandOptions) -> Result<Vec<ChatMessage>, ChatError> {
        self.messaging
            .room_recent_history(room, options.bypass_permissions)
            .await
    }

    pub async fn room_history_get(
        &self,
        room: &str,
        after: u64,
        limit: usize,
        options: &CommandOptions,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.messaging
            .room_history_get(room, after, limit, options.bypass_permissions)
            .await
    }

    pub async fn room_history_info(&self, room: &str, options: &CommandOptions) -> Result<HistoryInfo, ChatError> {
        self.messaging
            .room_history_info(room, options.bypass_permissions)
            .await
    }

    pub async fn room_user_seen(&self, room: &str, user: &str, options: &CommandOptions) -> Result<UserSeen, ChatError> {
        self.messaging
            .room_user_seen(room, user, options.bypass_permissions)
            .await
    }

    // ------------------------------------------------------------------
    // Direct messaging
    // ------------------------------------------------------------------

    pub async fn direct_message(
        &self,
        recipient: &str,
        msg: ChatMessage,
        options: &CommandOptions,
    ) -> Result<ChatMessage, ChatError> {
        self.messaging.direct_message(recipient, msg, options).await
    }

    pub async fn direct_add_to_list(&self, list: &str, values: Vec<String>) -> Result<(), ChatError> {
        self.messaging.direct_access().add_to_list(list, &values).await
    }

    pub async fn direct_remove_from_list(&self, list: &str, values: Vec<String>) -> Result<(), ChatError> {
        self.messaging.direct_access().remove_from_list(list, &values).await
    }

    pub async fn direct_get_access_list(&self, list: &str) -> Result<Vec<String>, ChatError> {
        self.messaging.direct_access().get_list(list).await
    }

    pub async fn direct_get_whitelist_mode(&self) -> Result<bool, ChatError> {
        self.messaging.direct_access().get_mode().await
    }

    pub async fn direct_set_whitelist_mode(&self, mode: bool) -> Result<(), ChatError> {
        self.messaging.direct_access().set_mode(mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_channel_name() {
        assert_eq!(echo_channel("alice"), "echo:alice");
    }

    #[test]
    fn socket_requirement() {
        assert_eq!(
            CommandOptions::default().require_socket("roomJoin"),
            Err(ChatError::NoSocket("roomJoin".into()))
        );
        assert_eq!(CommandOptions::for_socket("s1").require_socket("roomJoin"), Ok("s1"));
        assert!(CommandOptions::bypass().bypass_permissions);
    }
}
