//! Direct and room messaging, access lists and room management.

use super::{CommandOptions, UserCtx};
use crate::error::ChatError;
use crate::network::Event;
use crate::session::echo_channel;
use crate::state::{ChatMessage, DirectAccess, Room, UserSeen, now_millis};
use crate::validation::validate_name;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Direct message ids stay within the integer range JSON clients handle.
const MESSAGE_ID_MASK: u64 = (1 << 53) - 1;

/// Reply of `roomHistoryInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryInfo {
    pub history_max_get_messages: usize,
    pub history_max_size: usize,
    pub history_size: usize,
    pub last_message_id: u64,
}

pub(crate) struct Messaging {
    ctx: Arc<UserCtx>,
}

impl Messaging {
    pub(crate) fn new(ctx: Arc<UserCtx>) -> Self {
        Self { ctx }
    }

    pub(crate) fn direct_access(&self) -> DirectAccess {
        DirectAccess::new(self.ctx.core.store.clone(), &self.ctx.name)
    }

    async fn room(&self, name: &str) -> Result<Room, ChatError> {
        Room::load(&self.ctx.core.store, name).await
    }

    fn check_rooms_management(&self, bypass: bool) -> Result<(), ChatError> {
        if self.ctx.core.config.enable_rooms_management || bypass {
            Ok(())
        } else {
            Err(ChatError::NotAllowed)
        }
    }

    // ------------------------------------------------------------------
    // Direct messages
    // ------------------------------------------------------------------

    pub(crate) async fn direct_message(
        &self,
        recipient: &str,
        mut msg: ChatMessage,
        options: &CommandOptions,
    ) -> Result<ChatMessage, ChatError> {
        let core = &self.ctx.core;
        if !core.config.enable_direct_messages {
            return Err(ChatError::NotAllowed);
        }
        validate_name(recipient)?;
        msg.process(&self.ctx.name, Some(now_millis()));
        msg.id = Some(rand::random::<u64>() & MESSAGE_ID_MASK);

        if !core.store.user_exists(recipient).await? {
            return Err(ChatError::NoUser(recipient.to_string()));
        }
        DirectAccess::new(core.store.clone(), recipient)
            .check_message_from(&self.ctx.name, options.bypass_permissions)
            .await?;
        if core.store.user_sockets(recipient).await?.is_empty() {
            return Err(ChatError::NoUserOnline(recipient.to_string()));
        }

        let payload = serde_json::to_value(&msg)?;
        core.emit(
            &echo_channel(recipient),
            None,
            Event::new("directMessage", vec![payload.clone()]),
        )
        .await;
        self.ctx
            .emit_echo(
                options.socket.as_deref(),
                Event::new("directMessageEcho", vec![json!(recipient), payload]),
            )
            .await;
        Ok(msg)
    }

    // ------------------------------------------------------------------
    // Room management
    // ------------------------------------------------------------------

    pub(crate) async fn room_create(&self, room: &str, whitelist_only: bool, bypass: bool) -> Result<(), ChatError> {
        self.check_rooms_management(bypass)?;
        validate_name(room)?;
        let created = self
            .ctx
            .core
            .store
            .add_room(room, Some(&self.ctx.name), whitelist_only)
            .await?;
        if !created {
            return Err(ChatError::RoomExists(room.to_string()));
        }
        info!(user = %self.ctx.name, room = %room, whitelist_only, "Room created");
        Ok(())
    }

    /// Mark the room as removing and return its members for eviction.
    pub(crate) async fn start_room_removal(&self, room: &str, bypass: bool) -> Result<Vec<String>, ChatError> {
        self.check_rooms_management(bypass)?;
        let loaded = self.room(room).await?;
        loaded.check_is_owner(&self.ctx.name, bypass).await?;
        if !self.ctx.core.store.set_room_removing(room).await? {
            return Err(ChatError::NoRoom(room.to_string()));
        }
        loaded.users().await
    }

    pub(crate) async fn finish_room_removal(&self, room: &str) -> Result<(), ChatError> {
        self.ctx.core.store.remove_room(room).await?;
        info!(user = %self.ctx.name, room = %room, "Room deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Room access lists
    // ------------------------------------------------------------------

    /// Returns the members that lost access.
    pub(crate) async fn room_add_to_list(
        &self,
        room: &str,
        list: &str,
        values: &[String],
        bypass: bool,
    ) -> Result<Vec<String>, ChatError> {
        let evicted = self
            .room(room)
            .await?
            .add_to_list(&self.ctx.name, list, values, bypass)
            .await?;
        if self.ctx.core.config.enable_access_lists_updates {
            let event = Event::new("roomAccessListAdded", vec![json!(room), json!(list), json!(values)]);
            self.ctx.core.emit(room, None, event).await;
        }
        Ok(evicted)
    }

    pub(crate) async fn room_remove_from_list(
        &self,
        room: &str,
        list: &str,
        values: &[String],
        bypass: bool,
    ) -> Result<Vec<String>, ChatError> {
        let evicted = self
            .room(room)
            .await?
            .remove_from_list(&self.ctx.name, list, values, bypass)
            .await?;
        if self.ctx.core.config.enable_access_lists_updates {
            let event = Event::new("roomAccessListRemoved", vec![json!(room), json!(list), json!(values)]);
            self.ctx.core.emit(room, None, event).await;
        }
        Ok(evicted)
    }

    pub(crate) async fn room_set_whitelist_mode(&self, room: &str, mode: bool, bypass: bool) -> Result<Vec<String>, ChatError> {
        let evicted = self
            .room(room)
            .await?
            .change_mode(&self.ctx.name, mode, bypass)
            .await?;
        if self.ctx.core.config.enable_access_lists_updates {
            let event = Event::new("roomModeChanged", vec![json!(room), json!(mode)]);
            self.ctx.core.emit(room, None, event).await;
        }
        Ok(evicted)
    }

    pub(crate) async fn room_get_access_list(&self, room: &str, list: &str, bypass: bool) -> Result<Vec<String>, ChatError> {
        self.room(room).await?.get_list(&self.ctx.name, list, bypass).await
    }

    pub(crate) async fn room_get_owner(&self, room: &str, bypass: bool) -> Result<Option<String>, ChatError> {
        self.room(room).await?.get_owner(&self.ctx.name, bypass).await
    }

    pub(crate) async fn room_get_whitelist_mode(&self, room: &str, bypass: bool) -> Result<bool, ChatError> {
        self.room(room).await?.get_mode(&self.ctx.name, bypass).await
    }

    // ------------------------------------------------------------------
    // Room messages and history
    // ------------------------------------------------------------------

    pub(crate) async fn room_message(&self, room: &str, mut msg: ChatMessage, bypass: bool) -> Result<u64, ChatError> {
        let config = &self.ctx.core.config;
        let loaded = self.room(room).await?;
        msg.process(&self.ctx.name, None);
        let stored = loaded
            .message(&self.ctx.name, msg, bypass, config.history_max_size)
            .await?;
        let id = stored
            .id
            .ok_or_else(|| ChatError::Internal("stored message without id".into()))?;
        debug!(user = %self.ctx.name, room = %room, id, "Room message");

        let event = Event::new("roomMessage", vec![json!(room), serde_json::to_value(&stored)?]);
        self.ctx.core.emit(room, None, event).await;
        Ok(id)
    }

    pub(crate) async fn room_recent_history(&self, room: &str, bypass: bool) -> Result<Vec<ChatMessage>, ChatError> {
        let limit = self.ctx.core.config.history_max_get_messages;
        self.room(room)
            .await?
            .recent_messages(&self.ctx.name, bypass, limit)
            .await
    }

    pub(crate) async fn room_history_get(
        &self,
        room: &str,
        after: u64,
        limit: usize,
        bypass: bool,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let limit = limit.min(self.ctx.core.config.history_max_get_messages);
        self.room(room)
            .await?
            .messages_after(&self.ctx.name, after, limit, bypass)
            .await
    }

    pub(crate) async fn room_history_info(&self, room: &str, bypass: bool) -> Result<HistoryInfo, ChatError> {
        let config = &self.ctx.core.config;
        let stats = self.room(room).await?.history_stats(&self.ctx.name, bypass).await?;
        Ok(HistoryInfo {
            history_max_get_messages: config.history_max_get_messages,
            history_max_size: config.history_max_size,
            history_size: stats.size,
            last_message_id: stats.last_message_id,
        })
    }

    pub(crate) async fn room_user_seen(&self, room: &str, user: &str, bypass: bool) -> Result<UserSeen, ChatError> {
        validate_name(user)?;
        self.room(room).await?.user_seen(&self.ctx.name, user, bypass).await
    }
}
