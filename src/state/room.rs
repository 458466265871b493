//! Room permissions, access lists and history.
//!
//! A [`Room`] is a snapshot of the room metadata plus a handle to the store.
//! All membership changes go through the session layer; this type only
//! answers permission questions and edits the room's own records.

use crate::error::ChatError;
use crate::state::access::RoomListName;
use crate::state::message::now_millis;
use crate::state::store::{AccessList, AccessTarget, HistoryStats, RoomMeta, Store, UserSeen};
use crate::state::ChatMessage;
use crate::validation::validate_names;
use std::sync::Arc;

pub struct Room {
    name: String,
    meta: RoomMeta,
    target: AccessTarget,
    store: Arc<dyn Store>,
}

impl Room {
    /// Load a room; rooms being removed are reported as missing.
    pub async fn load(store: &Arc<dyn Store>, name: &str) -> Result<Self, ChatError> {
        match store.room_meta(name).await? {
            Some(meta) if !meta.removing => Ok(Self {
                name: name.to_string(),
                meta,
                target: AccessTarget::Room(name.to_string()),
                store: store.clone(),
            }),
            _ => Err(ChatError::NoRoom(name.to_string())),
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.meta.owner.as_deref()
    }

    fn is_owner(&self, user: &str) -> bool {
        self.owner() == Some(user)
    }

    pub async fn is_admin(&self, user: &str) -> Result<bool, ChatError> {
        if self.is_owner(user) {
            return Ok(true);
        }
        Ok(self
            .store
            .list_contains(&self.target, AccessList::Adminlist, user)
            .await?)
    }

    /// Whether `user` may be in the room under the current lists and mode.
    pub async fn has_access(&self, user: &str) -> Result<bool, ChatError> {
        if self.is_admin(user).await? {
            return Ok(true);
        }
        if self
            .store
            .list_contains(&self.target, AccessList::Blacklist, user)
            .await?
        {
            return Ok(false);
        }
        if self.store.whitelist_only(&self.target).await? {
            return Ok(self
                .store
                .list_contains(&self.target, AccessList::Whitelist, user)
                .await?);
        }
        Ok(true)
    }

    pub async fn check_join(&self, user: &str) -> Result<(), ChatError> {
        if self.has_access(user).await? {
            Ok(())
        } else {
            Err(ChatError::NotAllowed)
        }
    }

    pub async fn check_is_owner(&self, author: &str, bypass: bool) -> Result<(), ChatError> {
        if bypass || self.is_owner(author) {
            Ok(())
        } else {
            Err(ChatError::NotAllowed)
        }
    }

    async fn check_read(&self, author: &str, bypass: bool) -> Result<(), ChatError> {
        if bypass || self.has_access(author).await? {
            Ok(())
        } else {
            Err(ChatError::NotAllowed)
        }
    }

    async fn check_list_changes(
        &self,
        author: &str,
        list: &str,
        bypass: bool,
    ) -> Result<AccessList, ChatError> {
        let list = match RoomListName::parse(list)? {
            RoomListName::Stored(list) => list,
            RoomListName::Userlist => return Err(ChatError::NotAllowed),
        };
        if bypass || self.is_owner(author) {
            return Ok(list);
        }
        if list == AccessList::Adminlist || !self.is_admin(author).await? {
            return Err(ChatError::NotAllowed);
        }
        Ok(list)
    }

    async fn check_mode_change(&self, author: &str, bypass: bool) -> Result<(), ChatError> {
        if bypass || self.is_admin(author).await? {
            Ok(())
        } else {
            Err(ChatError::NotAllowed)
        }
    }

    /// Members among `candidates` that no longer have access.
    async fn members_without_access(&self, candidates: &[String]) -> Result<Vec<String>, ChatError> {
        let members = self.store.room_users(&self.name).await?;
        let mut evicted = Vec::new();
        for user in members.iter().filter(|m| candidates.contains(m)) {
            if !self.has_access(user).await? {
                evicted.push(user.clone());
            }
        }
        Ok(evicted)
    }

    /// Add values to a list; returns members that lost access.
    pub async fn add_to_list(
        &self,
        author: &str,
        list: &str,
        values: &[String],
        bypass: bool,
    ) -> Result<Vec<String>, ChatError> {
        let list = self.check_list_changes(author, list, bypass).await?;
        validate_names(values)?;
        self.store.list_add(&self.target, list, values).await?;
        self.members_without_access(values).await
    }

    /// Remove values from a list; returns members that lost access.
    pub async fn remove_from_list(
        &self,
        author: &str,
        list: &str,
        values: &[String],
        bypass: bool,
    ) -> Result<Vec<String>, ChatError> {
        let list = self.check_list_changes(author, list, bypass).await?;
        validate_names(values)?;
        self.store.list_remove(&self.target, list, values).await?;
        self.members_without_access(values).await
    }

    /// Switch whitelist mode; returns members that lost access.
    pub async fn change_mode(&self, author: &str, mode: bool, bypass: bool) -> Result<Vec<String>, ChatError> {
        self.check_mode_change(author, bypass).await?;
        self.store.set_whitelist_only(&self.target, mode).await?;
        if !mode {
            return Ok(Vec::new());
        }
        let members = self.store.room_users(&self.name).await?;
        self.members_without_access(&members).await
    }

    pub async fn get_list(&self, author: &str, list: &str, bypass: bool) -> Result<Vec<String>, ChatError> {
        let list = RoomListName::parse(list)?;
        self.check_read(author, bypass).await?;
        match list {
            RoomListName::Userlist => self.users().await,
            RoomListName::Stored(list) => Ok(self.store.list_get(&self.target, list).await?),
        }
    }

    pub async fn get_owner(&self, author: &str, bypass: bool) -> Result<Option<String>, ChatError> {
        self.check_read(author, bypass).await?;
        Ok(self.meta.owner.clone())
    }

    pub async fn get_mode(&self, author: &str, bypass: bool) -> Result<bool, ChatError> {
        self.check_read(author, bypass).await?;
        Ok(self.store.whitelist_only(&self.target).await?)
    }

    pub async fn users(&self) -> Result<Vec<String>, ChatError> {
        Ok(self.store.room_users(&self.name).await?)
    }

    /// Store a message from `author`; the author must be a member.
    pub async fn message(
        &self,
        author: &str,
        msg: ChatMessage,
        bypass: bool,
        history_max_size: usize,
    ) -> Result<ChatMessage, ChatError> {
        if !bypass && !self.users().await?.iter().any(|u| u == author) {
            return Err(ChatError::NotJoined(self.name.clone()));
        }
        self.store
            .history_push(&self.name, msg, history_max_size, now_millis())
            .await?
            .ok_or_else(|| ChatError::NoRoom(self.name.clone()))
    }

    pub async fn recent_messages(
        &self,
        author: &str,
        bypass: bool,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.check_read(author, bypass).await?;
        Ok(self.store.history_recent(&self.name, limit).await?)
    }

    pub async fn messages_after(
        &self,
        author: &str,
        after: u64,
        limit: usize,
        bypass: bool,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.check_read(author, bypass).await?;
        Ok(self.store.history_after(&self.name, after, limit).await?)
    }

    pub async fn history_stats(&self, author: &str, bypass: bool) -> Result<HistoryStats, ChatError> {
        self.check_read(author, bypass).await?;
        Ok(self.store.history_stats(&self.name).await?)
    }

    pub async fn user_seen(&self, author: &str, user: &str, bypass: bool) -> Result<UserSeen, ChatError> {
        self.check_read(author, bypass).await?;
        Ok(self.store.room_user_seen(&self.name, user).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn room_with_members(whitelist_only: bool, members: &[&str]) -> (Arc<dyn Store>, Room) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.add_room("lobby", Some("owner"), whitelist_only).await.unwrap();
        for member in members {
            store.room_add_user("lobby", member, 1).await.unwrap();
        }
        let room = Room::load(&store, "lobby").await.unwrap();
        (store, room)
    }

    #[tokio::test]
    async fn missing_and_removing_rooms() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        assert_eq!(Room::load(&store, "none").await.err(), Some(ChatError::NoRoom("none".into())));
        store.add_room("old", None, false).await.unwrap();
        store.set_room_removing("old").await.unwrap();
        assert_eq!(Room::load(&store, "old").await.err(), Some(ChatError::NoRoom("old".into())));
    }

    #[tokio::test]
    async fn blacklisting_members_evicts_them() {
        let (_, room) = room_with_members(false, &["bob", "carol"]).await;
        let evicted = room
            .add_to_list("owner", "blacklist", &names(&["bob", "dave"]), false)
            .await
            .unwrap();
        assert_eq!(evicted, names(&["bob"]));
        assert_eq!(room.check_join("bob").await, Err(ChatError::NotAllowed));
        assert!(room.check_join("carol").await.is_ok());
    }

    #[tokio::test]
    async fn whitelist_mode_evicts_non_whitelisted() {
        let (_, room) = room_with_members(false, &["bob", "carol", "owner"]).await;
        room.add_to_list("owner", "whitelist", &names(&["carol"]), false)
            .await
            .unwrap();
        let evicted = room.change_mode("owner", true, false).await.unwrap();
        assert_eq!(evicted, names(&["bob"]));
        assert!(room.get_mode("carol", false).await.unwrap());
    }

    #[tokio::test]
    async fn list_change_permissions() {
        let (_, room) = room_with_members(false, &[]).await;
        room.add_to_list("owner", "adminlist", &names(&["admin"]), false)
            .await
            .unwrap();

        // admins manage whitelist/blacklist but not the adminlist
        assert!(room.add_to_list("admin", "whitelist", &names(&["x"]), false).await.is_ok());
        assert_eq!(
            room.add_to_list("admin", "adminlist", &names(&["x"]), false).await,
            Err(ChatError::NotAllowed)
        );
        assert_eq!(
            room.add_to_list("stranger", "whitelist", &names(&["x"]), false).await,
            Err(ChatError::NotAllowed)
        );
        assert!(room.add_to_list("stranger", "whitelist", &names(&["y"]), true).await.is_ok());
        assert_eq!(
            room.add_to_list("owner", "userlist", &names(&["x"]), false).await,
            Err(ChatError::NotAllowed)
        );
        assert_eq!(
            room.add_to_list("owner", "nolist", &names(&["x"]), false).await,
            Err(ChatError::NoList("nolist".into()))
        );
        assert_eq!(room.change_mode("stranger", true, false).await, Err(ChatError::NotAllowed));
    }

    #[tokio::test]
    async fn reads_require_access() {
        let (_, room) = room_with_members(false, &["bob"]).await;
        room.add_to_list("owner", "blacklist", &names(&["eve"]), false)
            .await
            .unwrap();
        assert_eq!(room.get_owner("eve", false).await, Err(ChatError::NotAllowed));
        assert_eq!(room.get_owner("eve", true).await, Ok(Some("owner".into())));
        assert_eq!(room.get_list("bob", "userlist", false).await, Ok(names(&["bob"])));
        assert_eq!(room.get_list("bob", "blacklist", false).await, Ok(names(&["eve"])));
    }

    #[tokio::test]
    async fn messages_require_membership() {
        let (_, room) = room_with_members(false, &["bob"]).await;
        assert_eq!(
            room.message("carol", ChatMessage::text("hi"), false, 10).await,
            Err(ChatError::NotJoined("lobby".into()))
        );
        let stored = room
            .message("bob", ChatMessage::text("hi"), false, 10)
            .await
            .unwrap();
        assert_eq!(stored.id, Some(1));
        assert!(stored.timestamp.is_some());
        let stats = room.history_stats("bob", false).await.unwrap();
        assert_eq!(stats.last_message_id, 1);
    }
}
