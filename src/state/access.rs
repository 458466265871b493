//! Access list names and the per-user direct messaging permissions.

use crate::error::ChatError;
use crate::state::store::{AccessList, AccessTarget, Store};
use crate::validation::validate_names;
use std::sync::Arc;

/// A list name as accepted by the room list commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomListName {
    Stored(AccessList),
    /// Current members; readable, never writable.
    Userlist,
}

impl RoomListName {
    pub fn parse(name: &str) -> Result<Self, ChatError> {
        match name {
            "adminlist" => Ok(Self::Stored(AccessList::Adminlist)),
            "whitelist" => Ok(Self::Stored(AccessList::Whitelist)),
            "blacklist" => Ok(Self::Stored(AccessList::Blacklist)),
            "userlist" => Ok(Self::Userlist),
            other => Err(ChatError::NoList(other.to_string())),
        }
    }
}

/// Parse a direct messaging list name (`whitelist` or `blacklist`).
pub fn parse_direct_list(name: &str) -> Result<AccessList, ChatError> {
    match name {
        "whitelist" => Ok(AccessList::Whitelist),
        "blacklist" => Ok(AccessList::Blacklist),
        other => Err(ChatError::NoList(other.to_string())),
    }
}

/// Direct messaging permissions of one user.
pub struct DirectAccess {
    user_name: String,
    target: AccessTarget,
    store: Arc<dyn Store>,
}

impl DirectAccess {
    pub fn new(store: Arc<dyn Store>, user_name: &str) -> Self {
        Self {
            user_name: user_name.to_string(),
            target: AccessTarget::User(user_name.to_string()),
            store,
        }
    }

    /// Check that `author` may send a direct message to this user.
    pub async fn check_message_from(&self, author: &str, bypass: bool) -> Result<(), ChatError> {
        if author == self.user_name {
            return Err(ChatError::NotAllowed);
        }
        if bypass {
            return Ok(());
        }
        if self
            .store
            .list_contains(&self.target, AccessList::Blacklist, author)
            .await?
        {
            return Err(ChatError::NotAllowed);
        }
        if self.store.whitelist_only(&self.target).await?
            && !self
                .store
                .list_contains(&self.target, AccessList::Whitelist, author)
                .await?
        {
            return Err(ChatError::NotAllowed);
        }
        Ok(())
    }

    pub async fn add_to_list(&self, list: &str, values: &[String]) -> Result<(), ChatError> {
        let list = parse_direct_list(list)?;
        validate_names(values)?;
        Ok(self.store.list_add(&self.target, list, values).await?)
    }

    pub async fn remove_from_list(&self, list: &str, values: &[String]) -> Result<(), ChatError> {
        let list = parse_direct_list(list)?;
        validate_names(values)?;
        Ok(self.store.list_remove(&self.target, list, values).await?)
    }

    pub async fn get_list(&self, list: &str) -> Result<Vec<String>, ChatError> {
        let list = parse_direct_list(list)?;
        Ok(self.store.list_get(&self.target, list).await?)
    }

    pub async fn get_mode(&self) -> Result<bool, ChatError> {
        Ok(self.store.whitelist_only(&self.target).await?)
    }

    pub async fn set_mode(&self, mode: bool) -> Result<(), ChatError> {
        Ok(self.store.set_whitelist_only(&self.target, mode).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn parses_list_names() {
        assert_eq!(RoomListName::parse("userlist"), Ok(RoomListName::Userlist));
        assert_eq!(
            RoomListName::parse("adminlist"),
            Ok(RoomListName::Stored(AccessList::Adminlist))
        );
        assert_eq!(RoomListName::parse("mutelist"), Err(ChatError::NoList("mutelist".into())));
        assert_eq!(parse_direct_list("adminlist"), Err(ChatError::NoList("adminlist".into())));
    }

    #[tokio::test]
    async fn blacklist_and_whitelist_mode() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let bob = DirectAccess::new(store, "bob");

        assert!(bob.check_message_from("alice", false).await.is_ok());
        assert_eq!(bob.check_message_from("bob", true).await, Err(ChatError::NotAllowed));

        bob.add_to_list("blacklist", &names(&["alice"])).await.unwrap();
        assert_eq!(bob.check_message_from("alice", false).await, Err(ChatError::NotAllowed));
        assert!(bob.check_message_from("alice", true).await.is_ok());

        bob.remove_from_list("blacklist", &names(&["alice"])).await.unwrap();
        bob.set_mode(true).await.unwrap();
        assert!(bob.get_mode().await.unwrap());
        assert_eq!(bob.check_message_from("alice", false).await, Err(ChatError::NotAllowed));

        bob.add_to_list("whitelist", &names(&["alice"])).await.unwrap();
        assert!(bob.check_message_from("alice", false).await.is_ok());
        assert_eq!(bob.get_list("whitelist").await.unwrap(), names(&["alice"]));
    }

    #[tokio::test]
    async fn rejects_invalid_values() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let bob = DirectAccess::new(store, "bob");
        assert_eq!(
            bob.add_to_list("whitelist", &names(&["a:b"])).await,
            Err(ChatError::InvalidName("a:b".into()))
        );
        assert_eq!(
            bob.get_list("userlist").await,
            Err(ChatError::NoList("userlist".into()))
        );
    }
}
