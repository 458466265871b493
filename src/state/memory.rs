//! In-process implementation of the [`Store`] contract.
//!
//! Socket and room associations live behind one mutex so each composite
//! operation (for example removing a socket together with all its room
//! joins) is atomic. Rooms, access lists and locks are keyed tables in
//! `DashMap`s, atomic per key.
//!
//! Several instances in one process share a single `MemoryStore` to form a
//! cluster; this is how the integration tests run.

use crate::state::store::{
    AccessList, AccessTarget, HistoryStats, JoinCounts, RoomLeft, RoomMeta, SocketId,
    SocketOwner, SocketRecord, SocketRemoval, Store, StoreError, StoreResult, UserSeen,
};
use crate::state::ChatMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Associations {
    socket_owner: HashMap<SocketId, SocketOwner>,
    /// user → socket → instance
    user_sockets: HashMap<String, HashMap<SocketId, String>>,
    /// socket → room → logical join count
    socket_rooms: HashMap<SocketId, HashMap<String, u32>>,
    /// (user, room) → sockets joined
    user_room_sockets: HashMap<(String, String), HashSet<SocketId>>,
    /// Every user that ever registered a socket.
    known_users: HashSet<String>,
}

impl Associations {
    fn joined_count(&self, user: &str, room: &str) -> usize {
        self.user_room_sockets
            .get(&(user.to_string(), room.to_string()))
            .map_or(0, HashSet::len)
    }

    fn detach_from_room(&mut self, user: &str, socket: &str, room: &str) -> usize {
        let key = (user.to_string(), room.to_string());
        let remaining = match self.user_room_sockets.get_mut(&key) {
            Some(sockets) => {
                sockets.remove(socket);
                sockets.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.user_room_sockets.remove(&key);
        }
        remaining
    }

    fn instance_of(&self, user: &str, socket: &str) -> String {
        self.user_sockets
            .get(user)
            .and_then(|sockets| sockets.get(socket))
            .cloned()
            .or_else(|| self.socket_owner.get(socket).map(|o| o.instance_id.clone()))
            .unwrap_or_default()
    }
}

#[derive(Debug)]
struct RoomRecord {
    meta: RoomMeta,
    users: BTreeSet<String>,
    seen: HashMap<String, UserSeen>,
    history: VecDeque<ChatMessage>,
    last_message_id: u64,
}

#[derive(Debug, Default)]
struct AccessRecord {
    lists: HashMap<AccessList, BTreeSet<String>>,
    whitelist_only: bool,
}

#[derive(Debug)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// Shared in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    assoc: Mutex<Associations>,
    rooms: DashMap<String, RoomRecord>,
    access: DashMap<AccessTarget, AccessRecord>,
    locks: DashMap<String, LockEntry>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `Unavailable` (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// True when no socket, room join or lock is recorded.
    pub fn is_quiescent(&self) -> bool {
        let assoc = self.assoc.lock();
        assoc.socket_owner.is_empty()
            && assoc.user_sockets.is_empty()
            && assoc.socket_rooms.is_empty()
            && assoc.user_room_sockets.is_empty()
            && self.locks.is_empty()
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_socket(&self, socket: &str, user: &str, instance: &str) -> StoreResult<()> {
        self.check()?;
        self.assoc.lock().socket_owner.insert(
            socket.to_string(),
            SocketOwner {
                user_name: user.to_string(),
                instance_id: instance.to_string(),
            },
        );
        Ok(())
    }

    async fn socket_owner(&self, socket: &str) -> StoreResult<Option<SocketOwner>> {
        self.check()?;
        Ok(self.assoc.lock().socket_owner.get(socket).cloned())
    }

    async fn remove_socket(&self, socket: &str) -> StoreResult<()> {
        self.check()?;
        self.assoc.lock().socket_owner.remove(socket);
        Ok(())
    }

    async fn user_add_socket(&self, user: &str, socket: &str, instance: &str) -> StoreResult<usize> {
        self.check()?;
        let mut assoc = self.assoc.lock();
        assoc.known_users.insert(user.to_string());
        let sockets = assoc.user_sockets.entry(user.to_string()).or_default();
        sockets.insert(socket.to_string(), instance.to_string());
        Ok(sockets.len())
    }

    async fn user_exists(&self, user: &str) -> StoreResult<bool> {
        self.check()?;
        if self.assoc.lock().known_users.contains(user) {
            return Ok(true);
        }
        Ok(self.access.contains_key(&AccessTarget::User(user.to_string())))
    }

    async fn user_sockets(&self, user: &str) -> StoreResult<Vec<SocketRecord>> {
        self.check()?;
        let assoc = self.assoc.lock();
        let mut records: Vec<SocketRecord> = assoc
            .user_sockets
            .get(user)
            .map(|sockets| {
                sockets
                    .iter()
                    .map(|(socket_id, instance_id)| SocketRecord {
                        socket_id: socket_id.clone(),
                        instance_id: instance_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        records.sort();
        Ok(records)
    }

    async fn user_sockets_to_rooms(&self, user: &str) -> StoreResult<BTreeMap<SocketId, Vec<String>>> {
        self.check()?;
        let assoc = self.assoc.lock();
        let mut map = BTreeMap::new();
        if let Some(sockets) = assoc.user_sockets.get(user) {
            for socket in sockets.keys() {
                let mut rooms: Vec<String> = assoc
                    .socket_rooms
                    .get(socket)
                    .map(|rooms| rooms.keys().cloned().collect())
                    .unwrap_or_default();
                rooms.sort();
                map.insert(socket.clone(), rooms);
            }
        }
        Ok(map)
    }

    async fn user_remove_socket(&self, user: &str, socket: &str) -> StoreResult<SocketRemoval> {
        self.check()?;
        let mut assoc = self.assoc.lock();
        let (was_registered, connected) = match assoc.user_sockets.get_mut(user) {
            Some(sockets) => (sockets.remove(socket).is_some(), sockets.len()),
            None => (false, 0),
        };
        if connected == 0 {
            assoc.user_sockets.remove(user);
        }
        let mut rooms: Vec<String> = assoc
            .socket_rooms
            .remove(socket)
            .map(|rooms| rooms.into_keys().collect())
            .unwrap_or_default();
        rooms.sort();
        let rooms = rooms
            .into_iter()
            .map(|room_name| {
                let joined_sockets = assoc.detach_from_room(user, socket, &room_name);
                RoomLeft {
                    room_name,
                    joined_sockets,
                }
            })
            .collect();
        Ok(SocketRemoval {
            was_registered,
            rooms,
            connected,
        })
    }

    async fn socket_join_room(&self, user: &str, socket: &str, room: &str) -> StoreResult<JoinCounts> {
        self.check()?;
        let mut assoc = self.assoc.lock();
        let refs = assoc
            .socket_rooms
            .entry(socket.to_string())
            .or_default()
            .entry(room.to_string())
            .or_insert(0);
        *refs += 1;
        let socket_refs = *refs;
        let sockets = assoc
            .user_room_sockets
            .entry((user.to_string(), room.to_string()))
            .or_default();
        sockets.insert(socket.to_string());
        Ok(JoinCounts {
            socket_refs,
            joined_sockets: sockets.len(),
        })
    }

    async fn socket_leave_room(
        &self,
        user: &str,
        socket: &str,
        room: &str,
    ) -> StoreResult<Option<JoinCounts>> {
        self.check()?;
        let mut assoc = self.assoc.lock();
        let Some(rooms) = assoc.socket_rooms.get_mut(socket) else {
            return Ok(None);
        };
        let Some(refs) = rooms.get_mut(room) else {
            return Ok(None);
        };
        *refs -= 1;
        let socket_refs = *refs;
        if socket_refs == 0 {
            rooms.remove(room);
            if rooms.is_empty() {
                assoc.socket_rooms.remove(socket);
            }
            let joined_sockets = assoc.detach_from_room(user, socket, room);
            return Ok(Some(JoinCounts {
                socket_refs,
                joined_sockets,
            }));
        }
        Ok(Some(JoinCounts {
            socket_refs,
            joined_sockets: assoc.joined_count(user, room),
        }))
    }

    async fn user_leave_room(&self, user: &str, room: &str) -> StoreResult<Vec<SocketRecord>> {
        self.check()?;
        let mut assoc = self.assoc.lock();
        let sockets = assoc
            .user_room_sockets
            .remove(&(user.to_string(), room.to_string()))
            .unwrap_or_default();
        let mut removed = Vec::with_capacity(sockets.len());
        for socket in sockets {
            if let Some(rooms) = assoc.socket_rooms.get_mut(&socket) {
                rooms.remove(room);
                if rooms.is_empty() {
                    assoc.socket_rooms.remove(&socket);
                }
            }
            let instance_id = assoc.instance_of(user, &socket);
            removed.push(SocketRecord {
                socket_id: socket,
                instance_id,
            });
        }
        removed.sort();
        Ok(removed)
    }

    async fn add_room(&self, room: &str, owner: Option<&str>, whitelist_only: bool) -> StoreResult<bool> {
        self.check()?;
        match self.rooms.entry(room.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(RoomRecord {
                    meta: RoomMeta {
                        owner: owner.map(str::to_string),
                        removing: false,
                    },
                    users: BTreeSet::new(),
                    seen: HashMap::new(),
                    history: VecDeque::new(),
                    last_message_id: 0,
                });
                self.access.insert(
                    AccessTarget::Room(room.to_string()),
                    AccessRecord {
                        lists: HashMap::new(),
                        whitelist_only,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn room_meta(&self, room: &str) -> StoreResult<Option<RoomMeta>> {
        self.check()?;
        Ok(self.rooms.get(room).map(|r| r.meta.clone()))
    }

    async fn set_room_removing(&self, room: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(match self.rooms.get_mut(room) {
            Some(mut record) => {
                record.meta.removing = true;
                true
            }
            None => false,
        })
    }

    async fn remove_room(&self, room: &str) -> StoreResult<()> {
        self.check()?;
        self.rooms.remove(room);
        self.access.remove(&AccessTarget::Room(room.to_string()));
        Ok(())
    }

    async fn room_add_user(&self, room: &str, user: &str, now: i64) -> StoreResult<bool> {
        self.check()?;
        Ok(match self.rooms.get_mut(room) {
            Some(mut record) => {
                record.seen.insert(
                    user.to_string(),
                    UserSeen {
                        joined: true,
                        timestamp: Some(now),
                    },
                );
                record.users.insert(user.to_string())
            }
            None => false,
        })
    }

    async fn room_remove_user(&self, room: &str, user: &str, now: i64) -> StoreResult<bool> {
        self.check()?;
        Ok(match self.rooms.get_mut(room) {
            Some(mut record) => {
                let removed = record.users.remove(user);
                if removed {
                    record.seen.insert(
                        user.to_string(),
                        UserSeen {
                            joined: false,
                            timestamp: Some(now),
                        },
                    );
                }
                removed
            }
            None => false,
        })
    }

    async fn room_users(&self, room: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        Ok(self
            .rooms
            .get(room)
            .map(|r| r.users.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn room_user_seen(&self, room: &str, user: &str) -> StoreResult<UserSeen> {
        self.check()?;
        Ok(self
            .rooms
            .get(room)
            .and_then(|r| r.seen.get(user).copied())
            .unwrap_or_default())
    }

    async fn list_add(&self, target: &AccessTarget, list: AccessList, values: &[String]) -> StoreResult<()> {
        self.check()?;
        let mut record = self.access.entry(target.clone()).or_default();
        record
            .lists
            .entry(list)
            .or_default()
            .extend(values.iter().cloned());
        Ok(())
    }

    async fn list_remove(&self, target: &AccessTarget, list: AccessList, values: &[String]) -> StoreResult<()> {
        self.check()?;
        if let Some(mut record) = self.access.get_mut(target)
            && let Some(entries) = record.lists.get_mut(&list)
        {
            for value in values {
                entries.remove(value);
            }
        }
        Ok(())
    }

    async fn list_get(&self, target: &AccessTarget, list: AccessList) -> StoreResult<Vec<String>> {
        self.check()?;
        Ok(self
            .access
            .get(target)
            .and_then(|r| r.lists.get(&list).map(|l| l.iter().cloned().collect()))
            .unwrap_or_default())
    }

    async fn list_contains(&self, target: &AccessTarget, list: AccessList, value: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self
            .access
            .get(target)
            .is_some_and(|r| r.lists.get(&list).is_some_and(|l| l.contains(value))))
    }

    async fn set_whitelist_only(&self, target: &AccessTarget, mode: bool) -> StoreResult<()> {
        self.check()?;
        self.access.entry(target.clone()).or_default().whitelist_only = mode;
        Ok(())
    }

    async fn whitelist_only(&self, target: &AccessTarget) -> StoreResult<bool> {
        self.check()?;
        Ok(self.access.get(target).is_some_and(|r| r.whitelist_only))
    }

    async fn history_push(
        &self,
        room: &str,
        mut msg: ChatMessage,
        max_size: usize,
        now: i64,
    ) -> StoreResult<Option<ChatMessage>> {
        self.check()?;
        let Some(mut record) = self.rooms.get_mut(room) else {
            return Ok(None);
        };
        record.last_message_id += 1;
        msg.id = Some(record.last_message_id);
        msg.timestamp = Some(now);
        record.history.push_back(msg.clone());
        while record.history.len() > max_size {
            record.history.pop_front();
        }
        Ok(Some(msg))
    }

    async fn history_recent(&self, room: &str, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        self.check()?;
        Ok(self
            .rooms
            .get(room)
            .map(|r| r.history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn history_after(&self, room: &str, after: u64, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        self.check()?;
        Ok(self
            .rooms
            .get(room)
            .map(|r| {
                r.history
                    .iter()
                    .filter(|m| m.id.is_some_and(|id| id > after))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn history_stats(&self, room: &str) -> StoreResult<HistoryStats> {
        self.check()?;
        Ok(self
            .rooms
            .get(room)
            .map(|r| HistoryStats {
                size: r.history.len(),
                last_message_id: r.last_message_id,
            })
            .unwrap_or_default())
    }

    async fn lock_acquire(&self, resource: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let claim = LockEntry {
            token: token.to_string(),
            expires_at: now + ttl,
        };
        Ok(match self.locks.entry(resource.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(claim);
                true
            }
            Entry::Occupied(mut entry) if entry.get().expires_at <= now => {
                entry.insert(claim);
                true
            }
            Entry::Occupied(_) => false,
        })
    }

    async fn lock_release(&self, resource: &str, token: &str) -> StoreResult<bool> {
        self.check()?;
        let removed = self.locks.remove_if(resource, |_, entry| entry.token == token);
        Ok(removed.is_some_and(|(_, entry)| entry.expires_at > Instant::now()))
    }
}
