//! A store wrapper that watches the lock and can sabotage registration or
//! slow down room joins.

use async_trait::async_trait;
use parking_lot::Mutex;
use slchatd::network::{MemoryTransport, Transport};
use slchatd::state::{
    AccessList, AccessTarget, ChatMessage, HistoryStats, JoinCounts, MemoryStore, RoomMeta,
    SocketId, SocketOwner, SocketRecord, SocketRemoval, Store, StoreResult, UserSeen,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Delegates to a [`MemoryStore`], counting overlapping lock claims.
pub struct InstrumentedStore {
    pub inner: MemoryStore,
    holders: Mutex<HashMap<String, String>>,
    overlaps: AtomicUsize,
    acquisitions: AtomicUsize,
    vanish_on_add_socket: Mutex<Option<Arc<MemoryTransport>>>,
    join_delay: Mutex<Option<Duration>>,
}

impl InstrumentedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            holders: Mutex::new(HashMap::new()),
            overlaps: AtomicUsize::new(0),
            acquisitions: AtomicUsize::new(0),
            vanish_on_add_socket: Mutex::new(None),
            join_delay: Mutex::new(None),
        }
    }

    /// Times a lock was granted while another token held it.
    pub fn lock_overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn lock_acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Close the socket's transport connection right after its ownership
    /// record is written.
    pub fn vanish_connections_on_register(&self, transport: Arc<MemoryTransport>) {
        *self.vanish_on_add_socket.lock() = Some(transport);
    }

    /// Sleep before every socket room join.
    pub fn delay_room_joins(&self, delay: Duration) {
        *self.join_delay.lock() = Some(delay);
    }

    pub fn is_quiescent(&self) -> bool {
        self.inner.is_quiescent()
    }
}

#[async_trait]
impl Store for InstrumentedStore {
    async fn add_socket(&self, socket: &str, user: &str, instance: &str) -> StoreResult<()> {
        self.inner.add_socket(socket, user, instance).await?;
        let transport = self.vanish_on_add_socket.lock().clone();
        if let Some(transport) = transport {
            transport.disconnect_client(socket).await.expect("disconnect");
        }
        Ok(())
    }

    async fn socket_owner(&self, socket: &str) -> StoreResult<Option<SocketOwner>> {
        self.inner.socket_owner(socket).await
    }

    async fn remove_socket(&self, socket: &str) -> StoreResult<()> {
        self.inner.remove_socket(socket).await
    }

    async fn user_add_socket(&self, user: &str, socket: &str, instance: &str) -> StoreResult<usize> {
        self.inner.user_add_socket(user, socket, instance).await
    }

    async fn user_exists(&self, user: &str) -> StoreResult<bool> {
        self.inner.user_exists(user).await
    }

    async fn user_sockets(&self, user: &str) -> StoreResult<Vec<SocketRecord>> {
        self.inner.user_sockets(user).await
    }

    async fn user_sockets_to_rooms(&self, user: &str) -> StoreResult<BTreeMap<SocketId, Vec<String>>> {
        self.inner.user_sockets_to_rooms(user).await
    }

    async fn user_remove_socket(&self, user: &str, socket: &str) -> StoreResult<SocketRemoval> {
        self.inner.user_remove_socket(user, socket).await
    }

    async fn socket_join_room(&self, user: &str, socket: &str, room: &str) -> StoreResult<JoinCounts> {
        let delay = *self.join_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.socket_join_room(user, socket, room).await
    }

    async fn socket_leave_room(&self, user: &str, socket: &str, room: &str) -> StoreResult<Option<JoinCounts>> {
        self.inner.socket_leave_room(user, socket, room).await
    }

    async fn user_leave_room(&self, user: &str, room: &str) -> StoreResult<Vec<SocketRecord>> {
        self.inner.user_leave_room(user, room).await
    }

    async fn add_room(&self, room: &str, owner: Option<&str>, whitelist_only: bool) -> StoreResult<bool> {
        self.inner.add_room(room, owner, whitelist_only).await
    }

    async fn room_meta(&self, room: &str) -> StoreResult<Option<RoomMeta>> {
        self.inner.room_meta(room).await
    }

    async fn set_room_removing(&self, room: &str) -> StoreResult<bool> {
        self.inner.set_room_removing(room).await
    }

    async fn remove_room(&self, room: &str) -> StoreResult<()> {
        self.inner.remove_room(room).await
    }

    async fn room_add_user(&self, room: &str, user: &str, now: i64) -> StoreResult<bool> {
        self.inner.room_add_user(room, user, now).await
    }

    async fn room_remove_user(&self, room: &str, user: &str, now: i64) -> StoreResult<bool> {
        self.inner.room_remove_user(room, user, now).await
    }

    async fn room_users(&self, room: &str) -> StoreResult<Vec<String>> {
        self.inner.room_users(room).await
    }

    async fn room_user_seen(&self, room: &str, user: &str) -> StoreResult<UserSeen> {
        self.inner.room_user_seen(room, user).await
    }

    async fn list_add(&self, target: &AccessTarget, list: AccessList, values: &[String]) -> StoreResult<()> {
        self.inner.list_add(target, list, values).await
    }

    async fn list_remove(&self, target: &AccessTarget, list: AccessList, values: &[String]) -> StoreResult<()> {
        self.inner.list_remove(target, list, values).await
    }

    async fn list_get(&self, target: &AccessTarget, list: AccessList) -> StoreResult<Vec<String>> {
        self.inner.list_get(target, list).await
    }

    async fn list_contains(&self, target: &AccessTarget, list: AccessList, value: &str) -> StoreResult<bool> {
        self.inner.list_contains(target, list, value).await
    }

    async fn set_whitelist_only(&self, target: &AccessTarget, mode: bool) -> StoreResult<()> {
        self.inner.set_whitelist_only(target, mode).await
    }

    async fn whitelist_only(&self, target: &AccessTarget) -> StoreResult<bool> {
        self.inner.whitelist_only(target).await
    }

    async fn history_push(
        &self,
        room: &str,
        msg: ChatMessage,
        max_size: usize,
        now: i64,
    ) -> StoreResult<Option<ChatMessage>> {
        self.inner.history_push(room, msg, max_size, now).await
    }

    async fn history_recent(&self, room: &str, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        self.inner.history_recent(room, limit).await
    }

    async fn history_after(&self, room: &str, after: u64, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        self.inner.history_after(room, after, limit).await
    }

    async fn history_stats(&self, room: &str) -> StoreResult<HistoryStats> {
        self.inner.history_stats(room).await
    }

    async fn lock_acquire(&self, resource: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        // Hold the bookkeeping mutex across the claim so grant order and
        // bookkeeping order agree. The inner store never awaits.
        let mut holders = self.holders.lock();
        let granted = futures_util::FutureExt::now_or_never(self.inner.lock_acquire(resource, token, ttl))
            .expect("memory store lock is synchronous")?;
        if granted {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            if holders.insert(resource.to_string(), token.to_string()).is_some() {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(granted)
    }

    async fn lock_release(&self, resource: &str, token: &str) -> StoreResult<bool> {
        let mut holders = self.holders.lock();
        if holders.get(resource).is_some_and(|holder| holder == token) {
            holders.remove(resource);
        }
        futures_util::FutureExt::now_or_never(self.inner.lock_release(resource, token))
            .expect("memory store lock is synchronous")
    }
}
