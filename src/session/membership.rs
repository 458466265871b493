//! Socket × room associations and their reconciliation.
//!
//! A socket may join a room several times; the store counts the joins and
//! the transport channel is joined on the first and left on the last.
//! Evictions clear every socket of a user at once, including sockets held by
//! other instances, which are asked over the cluster bus to leave the
//! channel locally.

use super::{OperationInfo, UserCtx};
use crate::config::DISCONNECT_CONCURRENCY;
use crate::error::ChatError;
use crate::network::Event;
use crate::state::{Room, SocketRecord, now_millis};
use crate::sync::{BusRequest, InstanceFilter};
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct RoomMembership {
    ctx: Arc<UserCtx>,
}

struct JoinOutcome {
    njoined: usize,
    user_joined: bool,
}

struct LeaveOutcome {
    njoined: usize,
    socket_left: bool,
    user_left: bool,
}

struct Eviction {
    sockets: Vec<SocketRecord>,
    was_member: bool,
}

impl RoomMembership {
    pub(crate) fn new(ctx: Arc<UserCtx>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn join(&self, socket: &str, room_name: &str) -> Result<usize, ChatError> {
        let room = Room::load(&self.ctx.core.store, room_name).await?;
        room.check_join(&self.ctx.name).await?;

        let guard = self.ctx.lock().await?;
        let result = self.join_locked(socket, room_name).await;
        self.ctx.unlock(guard).await;
        let outcome = result?;

        if outcome.user_joined && self.ctx.core.config.enable_userlist_updates {
            let event = Event::new("roomUserJoined", vec![json!(room_name), json!(self.ctx.name)]);
            self.ctx.core.emit(room_name, None, event).await;
        }
        let event = Event::new(
            "roomJoinedEcho",
            vec![json!(room_name), json!(socket), json!(outcome.njoined)],
        );
        self.ctx.emit_echo(Some(socket), event).await;
        Ok(outcome.njoined)
    }

    async fn join_locked(&self, socket: &str, room: &str) -> Result<JoinOutcome, ChatError> {
        let core = &self.ctx.core;
        let user = &self.ctx.name;
        let info = || OperationInfo::store("roomJoin").room(room).socket(socket);

        let counts = core.store.socket_join_room(user, socket, room).await?;
        let mut user_joined = false;
        if counts.socket_refs == 1 {
            if let Err(e) = core.transport.join_channel(socket, room).await {
                self.undo_join(socket, room).await;
                return Err(e.into());
            }
            match core.store.room_add_user(room, user, now_millis()).await {
                Ok(added) => user_joined = added,
                Err(e) => {
                    self.undo_join(socket, room).await;
                    return Err(e.into());
                }
            }
        }

        // A concurrent roomDelete marks the room before evicting members.
        let meta = self.ctx.store_step(core.store.room_meta(room).await, info())?;
        if !meta.is_some_and(|meta| !meta.removing) {
            debug!(user = %user, room = %room, "Room removed during join");
            self.undo_join(socket, room).await;
            return Err(ChatError::NoRoom(room.to_string()));
        }

        Ok(JoinOutcome {
            njoined: counts.joined_sockets,
            user_joined,
        })
    }

    async fn undo_join(&self, socket: &str, room: &str) {
        let core = &self.ctx.core;
        let user = &self.ctx.name;
        let info = || OperationInfo::store("roomJoin").room(room).socket(socket);

        let counts = match core.store.socket_leave_room(user, socket, room).await {
            Ok(Some(counts)) => counts,
            Ok(None) => return,
            Err(e) => return self.ctx.report(e.into(), info()),
        };
        if counts.socket_refs == 0 {
            self.ctx.leave_local_channel(socket, room, "roomJoin").await;
        }
        if counts.joined_sockets == 0
            && let Err(e) = core.store.room_remove_user(room, user, now_millis()).await
        {
            self.ctx.report(e.into(), info());
        }
    }

    pub(crate) async fn leave(&self, socket: &str, room_name: &str) -> Result<usize, ChatError> {
        Room::load(&self.ctx.core.store, room_name).await?;

        let guard = self.ctx.lock().await?;
        let result = self.leave_locked(socket, room_name).await;
        self.ctx.unlock(guard).await;
        let outcome = result?;

        if outcome.user_left && self.ctx.core.config.enable_userlist_updates {
            let event = Event::new("roomUserLeft", vec![json!(room_name), json!(self.ctx.name)]);
            self.ctx.core.emit(room_name, None, event).await;
        }
        if outcome.socket_left {
            let event = Event::new(
                "roomLeftEcho",
                vec![json!(room_name), json!(socket), json!(outcome.njoined)],
            );
            self.ctx.emit_echo(Some(socket), event).await;
        }
        Ok(outcome.njoined)
    }

    async fn leave_locked(&self, socket: &str, room: &str) -> Result<LeaveOutcome, ChatError> {
        let core = &self.ctx.core;
        let user = &self.ctx.name;

        let Some(counts) = core.store.socket_leave_room(user, socket, room).await? else {
            // Never joined: nothing to undo, report the current count.
            let joined = core.store.user_sockets_to_rooms(user).await?;
            let njoined = joined
                .values()
                .filter(|rooms| rooms.iter().any(|r| r == room))
                .count();
            return Ok(LeaveOutcome {
                njoined,
                socket_left: false,
                user_left: false,
            });
        };

        let socket_left = counts.socket_refs == 0;
        if socket_left {
            self.ctx.leave_local_channel(socket, room, "roomLeave").await;
        }
        let mut user_left = false;
        if counts.joined_sockets == 0 {
            user_left = self.ctx.store_step(
                core.store.room_remove_user(room, user, now_millis()).await,
                OperationInfo::store("roomLeave").room(room).socket(socket),
            )?;
        }
        Ok(LeaveOutcome {
            njoined: counts.joined_sockets,
            socket_left,
            user_left,
        })
    }

    /// Evict `users` from `room` on every instance. Failures are reported,
    /// never returned: the command that triggered the eviction succeeded.
    pub(crate) async fn remove_room_users(&self, room: &str, users: Vec<String>) {
        if users.is_empty() {
            return;
        }
        let core = self.ctx.core.clone();
        stream::iter(users)
            .for_each_concurrent(DISCONNECT_CONCURRENCY, |user| {
                let target = UserCtx::new(core.clone(), &user);
                async move { evict(&target, room).await }
            })
            .await;
    }
}

async fn evict(target: &UserCtx, room: &str) {
    let info = || OperationInfo::store("removeRoomUser").room(room);
    let guard = match target.lock().await {
        Ok(guard) => guard,
        Err(e) => return target.report(e, info()),
    };
    let result = evict_locked(target, room).await;
    target.unlock(guard).await;
    let eviction = match result {
        Ok(eviction) => eviction,
        Err(e) => return target.report(e, info()),
    };
    debug!(user = %target.name, room = %room, sockets = eviction.sockets.len(), "User removed from room");

    let core = &target.core;
    for record in &eviction.sockets {
        let event = Event::new("roomLeftEcho", vec![json!(room), json!(record.socket_id), json!(0)]);
        target.emit_echo(None, event).await;
    }
    target
        .emit_echo(None, Event::new("roomAccessRemoved", vec![json!(room)]))
        .await;
    if eviction.was_member && core.config.enable_userlist_updates {
        let event = Event::new("roomUserLeft", vec![json!(room), json!(target.name)]);
        core.emit(room, None, event).await;
    }
}

async fn evict_locked(target: &UserCtx, room: &str) -> Result<Eviction, ChatError> {
    let core = &target.core;
    let sockets = core.store.user_leave_room(&target.name, room).await?;
    let was_member = target.store_step(
        core.store
            .room_remove_user(room, &target.name, now_millis())
            .await,
        OperationInfo::store("removeRoomUser").room(room),
    )?;

    let (local, remote): (Vec<&SocketRecord>, Vec<&SocketRecord>) = sockets
        .iter()
        .partition(|record| record.instance_id == core.instance_id);
    for record in local {
        target
            .leave_local_channel(&record.socket_id, room, "removeRoomUser")
            .await;
    }
    if !remote.is_empty() {
        leave_remote_channels(target, room, &remote).await;
    }
    Ok(Eviction { sockets, was_member })
}

/// Ask the instances holding `remote` sockets to leave the room channel.
async fn leave_remote_channels(target: &UserCtx, room: &str, remote: &[&SocketRecord]) {
    let core = &target.core;
    let instances: BTreeSet<String> = remote.iter().map(|r| r.instance_id.clone()).collect();
    let request = BusRequest::LeaveChannel {
        room: room.to_string(),
        sockets: remote.iter().map(|r| r.socket_id.clone()).collect(),
    };
    let expected = instances.len();
    let filter = InstanceFilter::Only(instances.into_iter().collect());
    let info = || OperationInfo::transport("removeRoomUser").room(room);

    match core.bus.request(filter, request, core.config.bus_ack_timeout()).await {
        // Instances missing from the bus count as not acknowledged.
        Ok(report) if report.acked < expected => target.report(
            ChatError::BusTimeout {
                expected,
                acked: report.acked,
            },
            info(),
        ),
        Ok(_) => {}
        Err(e) => target.report(e, info()),
    }
}
