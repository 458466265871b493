//! Socket registration and teardown for one user.

use super::{OperationInfo, UserCtx};
use crate::config::DISCONNECT_CONCURRENCY;
use crate::error::ChatError;
use crate::network::{Event, TransportError};
use crate::state::{SocketId, SocketRemoval, StoreResult, now_millis};
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) struct SocketRegistry {
    ctx: Arc<UserCtx>,
}

/// Store records removed for a socket, plus rooms the user left entirely.
struct Teardown {
    removal: SocketRemoval,
    user_left: Vec<String>,
}

impl SocketRegistry {
    pub(crate) fn new(ctx: Arc<UserCtx>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn register(&self, socket: &str) -> Result<usize, ChatError> {
        let guard = self.ctx.lock().await?;
        let result = self.register_locked(socket).await;
        self.ctx.unlock(guard).await;
        let nconnected = result?;

        crate::metrics::socket_registered();
        info!(user = %self.ctx.name, socket = %socket, nconnected, "Socket registered");
        let event = Event::new("socketConnectEcho", vec![json!(socket), json!(nconnected)]);
        self.ctx.emit_echo(Some(socket), event).await;
        Ok(nconnected)
    }

    async fn register_locked(&self, socket: &str) -> Result<usize, ChatError> {
        let core = &self.ctx.core;
        let user = &self.ctx.name;

        core.store.add_socket(socket, user, &core.instance_id).await?;
        let nconnected = self.ctx.store_step(
            core.store.user_add_socket(user, socket, &core.instance_id).await,
            OperationInfo::store("registerSocket").socket(socket),
        )?;

        // The connection may have closed while the store was written.
        let joined = if core.transport.connection_exists(socket) {
            core.transport.join_channel(socket, &self.ctx.echo_channel).await
        } else {
            Err(TransportError::NoConnection(socket.to_string()))
        };
        match joined {
            Ok(()) => {}
            Err(TransportError::NoConnection(_)) => {
                debug!(user = %user, socket = %socket, "Connection gone during registration");
                self.undo_registration(socket).await;
                return Err(ChatError::NoSocket("connection".to_string()));
            }
            Err(e) => self.ctx.report(
                e.into(),
                OperationInfo::transport("registerSocket").room(&self.ctx.echo_channel).socket(socket),
            ),
        }

        core.bindings.bind(socket, user, core.registry.command_names());
        Ok(nconnected)
    }

    async fn undo_registration(&self, socket: &str) {
        let store = &self.ctx.core.store;
        let undone: StoreResult<()> = async {
            store.user_remove_socket(&self.ctx.name, socket).await?;
            store.remove_socket(socket).await
        }
        .await;
        if let Err(e) = undone {
            self.ctx
                .report(e.into(), OperationInfo::store("registerSocket").socket(socket));
        }
    }

    /// Remove a socket's records and local channel memberships.
    ///
    /// The socket stays bound when the teardown fails so a later close can
    /// retry it.
    pub(crate) async fn remove(&self, socket: &str) -> Result<(), ChatError> {
        let Teardown { removal, user_left } = match self.teardown(socket).await {
            Ok(teardown) => teardown,
            Err(e) => {
                self.ctx
                    .report(e.clone(), OperationInfo::store("removeSocket").socket(socket));
                return Err(e);
            }
        };
        self.ctx.core.bindings.unbind(socket);

        if !removal.was_registered && removal.rooms.is_empty() {
            return Ok(());
        }
        if removal.was_registered {
            crate::metrics::socket_unregistered();
        }
        info!(user = %self.ctx.name, socket = %socket, nconnected = removal.connected, "Socket removed");

        for left in &removal.rooms {
            let event = Event::new(
                "roomLeftEcho",
                vec![json!(left.room_name), json!(socket), json!(left.joined_sockets)],
            );
            self.ctx.emit_echo(Some(socket), event).await;
        }
        if self.ctx.core.config.enable_userlist_updates {
            for room in &user_left {
                let event = Event::new("roomUserLeft", vec![json!(room), json!(self.ctx.name)]);
                self.ctx.core.emit(room, None, event).await;
            }
        }
        let event = Event::new("socketDisconnectEcho", vec![json!(socket), json!(removal.connected)]);
        self.ctx.emit_echo(Some(socket), event).await;
        Ok(())
    }

    async fn teardown(&self, socket: &str) -> Result<Teardown, ChatError> {
        let guard = self.ctx.lock().await?;
        let result = self.remove_locked(socket).await;
        self.ctx.unlock(guard).await;
        result
    }

    async fn remove_locked(&self, socket: &str) -> Result<Teardown, ChatError> {
        let core = &self.ctx.core;
        let user = &self.ctx.name;

        let removal = core.store.user_remove_socket(user, socket).await?;
        if let Err(e) = core.store.remove_socket(socket).await {
            self.ctx
                .report(e.into(), OperationInfo::store("removeSocket").socket(socket));
        }

        let mut user_left = Vec::new();
        for left in &removal.rooms {
            self.ctx
                .leave_local_channel(socket, &left.room_name, "removeSocket")
                .await;
            if left.joined_sockets > 0 {
                continue;
            }
            match core.store.room_remove_user(&left.room_name, user, now_millis()).await {
                Ok(true) => user_left.push(left.room_name.clone()),
                Ok(false) => {}
                Err(e) => self.ctx.report(
                    e.into(),
                    OperationInfo::store("removeSocket").room(&left.room_name).socket(socket),
                ),
            }
        }
        self.ctx
            .leave_local_channel(socket, &self.ctx.echo_channel, "removeSocket")
            .await;

        Ok(Teardown { removal, user_left })
    }

    /// Remove the socket, then close its transport connection.
    pub(crate) async fn remove_from_server(&self, socket: &str) -> Result<(), ChatError> {
        let removed = self.remove(socket).await;
        if let Err(e) = self.ctx.core.transport.disconnect_client(socket).await {
            warn!(user = %self.ctx.name, socket = %socket, error = %e, "Transport disconnect failed");
        }
        removed
    }

    pub(crate) async fn disconnect_instance_sockets(&self) -> Result<(), ChatError> {
        let instance = &self.ctx.core.instance_id;
        let sockets: Vec<SocketId> = self
            .ctx
            .core
            .store
            .user_sockets(&self.ctx.name)
            .await?
            .into_iter()
            .filter(|record| &record.instance_id == instance)
            .map(|record| record.socket_id)
            .collect();
        debug!(user = %self.ctx.name, count = sockets.len(), "Disconnecting instance sockets");

        stream::iter(sockets)
            .for_each_concurrent(DISCONNECT_CONCURRENCY, |socket| async move {
                if let Err(e) = self.remove_from_server(&socket).await {
                    warn!(user = %self.ctx.name, socket = %socket, error = %e, "Socket disconnect failed");
                }
            })
            .await;
        Ok(())
    }

    pub(crate) async fn check_online(&self) -> Result<(), ChatError> {
        let sockets = self.ctx.core.store.user_sockets(&self.ctx.name).await?;
        if sockets.is_empty() {
            Err(ChatError::NoUserOnline(self.ctx.name.clone()))
        } else {
            Ok(())
        }
    }

    pub(crate) async fn list_own_sockets(&self) -> Result<BTreeMap<SocketId, Vec<String>>, ChatError> {
        Ok(self.ctx.core.store.user_sockets_to_rooms(&self.ctx.name).await?)
    }
}
