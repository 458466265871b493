//! The chat instance: shared core state and the service API.
//!
//! [`ServerCore`] is what every session reaches through an `Arc`: the store,
//! this instance's transport and bus endpoint, the per-user lock, the
//! command registry and the socket bindings. [`ChatServer`] owns the core and
//! the task that serves requests arriving from peer instances.

use crate::config::{DISCONNECT_CONCURRENCY, ServiceConfig};
use crate::error::{ChatError, HandlerResult};
use crate::handlers::{Registry, SocketBindings};
use crate::network::{Event, Transport};
use crate::session::{CommandOptions, OperationInfo, ServerEvent, UserSession, consistency_failure};
use crate::state::{InstanceId, SocketId, Store};
use crate::sync::{BusEnvelope, BusRequest, ClusterBus, DistributedLock, InstanceFilter};
use crate::validation::validate_name;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the server event channel.
const SERVER_EVENTS_CAPACITY: usize = 1024;

/// Shared state of one instance.
pub struct ServerCore {
    pub instance_id: InstanceId,
    pub config: ServiceConfig,
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn Transport>,
    pub bus: Arc<dyn ClusterBus>,
    pub lock: DistributedLock,
    pub registry: Registry,
    pub bindings: SocketBindings,
    pub events: broadcast::Sender<ServerEvent>,
}

impl ServerCore {
    /// Emit to a channel on every instance: locally, then to peers.
    pub async fn emit(&self, channel: &str, exclude: Option<&str>, event: Arc<Event>) {
        self.transport.send_to_channel(exclude, channel, event.clone());
        self.bus
            .publish(
                InstanceFilter::AllExcept(self.instance_id.clone()),
                BusRequest::Emit {
                    channel: channel.to_string(),
                    exclude: exclude.map(str::to_string),
                    event,
                },
            )
            .await;
    }

    fn session(self: &Arc<Self>, user: &str) -> UserSession {
        UserSession::new(self.clone(), user)
    }

    /// The user owning `socket`, from the bindings or the store.
    async fn socket_user(&self, socket: &str) -> Result<Option<String>, ChatError> {
        if let Some(user) = self.bindings.user_of(socket) {
            return Ok(Some(user));
        }
        Ok(self.store.socket_owner(socket).await?.map(|owner| owner.user_name))
    }

    /// Remove a local socket and close its connection.
    async fn disconnect_local(self: &Arc<Self>, socket: &str) -> Result<(), ChatError> {
        match self.socket_user(socket).await? {
            Some(user) => {
                self.session(&user)
                    .disconnect(None, &CommandOptions::for_socket(socket))
                    .await
            }
            None => Ok(self.transport.disconnect_client(socket).await?),
        }
    }
}

/// One chat instance.
pub struct ChatServer {
    core: Arc<ServerCore>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ChatServer {
    /// Build an instance and start serving its bus inbox.
    ///
    /// The instance id is the bus endpoint's id. Must be called from within
    /// a Tokio runtime.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        bus: Arc<dyn ClusterBus>,
        inbox: mpsc::Receiver<BusEnvelope>,
    ) -> Self {
        let (events, _) = broadcast::channel(SERVER_EVENTS_CAPACITY);
        let core = Arc::new(ServerCore {
            instance_id: bus.instance_id().to_string(),
            lock: DistributedLock::new(store.clone(), &config),
            config,
            store,
            transport,
            bus,
            registry: Registry::new(),
            bindings: SocketBindings::new(),
            events,
        });
        let listener = tokio::spawn(run_bus_listener(core.clone(), inbox));
        info!(instance = %core.instance_id, "Chat instance started");
        Self {
            core,
            listener: Mutex::new(Some(listener)),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.core.instance_id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    pub fn bindings(&self) -> &SocketBindings {
        &self.core.bindings
    }

    /// A session for `name`.
    pub fn user(&self, name: &str) -> Result<UserSession, ChatError> {
        validate_name(name)?;
        Ok(self.core.session(name))
    }

    /// Register a connected socket for `user`; returns the user's
    /// connected-socket count.
    pub async fn register_socket(&self, user: &str, socket: &str) -> Result<usize, ChatError> {
        if self.core.bindings.user_of(socket).is_some() {
            return Err(ChatError::Internal(format!("socket {socket} is already registered")));
        }
        self.user(user)?.register_socket(socket).await
    }

    /// Run a command arriving on a registered socket.
    pub async fn dispatch(&self, socket: &str, command: &str, args: Vec<Value>) -> HandlerResult {
        let Some(user) = self.core.bindings.user_of(socket) else {
            return Err(ChatError::NoSocket(command.to_string()));
        };
        if !self.core.bindings.is_bound(socket, command) {
            crate::metrics::record_command_error("unknown", "noCommand");
            return Err(ChatError::NoCommand(command.to_string()));
        }
        self.core
            .session(&user)
            .exec(command, &CommandOptions::for_socket(socket), args)
            .await
    }

    /// Run a command on behalf of `user`, outside any socket.
    pub async fn exec_user_command(
        &self,
        user: &str,
        command: &str,
        options: &CommandOptions,
        args: Vec<Value>,
    ) -> HandlerResult {
        self.user(user)?.exec(command, options, args).await
    }

    /// The transport reported `socket` closed.
    pub async fn socket_closed(&self, socket: &str) -> Result<(), ChatError> {
        match self.core.socket_user(socket).await? {
            Some(user) => self.core.session(&user).remove_socket(socket).await,
            None => {
                debug!(socket = %socket, "Closed socket was never registered");
                Ok(())
            }
        }
    }

    /// Disconnect one socket wherever it is served.
    pub async fn disconnect_socket(&self, socket: &str) -> Result<(), ChatError> {
        let Some(owner) = self.core.store.socket_owner(socket).await? else {
            return self.core.disconnect_local(socket).await;
        };
        if owner.instance_id == self.core.instance_id {
            return self.core.disconnect_local(socket).await;
        }
        let report = self
            .core
            .bus
            .request(
                InstanceFilter::Only(vec![owner.instance_id]),
                BusRequest::DisconnectSockets {
                    sockets: vec![socket.to_string()],
                },
                self.core.config.bus_ack_timeout(),
            )
            .await?;
        report.check()
    }

    /// Log `user` out of every instance.
    pub async fn disconnect_user_sockets(&self, user: &str) -> Result<(), ChatError> {
        let session = self.user(user)?;
        session.disconnect_instance_sockets().await?;

        let report = self
            .core
            .bus
            .request(
                InstanceFilter::AllExcept(self.core.instance_id.clone()),
                BusRequest::DisconnectUser { user: user.to_string() },
                self.core.config.bus_ack_timeout(),
            )
            .await?;
        if let Err(error) = report.check() {
            consistency_failure(
                &self.core.events,
                user,
                error,
                OperationInfo::transport("disconnectUserSockets"),
            );
        }
        Ok(())
    }

    /// Server events (consistency failures).
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.core.events.subscribe()
    }

    /// Stop serving peers and disconnect every local socket.
    pub async fn close(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        let sockets: Vec<SocketId> = self.core.transport.local_sockets();
        info!(instance = %self.core.instance_id, sockets = sockets.len(), "Closing chat instance");
        stream::iter(sockets)
            .for_each_concurrent(DISCONNECT_CONCURRENCY, |socket| async move {
                if let Err(e) = self.core.disconnect_local(&socket).await {
                    warn!(socket = %socket, error = %e, "Disconnect on close failed");
                }
            })
            .await;
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

/// Serve requests from peer instances until the inbox closes.
async fn run_bus_listener(core: Arc<ServerCore>, mut inbox: mpsc::Receiver<BusEnvelope>) {
    while let Some(mut envelope) = inbox.recv().await {
        let kind = envelope.request.kind();
        match &envelope.request {
            BusRequest::Emit {
                channel,
                exclude,
                event,
            } => {
                core.transport
                    .send_to_channel(exclude.as_deref(), channel, event.clone());
            }
            BusRequest::LeaveChannel { room, sockets } => {
                for socket in sockets {
                    if let Err(e) = core.transport.leave_channel(socket, room).await {
                        warn!(socket = %socket, room = %room, error = %e, "Remote channel leave failed");
                    }
                }
            }
            BusRequest::DisconnectSockets { sockets } => {
                let core = core.clone();
                let sockets = sockets.clone();
                tokio::spawn(async move {
                    for socket in sockets {
                        if let Err(e) = core.disconnect_local(&socket).await {
                            warn!(socket = %socket, error = %e, "Remote socket disconnect failed");
                        }
                    }
                });
            }
            BusRequest::DisconnectUser { user } => {
                let session = core.session(user);
                tokio::spawn(async move {
                    if let Err(e) = session.disconnect_instance_sockets().await {
                        warn!(user = %session.name(), error = %e, "Remote user disconnect failed");
                    }
                });
            }
        }
        if envelope.wants_ack() {
            debug!(origin = %envelope.origin, kind, "Acknowledging bus request");
        }
        envelope.acknowledge();
    }
    debug!(instance = %core.instance_id, "Bus inbox closed");
}
