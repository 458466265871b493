//! Gateway - TCP listener speaking newline-delimited JSON.
//!
//! Each accepted connection is a socket. The first line names the user:
//!
//! ```text
//! {"user": "alice"}
//! ```
//!
//! After registration every line is a request, answered on the same stream:
//!
//! ```text
//! -> {"seq": 1, "command": "roomJoin", "args": ["lobby"]}
//! <- {"seq": 1, "result": [1]}
//! <- {"event": "roomJoinedEcho", "args": ["lobby", "...", 1]}
//! ```

use crate::error::ChatError;
use crate::network::{Event, MemoryTransport, Transport};
use crate::server::ChatServer;
use crate::telemetry::spans;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{Instrument, debug, error, info, instrument, warn};

/// Longest accepted line.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Time a client has to send its handshake line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tries at tearing down a closed socket before leaving it to operators.
const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct Hello {
    user: String,
}

#[derive(Debug, Deserialize)]
struct Request {
    seq: u64,
    command: String,
    #[serde(default)]
    args: Vec<Value>,
}

/// The Gateway accepts TCP connections and serves them as sockets.
pub struct Gateway {
    listener: TcpListener,
    server: Arc<ChatServer>,
    transport: Arc<MemoryTransport>,
}

impl Gateway {
    /// Bind the gateway to `addr`.
    pub async fn bind(
        addr: SocketAddr,
        server: Arc<ChatServer>,
        transport: Arc<MemoryTransport>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Gateway listener bound");
        Ok(Self {
            listener,
            server,
            transport,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the gateway, accepting connections forever.
    #[instrument(skip(self), name = "gateway")]
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let socket = uuid::Uuid::new_v4().to_string();
                    let server = Arc::clone(&self.server);
                    let transport = Arc::clone(&self.transport);
                    let span = spans::connection(&socket, &addr.to_string());
                    tokio::spawn(
                        async move {
                            if let Err(e) = serve_connection(&socket, stream, &server, &transport).await {
                                warn!(error = %e, "Connection error");
                            }
                            info!("Connection closed");
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

async fn serve_connection(
    socket: &str,
    stream: TcpStream,
    server: &ChatServer,
    transport: &MemoryTransport,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(line)) => serde_json::from_str::<Hello>(&line?)?,
        Ok(None) => return Ok(()),
        Err(_) => anyhow::bail!("handshake timed out"),
    };

    let mut events = transport.connect(socket);
    match server.register_socket(&hello.user, socket).await {
        Ok(nconnected) => {
            info!(user = %hello.user, nconnected, "Connection registered");
            framed
                .send(json!({ "socket": socket, "nconnected": nconnected }).to_string())
                .await?;
        }
        Err(e) => {
            let _ = transport.disconnect_client(socket).await;
            framed.send(json!({ "error": e.to_wire() }).to_string()).await?;
            return Ok(());
        }
    }

    let result = connection_loop(socket, &mut framed, &mut events, server).await;

    for attempt in 1..=CLEANUP_ATTEMPTS {
        match server.socket_closed(socket).await {
            Ok(()) => break,
            Err(e) if attempt < CLEANUP_ATTEMPTS => {
                warn!(attempt, error = %e, "Socket cleanup failed, retrying");
                tokio::time::sleep(CLEANUP_RETRY_DELAY).await;
            }
            Err(e) => warn!(error = %e, "Socket cleanup failed"),
        }
    }
    let _ = transport.disconnect_client(socket).await;
    result
}

async fn connection_loop(
    socket: &str,
    framed: &mut Framed<TcpStream, LinesCodec>,
    events: &mut tokio::sync::mpsc::Receiver<Arc<Event>>,
    server: &ChatServer,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            line = framed.next() => {
                let Some(line) = line else {
                    return Ok(());
                };
                let reply = handle_line(socket, &line?, server).await;
                framed.send(reply.to_string()).await?;
            }
            event = events.recv() => {
                // The transport dropped this connection (disconnect command
                // or a remote logout).
                let Some(event) = event else {
                    debug!("Event stream ended");
                    return Ok(());
                };
                framed
                    .send(json!({ "event": event.name, "args": event.args }).to_string())
                    .await?;
            }
        }
    }
}

async fn handle_line(socket: &str, line: &str, server: &ChatServer) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return json!({ "error": ChatError::from(e).to_wire() });
        }
    };
    match server.dispatch(socket, &request.command, request.args).await {
        Ok(result) => json!({ "seq": request.seq, "result": result }),
        Err(e) => json!({ "seq": request.seq, "error": e.to_wire() }),
    }
}
