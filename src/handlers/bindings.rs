//! Per-socket command bindings.
//!
//! A registered socket is bound to its user and to the allow-listed command
//! set at registration time. Inbound requests are only dispatched for bound
//! sockets and bound commands.

use crate::state::SocketId;
use dashmap::DashMap;
use std::collections::HashSet;

#[derive(Debug, Clone)]
struct Binding {
    user: String,
    commands: HashSet<&'static str>,
}

/// Socket id to user and command set.
#[derive(Debug, Default)]
pub struct SocketBindings {
    sockets: DashMap<SocketId, Binding>,
}

impl SocketBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, socket: &str, user: &str, commands: Vec<&'static str>) {
        self.sockets.insert(
            socket.to_string(),
            Binding {
                user: user.to_string(),
                commands: commands.into_iter().collect(),
            },
        );
    }

    /// Drop the binding; returns the user it belonged to.
    pub fn unbind(&self, socket: &str) -> Option<String> {
        self.sockets.remove(socket).map(|(_, binding)| binding.user)
    }

    pub fn user_of(&self, socket: &str) -> Option<String> {
        self.sockets.get(socket).map(|binding| binding.user.clone())
    }

    pub fn is_bound(&self, socket: &str, command: &str) -> bool {
        self.sockets
            .get(socket)
            .is_some_and(|binding| binding.commands.contains(command))
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}
