//! Command handler registry and dispatch.
//!
//! The `Registry` is the command allow-list: a name without a handler is
//! rejected with `NoCommand`. It also keeps usage counters per command.

use super::context::{Args, Context, Handler};
use crate::error::{ChatError, HandlerResult};
use crate::handlers::{
    connection::{DisconnectHandler, ListOwnSocketsHandler, SystemMessageHandler},
    direct::{
        DirectAddToListHandler, DirectGetAccessListHandler, DirectGetWhitelistModeHandler,
        DirectMessageHandler, DirectRemoveFromListHandler, DirectSetWhitelistModeHandler,
    },
    room::{
        RoomAddToListHandler, RoomCreateHandler, RoomDeleteHandler, RoomGetAccessListHandler,
        RoomGetOwnerHandler, RoomGetWhitelistModeHandler, RoomHistoryGetHandler,
        RoomHistoryInfoHandler, RoomJoinHandler, RoomLeaveHandler, RoomMessageHandler,
        RoomRecentHistoryHandler, RoomRemoveFromListHandler, RoomSetWhitelistModeHandler,
        RoomUserSeenHandler,
    },
};
use crate::session::{CommandOptions, UserSession};
use crate::telemetry::{CommandTimer, spans};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Instrument, debug};

/// Registry of command handlers.
pub struct Registry {
    handlers: HashMap<&'static str, Box<dyn Handler>>,
    /// Usage counters, one per registered command.
    command_counts: HashMap<&'static str, AtomicU64>,
}

impl Registry {
    /// Create a new registry with all handlers registered.
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Box<dyn Handler>> = HashMap::new();

        // Connection handlers
        handlers.insert("disconnect", Box::new(DisconnectHandler));
        handlers.insert("listOwnSockets", Box::new(ListOwnSocketsHandler));
        handlers.insert("systemMessage", Box::new(SystemMessageHandler));

        // Room membership and messages
        handlers.insert("roomJoin", Box::new(RoomJoinHandler));
        handlers.insert("roomLeave", Box::new(RoomLeaveHandler));
        handlers.insert("roomMessage", Box::new(RoomMessageHandler));

        // Room management
        handlers.insert("roomCreate", Box::new(RoomCreateHandler));
        handlers.insert("roomDelete", Box::new(RoomDeleteHandler));
        handlers.insert("roomAddToList", Box::new(RoomAddToListHandler));
        handlers.insert("roomRemoveFromList", Box::new(RoomRemoveFromListHandler));
        handlers.insert("roomSetWhitelistMode", Box::new(RoomSetWhitelistModeHandler));
        handlers.insert("roomGetAccessList", Box::new(RoomGetAccessListHandler));
        handlers.insert("roomGetOwner", Box::new(RoomGetOwnerHandler));
        handlers.insert("roomGetWhitelistMode", Box::new(RoomGetWhitelistModeHandler));

        // Room history
        handlers.insert("roomRecentHistory", Box::new(RoomRecentHistoryHandler));
        handlers.insert("roomHistoryGet", Box::new(RoomHistoryGetHandler));
        handlers.insert("roomHistoryInfo", Box::new(RoomHistoryInfoHandler));
        handlers.insert("roomUserSeen", Box::new(RoomUserSeenHandler));

        // Direct messaging
        handlers.insert("directMessage", Box::new(DirectMessageHandler));
        handlers.insert("directAddToList", Box::new(DirectAddToListHandler));
        handlers.insert("directRemoveFromList", Box::new(DirectRemoveFromListHandler));
        handlers.insert("directGetAccessList", Box::new(DirectGetAccessListHandler));
        handlers.insert("directGetWhitelistMode", Box::new(DirectGetWhitelistModeHandler));
        handlers.insert("directSetWhitelistMode", Box::new(DirectSetWhitelistModeHandler));

        let command_counts = handlers.keys().map(|&cmd| (cmd, AtomicU64::new(0))).collect();

        Self {
            handlers,
            command_counts,
        }
    }

    /// The allow-listed command names, sorted.
    pub fn command_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Command usage statistics, most used first.
    pub fn get_command_stats(&self) -> Vec<(&'static str, u64)> {
        let mut stats: Vec<_> = self
            .command_counts
            .iter()
            .map(|(cmd, count)| (*cmd, count.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        stats.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        stats
    }

    /// Validate and run `command` for `session`.
    pub async fn dispatch(
        &self,
        session: &UserSession,
        command: &str,
        options: &CommandOptions,
        args: Vec<Value>,
    ) -> HandlerResult {
        let Some((&name, handler)) = self.handlers.get_key_value(command) else {
            crate::metrics::record_command_error("unknown", "noCommand");
            return Err(ChatError::NoCommand(command.to_string()));
        };

        if let Some(counter) = self.command_counts.get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let result = Self::run(handler.as_ref(), session, name, options, args).await;
        if let Err(ref e) = result {
            crate::metrics::record_command_error(name, e.error_code());
            debug!(command = name, user = %session.name(), error = %e, "Command error");
        }
        result
    }

    async fn run(
        handler: &dyn Handler,
        session: &UserSession,
        name: &'static str,
        options: &CommandOptions,
        args: Vec<Value>,
    ) -> HandlerResult {
        if handler.requires_socket() {
            options.require_socket(name)?;
        }
        let arity = handler.arity();
        let min = arity - handler.optional_args();
        if args.len() < min || args.len() > arity {
            return Err(ChatError::WrongArgumentsCount {
                expected: arity,
                got: args.len(),
            });
        }

        let span = spans::command(name, session.name(), options.socket.as_deref());
        let _timer = CommandTimer::new(name);
        let ctx = Context { session, options };
        let args = Args::new(args);
        handler.handle(&ctx, &args).instrument(span).await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
