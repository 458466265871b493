//! Chat command handlers.
//!
//! Every command a user may run is a [`Handler`] registered by name in the
//! [`Registry`]. The registry is the allow-list: dispatch of a name it does
//! not know fails with `NoCommand`. Handlers receive a [`Context`] carrying
//! the user's session and the per-call options, plus positional [`Args`].

mod bindings;
mod connection;
mod core;
mod direct;
mod room;

pub use bindings::SocketBindings;
pub use self::core::{Args, Context, Handler, Registry, done, reply};
