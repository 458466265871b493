//! slchatd - Straylight Chat Daemon
//!
//! The session and consistency layer of a horizontally scaled chat service.
//! Instances share a store, each owns the live connections it serves, and
//! they coordinate through a cluster bus. Every mutation of a user's sockets
//! and rooms runs under that user's distributed lock; divergence between the
//! store and the transports is reported, not rolled back.

pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod metrics;
pub mod network;
pub mod server;
pub mod session;
pub mod state;
pub mod sync;
pub mod telemetry;
pub mod validation;

pub use error::{ChatError, HandlerResult};
pub use server::{ChatServer, ServerCore};
pub use session::{CommandOptions, ServerEvent, UserSession};
