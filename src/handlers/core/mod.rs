//! Core handler infrastructure: the handler trait, argument access and the
//! command registry.

pub mod context;
pub mod registry;

pub use context::{Args, Context, Handler, done, reply};
pub use registry::Registry;
