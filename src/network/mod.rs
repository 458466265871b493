//! Network module.
//!
//! Contains the instance transport contract with its in-process
//! implementation, and the JSON-lines TCP gateway in front of it.

mod gateway;
pub mod transport;

pub use gateway::Gateway;
pub use transport::{Event, MemoryTransport, Transport, TransportError};
