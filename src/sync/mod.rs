//! Cross-instance coordination: the cluster bus and the per-user lock.

mod bus;
mod lock;

pub use bus::{BusEnvelope, BusHub, BusReport, BusRequest, ClusterBus, InstanceFilter, MemoryBus};
pub use lock::{DistributedLock, LockGuard};
