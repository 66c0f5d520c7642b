//! # DSO client
//!
//! Per-process side of the distributed shared-object runtime.
//!
//! ## Design
//!
//! - **Identity map**: at most one live peer per object id; proxies hold
//!   peers weakly and dropped peers flow through a cleanup queue
//! - **Fault-in**: one round trip returns the object plus prefetched
//!   neighbours; reference fields resolve eagerly to a bounded depth and
//!   lazily beyond it; prefetched records nobody asks for are dropped and
//!   released after two cleaner ticks
//! - **Commit**: only fields changed since the last shipped baseline travel
//! - **Server maps**: server-first mutation with a local cache bounded by
//!   idle time, age and entry count
//! - **Seams**: [`RemoteObjectManager`] and [`ServerMapSource`] abstract
//!   the transport

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod manager;
pub mod peer;
pub mod periodic;
mod prefetch;
pub mod remote;
pub mod server_map;
pub mod shared;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ServerMapConfig};
pub use manager::{ClientObjectManager, ClientStats};
pub use peer::{ObjectProxy, Peer};
pub use periodic::PeriodicTask;
pub use remote::{RemoteObjectManager, ServerMapSource};
pub use server_map::{
    CacheStats, EvictionPolicy, EvictionReason, MapHandle, SERVER_MAP_CLASS, ServerMap,
    ServerMapRegistry, SweepOutcome,
};
pub use shared::{ClassRegistry, Reference, SharedObject};
