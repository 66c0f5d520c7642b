//! # DSO server
//!
//! Managed object store and distributed garbage collector.
//!
//! ## Design
//!
//! - **Store**: per-record checkout counts and locks, no global graph lock
//! - **Back-reference index**: child -> parents, mirrors the committed graph
//! - **DGC**: mark-and-sweep from roots, checkouts and client-held ids,
//!   running alongside mutation; optional young-generation passes
//! - **Replication**: DGC-consistent snapshots for a passive mirror

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod back_refs;
pub mod client_state;
pub mod config;
pub mod dgc;
pub mod object_manager;
pub mod record;
pub mod replication;
pub mod roots;
pub mod store;

pub use back_refs::BackReferenceIndex;
pub use client_state::ClientStateManager;
pub use config::ObjectManagerConfig;
pub use dgc::{
    DgcResultContext, GarbageCollectionInfo, GarbageCollectorEventListener, GcKind, GcLogger,
    GcState, GcThread, MarkAndSweepGarbageCollector,
};
pub use object_manager::{MapChange, MapChangeListener, ObjectManager, ObjectManagerStats};
pub use record::{ManagedObjectRecord, ManagedObjectState};
pub use replication::ReplicationSnapshot;
pub use roots::{RootSnapshot, RootTable};
pub use store::{ApplyMode, CheckedOut, ObjectStore, RecordCursor, RemoveOutcome, StoreStats};
