//! # DSO node
//!
//! Runs the object manager and any number of clients in one process,
//! connected through a loopback transport.
//!
//! ## Design
//!
//! - **Loopback**: client seams served straight from the object manager;
//!   map writes are optimistic read-decide-commit loops on the map version
//! - **Fan-out**: DGC results and map changes reach every client the way a
//!   networked server would broadcast them
//! - **Config**: `dso.toml` with `[server]`, `[client]` and `[map]` tables

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod demo;
pub mod loopback;
pub mod node;

pub use config::{DsoConfig, find_config_file, load_config};
pub use demo::{DemoReport, ListNode, demo_classes, run_demo};
pub use loopback::LoopbackRemote;
pub use node::{ClientNode, DsoNode, NodeStats};
