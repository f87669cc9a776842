//! Sharded Key-Value Store Library
//!
//! This library crate defines the modules that make up the server. It serves
//! as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`config`**: JSON configuration, command line arguments and validation.
//! - **`protocol`**: The client message model and its framed binary encoding.
//! - **`server`**: Per-connection state machine and the TCP accept loop.
//! - **`storage`**: Hash-partitioned Blocks with per-Block locking, TTL sweeping
//!   and per-Block persistence to disk.
//! - **`replication`**: One-way master to replica streaming of changed Blocks.

pub mod config;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod storage;
