//! Sharded Storage Module
//!
//! Implements the lock-per-Block storage engine.
//!
//! ## Core Concepts
//! - **Partitioning**: A key hashes to a Part, then to a Block inside that Part.
//!   Routing is a pure function, so every node resolves a key to the same Block.
//! - **Blocks**: Each Block owns its slots behind one lock, tracks whether it has
//!   unpersisted changes, and keeps a side-table of which replicas still need it.
//! - **Persistence**: Dirty Blocks are written whole to one file each by a
//!   background pass; I/O happens outside the Block lock.
//! - **Expiry**: A background sweep drops slots whose TTL has passed.

pub mod block;
pub mod error;
pub mod expiry;
pub mod partitioner;
pub mod persister;
pub mod store;
pub mod types;
