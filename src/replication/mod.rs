//! Replication Module
//!
//! Best-effort master → replica catch-up, not a consensus log.
//!
//! ## Core Mechanisms
//! - **Per-Block obligations**: Each Block keeps a `must_sync` flag per connected
//!   replica. Any change to the Block raises the flag for every replica.
//! - **Coalescing delivery**: The master periodically sends each flagged Block's
//!   full current state and clears the flag. Intermediate changes are not
//!   replayed; a replica converges on the latest state of each Block.
//! - **Durable bookmark**: The replica keeps a random 32-byte identity and a
//!   `head` counter of applied snapshots, written to disk periodically.

pub mod client;
pub mod master;
pub mod types;

#[cfg(test)]
mod tests;
