//! Client-Facing Server Module
//!
//! Accepts client connections and runs the per-connection protocol state
//! machine (auth, dispatch to the Store, replies) for each of them.

pub mod connection;
pub mod listener;
