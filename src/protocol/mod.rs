//! Wire Protocol Module
//!
//! Defines the message schema exchanged with clients and its byte-level
//! encoding.
//!
//! ## Core Concepts
//! - **Schema**: One `Msg` type carries opcode, status, key, value, expiry and a
//!   key list, covering every request and response.
//! - **Codec**: Compact varint bincode. Malformed bytes decode to an error,
//!   never a panic.
//! - **Framing**: Terminator-delimited frames with SLIP escaping. This is the
//!   only framing the server speaks; it preserves per-connection order.

pub mod codec;
pub mod error;
pub mod types;
