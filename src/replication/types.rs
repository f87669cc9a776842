use crate::protocol::codec::{MAX_FRAME_LEN, decode_with_limit, encode_with_limit, write_frame};
use crate::protocol::error::ProtocolError;
use crate::storage::types::{BlockId, ReplicaId, Slot};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::AsyncWrite;

pub const IDENTITY_LEN: usize = 32;

/// Target encoded size of one snapshot piece. A piece holding a single slot
/// may exceed it, but never [`REPL_MSG_LIMIT`], since that slot was admitted
/// through a client frame.
pub const REPL_CHUNK_LEN: u64 = (MAX_FRAME_LEN / 2) as u64;

/// Encode and decode limit for replication messages.
pub const REPL_MSG_LIMIT: usize = 2 * MAX_FRAME_LEN;

/// Frame read limit on the replica, leaving room for escaping.
pub const REPL_FRAME_LIMIT: usize = 2 * REPL_MSG_LIMIT;

/// A replica's durable identity and bookmark.
///
/// `head` counts the Block snapshots applied so far. It only moves forward and
/// is written to disk periodically, so after an unclean restart it may lag
/// what was actually applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplClientState {
    pub id: Vec<u8>,
    pub head: u64,
}

impl ReplClientState {
    /// Fresh identity from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut id = vec![0u8; IDENTITY_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self { id, head: 0 }
    }

    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId::from_identity(&self.id)
    }

    pub fn id_hex(&self) -> String {
        self.id.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Master/replica wire protocol, carried in the same frames as client traffic.
///
/// - `Hello`: first message from a replica, with its identity and bookmark.
/// - `Welcome` / `Denied`: the master's answer to `Hello`.
/// - `BlockPart`: a leading piece of a Block snapshot too large for one frame.
/// - `Block`: the full current contents of one Block, or the final piece of
///   it. The replica merges any preceding pieces and applies by overwrite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReplMessage {
    Hello {
        id: Vec<u8>,
        head: u64,
        secret: String,
    },
    Welcome,
    Denied {
        reason: String,
    },
    BlockPart {
        id: BlockId,
        slots: HashMap<String, Slot>,
    },
    Block {
        id: BlockId,
        slots: HashMap<String, Slot>,
    },
}

impl ReplMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_with_limit(bytes, REPL_MSG_LIMIT)
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let payload = encode_with_limit(self, REPL_MSG_LIMIT)?;
        write_frame(writer, &payload).await
    }
}
