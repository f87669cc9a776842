use serde::{Deserialize, Serialize};

/// Longest key the server accepts, in bytes.
pub const MAX_KEY_LEN: usize = 64 * 1024;

/// Message opcode. Encoded as a single byte on the wire.
///
/// Ack-suffixed variants ask the server for an explicit status reply; their
/// plain counterparts are fire-and-forget.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Op {
    #[default]
    Ping,
    Pong,
    Auth,
    Get,
    Set,
    SetAck,
    Del,
    DelAck,
    List,
    Count,
    Close,
}

impl Op {
    /// Operations that touch the store and therefore need an authenticated
    /// connection.
    pub fn is_store_op(self) -> bool {
        matches!(
            self,
            Op::Get | Op::Set | Op::SetAck | Op::Del | Op::DelAck | Op::List | Op::Count
        )
    }

    pub fn is_ack(self) -> bool {
        matches!(self, Op::SetAck | Op::DelAck)
    }
}

/// Reply status. Only meaningful on responses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    Ok,
    Error,
    NotFound,
    Unauthorized,
}

/// The wire unit, shared by requests and responses.
///
/// - `key`: the key for Get/Set/Del, the prefix for List/Count, the secret for Auth.
/// - `value`: the stored bytes; on a Count reply, the count as a big-endian `u64`.
/// - `expires`: unix milliseconds, `0` for no expiry.
/// - `keys`: List replies only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Msg {
    pub op: Op,
    pub status: Status,
    pub key: String,
    pub value: Vec<u8>,
    pub expires: i64,
    pub keys: Vec<String>,
}

impl Msg {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            ..Default::default()
        }
    }

    pub fn with_key(op: Op, key: impl Into<String>) -> Self {
        Self {
            op,
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn set(key: impl Into<String>, value: Vec<u8>, expires: i64, ack: bool) -> Self {
        Self {
            op: if ack { Op::SetAck } else { Op::Set },
            key: key.into(),
            value,
            expires,
            ..Default::default()
        }
    }

    pub fn reply(op: Op, status: Status) -> Self {
        Self {
            op,
            status,
            ..Default::default()
        }
    }

    pub fn count_reply(count: u64) -> Self {
        Self {
            op: Op::Count,
            status: Status::Ok,
            value: count.to_be_bytes().to_vec(),
            ..Default::default()
        }
    }

    /// Decodes the count carried by a Count reply.
    pub fn count(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.value.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}
