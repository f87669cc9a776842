use crc::{CRC_64_XZ, Crc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// A stored value together with its TTL and modification metadata.
///
/// `expires` and `modified` are unix timestamps in milliseconds.
/// An `expires` of `0` means the slot never expires.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slot {
    pub value: Vec<u8>,
    pub expires: i64,
    pub modified: i64,
}

impl Slot {
    pub fn new(value: Vec<u8>, expires: i64) -> Self {
        Self {
            value,
            expires,
            modified: now_ms(),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires != 0 && self.expires <= now
    }
}

/// Two-level shard address of a Block: the Part it belongs to and its index
/// within that Part.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub part: u32,
    pub block: u32,
}

impl BlockId {
    pub fn new(part: u32, block: u32) -> Self {
        Self { part, block }
    }

    pub fn part_dir_name(&self) -> String {
        format!("part-{:04x}", self.part)
    }

    pub fn file_name(&self) -> String {
        format!("block-{:04x}.bin", self.block)
    }

    /// Location of this Block's file below the store's base directory.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.part_dir_name()).join(self.file_name())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.part, self.block)
    }
}

/// Identifier of a replica as known by the master.
///
/// A CRC-64 of the replica's whole persisted identity, so it stays stable
/// across reconnects and identities sharing a prefix stay distinct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    pub fn from_identity(identity: &[u8]) -> Self {
        Self(CRC64.checksum(identity))
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
