//! Block: the smallest lock-protected, separately persisted shard.
//!
//! A single `RwLock` guards the slot map, the dirty flag and the per-replica
//! sync table together, so none of them can be observed out of step with the
//! others. Every mutation bumps `version`; background passes (persistence,
//! replica delivery) snapshot under the lock, do their I/O unlocked, and only
//! clear their flag afterwards if `version` has not moved in the meantime.
//! Persists of one Block are serialised by a separate mutex, so an older
//! snapshot can never be renamed over a newer one.

use super::error::StorageError;
use super::types::{BlockId, ReplicaId, Slot};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sync bookkeeping for one replica, keyed by `ReplicaId` in the Block's
/// side-table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplNodeState {
    pub must_sync: bool,
}

#[derive(Debug, Default)]
struct BlockInner {
    slots: HashMap<String, Slot>,
    dirty: bool,
    version: u64,
    repl_state: HashMap<ReplicaId, ReplNodeState>,
}

impl BlockInner {
    fn mark_changed(&mut self) {
        self.dirty = true;
        self.version += 1;
        for state in self.repl_state.values_mut() {
            state.must_sync = true;
        }
    }
}

pub struct Block {
    id: BlockId,
    inner: RwLock<BlockInner>,
    persist_lock: Mutex<()>,
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            inner: RwLock::new(BlockInner::default()),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn get(&self, key: &str) -> Option<Slot> {
        self.inner.read().slots.get(key).cloned()
    }

    pub fn set(&self, key: String, slot: Slot) {
        let mut inner = self.inner.write();
        inner.slots.insert(key, slot);
        inner.mark_changed();
    }

    /// Removes `key`. Returns whether a slot was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.slots.remove(key).is_some();
        if removed {
            inner.mark_changed();
        }
        removed
    }

    /// Replaces the whole slot map, used when applying a replicated snapshot.
    ///
    /// Applying the same snapshot twice leaves the Block in the same state.
    pub fn replace(&self, slots: HashMap<String, Slot>) {
        let mut inner = self.inner.write();
        inner.slots = slots;
        inner.mark_changed();
    }

    /// Appends every live key starting with `prefix` to `out`.
    pub fn collect_keys(&self, prefix: &str, now: i64, out: &mut Vec<String>) {
        let inner = self.inner.read();
        out.extend(
            inner
                .slots
                .iter()
                .filter(|(key, slot)| key.starts_with(prefix) && !slot.is_expired(now))
                .map(|(key, _)| key.clone()),
        );
    }

    pub fn count_keys(&self, prefix: &str, now: i64) -> usize {
        self.inner
            .read()
            .slots
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && !slot.is_expired(now))
            .count()
    }

    /// Drops every slot whose TTL has passed. Returns the number removed.
    pub fn remove_expired(&self, now: i64) -> usize {
        let mut inner = self.inner.write();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| !slot.is_expired(now));
        let removed = before - inner.slots.len();
        if removed > 0 {
            inner.mark_changed();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// Writes the Block to its file if it has unpersisted changes.
    ///
    /// Returns `Ok(true)` if a file was written. On failure the dirty flag is
    /// left set so the next cycle retries.
    pub fn persist(&self, dir: &Path) -> Result<bool, StorageError> {
        // Held until the dirty flag is settled. Mutations only take `inner`.
        let _persisting = self.persist_lock.lock();
        let (encoded, version) = {
            let inner = self.inner.read();
            if !inner.dirty {
                return Ok(false);
            }
            let encoded =
                bincode::serialize(&inner.slots).map_err(|source| StorageError::Encode {
                    what: format!("block {}", self.id),
                    source,
                })?;
            (encoded, inner.version)
        };

        write_atomically(&self.id.path_in(dir), &encoded)?;

        let mut inner = self.inner.write();
        if inner.version == version {
            inner.dirty = false;
        }
        Ok(true)
    }

    /// Populates the Block from its file. Returns the number of slots loaded.
    ///
    /// A missing file is a never-written shard. An unreadable or corrupt file
    /// is logged and the Block starts empty.
    pub fn load(&self, dir: &Path) -> usize {
        let path = self.id.path_in(dir);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::error!("Failed to read block {} from {}: {}", self.id, path.display(), e);
                return 0;
            }
        };

        match bincode::deserialize::<HashMap<String, Slot>>(&bytes) {
            Ok(slots) => {
                let count = slots.len();
                let mut inner = self.inner.write();
                inner.slots = slots;
                inner.dirty = false;
                tracing::debug!("Read {} slots from block {}", count, self.id);
                count
            }
            Err(e) => {
                tracing::error!("Failed to decode data in block {}: {}", self.id, e);
                0
            }
        }
    }

    /// Flags the Block for a full sync to `replica`. Bumps `version` so a
    /// snapshot taken for an earlier session of the same replica cannot clear
    /// the new flag.
    pub fn register_replica(&self, replica: ReplicaId) {
        let mut inner = self.inner.write();
        inner.version += 1;
        inner
            .repl_state
            .insert(replica, ReplNodeState { must_sync: true });
    }

    pub fn unregister_replica(&self, replica: ReplicaId) {
        self.inner.write().repl_state.remove(&replica);
    }

    pub fn must_sync(&self, replica: ReplicaId) -> bool {
        self.inner
            .read()
            .repl_state
            .get(&replica)
            .map(|state| state.must_sync)
            .unwrap_or(false)
    }

    /// Snapshot of the slot map if `replica` has pending changes in this
    /// Block, along with the version it was taken at.
    pub fn sync_snapshot(&self, replica: ReplicaId) -> Option<(HashMap<String, Slot>, u64)> {
        let inner = self.inner.read();
        match inner.repl_state.get(&replica) {
            Some(state) if state.must_sync => Some((inner.slots.clone(), inner.version)),
            _ => None,
        }
    }

    /// Clears `replica`'s pending flag unless the Block changed after the
    /// snapshot at `version` was taken.
    pub fn mark_synced(&self, replica: ReplicaId, version: u64) {
        let mut inner = self.inner.write();
        if inner.version != version {
            return;
        }
        if let Some(state) = inner.repl_state.get_mut(&replica) {
            state.must_sync = false;
        }
    }
}

/// Writes `bytes` to a uniquely named sibling temp file and renames it over
/// `path`, so a crash mid-write never leaves a truncated file behind.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("{}.{}.tmp", std::process::id(), seq));
    if let Err(e) = std::fs::write(&tmp, bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(StorageError::io(&tmp, e));
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        StorageError::io(path, e)
    })
}
