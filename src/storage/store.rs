//! Sharded Store
//!
//! Routes every key operation to the Block that owns it. There is no global
//! lock: each Block's lock is the only synchronisation, so operations on
//! different Blocks run fully in parallel.
//!
//! ## On-disk layout
//! ```text
//! <dir>/part-0000/block-0000.bin
//! <dir>/part-0000/block-0001.bin
//! ...
//! ```
//! Every part directory is created when the Store is opened, before any
//! connection is accepted, so a later persist never fails on a missing path.

use super::block::Block;
use super::error::StorageError;
use super::partitioner::Partitioner;
use super::types::{BlockId, ReplicaId, Slot, now_ms};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Outcome of one persistence pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistReport {
    pub written: usize,
    pub failed: usize,
}

pub struct Store {
    dir: PathBuf,
    partitioner: Partitioner,
    blocks: Vec<Block>,
}

impl Store {
    /// Creates the directory layout and every Block, all empty.
    pub fn open(dir: impl Into<PathBuf>, partitioner: Partitioner) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let blocks: Vec<Block> = partitioner.block_ids().map(Block::new).collect();
        for part in 0..partitioner.num_parts() {
            let part_dir = dir.join(BlockId::new(part, 0).part_dir_name());
            std::fs::create_dir_all(&part_dir).map_err(|e| StorageError::io(&part_dir, e))?;
        }

        tracing::info!(
            "Store at {} has {} parts x {} blocks",
            dir.display(),
            partitioner.num_parts(),
            partitioner.blocks_per_part()
        );

        Ok(Self {
            dir,
            partitioner,
            blocks,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.partitioner
            .index_of(id)
            .and_then(|index| self.blocks.get(index))
    }

    fn block_for(&self, key: &str) -> &Block {
        let id = self.partitioner.locate(key);
        // locate() never leaves the layout, and the layout is fixed at open().
        let index = id.part as usize * self.partitioner.blocks_per_part() as usize
            + id.block as usize;
        &self.blocks[index]
    }

    /// Returns the live slot for `key`. A slot past its TTL is treated as
    /// absent even before the sweeper removes it.
    pub fn get(&self, key: &str) -> Option<Slot> {
        self.block_for(key)
            .get(key)
            .filter(|slot| !slot.is_expired(now_ms()))
    }

    pub fn set(&self, key: &str, value: Vec<u8>, expires: i64) {
        self.block_for(key)
            .set(key.to_string(), Slot::new(value, expires));
    }

    pub fn delete(&self, key: &str) -> bool {
        self.block_for(key).delete(key)
    }

    /// Every live key starting with `prefix`, in no particular order.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let now = now_ms();
        let mut keys = Vec::new();
        for block in &self.blocks {
            block.collect_keys(prefix, now, &mut keys);
        }
        keys
    }

    pub fn count(&self, prefix: &str) -> usize {
        let now = now_ms();
        self.blocks
            .iter()
            .map(|block| block.count_keys(prefix, now))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Block::is_empty)
    }

    /// Reads every block file. Returns the total number of slots loaded.
    pub fn load_all(&self) -> usize {
        let loaded: usize = self.blocks.iter().map(|block| block.load(&self.dir)).sum();
        tracing::info!("Loaded {} keys from {}", loaded, self.dir.display());
        loaded
    }

    /// Writes every dirty Block. Failures are logged and the Block stays
    /// dirty for the next pass.
    pub fn persist_all(&self) -> PersistReport {
        let mut report = PersistReport::default();
        for block in &self.blocks {
            match block.persist(&self.dir) {
                Ok(true) => report.written += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Failed to persist block {}: {}", block.id(), e);
                    report.failed += 1;
                }
            }
        }
        if report.written > 0 || report.failed > 0 {
            tracing::debug!(
                "Persisted {} blocks ({} failed)",
                report.written,
                report.failed
            );
        }
        report
    }

    pub fn remove_expired(&self, now: i64) -> usize {
        self.blocks
            .iter()
            .map(|block| block.remove_expired(now))
            .sum()
    }

    /// Starts tracking `replica` in every Block, all flagged for a full sync.
    pub fn register_replica(&self, replica: ReplicaId) {
        for block in &self.blocks {
            block.register_replica(replica);
        }
    }

    pub fn unregister_replica(&self, replica: ReplicaId) {
        for block in &self.blocks {
            block.unregister_replica(replica);
        }
    }

    /// Overwrites a Block with a snapshot received from the master.
    pub fn apply_block(
        &self,
        id: BlockId,
        slots: HashMap<String, Slot>,
    ) -> Result<(), StorageError> {
        let block = self.block(id).ok_or(StorageError::UnknownBlock(id))?;
        block.replace(slots);
        Ok(())
    }
}
