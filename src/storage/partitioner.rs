use super::types::BlockId;
use crc::{CRC_32_ISO_HDLC, Crc};

/// CRC-32 keeps routing stable across builds and platforms, unlike
/// `DefaultHasher`.
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Maps keys onto the Part/Block grid.
///
/// Routing is a pure function of the key and the two counts. Changing either
/// count after data exists orphans the existing block files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    num_parts: u32,
    blocks_per_part: u32,
}

impl Partitioner {
    pub fn new(num_parts: u32, blocks_per_part: u32) -> Self {
        Self {
            num_parts: num_parts.max(1),
            blocks_per_part: blocks_per_part.max(1),
        }
    }

    pub fn num_parts(&self) -> u32 {
        self.num_parts
    }

    pub fn blocks_per_part(&self) -> u32 {
        self.blocks_per_part
    }

    pub fn num_blocks(&self) -> usize {
        self.num_parts as usize * self.blocks_per_part as usize
    }

    pub fn hash_key(key: &str) -> u32 {
        CRC32.checksum(key.as_bytes())
    }

    /// The second stage divides out the first so part and block stay
    /// independent when the two counts share factors.
    pub fn locate(&self, key: &str) -> BlockId {
        let hash = Self::hash_key(key);
        BlockId {
            part: hash % self.num_parts,
            block: (hash / self.num_parts) % self.blocks_per_part,
        }
    }

    /// Dense index of a Block, `None` if the id is outside this layout.
    pub fn index_of(&self, id: BlockId) -> Option<usize> {
        if id.part >= self.num_parts || id.block >= self.blocks_per_part {
            return None;
        }
        Some(id.part as usize * self.blocks_per_part as usize + id.block as usize)
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.num_parts).flat_map(move |part| {
            (0..self.blocks_per_part).map(move |block| BlockId::new(part, block))
        })
    }
}
