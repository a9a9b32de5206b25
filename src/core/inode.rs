//! Inode records and global addressing
//!
//! An inode record is `length: i32`, `usage: u8`, the attribute bytes, then
//! `pointer_count` block pointers of `global: i32, count: u8`. All integers
//! are little endian.

use crate::core::error::{Result, SlabError};
use crate::core::header::MAX_EXTENT_BLOCKS;

/// Bytes per serialized block pointer
pub const POINTER_SIZE: usize = 5;

/// What an inode is used for
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InodeUsage {
    Unused = 0,
    Directory = 1,
    NormalFile = 2,
    TinyFile = 3,
}

impl InodeUsage {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Unused),
            1 => Ok(Self::Directory),
            2 => Ok(Self::NormalFile),
            3 => Ok(Self::TinyFile),
            other => Err(SlabError::InconsistentData(format!(
                "unknown inode usage {}",
                other
            ))),
        }
    }

    pub fn is_file(self) -> bool {
        matches!(self, Self::NormalFile | Self::TinyFile)
    }
}

/// A run of contiguous blocks inside one block group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockPointer {
    /// Global index of the first block
    pub global_index: i32,
    /// Blocks in the run (1..=255 when in use)
    pub count: u8,
}

impl BlockPointer {
    pub const EMPTY: BlockPointer = BlockPointer {
        global_index: 0,
        count: 0,
    };

    pub fn new(global_index: i32, count: u8) -> Self {
        BlockPointer {
            global_index,
            count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.global_index == 0 && self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count as usize == MAX_EXTENT_BLOCKS
    }
}

/// In-memory inode record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub length: i32,
    pub usage: InodeUsage,
    pub attributes: Vec<u8>,
    pub pointers: Vec<BlockPointer>,
}

impl Inode {
    pub fn empty(attribute_size: u8, pointer_count: u8) -> Self {
        Inode {
            length: 0,
            usage: InodeUsage::Unused,
            attributes: vec![0; attribute_size as usize],
            pointers: vec![BlockPointer::EMPTY; pointer_count as usize],
        }
    }

    pub fn record_size(attribute_size: u8, pointer_count: u8) -> usize {
        4 + 1 + attribute_size as usize + pointer_count as usize * POINTER_SIZE
    }

    pub fn is_unused(&self) -> bool {
        self.usage == InodeUsage::Unused
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            4 + 1 + self.attributes.len() + self.pointers.len() * POINTER_SIZE,
        );
        bytes.extend_from_slice(&self.length.to_le_bytes());
        bytes.push(self.usage as u8);
        bytes.extend_from_slice(&self.attributes);
        for pointer in &self.pointers {
            bytes.extend_from_slice(&pointer.global_index.to_le_bytes());
            bytes.push(pointer.count);
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8], attribute_size: u8, pointer_count: u8) -> Result<Self> {
        let size = Self::record_size(attribute_size, pointer_count);
        if bytes.len() < size {
            return Err(SlabError::InconsistentData(format!(
                "inode record needs {} bytes, got {}",
                size,
                bytes.len()
            )));
        }

        let length = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let usage = InodeUsage::from_u8(bytes[4])?;
        let attr_end = 5 + attribute_size as usize;
        let attributes = bytes[5..attr_end].to_vec();

        let pointers = bytes[attr_end..size]
            .chunks_exact(POINTER_SIZE)
            .map(|chunk| {
                BlockPointer::new(
                    i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                    chunk[4],
                )
            })
            .collect();

        Ok(Inode {
            length,
            usage,
            attributes,
            pointers,
        })
    }

    /// Blocks owned across all extents
    pub fn allocated_blocks(&self) -> usize {
        self.pointers.iter().map(|p| p.count as usize).sum()
    }

    /// Index of the last non-empty pointer
    pub fn last_used_pointer(&self) -> Option<usize> {
        self.pointers.iter().rposition(|p| !p.is_empty())
    }

    /// Non-empty pointers, in order
    pub fn used_pointers(&self) -> impl Iterator<Item = &BlockPointer> {
        self.pointers.iter().take_while(|p| !p.is_empty())
    }

    /// Map a logical block to `(global block index, blocks left in that run)`
    pub fn resolve_block(&self, logical_block: usize) -> Option<(i32, usize)> {
        let mut skipped = 0;
        for pointer in self.used_pointers() {
            let count = pointer.count as usize;
            if logical_block < skipped + count {
                let offset = logical_block - skipped;
                return Some((pointer.global_index + offset as i32, count - offset));
            }
            skipped += count;
        }
        None
    }
}

/// Global index from a group and a group-local index
pub fn global_index(group: i32, local: usize, block_size: u16) -> i32 {
    group * per_group(block_size) as i32 + local as i32
}

/// Split a global index into `(group, local)`
pub fn local_index(global: i32, block_size: u16) -> (i32, usize) {
    let per = per_group(block_size) as i32;
    (global / per, (global % per) as usize)
}

/// Blocks (and inodes) per block group
pub fn per_group(block_size: u16) -> usize {
    block_size as usize * 8
}
