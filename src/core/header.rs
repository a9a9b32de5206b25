//! Volume header
//!
//! The first 256 bytes of every volume. All integers are little-endian.
//!
//! ```text
//! offset  size  field
//!      0     4  signature "SMFS"
//!      4     1  format version (0)
//!      5     2  block size in bytes, u16
//!      7     1  extents per inode: 3 below 1024-byte blocks, 7 otherwise
//!      8     1  attribute bytes per inode, 0..=32
//!      9     4  block group count, i32
//!     13   243  reserved, zero
//! ```
//!
//! Block group 0 starts right after the header.

use crate::core::error::{Result, SlabError};

pub const SIGNATURE: [u8; 4] = *b"SMFS";
pub const FORMAT_VERSION: u8 = 0;
pub const HEADER_SIZE: usize = 256;
pub const MIN_BLOCK_SIZE: u16 = 128;
pub const MAX_BLOCK_SIZE: u16 = 1024;
pub const MAX_ATTRIBUTE_SIZE: u8 = 32;

/// Blocks a single extent can address
pub const MAX_EXTENT_BLOCKS: usize = u8::MAX as usize;

// Field offsets inside the reserved header region
const VERSION_OFFSET: usize = 4;
const BLOCK_SIZE_OFFSET: usize = 5;
const POINTER_COUNT_OFFSET: usize = 7;
const ATTRIBUTE_SIZE_OFFSET: usize = 8;
const GROUP_COUNT_OFFSET: usize = 9;

/// Volume header (offset 0)
///
/// Describes the geometry every other structure is laid out with. Only the
/// block group count changes after creation, and it only grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Block size in bytes (power of two, 128..=1024)
    pub block_size: u16,

    /// Extents per inode, derived from the block size
    pub pointer_count: u8,

    /// User attribute bytes stored in each inode
    pub attribute_size: u8,

    /// Number of block groups laid out in the store
    pub block_group_count: i32,
}

impl Header {
    /// Create a header for a fresh volume with no block groups
    pub fn new(block_size: u16, attribute_size: u8) -> Result<Self> {
        let header = Header {
            block_size,
            pointer_count: Self::pointer_count_for(block_size),
            attribute_size,
            block_group_count: 0,
        };
        header.validate()?;
        Ok(header)
    }

    /// Small blocks get fewer extents so inode records stay compact
    pub fn pointer_count_for(block_size: u16) -> u8 {
        if block_size < 1024 {
            3
        } else {
            7
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() {
            return Err(SlabError::InvalidHeader(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(SlabError::InvalidHeader(format!(
                "block size {} outside {}..={}",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.attribute_size > MAX_ATTRIBUTE_SIZE {
            return Err(SlabError::InvalidHeader(format!(
                "attribute size {} exceeds {}",
                self.attribute_size, MAX_ATTRIBUTE_SIZE
            )));
        }
        if self.pointer_count != Self::pointer_count_for(self.block_size) {
            return Err(SlabError::InvalidHeader(format!(
                "pointer count {} does not match block size {}",
                self.pointer_count, self.block_size
            )));
        }
        if self.block_group_count < 0 {
            return Err(SlabError::InvalidHeader(format!(
                "negative block group count {}",
                self.block_group_count
            )));
        }
        Ok(())
    }

    /// Size of one inode record in bytes
    pub fn inode_size(&self) -> usize {
        4 + 1 + self.attribute_size as usize + self.pointer_count as usize * 5
    }

    /// Largest file an inode can describe
    pub fn max_file_size(&self) -> u64 {
        self.pointer_count as u64 * MAX_EXTENT_BLOCKS as u64 * self.block_size as u64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(&SIGNATURE);
        bytes[VERSION_OFFSET] = FORMAT_VERSION;
        bytes[BLOCK_SIZE_OFFSET..BLOCK_SIZE_OFFSET + 2]
            .copy_from_slice(&self.block_size.to_le_bytes());
        bytes[POINTER_COUNT_OFFSET] = self.pointer_count;
        bytes[ATTRIBUTE_SIZE_OFFSET] = self.attribute_size;
        bytes[GROUP_COUNT_OFFSET..GROUP_COUNT_OFFSET + 4]
            .copy_from_slice(&self.block_group_count.to_le_bytes());
        bytes
    }

    /// Decode and validate a header.
    ///
    /// Anything that does not look like this format at all (signature,
    /// version, block size shape, pointer derivation) is `UnknownFormat`;
    /// a recognisable header with out-of-range fields is `InvalidHeader`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(SlabError::UnknownFormat);
        }
        if bytes[..4] != SIGNATURE || bytes[VERSION_OFFSET] != FORMAT_VERSION {
            return Err(SlabError::UnknownFormat);
        }

        let block_size =
            u16::from_le_bytes([bytes[BLOCK_SIZE_OFFSET], bytes[BLOCK_SIZE_OFFSET + 1]]);
        let pointer_count = bytes[POINTER_COUNT_OFFSET];
        if !block_size.is_power_of_two() || pointer_count != Self::pointer_count_for(block_size)
        {
            return Err(SlabError::UnknownFormat);
        }

        let mut count = [0u8; 4];
        count.copy_from_slice(&bytes[GROUP_COUNT_OFFSET..GROUP_COUNT_OFFSET + 4]);

        let header = Header {
            block_size,
            pointer_count,
            attribute_size: bytes[ATTRIBUTE_SIZE_OFFSET],
            block_group_count: i32::from_le_bytes(count),
        };
        header.validate()?;
        Ok(header)
    }
}
