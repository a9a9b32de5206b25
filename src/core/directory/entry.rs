//! Directory entry records
//!
//! An entry is `entry_length: u8`, `name_length: u8`, `usage: u8`,
//! `inode: i32` followed by the UTF-8 name, zero padded to `entry_length`.
//! Entry lengths are rounded up so a freed slot can be reused by names of a
//! similar size.

use crate::core::error::{Result, SlabError};
use crate::core::inode::InodeUsage;
use std::collections::BTreeMap;

/// Fixed bytes before the name
pub const ENTRY_HEADER_SIZE: usize = 7;

/// Longest name, in UTF-8 bytes
pub const MAX_NAME_LENGTH: usize = 248;

/// Bytes of the slot-count prefix at the start of a directory's content
pub const COUNT_PREFIX_SIZE: usize = 4;

/// Name length rounded to its slot size
pub fn regulated_name_length(name_length: usize) -> usize {
    match name_length {
        0..=63 => name_length.max(1).next_power_of_two(),
        225.. => MAX_NAME_LENGTH,
        _ => name_length.div_ceil(32) * 32,
    }
}

/// Full record length for a name of `name_length` bytes
pub fn entry_length(name_length: usize) -> u8 {
    (regulated_name_length(name_length) + ENTRY_HEADER_SIZE) as u8
}

/// Reject names that cannot appear as a single path segment
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > MAX_NAME_LENGTH
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(SlabError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    entry_length: u8,
    name: String,
    usage: InodeUsage,
    inode: i32,
}

impl DirectoryEntry {
    pub fn new(name: &str, inode: i32, usage: InodeUsage) -> Result<Self> {
        validate_name(name)?;
        Self::with_length(entry_length(name.len()), name, inode, usage)
    }

    fn with_length(entry_length: u8, name: &str, inode: i32, usage: InodeUsage) -> Result<Self> {
        if usage == InodeUsage::Unused || inode < 0 {
            return Err(SlabError::InvalidArgument(format!(
                "entry {} needs a used inode",
                name
            )));
        }
        if name.len() + ENTRY_HEADER_SIZE > entry_length as usize {
            return Err(SlabError::InvalidArgument(format!(
                "name {} does not fit a {} byte entry",
                name, entry_length
            )));
        }
        Ok(DirectoryEntry {
            entry_length,
            name: name.to_string(),
            usage,
            inode,
        })
    }

    /// Same slot, now describing another child
    pub fn reuse(&self, name: &str, inode: i32, usage: InodeUsage) -> Result<Self> {
        if !self.is_free() {
            return Err(SlabError::InconsistentData(format!(
                "slot holding {} reused while live",
                self.name
            )));
        }
        Self::with_length(self.entry_length, name, inode, usage)
    }

    /// Same slot, released
    pub fn freed(&self) -> Self {
        DirectoryEntry {
            entry_length: self.entry_length,
            name: String::new(),
            usage: InodeUsage::Unused,
            inode: -1,
        }
    }

    pub fn entry_length(&self) -> u8 {
        self.entry_length
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> InodeUsage {
        self.usage
    }

    pub fn inode(&self) -> i32 {
        self.inode
    }

    pub fn is_free(&self) -> bool {
        self.usage == InodeUsage::Unused
    }

    pub fn is_directory(&self) -> bool {
        self.usage == InodeUsage::Directory
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.entry_length as usize];
        bytes[0] = self.entry_length;
        bytes[1] = self.name.len() as u8;
        bytes[2] = self.usage as u8;
        bytes[3..7].copy_from_slice(&self.inode.to_le_bytes());
        bytes[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + self.name.len()]
            .copy_from_slice(self.name.as_bytes());
        bytes
    }

    /// Decode one record from the front of `bytes`, returning it with the
    /// bytes consumed
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize)> {
        let length = *bytes
            .first()
            .ok_or_else(|| SlabError::InconsistentData("directory entry truncated".into()))?
            as usize;
        if length <= ENTRY_HEADER_SIZE || bytes.len() < length {
            return Err(SlabError::InconsistentData(format!(
                "directory entry of {} bytes with {} available",
                length,
                bytes.len()
            )));
        }

        let name_length = bytes[1] as usize;
        if name_length + ENTRY_HEADER_SIZE > length {
            return Err(SlabError::InconsistentData(format!(
                "directory entry name of {} bytes in a {} byte entry",
                name_length, length
            )));
        }
        let usage = InodeUsage::from_u8(bytes[2])?;
        let inode = i32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);

        let name = if usage == InodeUsage::Unused {
            String::new()
        } else {
            std::str::from_utf8(&bytes[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + name_length])
                .map_err(|_| SlabError::InconsistentData("directory entry name is not UTF-8".into()))?
                .to_string()
        };

        Ok((
            DirectoryEntry {
                entry_length: length as u8,
                name,
                usage,
                inode,
            },
            length,
        ))
    }
}

/// Free slots bucketed by entry length
#[derive(Debug, Default, Clone)]
pub struct FreeSlots {
    buckets: BTreeMap<u8, Vec<usize>>,
}

impl FreeSlots {
    pub fn insert(&mut self, entry_length: u8, index: usize) {
        self.buckets.entry(entry_length).or_default().push(index);
    }

    /// Take a slot from the smallest bucket that fits `entry_length`
    pub fn take(&mut self, entry_length: u8) -> Option<usize> {
        let (&bucket, slots) = self.buckets.range_mut(entry_length..).next()?;
        let index = slots.pop();
        if slots.is_empty() {
            self.buckets.remove(&bucket);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}
