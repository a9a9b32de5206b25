//! Block groups
//!
//! A group is a fixed-size slab: a 32-byte head, the block bitmap, the inode
//! bitmap, the inode table and finally the data blocks. Group `i` starts at a
//! closed-form offset, so nothing indexes the groups themselves.
//!
//! ```text
//! +------+--------------+--------------+------------------+-------------+
//! | head | block bitmap | inode bitmap | 8*bs inode recs  | 8*bs blocks |
//! | 32 B |     bs B     |     bs B     |                  |             |
//! +------+--------------+--------------+------------------+-------------+
//! ```
//!
//! A loaded group keeps two views of each bitmap: the live allocator, which
//! every open transaction allocates from, and the bytes as they are on disk.
//! Only commits change the on-disk bytes, so writing a group never leaks
//! another transaction's uncommitted bits.

use crate::core::allocator::bitmap::{write_bits, zero_bits};
use crate::core::allocator::Bitmap;
use crate::core::error::{Result, SlabError};
use crate::core::header::{Header, HEADER_SIZE};
use crate::core::inode::{Inode, InodeUsage};
use crate::core::io::Store;
use crate::core::transaction::{BitChange, BitmapKind, GroupChanges, TransactionLog};
use ahash::AHashMap;

pub const GROUP_SIGNATURE: [u8; 4] = *b"BKGP";
pub const GROUP_HEAD_SIZE: usize = 32;

const FREE_BLOCKS_OFFSET: usize = 4;
const FREE_INODES_OFFSET: usize = 8;

/// Free counters stored redundantly at the start of every group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupHead {
    pub free_blocks: u16,
    pub free_inodes: u16,
}

impl GroupHead {
    pub fn to_bytes(&self) -> [u8; GROUP_HEAD_SIZE] {
        let mut bytes = [0u8; GROUP_HEAD_SIZE];
        bytes[..4].copy_from_slice(&GROUP_SIGNATURE);
        bytes[FREE_BLOCKS_OFFSET..FREE_BLOCKS_OFFSET + 2]
            .copy_from_slice(&self.free_blocks.to_le_bytes());
        bytes[FREE_INODES_OFFSET..FREE_INODES_OFFSET + 2]
            .copy_from_slice(&self.free_inodes.to_le_bytes());
        bytes
    }

    pub fn from_bytes(index: i32, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GROUP_HEAD_SIZE || bytes[..4] != GROUP_SIGNATURE {
            return Err(SlabError::InvalidBlockGroup(index));
        }
        Ok(GroupHead {
            free_blocks: u16::from_le_bytes([
                bytes[FREE_BLOCKS_OFFSET],
                bytes[FREE_BLOCKS_OFFSET + 1],
            ]),
            free_inodes: u16::from_le_bytes([
                bytes[FREE_INODES_OFFSET],
                bytes[FREE_INODES_OFFSET + 1],
            ]),
        })
    }

    /// Read only the head of group `index`
    pub fn read(store: &mut Store, layout: &GroupLayout, index: i32) -> Result<Self> {
        let mut bytes = [0u8; GROUP_HEAD_SIZE];
        store.read_at(layout.group_offset(index), &mut bytes)?;
        Self::from_bytes(index, &bytes)
    }

    pub fn fits(&self, blocks: usize, need_inode: bool) -> bool {
        self.free_blocks as usize >= blocks && (!need_inode || self.free_inodes > 0)
    }
}

/// Byte offsets of every group structure for one volume geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLayout {
    pub block_size: u16,
    pub inode_size: usize,
}

impl GroupLayout {
    pub fn new(header: &Header) -> Self {
        GroupLayout {
            block_size: header.block_size,
            inode_size: header.inode_size(),
        }
    }

    /// Blocks, and inodes, per group
    pub fn per_group(&self) -> usize {
        self.block_size as usize * 8
    }

    /// Head plus both bitmaps
    pub fn meta_size(&self) -> u64 {
        GROUP_HEAD_SIZE as u64 + 2 * self.block_size as u64
    }

    pub fn group_size(&self) -> u64 {
        let per = self.per_group() as u64;
        self.meta_size() + per * self.inode_size as u64 + per * self.block_size as u64
    }

    pub fn group_offset(&self, index: i32) -> u64 {
        HEADER_SIZE as u64 + index as u64 * self.group_size()
    }

    pub fn group_end(&self, index: i32) -> u64 {
        self.group_offset(index) + self.group_size()
    }

    pub fn block_bitmap_offset(&self, index: i32) -> u64 {
        self.group_offset(index) + GROUP_HEAD_SIZE as u64
    }

    pub fn inode_bitmap_offset(&self, index: i32) -> u64 {
        self.block_bitmap_offset(index) + self.block_size as u64
    }

    pub fn inode_offset(&self, index: i32, local: usize) -> u64 {
        self.group_offset(index) + self.meta_size() + (local * self.inode_size) as u64
    }

    pub fn block_offset(&self, index: i32, local: usize) -> u64 {
        self.group_offset(index)
            + self.meta_size()
            + (self.per_group() * self.inode_size) as u64
            + local as u64 * self.block_size as u64
    }
}

/// A loaded ("hot") block group
#[derive(Debug)]
pub struct BlockGroup {
    index: i32,
    layout: GroupLayout,
    attribute_size: u8,
    pointer_count: u8,
    blocks: Bitmap,
    inodes: Bitmap,
    saved_blocks: Vec<u8>,
    saved_inodes: Vec<u8>,
    table: AHashMap<usize, Inode>,
}

impl BlockGroup {
    /// A brand-new, completely free group
    pub fn create(index: i32, header: &Header) -> Self {
        let layout = GroupLayout::new(header);
        BlockGroup {
            index,
            layout,
            attribute_size: header.attribute_size,
            pointer_count: header.pointer_count,
            blocks: Bitmap::new(header.block_size as usize),
            inodes: Bitmap::new(header.block_size as usize),
            saved_blocks: vec![0u8; header.block_size as usize],
            saved_inodes: vec![0u8; header.block_size as usize],
            table: AHashMap::new(),
        }
    }

    /// Load head and bitmaps and check that the counters agree
    pub fn load(store: &mut Store, index: i32, header: &Header) -> Result<Self> {
        let layout = GroupLayout::new(header);
        let head = GroupHead::read(store, &layout, index)?;

        let size = header.block_size as usize;
        let mut block_bytes = vec![0u8; size];
        store.read_at(layout.block_bitmap_offset(index), &mut block_bytes)?;
        let mut inode_bytes = vec![0u8; size];
        store.read_at(layout.inode_bitmap_offset(index), &mut inode_bytes)?;

        let group = BlockGroup {
            index,
            layout,
            attribute_size: header.attribute_size,
            pointer_count: header.pointer_count,
            blocks: Bitmap::load(block_bytes.clone()),
            inodes: Bitmap::load(inode_bytes.clone()),
            saved_blocks: block_bytes,
            saved_inodes: inode_bytes,
            table: AHashMap::new(),
        };

        let actual = group.saved_head();
        if actual != head {
            return Err(SlabError::InconsistentData(format!(
                "block group {} head says {}/{} free blocks/inodes, bitmaps say {}/{}",
                index, head.free_blocks, head.free_inodes, actual.free_blocks, actual.free_inodes
            )));
        }
        Ok(group)
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    /// Head derived from the live bitmaps
    pub fn head(&self) -> GroupHead {
        GroupHead {
            free_blocks: self.blocks.free_bits() as u16,
            free_inodes: self.inodes.free_bits() as u16,
        }
    }

    /// Head as it is (or is about to be) on disk
    pub fn saved_head(&self) -> GroupHead {
        GroupHead {
            free_blocks: zero_bits(&self.saved_blocks) as u16,
            free_inodes: zero_bits(&self.saved_inodes) as u16,
        }
    }

    pub fn blocks(&self) -> &Bitmap {
        &self.blocks
    }

    pub fn inodes(&self) -> &Bitmap {
        &self.inodes
    }

    /// Exact check (contiguity included) for a pending allocation
    pub fn has_room(&self, blocks: usize, need_inode: bool) -> bool {
        self.blocks.can_allocate(blocks) && (!need_inode || self.inodes.free_bits() > 0)
    }

    /// Write head and both bitmaps from the on-disk images
    pub fn save_meta(&self, store: &mut Store) -> Result<()> {
        let mut meta = Vec::with_capacity(self.layout.meta_size() as usize);
        meta.extend_from_slice(&self.saved_head().to_bytes());
        meta.extend_from_slice(&self.saved_blocks);
        meta.extend_from_slice(&self.saved_inodes);
        store.write_at(self.layout.group_offset(self.index), &meta)
    }

    /// Write one cached inode record
    pub fn save_inode(&mut self, store: &mut Store, local: usize) -> Result<()> {
        let bytes = self.inode(store, local)?.to_bytes();
        store.write_at(self.layout.inode_offset(self.index, local), &bytes)
    }

    /// Inode record, read through the cache
    pub fn inode(&mut self, store: &mut Store, local: usize) -> Result<&Inode> {
        self.check_local(local)?;
        if !self.table.contains_key(&local) {
            let mut bytes = vec![0u8; self.layout.inode_size];
            store.read_at(self.layout.inode_offset(self.index, local), &mut bytes)?;
            let inode = Inode::from_bytes(&bytes, self.attribute_size, self.pointer_count)?;
            self.table.insert(local, inode);
        }
        self.table
            .get(&local)
            .ok_or_else(|| SlabError::Internal(format!("inode {} vanished from cache", local)))
    }

    /// Mutate an inode, recording its before-image first
    pub fn update_inode<F>(
        &mut self,
        log: &mut TransactionLog,
        store: &mut Store,
        local: usize,
        update: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Inode),
    {
        let global = self.global(local);
        let before = self.inode(store, local)?.clone();
        log.record_inode(global, &before);
        if let Some(inode) = self.table.get_mut(&local) {
            update(inode);
        }
        Ok(())
    }

    /// Claim a free inode and initialise it for `usage`
    pub fn allocate_inode(
        &mut self,
        log: &mut TransactionLog,
        store: &mut Store,
        usage: InodeUsage,
    ) -> Result<Option<usize>> {
        let Some(local) = self.inodes.allocate(1)? else {
            return Ok(None);
        };
        log.record_bits(self.index, bit_change(BitmapKind::Inodes, local, 1, true));

        let current = self.inode(store, local)?.clone();
        if !current.is_unused() {
            return Err(SlabError::InconsistentData(format!(
                "inode {} is marked free but in use",
                self.global(local)
            )));
        }

        let (attribute_size, pointer_count) = (self.attribute_size, self.pointer_count);
        self.update_inode(log, store, local, |inode| {
            *inode = Inode::empty(attribute_size, pointer_count);
            inode.usage = usage;
        })?;
        Ok(Some(local))
    }

    /// Claim `count` contiguous blocks
    pub fn allocate_blocks(
        &mut self,
        log: &mut TransactionLog,
        count: usize,
    ) -> Result<Option<usize>> {
        let first = self.blocks.allocate(count)?;
        if let Some(first) = first {
            log.record_bits(self.index, bit_change(BitmapKind::Blocks, first, count, true));
        }
        Ok(first)
    }

    /// Grow an allocation ending just before `next` by up to `max`
    pub fn expand_block_usage_at_best(
        &mut self,
        log: &mut TransactionLog,
        next: usize,
        max: usize,
    ) -> Result<usize> {
        if next >= self.blocks.size() {
            return Ok(0);
        }
        let grown = self.blocks.expand_at_best(next, max)?;
        if grown > 0 {
            log.record_bits(self.index, bit_change(BitmapKind::Blocks, next, grown, true));
        }
        Ok(grown)
    }

    /// Release blocks when the transaction commits. Until then they stay
    /// taken, so nobody else can reuse them.
    pub fn free_blocks(
        &mut self,
        log: &mut TransactionLog,
        start: usize,
        count: usize,
    ) -> Result<()> {
        self.check_release(log, BitmapKind::Blocks, start, count)?;
        log.record_bits(self.index, bit_change(BitmapKind::Blocks, start, count, false));
        Ok(())
    }

    /// Reset an inode record; its bit is released at commit
    pub fn free_inode(
        &mut self,
        log: &mut TransactionLog,
        store: &mut Store,
        local: usize,
    ) -> Result<()> {
        self.check_release(log, BitmapKind::Inodes, local, 1)?;
        let (attribute_size, pointer_count) = (self.attribute_size, self.pointer_count);
        self.update_inode(log, store, local, |inode| {
            *inode = Inode::empty(attribute_size, pointer_count);
        })?;
        log.record_bits(self.index, bit_change(BitmapKind::Inodes, local, 1, false));
        Ok(())
    }

    /// Fold committed changes into the on-disk images. Releases reach the
    /// live bitmaps only now.
    pub(crate) fn apply_changes(&mut self, changes: &[BitChange]) -> Result<()> {
        for change in changes {
            if !change.set {
                self.bitmap_mut(change.kind).free(change.start, change.count)?;
            }
            write_bits(
                self.saved_mut(change.kind),
                change.start,
                change.count,
                change.set,
            );
        }
        Ok(())
    }

    /// Undo a transaction's changes, newest first
    pub(crate) fn revert_changes(&mut self, changes: &GroupChanges) -> Result<()> {
        for change in changes.bits.iter().rev() {
            match (change.set, changes.applied) {
                (true, _) => self.bitmap_mut(change.kind).free(change.start, change.count)?,
                (false, true) => self.bitmap_mut(change.kind).claim(change.start, change.count)?,
                (false, false) => {}
            }
            if changes.applied {
                write_bits(
                    self.saved_mut(change.kind),
                    change.start,
                    change.count,
                    !change.set,
                );
            }
        }
        Ok(())
    }

    /// Read bytes from a run of blocks starting at `local_block`
    pub fn read_content(
        &self,
        store: &mut Store,
        local_block: usize,
        skip: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        self.check_content(local_block, skip, buf.len())?;
        store.read_at(self.layout.block_offset(self.index, local_block) + skip as u64, buf)
    }

    /// Write bytes into a run of blocks starting at `local_block`
    pub fn write_content(
        &self,
        store: &mut Store,
        local_block: usize,
        skip: usize,
        data: &[u8],
    ) -> Result<()> {
        self.check_content(local_block, skip, data.len())?;
        store.write_at(self.layout.block_offset(self.index, local_block) + skip as u64, data)
    }

    pub(crate) fn restore_inode(&mut self, local: usize, inode: Inode) {
        self.table.insert(local, inode);
    }

    fn bitmap_mut(&mut self, kind: BitmapKind) -> &mut Bitmap {
        match kind {
            BitmapKind::Blocks => &mut self.blocks,
            BitmapKind::Inodes => &mut self.inodes,
        }
    }

    fn saved_mut(&mut self, kind: BitmapKind) -> &mut Vec<u8> {
        match kind {
            BitmapKind::Blocks => &mut self.saved_blocks,
            BitmapKind::Inodes => &mut self.saved_inodes,
        }
    }

    /// Bits being released must be taken and not already released by `log`
    fn check_release(
        &self,
        log: &TransactionLog,
        kind: BitmapKind,
        start: usize,
        count: usize,
    ) -> Result<()> {
        let bitmap = match kind {
            BitmapKind::Blocks => &self.blocks,
            BitmapKind::Inodes => &self.inodes,
        };
        match (start..start + count)
            .find(|&index| !bitmap.is_set(index) || log.releases(self.index, kind, index))
        {
            Some(index) => Err(SlabError::WrongBit { index, set: false }),
            None => Ok(()),
        }
    }

    fn global(&self, local: usize) -> i32 {
        self.index * self.layout.per_group() as i32 + local as i32
    }

    fn check_local(&self, local: usize) -> Result<()> {
        if local >= self.layout.per_group() {
            return Err(SlabError::InvalidInode(self.global(local)));
        }
        Ok(())
    }

    fn check_content(&self, local_block: usize, skip: usize, len: usize) -> Result<()> {
        let group_bytes = self.layout.per_group() * self.layout.block_size as usize;
        if local_block * self.layout.block_size as usize + skip + len > group_bytes {
            return Err(SlabError::Internal(format!(
                "content access at block {} (+{}, {} bytes) leaves block group {}",
                local_block, skip, len, self.index
            )));
        }
        Ok(())
    }
}

fn bit_change(kind: BitmapKind, start: usize, count: usize, set: bool) -> BitChange {
    BitChange {
        kind,
        start,
        count,
        set,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::Store;
    use std::io::Cursor;

    fn header() -> Header {
        let mut header = Header::new(128, 0).unwrap();
        header.block_group_count = 1;
        header
    }

    fn store() -> Store {
        Store::new(Box::new(Cursor::new(Vec::new())), 4096).unwrap()
    }

    #[test]
    fn test_layout_offsets() {
        let header = header();
        let layout = GroupLayout::new(&header);
        let inode_size = header.inode_size();
        assert_eq!(inode_size, 20);

        assert_eq!(layout.group_offset(0), 256);
        let expected = 256 + (32 + 2 * 128) + 8 * (inode_size as u64 * 128 + 128 * 128);
        assert_eq!(layout.group_offset(1), expected);
        assert_eq!(layout.inode_offset(0, 2), 256 + 32 + 256 + 40);
        assert_eq!(
            layout.block_offset(0, 1),
            256 + 32 + 256 + 1024 * inode_size as u64 + 128
        );
        assert_eq!(layout.group_end(0), layout.group_offset(1));
    }

    #[test]
    fn test_head_roundtrip() {
        let head = GroupHead {
            free_blocks: 1000,
            free_inodes: 7,
        };
        let bytes = head.to_bytes();
        assert_eq!(&bytes[..4], b"BKGP");
        assert_eq!(&bytes[4..6], &1000u16.to_le_bytes());
        assert_eq!(&bytes[8..10], &7u16.to_le_bytes());
        assert_eq!(GroupHead::from_bytes(0, &bytes).unwrap(), head);
        assert!(matches!(
            GroupHead::from_bytes(3, &[0u8; 32]),
            Err(SlabError::InvalidBlockGroup(3))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let header = header();
        let mut store = store();
        let mut log = TransactionLog::default();

        let mut group = BlockGroup::create(0, &header);
        let local = group
            .allocate_inode(&mut log, &mut store, InodeUsage::NormalFile)
            .unwrap()
            .unwrap();
        let first = group.allocate_blocks(&mut log, 10).unwrap().unwrap();
        group.update_inode(&mut log, &mut store, local, |inode| {
            inode.length = 99;
        })
        .unwrap();
        group.save_meta(&mut store).unwrap();
        assert_eq!(
            BlockGroup::load(&mut store, 0, &header).unwrap().head().free_blocks,
            1024
        );

        group.apply_changes(log.bit_changes(0)).unwrap();
        group.save_meta(&mut store).unwrap();
        group.save_inode(&mut store, local).unwrap();

        let mut loaded = BlockGroup::load(&mut store, 0, &header).unwrap();
        assert_eq!(loaded.head().free_blocks, 1024 - 10);
        assert_eq!(loaded.head().free_inodes, 1023);
        assert!(loaded.blocks().is_set(first + 9));
        let inode = loaded.inode(&mut store, local).unwrap();
        assert_eq!(inode.length, 99);
        assert_eq!(inode.usage, InodeUsage::NormalFile);
    }

    #[test]
    fn test_load_detects_count_mismatch() {
        let header = header();
        let mut store = store();
        let group = BlockGroup::create(0, &header);
        group.save_meta(&mut store).unwrap();

        let bad = GroupHead {
            free_blocks: 5,
            free_inodes: 1024,
        };
        store
            .write_at(GroupLayout::new(&header).group_offset(0), &bad.to_bytes())
            .unwrap();
        let err = BlockGroup::load(&mut store, 0, &header).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_release_waits_for_commit() {
        let header = header();
        let mut log = TransactionLog::default();
        let mut group = BlockGroup::create(0, &header);

        let first = group.allocate_blocks(&mut log, 4).unwrap().unwrap();
        let second = group.allocate_blocks(&mut log, 4).unwrap().unwrap();
        group.free_blocks(&mut log, first, 4).unwrap();
        assert_eq!(log.bit_changes(0).len(), 3);

        // still taken until the release is applied
        assert!(group.blocks().is_set(first));
        assert_eq!(group.head().free_blocks, 1024 - 8);
        assert!(matches!(
            group.free_blocks(&mut log, first + 1, 1),
            Err(SlabError::WrongBit { .. })
        ));
        assert_eq!(group.saved_head().free_blocks, 1024);

        group.apply_changes(log.bit_changes(0)).unwrap();
        assert!(!group.blocks().is_set(first));
        assert!(group.blocks().is_set(second));
        assert_eq!(group.saved_head().free_blocks, 1024 - 4);
        assert_eq!(group.head(), group.saved_head());
    }

    #[test]
    fn test_revert_undoes_own_changes_only() {
        let header = header();
        let mut store = store();
        let mut group = BlockGroup::create(0, &header);

        let mut committed = TransactionLog::default();
        let kept = group.allocate_blocks(&mut committed, 6).unwrap().unwrap();
        group.apply_changes(committed.bit_changes(0)).unwrap();

        let mut other = TransactionLog::default();
        let theirs = group.allocate_blocks(&mut other, 2).unwrap().unwrap();

        let mut log = TransactionLog::default();
        let local = group
            .allocate_inode(&mut log, &mut store, InodeUsage::Directory)
            .unwrap()
            .unwrap();
        group.allocate_blocks(&mut log, 3).unwrap();
        group.free_blocks(&mut log, kept, 6).unwrap();
        assert!(log.inode_image(local as i32).unwrap().is_unused());

        group
            .revert_changes(&GroupChanges {
                bits: log.bit_changes(0).to_vec(),
                applied: false,
            })
            .unwrap();
        assert!(group.blocks().is_set(kept));
        assert!(group.blocks().is_set(theirs));
        assert!(!group.inodes().is_set(local));
        assert_eq!(group.head().free_blocks, 1024 - 8);

        // after the changes reached the on-disk image, revert puts it back
        let mut log = TransactionLog::default();
        group.free_blocks(&mut log, kept, 6).unwrap();
        group.apply_changes(log.bit_changes(0)).unwrap();
        assert_eq!(group.saved_head().free_blocks, 1024);
        group
            .revert_changes(&GroupChanges {
                bits: log.bit_changes(0).to_vec(),
                applied: true,
            })
            .unwrap();
        assert!(group.blocks().is_set(kept));
        assert_eq!(group.saved_head().free_blocks, 1024 - 6);
    }

    #[test]
    fn test_content_bounds() {
        let header = header();
        let mut store = store();
        let group = BlockGroup::create(0, &header);
        group.write_content(&mut store, 1023, 0, &[1u8; 128]).unwrap();
        assert!(group.write_content(&mut store, 1023, 1, &[1u8; 128]).is_err());

        let mut buf = [0u8; 4];
        group.read_content(&mut store, 1023, 124, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 4]);
    }
}
