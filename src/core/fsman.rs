//! Filesystem manager
//!
//! Owns the store, the header, the loaded ("hot") block groups, the cold
//! head window, the open transactions, the open-file table and the directory
//! arena. Everything else borrows through it.
//!
//! Hot groups sit in an LRU cache. Once a commit or rollback leaves more of
//! them loaded than `max_cached_groups`, the least recently used ones that no
//! open transaction has touched are dropped; their heads stay in the window.
//!
//! Space search runs in three tiers, cheapest first:
//! 1. hot groups already in memory (no I/O)
//! 2. cold groups whose cached head shows enough free space; the first one
//!    that really fits is loaded and promoted
//! 3. a brand-new group appended to the store, which always fits

use crate::core::block_group::{BlockGroup, GroupHead, GroupLayout};
use crate::core::config::Config;
use crate::core::directory::{DirectoryTree, DirId};
use crate::core::error::{Result, SlabError};
use crate::core::head_window::HeadWindow;
use crate::core::header::{Header, HEADER_SIZE};
use crate::core::inode::{global_index, local_index, BlockPointer, Inode, InodeUsage};
use crate::core::io::{Storage, Store};
use crate::core::stream::OpenFiles;
use crate::core::transaction::{log_mut, Transaction, TransactionId, TransactionMode};
use lru::LruCache;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use tracing::{debug, info, warn};

/// Inode of the root directory
pub const ROOT_INODE: i32 = 0;

/// Snapshot of volume state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStats {
    pub block_size: u16,
    pub block_group_count: i32,
    pub loaded_groups: usize,
    pub loaded_directories: usize,
    pub open_handles: usize,
    pub open_transactions: usize,
    pub free_blocks: u64,
    pub free_inodes: u64,
    pub store_len: u64,
}

pub struct FsMan {
    pub(crate) store: Store,
    pub(crate) header: Header,
    pub(crate) layout: GroupLayout,
    pub(crate) config: Config,
    pub(crate) groups: LruCache<i32, BlockGroup>,
    pub(crate) window: HeadWindow,
    pub(crate) transactions: BTreeMap<TransactionId, Transaction>,
    pub(crate) next_transaction: u32,
    pub(crate) files: OpenFiles,
    pub(crate) tree: DirectoryTree,
    closed: bool,
}

impl std::fmt::Debug for FsMan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsMan")
            .field("header", &self.header)
            .field("layout", &self.layout)
            .field("config", &self.config)
            .field("next_transaction", &self.next_transaction)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl FsMan {
    /// Lay out a new volume on an empty store
    pub fn create(storage: Box<dyn Storage>, config: Config) -> Result<Self> {
        config.validate_all()?;
        let header = Header::new(config.block_size, config.attribute_size)?;
        let mut store = Store::new(storage, config.effective_write_buffer(header.block_size))?;
        if !store.is_empty() {
            return Err(SlabError::StoreNotEmpty);
        }
        store.write_at(0, &header.to_bytes())?;
        store.ensure_len(HEADER_SIZE as u64)?;

        let mut fs = Self::assemble(store, header, config);
        let tx = fs.begin_transaction(TransactionMode::Immediate, Some("format"));
        let root = fs.allocate_inode_near(tx, None, InodeUsage::Directory, 1)?;
        if root != ROOT_INODE {
            return Err(SlabError::Internal(format!(
                "root directory landed on inode {}",
                root
            )));
        }
        fs.end_transaction(tx)?;
        fs.store.sync()?;

        info!(
            "Created volume: block size {}, attribute size {}, {} pointers per inode",
            fs.header.block_size, fs.header.attribute_size, fs.header.pointer_count
        );
        Ok(fs)
    }

    /// Open an existing volume
    pub fn open(storage: Box<dyn Storage>, config: Config) -> Result<Self> {
        config.validate_all()?;
        let mut store = Store::new(storage, config.write_buffer_size)?;
        if store.len() < HEADER_SIZE as u64 {
            return Err(SlabError::UnknownFormat);
        }
        let mut bytes = vec![0u8; HEADER_SIZE];
        store.read_at(0, &mut bytes)?;
        let header = Header::from_bytes(&bytes)?;
        if header.block_group_count == 0 {
            return Err(SlabError::InconsistentData(
                "volume has no block groups".into(),
            ));
        }

        let write_buffer = config.effective_write_buffer(header.block_size);
        store.set_capacity(write_buffer)?;
        let mut fs = Self::assemble(store, header, config);

        let root = fs.inode(ROOT_INODE)?;
        if root.usage != InodeUsage::Directory {
            return Err(SlabError::InconsistentData(
                "inode 0 is not a directory".into(),
            ));
        }
        let content = fs.read_inode_content(&root)?;
        let root_dir = fs.tree.root();
        fs.tree.get_mut(root_dir)?.load_entries(&content)?;

        info!(
            "Opened volume: block size {}, {} block groups",
            header.block_size, header.block_group_count
        );
        Ok(fs)
    }

    fn assemble(store: Store, header: Header, config: Config) -> Self {
        let window = HeadWindow::new(config.max_cached_group_heads);
        let tree = DirectoryTree::new(ROOT_INODE, config.max_cached_directories);
        FsMan {
            store,
            layout: GroupLayout::new(&header),
            header,
            config,
            groups: LruCache::unbounded(),
            window,
            transactions: BTreeMap::new(),
            next_transaction: 0,
            files: OpenFiles::default(),
            tree,
            closed: false,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn block_size(&self) -> u16 {
        self.header.block_size
    }

    pub fn root(&self) -> DirId {
        self.tree.root()
    }

    /// Write everything staged to the backing store
    pub fn flush(&mut self) -> Result<()> {
        self.store.sync()
    }

    /// Copy the committed container into `writer`
    pub fn backup(&mut self, writer: &mut dyn Write) -> Result<u64> {
        let copied = self.store.copy_to(writer)?;
        debug!("Backed up {} bytes", copied);
        Ok(copied)
    }

    /// Flush and shut down. Leaked handles are closed and reported; open
    /// transactions are rolled back and reported as unsaved changes.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;

        let leaked = self.files.handle_ids();
        for handle in &leaked {
            warn!("File handle {} was never closed", handle.get());
            if let Err(err) = self.close_handle(*handle) {
                warn!("Closing leaked handle {} failed: {}", handle.get(), err);
            }
        }

        let open: Vec<TransactionId> = self.transactions.keys().copied().collect();
        for id in &open {
            warn!("Transaction {} still open at close, rolling back", id);
            self.rollback(*id)?;
        }

        self.store.sync()?;
        info!("Closed volume");
        if !open.is_empty() {
            return Err(SlabError::UnsavedChanges(open.len()));
        }
        Ok(())
    }

    pub fn stats(&mut self) -> Result<VolumeStats> {
        let mut free_blocks = 0u64;
        let mut free_inodes = 0u64;
        for index in 0..self.header.block_group_count {
            let head = match self.groups.peek(&index) {
                Some(group) => group.head(),
                None => self.window.head(
                    &mut self.store,
                    &self.layout,
                    self.header.block_group_count,
                    index,
                )?,
            };
            free_blocks += head.free_blocks as u64;
            free_inodes += head.free_inodes as u64;
        }
        Ok(VolumeStats {
            block_size: self.header.block_size,
            block_group_count: self.header.block_group_count,
            loaded_groups: self.groups.len(),
            loaded_directories: self.tree.len(),
            open_handles: self.files.len(),
            open_transactions: self.transactions.len(),
            free_blocks,
            free_inodes,
            store_len: self.store.len(),
        })
    }

    /// Unload least recently used groups beyond `max_cached_groups`. Groups
    /// holding anything an open transaction changed are never unloaded.
    pub fn trim_groups(&mut self) {
        let capacity = self.config.max_cached_groups;
        if self.groups.len() <= capacity {
            return;
        }
        let block_size = self.header.block_size;
        let pinned: BTreeSet<i32> = self
            .transactions
            .values()
            .flat_map(|tx| tx.log.touched_groups(block_size))
            .collect();
        let victims: Vec<i32> = self
            .groups
            .iter()
            .rev()
            .map(|(index, _)| *index)
            .filter(|index| !pinned.contains(index))
            .take(self.groups.len() - capacity)
            .collect();
        for index in &victims {
            if let Some(group) = self.groups.pop(index) {
                self.window.update(*index, group.saved_head());
            }
        }
        debug!(
            "Unloaded {} block groups, {} still loaded",
            victims.len(),
            self.groups.len()
        );
    }

    pub(crate) fn ensure_group(&mut self, index: i32) -> Result<()> {
        if self.groups.contains(&index) {
            return Ok(());
        }
        if index < 0 || index >= self.header.block_group_count {
            return Err(SlabError::InvalidBlockGroup(index));
        }
        let group = BlockGroup::load(&mut self.store, index, &self.header)?;
        debug!("Loaded block group {}", index);
        self.groups.put(index, group);
        Ok(())
    }

    pub(crate) fn group(&mut self, index: i32) -> Result<&mut BlockGroup> {
        self.ensure_group(index)?;
        self.groups
            .get_mut(&index)
            .ok_or(SlabError::InvalidBlockGroup(index))
    }

    fn check_inode_index(&self, global: i32) -> Result<(i32, usize)> {
        let (group, local) = local_index(global, self.header.block_size);
        if global < 0 || group >= self.header.block_group_count {
            return Err(SlabError::InvalidInode(global));
        }
        Ok((group, local))
    }

    /// Current in-memory state of an inode record
    pub fn inode(&mut self, global: i32) -> Result<Inode> {
        let (group, local) = self.check_inode_index(global)?;
        self.ensure_group(group)?;
        let group = self
            .groups
            .get_mut(&group)
            .ok_or(SlabError::InvalidBlockGroup(group))?;
        Ok(group.inode(&mut self.store, local)?.clone())
    }

    /// Mutate an inode under `tx`, recording its before-image
    pub(crate) fn update_inode<F>(&mut self, tx: TransactionId, global: i32, update: F) -> Result<()>
    where
        F: FnOnce(&mut Inode),
    {
        let (group, local) = self.check_inode_index(global)?;
        self.check_claim(tx, global)?;
        self.ensure_group(group)?;
        let block_group = self
            .groups
            .get_mut(&group)
            .ok_or(SlabError::InvalidBlockGroup(group))?;
        let log = log_mut(&mut self.transactions, tx)?;
        block_group.update_inode(log, &mut self.store, local, update)
    }

    /// Find a group with `blocks` contiguous free blocks (and a free inode
    /// when asked), creating one if nothing existing fits
    fn find_group(&mut self, blocks: usize, need_inode: bool, exclude: Option<i32>) -> Result<i32> {
        let hot = self
            .groups
            .iter()
            .find(|(index, group)| Some(**index) != exclude && group.has_room(blocks, need_inode))
            .map(|(index, _)| *index);
        if let Some(index) = hot {
            return Ok(index);
        }

        let count = self.header.block_group_count;
        for index in 0..count {
            if Some(index) == exclude || self.groups.contains(&index) {
                continue;
            }
            let head = self
                .window
                .head(&mut self.store, &self.layout, count, index)?;
            if !head.fits(blocks, need_inode) {
                continue;
            }
            self.ensure_group(index)?;
            if self
                .groups
                .get(&index)
                .map(|group| group.has_room(blocks, need_inode))
                .unwrap_or(false)
            {
                return Ok(index);
            }
        }

        self.create_group()
    }

    /// Append a new, empty block group
    fn create_group(&mut self) -> Result<i32> {
        let index = self.header.block_group_count;
        let per_group = self.layout.per_group() as i64;
        if (index as i64 + 1) * per_group > i32::MAX as i64 {
            return Err(SlabError::UnableToAllocateBlockGroup(index));
        }

        let offset = self.layout.group_offset(index);
        if self.store.len() > offset {
            let mut magic = [0u8; 4];
            self.store.read_at(offset, &mut magic)?;
            if magic != [0u8; 4] {
                return Err(SlabError::InvalidBlockGroup(index));
            }
        }

        let group = BlockGroup::create(index, &self.header);
        group.save_meta(&mut self.store)?;
        self.store.ensure_len(self.layout.group_end(index))?;

        self.header.block_group_count += 1;
        self.store.write_at(0, &self.header.to_bytes())?;
        self.window.update(index, group.saved_head());
        self.groups.put(index, group);

        debug!("Allocated block group {}", index);
        Ok(index)
    }

    /// Allocate an inode, preferring the group of `near`, with an initial
    /// extent of `blocks` blocks in the same group
    pub(crate) fn allocate_inode_near(
        &mut self,
        tx: TransactionId,
        near: Option<i32>,
        usage: InodeUsage,
        blocks: usize,
    ) -> Result<i32> {
        let blocks = blocks.min(u8::MAX as usize);
        let preferred = match near {
            Some(global) => {
                let (group, _) = self.check_inode_index(global)?;
                self.ensure_group(group)?;
                self.groups
                    .get(&group)
                    .filter(|g| g.has_room(blocks, true))
                    .map(|_| group)
            }
            None => None,
        };
        let group_index = match preferred {
            Some(group) => group,
            None => self.find_group(blocks, true, near.map(|g| local_index(g, self.header.block_size).0))?,
        };

        let block_size = self.header.block_size;
        let group = self
            .groups
            .get_mut(&group_index)
            .ok_or(SlabError::InvalidBlockGroup(group_index))?;
        let log = log_mut(&mut self.transactions, tx)?;

        let local = group
            .allocate_inode(log, &mut self.store, usage)?
            .ok_or(SlabError::NotEnoughSpace(1))?;
        if blocks > 0 {
            let first = group
                .allocate_blocks(log, blocks)?
                .ok_or(SlabError::NotEnoughSpace(blocks))?;
            let pointer = BlockPointer::new(global_index(group_index, first, block_size), blocks as u8);
            group.update_inode(log, &mut self.store, local, |inode| {
                inode.pointers[0] = pointer;
            })?;
        }
        Ok(global_index(group_index, local, block_size))
    }

    /// Allocate `count` contiguous blocks, preferring the group of `inode`
    pub(crate) fn allocate_block_near_inode(
        &mut self,
        tx: TransactionId,
        inode: i32,
        count: usize,
    ) -> Result<BlockPointer> {
        if count == 0 || count > u8::MAX as usize {
            return Err(SlabError::InvalidArgument(format!(
                "extent of {} blocks",
                count
            )));
        }
        let (home, _) = self.check_inode_index(inode)?;
        self.ensure_group(home)?;
        let group_index = if self
            .groups
            .get(&home)
            .map(|g| g.has_room(count, false))
            .unwrap_or(false)
        {
            home
        } else {
            self.find_group(count, false, Some(home))?
        };

        let group = self
            .groups
            .get_mut(&group_index)
            .ok_or(SlabError::InvalidBlockGroup(group_index))?;
        let log = log_mut(&mut self.transactions, tx)?;
        let first = group
            .allocate_blocks(log, count)?
            .ok_or(SlabError::NotEnoughSpace(count))?;
        Ok(BlockPointer::new(
            global_index(group_index, first, self.header.block_size),
            count as u8,
        ))
    }

    /// Grow an extent in place by up to `max` blocks; returns the growth
    pub(crate) fn expand_extent_at_best(
        &mut self,
        tx: TransactionId,
        pointer: BlockPointer,
        max: usize,
    ) -> Result<usize> {
        let (group_index, first) = local_index(pointer.global_index, self.header.block_size);
        self.ensure_group(group_index)?;
        let group = self
            .groups
            .get_mut(&group_index)
            .ok_or(SlabError::InvalidBlockGroup(group_index))?;
        let log = log_mut(&mut self.transactions, tx)?;
        group.expand_block_usage_at_best(log, first + pointer.count as usize, max)
    }

    pub(crate) fn free_extent(&mut self, tx: TransactionId, pointer: BlockPointer) -> Result<()> {
        if pointer.is_empty() {
            return Ok(());
        }
        let (group_index, first) = local_index(pointer.global_index, self.header.block_size);
        self.ensure_group(group_index)?;
        let group = self
            .groups
            .get_mut(&group_index)
            .ok_or(SlabError::InvalidBlockGroup(group_index))?;
        let log = log_mut(&mut self.transactions, tx)?;
        group.free_blocks(log, first, pointer.count as usize)
    }

    /// Release an inode and every block it owns. Buffered content for it is
    /// dropped from the transaction.
    pub(crate) fn free_inode(&mut self, tx: TransactionId, global: i32) -> Result<()> {
        self.check_claim(tx, global)?;
        let inode = self.inode(global)?;
        if inode.is_unused() {
            return Err(SlabError::EmptyInode(global));
        }
        for pointer in inode.used_pointers() {
            self.free_extent(tx, *pointer)?;
        }

        let (group_index, local) = self.check_inode_index(global)?;
        let group = self
            .groups
            .get_mut(&group_index)
            .ok_or(SlabError::InvalidBlockGroup(group_index))?;
        let log = log_mut(&mut self.transactions, tx)?;
        group.free_inode(log, &mut self.store, local)?;
        log.forget_file(global);
        Ok(())
    }

    /// Read `buf.len()` committed bytes at `position` through the extents
    pub(crate) fn read_extents(&mut self, inode: &Inode, position: u64, buf: &mut [u8]) -> Result<()> {
        let block_size = self.header.block_size as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let at = position + done as u64;
            let logical = (at / block_size) as usize;
            let skip = (at % block_size) as usize;
            let (global, run) = inode.resolve_block(logical).ok_or_else(|| {
                SlabError::InconsistentData(format!("read at {} past the allocated blocks", at))
            })?;
            let span = (run * block_size as usize - skip).min(buf.len() - done);

            let (group_index, local) = local_index(global, self.header.block_size);
            self.ensure_group(group_index)?;
            let group = self
                .groups
                .get(&group_index)
                .ok_or(SlabError::InvalidBlockGroup(group_index))?;
            group.read_content(&mut self.store, local, skip, &mut buf[done..done + span])?;
            done += span;
        }
        Ok(())
    }

    /// Write `data` at `position` through the extents
    pub(crate) fn write_extents(&mut self, inode: &Inode, position: u64, data: &[u8]) -> Result<()> {
        let block_size = self.header.block_size as u64;
        let mut done = 0usize;
        while done < data.len() {
            let at = position + done as u64;
            let logical = (at / block_size) as usize;
            let skip = (at % block_size) as usize;
            let (global, run) = inode.resolve_block(logical).ok_or_else(|| {
                SlabError::InconsistentData(format!("write at {} past the allocated blocks", at))
            })?;
            let span = (run * block_size as usize - skip).min(data.len() - done);

            let (group_index, local) = local_index(global, self.header.block_size);
            self.ensure_group(group_index)?;
            let group = self
                .groups
                .get(&group_index)
                .ok_or(SlabError::InvalidBlockGroup(group_index))?;
            group.write_content(&mut self.store, local, skip, &data[done..done + span])?;
            done += span;
        }
        Ok(())
    }

    /// The committed content of an inode, `length` bytes
    pub(crate) fn read_inode_content(&mut self, inode: &Inode) -> Result<Vec<u8>> {
        let mut content = vec![0u8; inode.length.max(0) as usize];
        self.read_extents(inode, 0, &mut content)?;
        Ok(content)
    }

    /// Free counters of a group, hot or cold
    pub fn group_head(&mut self, index: i32) -> Result<GroupHead> {
        if let Some(group) = self.groups.peek(&index) {
            return Ok(group.head());
        }
        if index < 0 || index >= self.header.block_group_count {
            return Err(SlabError::InvalidBlockGroup(index));
        }
        self.window
            .head(&mut self.store, &self.layout, self.header.block_group_count, index)
    }
}

impl Drop for FsMan {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if !self.files.is_empty() {
            warn!("Volume dropped with {} open file handle(s)", self.files.len());
        }
        if !self.transactions.is_empty() {
            warn!(
                "Volume dropped with {} open transaction(s); their changes are discarded",
                self.transactions.len()
            );
        }
        if let Err(err) = self.store.sync() {
            warn!("Flush on drop failed: {}", err);
        }
    }
}
