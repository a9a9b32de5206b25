//! Open files
//!
//! A handle is an entry in the open-file table: the inode, a position, the
//! access it was opened with and, for writers, the transaction its writes
//! are buffered under. Writes only ever reach the store at commit, where
//! [`FsMan::commit_file_change`] grows the extents to fit and applies the
//! compacted writes.
//!
//! Growth tries the cheap paths first: stretch the last extent in place,
//! then fill an empty pointer slot. When every slot is taken the file is
//! self-defragmented into fewer, larger extents.

use crate::core::directory::entry::validate_name;
use crate::core::directory::DirId;
use crate::core::error::{Result, SlabError};
use crate::core::fsman::FsMan;
use crate::core::header::MAX_EXTENT_BLOCKS;
use crate::core::inode::BlockPointer;
use crate::core::transaction::{
    compact_writes, log_mut, FileChange, TransactionId, TransactionMode, WriteOp,
};
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use tracing::{debug, warn};

/// Open-file handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u32);

impl HandleId {
    pub fn get(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    ReadWrite,
}

impl FileAccess {
    pub fn can_write(self) -> bool {
        self == FileAccess::ReadWrite
    }
}

/// How an open treats a missing or existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// The file must exist
    Open,
    /// Open, creating the file if missing
    OpenOrCreate,
    /// The file must not exist yet
    CreateNew,
    /// Create, or truncate an existing file
    Create,
    /// The file must exist; its length is reset to zero
    Truncate,
    /// The file must exist; the position starts at its end
    Append,
}

impl OpenMode {
    fn needs_write(self) -> bool {
        matches!(
            self,
            OpenMode::CreateNew | OpenMode::Create | OpenMode::Truncate | OpenMode::Append
        )
    }
}

#[derive(Debug)]
struct OpenFile {
    inode: i32,
    name: String,
    access: FileAccess,
    position: u64,
    transaction: Option<TransactionId>,
    owns_transaction: bool,
}

#[derive(Debug, Default)]
struct FileSharing {
    writer: Option<HandleId>,
    readers: usize,
}

/// Table of open handles and per-inode sharing state
#[derive(Debug, Default)]
pub struct OpenFiles {
    handles: BTreeMap<HandleId, OpenFile>,
    sharing: AHashMap<i32, FileSharing>,
    next: u32,
}

impl OpenFiles {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handle_ids(&self) -> Vec<HandleId> {
        self.handles.keys().copied().collect()
    }

    /// Any handle open on `inode`
    pub fn is_open(&self, inode: i32) -> bool {
        self.sharing.contains_key(&inode)
    }

    pub fn readers(&self, inode: i32) -> usize {
        self.sharing.get(&inode).map(|s| s.readers).unwrap_or(0)
    }

    pub fn has_writer(&self, inode: i32) -> bool {
        self.sharing
            .get(&inode)
            .map(|s| s.writer.is_some())
            .unwrap_or(false)
    }

    fn check_access(&self, inode: i32, access: FileAccess, name: &str) -> Result<()> {
        if access.can_write() && self.has_writer(inode) {
            return Err(SlabError::FileWriteAccessTaken(name.to_string()));
        }
        Ok(())
    }

    fn register(&mut self, file: OpenFile) -> HandleId {
        self.next = self.next.wrapping_add(1).max(1);
        while self.handles.contains_key(&HandleId(self.next)) {
            self.next = self.next.wrapping_add(1).max(1);
        }
        let handle = HandleId(self.next);

        let sharing = self.sharing.entry(file.inode).or_default();
        if file.access.can_write() {
            sharing.writer = Some(handle);
        } else {
            sharing.readers += 1;
        }
        self.handles.insert(handle, file);
        handle
    }

    fn release(&mut self, handle: HandleId) -> Result<OpenFile> {
        let file = self
            .handles
            .remove(&handle)
            .ok_or(SlabError::InvalidHandle(handle.0))?;
        if let Some(sharing) = self.sharing.get_mut(&file.inode) {
            if sharing.writer == Some(handle) {
                sharing.writer = None;
            } else {
                sharing.readers = sharing.readers.saturating_sub(1);
            }
            if sharing.writer.is_none() && sharing.readers == 0 {
                self.sharing.remove(&file.inode);
            }
        }
        Ok(file)
    }

    fn get(&self, handle: HandleId) -> Result<&OpenFile> {
        self.handles
            .get(&handle)
            .ok_or(SlabError::InvalidHandle(handle.0))
    }

    fn get_mut(&mut self, handle: HandleId) -> Result<&mut OpenFile> {
        self.handles
            .get_mut(&handle)
            .ok_or(SlabError::InvalidHandle(handle.0))
    }

    /// Detach every handle from a transaction that is going away
    pub(crate) fn unbind_transaction(&mut self, id: TransactionId) {
        for file in self.handles.values_mut() {
            if file.transaction == Some(id) {
                file.transaction = None;
                file.owns_transaction = false;
            }
        }
    }
}

impl FsMan {
    /// Open `name` in `dir`.
    ///
    /// A writer opened without `tx` gets its own temporary transaction that
    /// commits when the handle closes. Readers never hold a transaction;
    /// `tx` is then only used if the file has to be created.
    pub fn open_file(
        &mut self,
        tx: Option<TransactionId>,
        dir: DirId,
        name: &str,
        mode: OpenMode,
        access: FileAccess,
        size_hint: Option<u64>,
    ) -> Result<HandleId> {
        validate_name(name)?;
        if self.has_directory(dir, name)? {
            return Err(SlabError::InvalidArgument(format!(
                "{} is a directory",
                name
            )));
        }
        let existing = self.find_file(dir, name)?;
        match (mode, existing) {
            (OpenMode::Open | OpenMode::Truncate | OpenMode::Append, None) => {
                return Err(SlabError::NotFound(name.to_string()));
            }
            (OpenMode::CreateNew, Some(_)) => {
                return Err(SlabError::AlreadyExists(name.to_string()));
            }
            _ => {}
        }
        if mode.needs_write() && !access.can_write() {
            return Err(SlabError::NoWriteAccess);
        }
        if let Some(inode) = existing {
            self.files.check_access(inode, access, name)?;
        }
        if let Some(id) = tx {
            self.require_open(id)?;
        }

        let (bound, owns) = match (access, tx) {
            (FileAccess::ReadWrite, Some(id)) => (Some(id), false),
            (FileAccess::ReadWrite, None) => (
                Some(self.begin_transaction(TransactionMode::Temporary, Some(name))),
                true,
            ),
            (FileAccess::Read, _) => (None, false),
        };

        let claimed = match (existing, bound) {
            (Some(inode), Some(id)) => self.check_claim(id, inode),
            _ => Ok(()),
        };
        let prepared = claimed
            .and_then(|_| self.prepare_file(bound.or(tx), dir, name, mode, existing, size_hint))
            .and_then(|inode| {
                let position = match mode {
                    OpenMode::Append => self.inode(inode)?.length.max(0) as u64,
                    _ => 0,
                };
                Ok((inode, position))
            });
        let (inode, position) = match prepared {
            Ok(opened) => opened,
            Err(err) => {
                if let (true, Some(id)) = (owns, bound) {
                    if let Err(rollback) = self.rollback(id) {
                        warn!("Rollback of transaction {} failed: {}", id, rollback);
                    }
                }
                return Err(err);
            }
        };

        let handle = self.files.register(OpenFile {
            inode,
            name: name.to_string(),
            access,
            position,
            transaction: bound,
            owns_transaction: owns,
        });
        debug!(
            "Opened {} (inode {}) as handle {} for {:?}",
            name,
            inode,
            handle.get(),
            access
        );
        Ok(handle)
    }

    fn prepare_file(
        &mut self,
        tx: Option<TransactionId>,
        dir: DirId,
        name: &str,
        mode: OpenMode,
        existing: Option<i32>,
        size_hint: Option<u64>,
    ) -> Result<i32> {
        let truncate = mode == OpenMode::Truncate || mode == OpenMode::Create;
        match existing {
            Some(inode) if truncate => {
                self.with_transaction(tx, |fs, tx| fs.truncate_inode(tx, inode))?;
                Ok(inode)
            }
            Some(inode) => Ok(inode),
            None => {
                let block_size = self.header.block_size as u64;
                let blocks = size_hint
                    .map(|size| size.div_ceil(block_size).min(MAX_EXTENT_BLOCKS as u64))
                    .unwrap_or(1) as usize;
                self.with_transaction(tx, |fs, tx| fs.create_file(tx, dir, name, blocks))
            }
        }
    }

    fn truncate_inode(&mut self, tx: TransactionId, inode: i32) -> Result<()> {
        let current = self.inode(inode)?;
        log_mut(&mut self.transactions, tx)?
            .file_change(inode, current.length)
            .writes
            .clear();
        self.update_inode(tx, inode, |record| record.length = 0)
    }

    /// Handle's inode, access and bound transaction
    fn writer(&self, handle: HandleId) -> Result<(i32, u64, TransactionId)> {
        let file = self.files.get(handle)?;
        if !file.access.can_write() {
            return Err(SlabError::NoWriteAccess);
        }
        let tx = file.transaction.ok_or(SlabError::MissingTransaction)?;
        self.require_open(tx)?;
        self.check_claim(tx, file.inode)?;
        Ok((file.inode, file.position, tx))
    }

    fn check_size(&self, requested: u64) -> Result<()> {
        let max = self.header.max_file_size();
        if requested > max {
            return Err(SlabError::FileTooLarge { requested, max });
        }
        Ok(())
    }

    /// Read at the handle's position. Fails while any transaction buffers
    /// writes for the file.
    pub fn read(&mut self, handle: HandleId, buf: &mut [u8]) -> Result<usize> {
        let (global, position) = {
            let file = self.files.get(handle)?;
            (file.inode, file.position)
        };
        if self.has_pending_writes(global) {
            return Err(SlabError::ReadWhileContentChanged(global));
        }

        let inode = self.inode(global)?;
        let length = inode.length.max(0) as u64;
        if position >= length || buf.is_empty() {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(length - position) as usize;
        self.read_extents(&inode, position, &mut buf[..count])?;
        self.files.get_mut(handle)?.position += count as u64;
        Ok(count)
    }

    /// Buffer a write at the handle's position under its transaction
    pub fn write(&mut self, handle: HandleId, data: &[u8]) -> Result<usize> {
        let (global, position, tx) = self.writer(handle)?;
        if data.is_empty() {
            return Ok(0);
        }
        let end = position + data.len() as u64;
        self.check_size(end)?;

        let current = self.inode(global)?;
        log_mut(&mut self.transactions, tx)?
            .file_change(global, current.length)
            .writes
            .push(WriteOp::new(position, data.to_vec()));
        if end > current.length.max(0) as u64 {
            self.update_inode(tx, global, |record| record.length = end as i32)?;
        }
        self.files.get_mut(handle)?.position = end;
        Ok(data.len())
    }

    /// Move the position; positions past the end are rejected
    pub fn seek(&mut self, handle: HandleId, target: SeekFrom) -> Result<u64> {
        let (global, position) = {
            let file = self.files.get(handle)?;
            (file.inode, file.position)
        };
        let length = self.inode(global)?.length.max(0) as u64;

        let position = match target {
            SeekFrom::Start(offset) => Some(offset as i128),
            SeekFrom::End(delta) => Some(length as i128 + delta as i128),
            SeekFrom::Current(delta) => Some(position as i128 + delta as i128),
        }
        .filter(|p| *p >= 0)
        .ok_or_else(|| SlabError::InvalidArgument("seek before the start of the file".into()))?;
        if position > length as i128 {
            return Err(SlabError::SeekOutOfRange {
                position: position.min(i64::MAX as i128) as i64,
                length,
            });
        }

        let position = position as u64;
        self.files.get_mut(handle)?.position = position;
        Ok(position)
    }

    /// Grow with zeros or shrink. Shrinking keeps the blocks.
    pub fn set_length(&mut self, handle: HandleId, length: u64) -> Result<()> {
        let (global, position, tx) = self.writer(handle)?;
        self.check_size(length)?;
        let current = self.inode(global)?;
        let old = current.length.max(0) as u64;

        let change = log_mut(&mut self.transactions, tx)?.file_change(global, current.length);
        if length > old {
            change
                .writes
                .push(WriteOp::new(old, vec![0u8; (length - old) as usize]));
        } else if length < old {
            change.writes.retain_mut(|op| {
                if op.position >= length {
                    return false;
                }
                if op.end() > length {
                    op.data.truncate((length - op.position) as usize);
                }
                true
            });
        }
        self.update_inode(tx, global, |record| record.length = length as i32)?;
        if position > length {
            self.files.get_mut(handle)?.position = length;
        }
        Ok(())
    }

    pub fn length(&mut self, handle: HandleId) -> Result<u64> {
        let global = self.files.get(handle)?.inode;
        Ok(self.inode(global)?.length.max(0) as u64)
    }

    pub fn position(&self, handle: HandleId) -> Result<u64> {
        Ok(self.files.get(handle)?.position)
    }

    /// Name the handle was opened with
    pub fn handle_name(&self, handle: HandleId) -> Result<&str> {
        Ok(&self.files.get(handle)?.name)
    }

    pub fn handle_transaction(&self, handle: HandleId) -> Result<Option<TransactionId>> {
        Ok(self.files.get(handle)?.transaction)
    }

    pub fn read_attributes(&mut self, handle: HandleId) -> Result<Vec<u8>> {
        let global = self.files.get(handle)?.inode;
        Ok(self.inode(global)?.attributes)
    }

    /// Replace the attributes; shorter input is zero padded
    pub fn write_attributes(&mut self, handle: HandleId, attributes: &[u8]) -> Result<()> {
        let (global, _, tx) = self.writer(handle)?;
        let size = self.header.attribute_size as usize;
        if attributes.len() > size {
            return Err(SlabError::InvalidArgument(format!(
                "{} attribute bytes given, inodes hold {}",
                attributes.len(),
                size
            )));
        }
        let mut padded = attributes.to_vec();
        padded.resize(size, 0);

        let current = self.inode(global)?;
        let change = log_mut(&mut self.transactions, tx)?.file_change(global, current.length);
        if change.old_attributes.is_none() {
            change.old_attributes = Some(current.attributes.clone());
        }
        self.update_inode(tx, global, |record| record.attributes = padded)
    }

    /// Commit the handle's transaction unless the caller manages it
    pub fn flush_handle(&mut self, handle: HandleId) -> Result<()> {
        let Some(tx) = self.files.get(handle)?.transaction else {
            return Ok(());
        };
        match self.transaction(tx).map(|t| t.mode()) {
            Some(TransactionMode::Temporary | TransactionMode::Immediate) => self.commit(tx),
            _ => Ok(()),
        }
    }

    /// Close a handle, committing and disposing a transaction it owns. A
    /// failed commit rolls that transaction back.
    pub fn close_handle(&mut self, handle: HandleId) -> Result<()> {
        let file = self.files.release(handle)?;
        debug!("Closed handle {} ({})", handle.get(), file.name);

        let Some(tx) = file.transaction.filter(|_| file.owns_transaction) else {
            return Ok(());
        };
        if !self.transactions.contains_key(&tx) {
            return Ok(());
        }
        if let Err(err) = self.end_transaction(tx) {
            if self.transactions.contains_key(&tx) {
                if let Err(rollback) = self.rollback(tx) {
                    warn!("Rollback of transaction {} failed: {}", tx, rollback);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Apply one file's buffered writes, growing its extents first when the
    /// writes reach past them
    pub(crate) fn commit_file_change(
        &mut self,
        tx: TransactionId,
        global: i32,
        change: FileChange,
    ) -> Result<()> {
        let inode = self.inode(global)?;
        if inode.is_unused() {
            return Ok(());
        }
        if change.old_attributes.is_some() {
            debug!("Attributes of inode {} replaced", global);
        }
        let ops = compact_writes(&change.writes);
        let Some(max_end) = ops.last().map(WriteOp::end) else {
            return Ok(());
        };

        let block_size = self.header.block_size as u64;
        let capacity = inode.allocated_blocks() as u64 * block_size;
        let relocations = if max_end > capacity {
            let committed = change.origin_length.min(inode.length).max(0) as u64;
            self.allocate_more_blocks(tx, global, max_end - capacity, committed)?
        } else {
            Vec::new()
        };

        let inode = self.inode(global)?;
        for op in relocations.iter().chain(ops.iter()) {
            self.write_extents(&inode, op.position, &op.data)?;
        }
        Ok(())
    }

    /// Add room for at least `bytes` more bytes. Returns content writes that
    /// move data a self-defragmentation relocated.
    pub(crate) fn allocate_more_blocks(
        &mut self,
        tx: TransactionId,
        global: i32,
        bytes: u64,
        committed: u64,
    ) -> Result<Vec<WriteOp>> {
        let block_size = self.header.block_size as u64;
        let inode = self.inode(global)?;
        let slots = inode.pointers.len();
        let have = inode.allocated_blocks();
        let cap = slots * MAX_EXTENT_BLOCKS;

        let min = bytes.div_ceil(block_size) as usize;
        let target = (min * 2).max(have).min(cap - have);
        if min > target {
            return Err(SlabError::UnableToAllocateMoreBlocks(format!(
                "inode {} needs {} more blocks, {} of {} in use",
                global, min, have, cap
            )));
        }

        let last_used = inode.last_used_pointer();
        let mut pointers = inode.pointers;
        let mut allocated = 0;
        for slot in 0..slots {
            if allocated >= target {
                break;
            }
            let pointer = pointers[slot];
            if pointer.is_empty() {
                let count = (target - allocated).min(MAX_EXTENT_BLOCKS);
                let fresh = self.allocate_block_near_inode(tx, global, count)?;
                pointers[slot] = fresh;
                allocated += count;
            } else if Some(slot) == last_used && !pointer.is_full() {
                let room = MAX_EXTENT_BLOCKS - pointer.count as usize;
                let grown = self.expand_extent_at_best(tx, pointer, (target - allocated).min(room))?;
                pointers[slot].count += grown as u8;
                allocated += grown;
            }
        }
        let grown = pointers.clone();
        self.update_inode(tx, global, |record| record.pointers = grown)?;
        debug!(
            "Inode {} grew by {} blocks (wanted {})",
            global, allocated, target
        );

        let mut relocations = Vec::new();
        if allocated < target {
            relocations = self.self_defrag(tx, global, target - allocated, committed)?;
        }
        let now = self.inode(global)?.allocated_blocks();
        if now < have + min {
            return Err(SlabError::UnableToAllocateMoreBlocks(format!(
                "inode {} reached {} blocks, needs {}",
                global,
                now,
                have + min
            )));
        }
        Ok(relocations)
    }

    /// Rewrite the tail of a file into fewer, larger extents.
    ///
    /// Leading full extents stay put. Everything after them is copied into
    /// freshly allocated extents sized for at least `goal` more blocks, then
    /// the old extents are released. The returned write carries the copied
    /// bytes to their new place.
    pub(crate) fn self_defrag(
        &mut self,
        tx: TransactionId,
        global: i32,
        goal: usize,
        committed: u64,
    ) -> Result<Vec<WriteOp>> {
        let block_size = self.header.block_size as u64;
        let inode = self.inode(global)?;
        let slots = inode.pointers.len();
        let start = inode.pointers.iter().take_while(|p| p.is_full()).count();
        let old: usize = inode.pointers[start..]
            .iter()
            .map(|p| p.count as usize)
            .sum();
        let max = (slots - start) * MAX_EXTENT_BLOCKS;
        if max == 0 {
            return Ok(Vec::new());
        }
        let new = (old + goal).max(old * 2).min(max);
        if new <= old {
            return Ok(Vec::new());
        }

        let from = (start * MAX_EXTENT_BLOCKS) as u64 * block_size;
        let until = committed.min((start * MAX_EXTENT_BLOCKS + old) as u64 * block_size);
        let mut moved = vec![0u8; until.saturating_sub(from) as usize];
        if !moved.is_empty() {
            self.read_extents(&inode, from, &mut moved)?;
        }

        let mut fresh = Vec::new();
        let mut remaining = new;
        while remaining > 0 {
            let count = remaining.min(MAX_EXTENT_BLOCKS);
            fresh.push(self.allocate_block_near_inode(tx, global, count)?);
            remaining -= count;
        }
        for pointer in inode.pointers[start..].iter().filter(|p| !p.is_empty()) {
            self.free_extent(tx, *pointer)?;
        }

        let mut pointers = inode.pointers.clone();
        for (slot, pointer) in pointers[start..].iter_mut().enumerate() {
            *pointer = fresh.get(slot).copied().unwrap_or(BlockPointer::EMPTY);
        }
        self.update_inode(tx, global, |record| record.pointers = pointers)?;

        debug!(
            "Self-defragmented inode {}: {} blocks in {} extents became {} blocks in {}",
            global,
            old,
            slots - start,
            new,
            fresh.len()
        );
        if moved.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![WriteOp::new(from, moved)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use std::io::Cursor;

    fn memory_fs(block_size: u16, attribute_size: u8) -> FsMan {
        FsMan::create(
            Box::new(Cursor::new(Vec::new())),
            Config::with_geometry(block_size, attribute_size),
        )
        .unwrap()
    }

    fn read_all(fs: &mut FsMan, handle: HandleId) -> Vec<u8> {
        fs.seek(handle, SeekFrom::Start(0)).unwrap();
        let mut out = vec![0u8; fs.length(handle).unwrap() as usize];
        let mut done = 0;
        while done < out.len() {
            done += fs.read(handle, &mut out[done..]).unwrap();
        }
        out
    }

    #[test]
    fn test_write_commits_on_close() {
        let mut fs = memory_fs(256, 0);
        let root = fs.root();
        let handle = fs
            .open_file(None, root, "a.bin", OpenMode::Create, FileAccess::ReadWrite, None)
            .unwrap();
        fs.write(handle, b"hello world").unwrap();
        assert_eq!(fs.length(handle).unwrap(), 11);
        assert!(matches!(
            fs.read(handle, &mut [0u8; 4]),
            Err(SlabError::ReadWhileContentChanged(_))
        ));
        fs.close_handle(handle).unwrap();
        assert_eq!(fs.transactions().count(), 0);

        let reader = fs
            .open_file(None, root, "a.bin", OpenMode::Open, FileAccess::Read, None)
            .unwrap();
        assert_eq!(read_all(&mut fs, reader), b"hello world");
        fs.close_handle(reader).unwrap();
    }

    #[test]
    fn test_flush_makes_writes_readable() {
        let mut fs = memory_fs(256, 0);
        let root = fs.root();
        let handle = fs
            .open_file(None, root, "f", OpenMode::CreateNew, FileAccess::ReadWrite, None)
            .unwrap();
        fs.write(handle, &[7u8; 600]).unwrap();
        fs.flush_handle(handle).unwrap();
        assert_eq!(read_all(&mut fs, handle), vec![7u8; 600]);
        fs.close_handle(handle).unwrap();
    }

    #[test]
    fn test_single_writer_many_readers() {
        let mut fs = memory_fs(256, 0);
        let root = fs.root();
        let writer = fs
            .open_file(None, root, "s", OpenMode::Create, FileAccess::ReadWrite, None)
            .unwrap();
        let err = fs
            .open_file(None, root, "s", OpenMode::Open, FileAccess::ReadWrite, None)
            .unwrap_err();
        assert!(matches!(err, SlabError::FileWriteAccessTaken(_)));

        let r1 = fs
            .open_file(None, root, "s", OpenMode::Open, FileAccess::Read, None)
            .unwrap();
        let r2 = fs
            .open_file(None, root, "s", OpenMode::Open, FileAccess::Read, None)
            .unwrap();
        let inode = fs.find_file(root, "s").unwrap().unwrap();
        assert_eq!(fs.files.readers(inode), 2);
        assert!(matches!(fs.write(r1, b"x"), Err(SlabError::NoWriteAccess)));

        let err = fs
            .with_transaction(None, |fs, tx| fs.delete_file(tx, root, "s"))
            .unwrap_err();
        assert!(matches!(err, SlabError::UnableToDeleteFile(_)));

        for handle in [writer, r1, r2] {
            fs.close_handle(handle).unwrap();
        }
        assert!(!fs.files.is_open(inode));
        assert!(matches!(
            fs.close_handle(writer),
            Err(SlabError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_open_mode_rules() {
        let mut fs = memory_fs(256, 0);
        let root = fs.root();
        assert!(matches!(
            fs.open_file(None, root, "nope", OpenMode::Open, FileAccess::Read, None),
            Err(SlabError::NotFound(_))
        ));
        assert!(matches!(
            fs.open_file(None, root, "nope", OpenMode::Create, FileAccess::Read, None),
            Err(SlabError::NoWriteAccess)
        ));

        let reader = fs
            .open_file(None, root, "made", OpenMode::OpenOrCreate, FileAccess::Read, None)
            .unwrap();
        assert_eq!(fs.length(reader).unwrap(), 0);
        fs.close_handle(reader).unwrap();
        assert!(fs.has_file(root, "made").unwrap());
        assert!(matches!(
            fs.open_file(None, root, "made", OpenMode::CreateNew, FileAccess::ReadWrite, None),
            Err(SlabError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_append_and_truncate() {
        let mut fs = memory_fs(256, 0);
        let root = fs.root();
        let handle = fs
            .open_file(None, root, "log", OpenMode::Create, FileAccess::ReadWrite, None)
            .unwrap();
        fs.write(handle, b"one,").unwrap();
        fs.close_handle(handle).unwrap();

        let handle = fs
            .open_file(None, root, "log", OpenMode::Append, FileAccess::ReadWrite, None)
            .unwrap();
        assert_eq!(fs.position(handle).unwrap(), 4);
        fs.write(handle, b"two").unwrap();
        fs.close_handle(handle).unwrap();

        let handle = fs
            .open_file(None, root, "log", OpenMode::Open, FileAccess::Read, None)
            .unwrap();
        assert_eq!(read_all(&mut fs, handle), b"one,two");
        fs.close_handle(handle).unwrap();

        let handle = fs
            .open_file(None, root, "log", OpenMode::Truncate, FileAccess::ReadWrite, None)
            .unwrap();
        assert_eq!(fs.length(handle).unwrap(), 0);
        fs.close_handle(handle).unwrap();
    }

    #[test]
    fn test_seek_rules() {
        let mut fs = memory_fs(256, 0);
        let root = fs.root();
        let handle = fs
            .open_file(None, root, "s", OpenMode::Create, FileAccess::ReadWrite, None)
            .unwrap();
        fs.write(handle, &[1u8; 10]).unwrap();
        assert_eq!(fs.seek(handle, SeekFrom::End(-4)).unwrap(), 6);
        assert_eq!(fs.seek(handle, SeekFrom::Current(2)).unwrap(), 8);
        assert!(matches!(
            fs.seek(handle, SeekFrom::Start(11)),
            Err(SlabError::SeekOutOfRange { position: 11, length: 10 })
        ));
        assert!(fs.seek(handle, SeekFrom::Current(-20)).is_err());
        fs.close_handle(handle).unwrap();
    }

    #[test]
    fn test_set_length_grow_and_shrink() {
        let mut fs = memory_fs(256, 0);
        let root = fs.root();
        let handle = fs
            .open_file(None, root, "s", OpenMode::Create, FileAccess::ReadWrite, None)
            .unwrap();
        fs.write(handle, b"abcdefgh").unwrap();
        fs.set_length(handle, 3).unwrap();
        assert_eq!(fs.position(handle).unwrap(), 3);
        fs.set_length(handle, 6).unwrap();
        fs.flush_handle(handle).unwrap();
        assert_eq!(read_all(&mut fs, handle), b"abc\0\0\0");
        fs.close_handle(handle).unwrap();
    }

    #[test]
    fn test_attributes_are_padded_and_rolled_back() {
        let mut fs = memory_fs(256, 4);
        let root = fs.root();
        let tx = fs.begin_transaction(TransactionMode::Manual, Some("attrs"));
        let handle = fs
            .open_file(Some(tx), root, "a", OpenMode::Create, FileAccess::ReadWrite, None)
            .unwrap();
        fs.write_attributes(handle, &[9, 8]).unwrap();
        assert_eq!(fs.read_attributes(handle).unwrap(), vec![9, 8, 0, 0]);
        assert!(fs.write_attributes(handle, &[0; 5]).is_err());
        fs.commit(tx).unwrap();

        fs.write_attributes(handle, &[1, 1, 1, 1]).unwrap();
        fs.rollback(tx).unwrap();
        assert_eq!(fs.read_attributes(handle).unwrap(), vec![9, 8, 0, 0]);
        assert_eq!(fs.handle_transaction(handle).unwrap(), None);
        assert!(matches!(
            fs.write(handle, b"x"),
            Err(SlabError::MissingTransaction)
        ));
        fs.close_handle(handle).unwrap();
    }

    #[test]
    fn test_file_too_large() {
        let mut fs = memory_fs(128, 0);
        let root = fs.root();
        let handle = fs
            .open_file(None, root, "big", OpenMode::Create, FileAccess::ReadWrite, None)
            .unwrap();
        let max = fs.header().max_file_size();
        fs.seek(handle, SeekFrom::Start(0)).unwrap();
        fs.set_length(handle, max).unwrap();
        fs.seek(handle, SeekFrom::End(0)).unwrap();
        assert!(matches!(
            fs.write(handle, b"x"),
            Err(SlabError::FileTooLarge { .. })
        ));
        fs.close_handle(handle).unwrap();
    }

    #[test]
    fn test_growth_doubles_in_place() {
        let mut fs = memory_fs(128, 0);
        let root = fs.root();
        let handle = fs
            .open_file(None, root, "g", OpenMode::Create, FileAccess::ReadWrite, None)
            .unwrap();
        fs.write(handle, &[3u8; 1000]).unwrap();
        fs.close_handle(handle).unwrap();

        let inode = fs.find_file(root, "g").unwrap().unwrap();
        let record = fs.inode(inode).unwrap();
        // one block to start, 1000 bytes need 7 more; growth asks for twice that
        assert_eq!(record.used_pointers().count(), 1);
        assert_eq!(record.allocated_blocks(), 15);
    }

    #[test]
    fn test_self_defrag_compacts_extents() {
        let mut fs = memory_fs(128, 0);
        let root = fs.root();
        let names = ["left", "right"];
        let mut expected = [Vec::new(), Vec::new()];
        for round in 0..6u8 {
            for (i, name) in names.iter().enumerate() {
                let handle = fs
                    .open_file(None, root, name, OpenMode::OpenOrCreate, FileAccess::ReadWrite, None)
                    .unwrap();
                fs.seek(handle, SeekFrom::End(0)).unwrap();
                let chunk = vec![round * 2 + i as u8; 300 * (round as usize + 1)];
                fs.write(handle, &chunk).unwrap();
                fs.close_handle(handle).unwrap();
                expected[i].extend_from_slice(&chunk);
            }
        }

        for (i, name) in names.iter().enumerate() {
            let handle = fs
                .open_file(None, root, name, OpenMode::Open, FileAccess::Read, None)
                .unwrap();
            assert_eq!(read_all(&mut fs, handle), expected[i]);
            fs.close_handle(handle).unwrap();

            let inode = fs.find_file(root, name).unwrap().unwrap();
            let record = fs.inode(inode).unwrap();
            assert!(record.used_pointers().count() <= 3);
            assert!(record.allocated_blocks() * 128 >= expected[i].len());
        }
    }
}
