//! Directories
//!
//! A directory is an ordinary inode whose content is a slot-count prefix
//! followed by [`DirectoryEntry`] records. Loaded directories live in an
//! arena keyed by [`DirId`]; parents and children refer to each other by id
//! and the arena is owned by the filesystem manager.
//!
//! Entry tables are only written at commit. Until then every changed slot
//! is owned by the transaction that changed it and keeps its before-image,
//! so a rollback can put the slot back and a commit writes only the slots it
//! owns. A slot another transaction owns cannot be touched, a freed slot is
//! only reused once its release is committed, and a name released by an
//! uncommitted transaction stays reserved.

pub mod entry;

use crate::core::directory::entry::{
    entry_length, validate_name, DirectoryEntry, FreeSlots, COUNT_PREFIX_SIZE,
};
use crate::core::error::{Result, SlabError};
use crate::core::fsman::FsMan;
use crate::core::inode::InodeUsage;
use crate::core::transaction::{log_mut, TransactionId, WriteOp};
use ahash::AHashMap;
use std::collections::BTreeMap;
use tracing::debug;

/// Arena handle of a loaded directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirId(u64);

impl DirId {
    pub fn from_raw(raw: u64) -> Self {
        DirId(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    File,
    Directory,
}

/// What a directory knows about one of its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub inode: i32,
    pub length: u64,
    pub attributes: Vec<u8>,
}

/// Uncommitted change to one slot
#[derive(Debug, Clone)]
struct PendingSlot {
    owner: TransactionId,
    /// Slot before the change; `None` for a slot appended by `owner`
    before: Option<DirectoryEntry>,
}

#[derive(Debug)]
pub struct Directory {
    parent: Option<DirId>,
    name: String,
    inode: i32,
    entries: Vec<DirectoryEntry>,
    files: AHashMap<String, usize>,
    dirs: AHashMap<String, usize>,
    free: FreeSlots,
    loaded: AHashMap<String, DirId>,
    pending: BTreeMap<usize, PendingSlot>,
    /// Slots in the table on disk
    persisted: usize,
    /// Uncommitted transaction that created this directory
    created_by: Option<TransactionId>,
}

impl Directory {
    fn new(parent: Option<DirId>, name: &str, inode: i32) -> Self {
        Directory {
            parent,
            name: name.to_string(),
            inode,
            entries: Vec::new(),
            files: AHashMap::new(),
            dirs: AHashMap::new(),
            free: FreeSlots::default(),
            loaded: AHashMap::new(),
            pending: BTreeMap::new(),
            persisted: 0,
            created_by: None,
        }
    }

    pub fn parent(&self) -> Option<DirId> {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> i32 {
        self.inode
    }

    /// Slots in the entry table, live and free
    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }

    pub fn free_slot_count(&self) -> usize {
        self.free.len()
    }

    /// Slots with uncommitted changes
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty() || self.created_by.is_some()
    }

    /// Some transaction other than `tx` has uncommitted changes here
    fn foreign_owner(&self, tx: TransactionId) -> Option<TransactionId> {
        self.created_by
            .filter(|owner| *owner != tx)
            .or_else(|| {
                self.pending
                    .values()
                    .map(|slot| slot.owner)
                    .find(|owner| *owner != tx)
            })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn directory_count(&self) -> usize {
        self.dirs.len()
    }

    pub fn lookup(&self, name: &str) -> Option<(usize, &DirectoryEntry)> {
        let index = self
            .dirs
            .get(name)
            .or_else(|| self.files.get(name))
            .copied()?;
        self.entries.get(index).map(|entry| (index, entry))
    }

    pub fn child_kind(&self, name: &str) -> Option<ChildKind> {
        if self.dirs.contains_key(name) {
            Some(ChildKind::Directory)
        } else if self.files.contains_key(name) {
            Some(ChildKind::File)
        } else {
            None
        }
    }

    /// File names, sorted
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.keys().cloned().collect();
        names.sort();
        names
    }

    /// Subdirectory names, sorted
    pub fn directory_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dirs.keys().cloned().collect();
        names.sort();
        names
    }

    fn file_inodes(&self) -> Vec<i32> {
        self.files
            .values()
            .filter_map(|&index| self.entries.get(index))
            .map(DirectoryEntry::inode)
            .collect()
    }

    fn loaded_child(&self, name: &str) -> Option<DirId> {
        self.loaded.get(name).copied()
    }

    fn loaded_children(&self) -> Vec<DirId> {
        let mut children: Vec<DirId> = self.loaded.values().copied().collect();
        children.sort();
        children
    }

    /// Parse a stored entry table. Empty content is an empty directory.
    pub(crate) fn load_entries(&mut self, content: &[u8]) -> Result<()> {
        self.entries.clear();
        self.pending.clear();
        self.persisted = 0;
        if content.is_empty() {
            self.reindex();
            return Ok(());
        }
        if content.len() < COUNT_PREFIX_SIZE {
            return Err(SlabError::InconsistentData(format!(
                "directory {} content is {} bytes",
                self.name,
                content.len()
            )));
        }

        let count = i32::from_le_bytes([content[0], content[1], content[2], content[3]]);
        if count < 0 {
            return Err(SlabError::InconsistentData(format!(
                "directory {} claims {} entries",
                self.name, count
            )));
        }
        let count = count as usize;
        let mut at = COUNT_PREFIX_SIZE;
        while self.entries.len() < count && at < content.len() {
            let (entry, used) = DirectoryEntry::from_bytes(&content[at..])?;
            self.entries.push(entry);
            at += used;
        }
        if self.entries.len() < count {
            return Err(SlabError::InconsistentData(format!(
                "directory {} claims {} entries, found {}",
                self.name,
                count,
                self.entries.len()
            )));
        }

        self.persisted = count;
        self.reindex();
        if self.files.len() + self.dirs.len() + self.free.len() != self.entries.len() {
            return Err(SlabError::InconsistentData(format!(
                "directory {} holds duplicate names",
                self.name
            )));
        }
        Ok(())
    }

    /// Rebuild the name maps and free buckets from the entry table. Slots
    /// freed by an uncommitted transaction are not reusable yet.
    fn reindex(&mut self) {
        self.files.clear();
        self.dirs.clear();
        self.free.clear();
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.is_free() {
                if !self.pending.contains_key(&index) {
                    self.free.insert(entry.entry_length(), index);
                }
            } else if entry.is_directory() {
                self.dirs.insert(entry.name().to_string(), index);
            } else {
                self.files.insert(entry.name().to_string(), index);
            }
        }
    }

    fn check_created(&self, tx: TransactionId) -> Result<()> {
        match self.created_by {
            Some(owner) if owner != tx => Err(SlabError::TransactionConflict {
                holder: owner,
                what: format!("directory {}", self.name),
            }),
            _ => Ok(()),
        }
    }

    /// Whether `tx` may add a child called `name`
    fn check_insert(&self, tx: TransactionId, name: &str) -> Result<()> {
        if self.child_kind(name).is_some() {
            return Err(SlabError::AlreadyExists(name.to_string()));
        }
        self.check_created(tx)?;
        let reserved = self.pending.values().find(|slot| {
            slot.owner != tx
                && slot
                    .before
                    .as_ref()
                    .map(|entry| !entry.is_free() && entry.name() == name)
                    .unwrap_or(false)
        });
        match reserved {
            Some(slot) => Err(SlabError::TransactionConflict {
                holder: slot.owner,
                what: format!("name {}", name),
            }),
            None => Ok(()),
        }
    }

    fn own_slot(&mut self, tx: TransactionId, index: usize, before: Option<DirectoryEntry>) {
        self.pending
            .entry(index)
            .or_insert(PendingSlot { owner: tx, before });
    }

    /// Add a child, reusing a free slot of a fitting size when there is one
    pub(crate) fn insert_entry(
        &mut self,
        tx: TransactionId,
        name: &str,
        inode: i32,
        usage: InodeUsage,
    ) -> Result<usize> {
        self.check_insert(tx, name)?;

        let index = match self.free.take(entry_length(name.len())) {
            Some(index) => {
                let slot = self.entries[index].clone();
                match slot.reuse(name, inode, usage) {
                    Ok(entry) => {
                        self.entries[index] = entry;
                        self.own_slot(tx, index, Some(slot));
                        index
                    }
                    Err(err) => {
                        self.free.insert(slot.entry_length(), index);
                        return Err(err);
                    }
                }
            }
            None => {
                let entry = DirectoryEntry::new(name, inode, usage)?;
                let index = self.entries.len();
                self.entries.push(entry);
                self.own_slot(tx, index, None);
                index
            }
        };

        if usage == InodeUsage::Directory {
            self.dirs.insert(name.to_string(), index);
        } else {
            self.files.insert(name.to_string(), index);
        }
        Ok(index)
    }

    /// Whether `tx` may remove the child `name`
    fn check_remove(&self, tx: TransactionId, name: &str) -> Result<usize> {
        self.check_created(tx)?;
        let (index, _) = self
            .lookup(name)
            .ok_or_else(|| SlabError::NotFound(name.to_string()))?;
        match self.pending.get(&index).filter(|slot| slot.owner != tx) {
            Some(slot) => Err(SlabError::TransactionConflict {
                holder: slot.owner,
                what: format!("entry {}", name),
            }),
            None => Ok(index),
        }
    }

    /// Free the slot of a child, returning the entry it held. The slot
    /// becomes reusable once the removal commits.
    pub(crate) fn remove_entry(&mut self, tx: TransactionId, name: &str) -> Result<DirectoryEntry> {
        let index = self.check_remove(tx, name)?;
        let entry = self.entries[index].clone();

        self.own_slot(tx, index, Some(entry.clone()));
        self.entries[index] = entry.freed();
        if entry.is_directory() {
            self.dirs.remove(name);
        } else {
            self.files.remove(name);
        }
        Ok(entry)
    }

    /// Put back every slot `tx` owns. Slots it appended become free, and
    /// free slots past the on-disk table are dropped from the end.
    pub(crate) fn revert(&mut self, tx: TransactionId) {
        let owned: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, slot)| slot.owner == tx)
            .map(|(&index, _)| index)
            .collect();
        for index in owned {
            let Some(slot) = self.pending.remove(&index) else {
                continue;
            };
            if let Some(current) = self.entries.get_mut(index) {
                let restored = match slot.before {
                    Some(entry) => entry,
                    None => current.freed(),
                };
                *current = restored;
            }
        }
        while self.entries.len() > self.persisted
            && !self.pending.contains_key(&(self.entries.len() - 1))
            && self.entries.last().map(DirectoryEntry::is_free).unwrap_or(false)
        {
            self.entries.pop();
        }
        if self.created_by == Some(tx) {
            self.created_by = None;
        }
        self.reindex();
    }

    /// Content writes committing the slots `tx` owns, with the slot count
    /// and table length that result.
    ///
    /// Slots past the on-disk table that belong to no one or to another
    /// transaction are written as free placeholders so the table stays
    /// readable.
    fn commit_writes(&self, tx: TransactionId) -> (Vec<WriteOp>, usize, usize) {
        let owned_end = self
            .pending
            .iter()
            .filter(|(_, slot)| slot.owner == tx)
            .map(|(&index, _)| index + 1)
            .max()
            .unwrap_or(0);
        let count = self.persisted.max(owned_end).min(self.entries.len());

        let mut ops = vec![WriteOp::new(0, (count as i32).to_le_bytes().to_vec())];
        let mut position = COUNT_PREFIX_SIZE as u64;
        for (index, entry) in self.entries.iter().take(count).enumerate() {
            match self.pending.get(&index) {
                Some(slot) if slot.owner == tx => {
                    ops.push(WriteOp::new(position, entry.to_bytes()));
                }
                _ if index >= self.persisted => {
                    ops.push(WriteOp::new(position, entry.freed().to_bytes()));
                }
                _ => {}
            }
            position += entry.entry_length() as u64;
        }
        (ops, count, position as usize)
    }

    /// Forget the slots `tx` owned once its commit reached the store
    pub(crate) fn settle(&mut self, tx: TransactionId, count: usize) {
        self.pending.retain(|_, slot| slot.owner != tx);
        self.persisted = self.persisted.max(count);
        if self.created_by == Some(tx) {
            self.created_by = None;
        }
        self.reindex();
    }
}

/// Arena of loaded directories
#[derive(Debug)]
pub struct DirectoryTree {
    dirs: AHashMap<DirId, Directory>,
    root: DirId,
    next_id: u64,
    active: DirId,
    capacity: usize,
}

impl DirectoryTree {
    pub fn new(root_inode: i32, capacity: usize) -> Self {
        let root = DirId(0);
        let mut dirs = AHashMap::new();
        dirs.insert(root, Directory::new(None, "", root_inode));
        DirectoryTree {
            dirs,
            root,
            next_id: 1,
            active: root,
            capacity: capacity.max(1),
        }
    }

    pub fn root(&self) -> DirId {
        self.root
    }

    /// Directory most recently worked in
    pub fn active(&self) -> DirId {
        self.active
    }

    pub fn set_active(&mut self, id: DirId) {
        if self.dirs.contains_key(&id) {
            self.active = id;
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn contains(&self, id: DirId) -> bool {
        self.dirs.contains_key(&id)
    }

    pub fn get(&self, id: DirId) -> Result<&Directory> {
        self.dirs.get(&id).ok_or(SlabError::DirectoryDisposed)
    }

    pub fn get_mut(&mut self, id: DirId) -> Result<&mut Directory> {
        self.dirs.get_mut(&id).ok_or(SlabError::DirectoryDisposed)
    }

    fn insert(&mut self, parent: DirId, name: &str, inode: i32) -> Result<DirId> {
        let id = DirId(self.next_id);
        self.get_mut(parent)?.loaded.insert(name.to_string(), id);
        self.next_id += 1;
        self.dirs.insert(id, Directory::new(Some(parent), name, inode));
        Ok(id)
    }

    /// `id` and every loaded directory below it, parents first
    pub fn subtree(&self, id: DirId) -> Vec<DirId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(dir) = self.dirs.get(&current) {
                order.push(current);
                stack.extend(dir.loaded.values().copied());
            }
        }
        order
    }

    /// Path of ids from the root down to `id`
    pub fn chain(&self, id: DirId) -> Result<Vec<DirId>> {
        let mut chain = vec![id];
        let mut current = self.get(id)?;
        while let Some(parent) = current.parent {
            chain.push(parent);
            current = self.get(parent)?;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Unload a directory and everything below it; returns how many went
    fn dispose(&mut self, id: DirId) -> usize {
        if id == self.root {
            return 0;
        }
        let parent = match self.dirs.get(&id) {
            Some(dir) => dir.parent,
            None => return 0,
        };
        if let Some(parent) = parent.and_then(|p| self.dirs.get_mut(&p)) {
            parent.loaded.retain(|_, child| *child != id);
        }

        let removed = self.subtree(id);
        for dir in &removed {
            self.dirs.remove(dir);
        }
        if !self.dirs.contains_key(&self.active) {
            self.active = parent
                .filter(|p| self.dirs.contains_key(p))
                .unwrap_or(self.root);
        }
        removed.len()
    }

    /// Hang a loaded directory under another parent and name
    fn reparent(&mut self, id: DirId, parent: DirId, name: &str) -> Result<()> {
        let old_parent = self.get(id)?.parent;
        if let Some(old) = old_parent.and_then(|p| self.dirs.get_mut(&p)) {
            old.loaded.retain(|_, child| *child != id);
        }
        self.get_mut(parent)?.loaded.insert(name.to_string(), id);
        let dir = self.get_mut(id)?;
        dir.parent = Some(parent);
        dir.name = name.to_string();
        Ok(())
    }
}

impl FsMan {
    /// Note under `tx` that the entry table of `dir` changed
    fn record_table(&mut self, tx: TransactionId, dir: DirId) -> Result<()> {
        log_mut(&mut self.transactions, tx)?.record_table(dir);
        Ok(())
    }

    /// Mark `dir` and its ancestors as holding changes under `tx`
    fn mark_dirty_chain(&mut self, tx: TransactionId, dir: DirId) -> Result<()> {
        let log = log_mut(&mut self.transactions, tx)?;
        let mut child = dir;
        while let Some(parent) = self.tree.get(child)?.parent() {
            if !log.mark_child(parent, child) {
                break;
            }
            child = parent;
        }
        Ok(())
    }

    pub fn directory(&self, dir: DirId) -> Result<&Directory> {
        self.tree.get(dir)
    }

    pub(crate) fn set_active_directory(&mut self, dir: DirId) {
        self.tree.set_active(dir);
    }

    /// Stage the slots of `dir` owned by `tx` as content writes on its
    /// inode. Returns the slot count the table has on disk afterwards.
    pub(crate) fn save_directory(&mut self, tx: TransactionId, dir: DirId) -> Result<usize> {
        let (inode, (ops, count, table_length)) = {
            let directory = self.tree.get(dir)?;
            (directory.inode(), directory.commit_writes(tx))
        };
        let current = self.inode(inode)?;
        log_mut(&mut self.transactions, tx)?
            .file_change(inode, current.length)
            .writes
            .extend(ops);
        if table_length as i32 > current.length {
            self.update_inode(tx, inode, |record| record.length = table_length as i32)?;
        }
        Ok(count)
    }

    /// Unload children whose entries no longer match after a revert
    pub(crate) fn drop_stale_children(&mut self, dir: DirId) {
        let stale: Vec<DirId> = match self.tree.get(dir) {
            Ok(directory) => directory
                .loaded
                .iter()
                .filter(|(name, child)| {
                    let current = directory
                        .lookup(name)
                        .filter(|(_, entry)| entry.is_directory())
                        .map(|(_, entry)| entry.inode());
                    let loaded = self.tree.get(**child).map(Directory::inode).ok();
                    current.is_none() || current != loaded
                })
                .map(|(_, child)| *child)
                .collect(),
            Err(_) => return,
        };
        for child in stale {
            self.tree.dispose(child);
        }
    }

    /// Loaded handle of the subdirectory `name`, reading it if needed
    fn load_child(&mut self, dir: DirId, name: &str) -> Result<DirId> {
        let inode_index = {
            let directory = self.tree.get(dir)?;
            if let Some(id) = directory.loaded_child(name) {
                return Ok(id);
            }
            match directory.lookup(name) {
                Some((_, entry)) if entry.is_directory() => entry.inode(),
                _ => return Err(SlabError::NotFound(name.to_string())),
            }
        };

        let inode = self.inode(inode_index)?;
        if inode.usage != InodeUsage::Directory {
            return Err(SlabError::InconsistentData(format!(
                "entry {} points at inode {} which is not a directory",
                name, inode_index
            )));
        }
        let content = self.read_inode_content(&inode)?;
        let id = self.tree.insert(dir, name, inode_index)?;
        if let Err(err) = self.tree.get_mut(id)?.load_entries(&content) {
            self.tree.dispose(id);
            return Err(err);
        }
        Ok(id)
    }

    pub fn has_child(&self, dir: DirId, name: &str) -> Result<Option<ChildKind>> {
        validate_name(name)?;
        Ok(self.tree.get(dir)?.child_kind(name))
    }

    pub fn has_file(&self, dir: DirId, name: &str) -> Result<bool> {
        Ok(self.has_child(dir, name)? == Some(ChildKind::File))
    }

    pub fn has_directory(&self, dir: DirId, name: &str) -> Result<bool> {
        Ok(self.has_child(dir, name)? == Some(ChildKind::Directory))
    }

    pub fn get_directory(&mut self, dir: DirId, name: &str) -> Result<DirId> {
        validate_name(name)?;
        self.load_child(dir, name)
    }

    pub fn try_get_directory(&mut self, dir: DirId, name: &str) -> Result<Option<DirId>> {
        if !self.has_directory(dir, name)? {
            return Ok(None);
        }
        self.load_child(dir, name).map(Some)
    }

    pub fn create_directory(&mut self, tx: TransactionId, dir: DirId, name: &str) -> Result<DirId> {
        validate_name(name)?;
        self.require_open(tx)?;
        let parent_inode = {
            let directory = self.tree.get(dir)?;
            directory.check_insert(tx, name)?;
            directory.inode()
        };

        let inode = self.allocate_inode_near(tx, Some(parent_inode), InodeUsage::Directory, 1)?;
        self.tree
            .get_mut(dir)?
            .insert_entry(tx, name, inode, InodeUsage::Directory)?;
        self.record_table(tx, dir)?;
        let child = self.tree.insert(dir, name, inode)?;
        self.tree.get_mut(child)?.created_by = Some(tx);
        self.record_table(tx, child)?;
        self.mark_dirty_chain(tx, child)?;

        debug!("Created directory {} (inode {})", name, inode);
        Ok(child)
    }

    pub fn get_or_create_directory(
        &mut self,
        tx: TransactionId,
        dir: DirId,
        name: &str,
    ) -> Result<DirId> {
        match self.has_child(dir, name)? {
            Some(ChildKind::Directory) => self.load_child(dir, name),
            Some(ChildKind::File) => Err(SlabError::AlreadyExists(name.to_string())),
            None => self.create_directory(tx, dir, name),
        }
    }

    /// Create an empty file entry with `blocks` blocks reserved; returns the
    /// new inode
    pub fn create_file(
        &mut self,
        tx: TransactionId,
        dir: DirId,
        name: &str,
        blocks: usize,
    ) -> Result<i32> {
        validate_name(name)?;
        self.require_open(tx)?;
        let parent_inode = {
            let directory = self.tree.get(dir)?;
            directory.check_insert(tx, name)?;
            directory.inode()
        };

        let inode = self.allocate_inode_near(
            tx,
            Some(parent_inode),
            InodeUsage::NormalFile,
            blocks.clamp(1, u8::MAX as usize),
        )?;
        self.tree
            .get_mut(dir)?
            .insert_entry(tx, name, inode, InodeUsage::NormalFile)?;
        self.record_table(tx, dir)?;
        self.mark_dirty_chain(tx, dir)?;
        Ok(inode)
    }

    /// Inode of the file `name`, if there is one
    pub fn find_file(&self, dir: DirId, name: &str) -> Result<Option<i32>> {
        validate_name(name)?;
        let directory = self.tree.get(dir)?;
        Ok(directory
            .files
            .get(name)
            .and_then(|&index| directory.entries.get(index))
            .map(DirectoryEntry::inode))
    }

    pub fn file_info(&mut self, dir: DirId, name: &str) -> Result<FileInfo> {
        let global = self
            .find_file(dir, name)?
            .ok_or_else(|| SlabError::NotFound(name.to_string()))?;
        let inode = self.inode(global)?;
        Ok(FileInfo {
            name: name.to_string(),
            inode: global,
            length: inode.length.max(0) as u64,
            attributes: inode.attributes,
        })
    }

    /// Delete a file; `false` when there is no such file
    pub fn delete_file(&mut self, tx: TransactionId, dir: DirId, name: &str) -> Result<bool> {
        let Some(inode) = self.find_file(dir, name)? else {
            return Ok(false);
        };
        self.require_open(tx)?;
        if self.files.is_open(inode) {
            return Err(SlabError::UnableToDeleteFile(name.to_string()));
        }
        self.tree.get(dir)?.check_remove(tx, name)?;

        self.free_inode(tx, inode)?;
        self.tree.get_mut(dir)?.remove_entry(tx, name)?;
        self.record_table(tx, dir)?;
        self.mark_dirty_chain(tx, dir)?;
        Ok(true)
    }

    /// Delete a directory and everything below it; `false` when there is no
    /// such directory. Inodes are freed leaves first.
    pub fn delete_directory(&mut self, tx: TransactionId, dir: DirId, name: &str) -> Result<bool> {
        if !self.has_directory(dir, name)? {
            return Ok(false);
        }
        self.require_open(tx)?;
        self.tree.get(dir)?.check_remove(tx, name)?;
        let child = self.load_child(dir, name)?;

        let mut order = Vec::new();
        let mut stack = vec![child];
        while let Some(id) = stack.pop() {
            order.push(id);
            let subs = self.tree.get(id)?.directory_names();
            for sub in subs {
                stack.push(self.load_child(id, &sub)?);
            }
        }

        for &id in &order {
            let directory = self.tree.get(id)?;
            if let Some(holder) = directory.foreign_owner(tx) {
                return Err(SlabError::TransactionConflict {
                    holder,
                    what: format!("directory {}", directory.name()),
                });
            }
            let inodes = directory.file_inodes();
            if inodes.iter().any(|&inode| self.files.is_open(inode)) {
                return Err(SlabError::UnableToDeleteFile(name.to_string()));
            }
            self.check_claim(tx, directory.inode())?;
            for inode in inodes {
                self.check_claim(tx, inode)?;
            }
        }

        for &id in order.iter().rev() {
            let (files, inode) = {
                let directory = self.tree.get(id)?;
                (directory.file_inodes(), directory.inode())
            };
            for file in files {
                self.free_inode(tx, file)?;
            }
            self.free_inode(tx, inode)?;
        }

        self.tree.get_mut(dir)?.remove_entry(tx, name)?;
        self.record_table(tx, dir)?;
        let unloaded = self.tree.dispose(child);
        self.mark_dirty_chain(tx, dir)?;

        debug!(
            "Deleted directory {} ({} directories unloaded)",
            name, unloaded
        );
        Ok(true)
    }

    /// Delete a file or directory by name
    pub fn delete_child(&mut self, tx: TransactionId, dir: DirId, name: &str) -> Result<bool> {
        match self.has_child(dir, name)? {
            Some(ChildKind::File) => self.delete_file(tx, dir, name),
            Some(ChildKind::Directory) => self.delete_directory(tx, dir, name),
            None => Ok(false),
        }
    }

    /// Delete every child of `dir`
    pub fn clear_directory(&mut self, tx: TransactionId, dir: DirId) -> Result<()> {
        let (dirs, files) = {
            let directory = self.tree.get(dir)?;
            (directory.directory_names(), directory.file_names())
        };
        for name in dirs {
            self.delete_directory(tx, dir, &name)?;
        }
        for name in files {
            self.delete_file(tx, dir, &name)?;
        }
        Ok(())
    }

    /// Move or rename a child. The inode stays the same. Returns `false`
    /// when the source does not exist, or the target exists and
    /// `overwrite` is off.
    pub fn move_child(
        &mut self,
        tx: TransactionId,
        from: DirId,
        name: &str,
        to: DirId,
        to_name: &str,
        overwrite: bool,
    ) -> Result<bool> {
        validate_name(name)?;
        validate_name(to_name)?;
        self.require_open(tx)?;
        let source = match self.tree.get(from)?.lookup(name) {
            Some((_, entry)) => entry.clone(),
            None => return Ok(false),
        };
        if from == to && name == to_name {
            return Ok(true);
        }
        self.tree.get(from)?.check_remove(tx, name)?;
        self.tree.get(to)?.check_created(tx)?;

        let source_dir = if source.is_directory() {
            let id = self.load_child(from, name)?;
            if self.tree.chain(to)?.contains(&id) {
                return Err(SlabError::MoveIntoSubtree(name.to_string()));
            }
            Some(id)
        } else {
            None
        };

        if let Some(kind) = self.tree.get(to)?.child_kind(to_name) {
            if !overwrite {
                return Ok(false);
            }
            if kind == ChildKind::Directory {
                let target = self.load_child(to, to_name)?;
                if self.tree.chain(from)?.contains(&target) {
                    return Err(SlabError::MoveIntoSubtree(to_name.to_string()));
                }
            }
            self.delete_child(tx, to, to_name)?;
        }

        self.tree.get(to)?.check_insert(tx, to_name)?;
        self.tree
            .get_mut(to)?
            .insert_entry(tx, to_name, source.inode(), source.usage())?;
        self.tree.get_mut(from)?.remove_entry(tx, name)?;
        self.record_table(tx, to)?;
        self.record_table(tx, from)?;
        if let Some(id) = source_dir {
            self.tree.reparent(id, to, to_name)?;
        }
        self.mark_dirty_chain(tx, from)?;
        self.mark_dirty_chain(tx, to)?;
        Ok(true)
    }

    /// Children of `dir` as relative paths, optionally of one kind only and
    /// optionally descending into subdirectories
    pub fn list_children(
        &mut self,
        dir: DirId,
        kind: Option<ChildKind>,
        recursive: bool,
    ) -> Result<Vec<(String, ChildKind)>> {
        let mut listed = Vec::new();
        let mut stack = vec![(dir, String::new())];
        while let Some((id, prefix)) = stack.pop() {
            let (files, dirs) = {
                let directory = self.tree.get(id)?;
                (directory.file_names(), directory.directory_names())
            };
            if kind != Some(ChildKind::Directory) {
                listed.extend(files.into_iter().map(|f| (format!("{}{}", prefix, f), ChildKind::File)));
            }
            for sub in dirs {
                let path = format!("{}{}", prefix, sub);
                if kind != Some(ChildKind::File) {
                    listed.push((path.clone(), ChildKind::Directory));
                }
                if recursive {
                    let child = self.load_child(id, &sub)?;
                    stack.push((child, format!("{}/", path)));
                }
            }
        }
        listed.sort();
        Ok(listed)
    }

    /// Absolute path of a loaded directory, `/` for the root
    pub fn directory_path(&self, dir: DirId) -> Result<String> {
        let mut path = String::new();
        for id in self.tree.chain(dir)?.into_iter().skip(1) {
            path.push('/');
            path.push_str(self.tree.get(id)?.name());
        }
        if path.is_empty() {
            path.push('/');
        }
        Ok(path)
    }

    fn subtree_has_changes(&self, id: DirId) -> bool {
        self.tree.subtree(id).into_iter().any(|dir| {
            self.tree.get(dir).map(Directory::is_dirty).unwrap_or(false)
                || self
                    .transactions
                    .values()
                    .any(|tx| tx.log.dir_change(dir).is_some())
        })
    }

    /// Unload directories once the cache is over capacity.
    ///
    /// Walks the chain from the root to the active directory, picks the
    /// ancestor in the upper half with the most loaded children and unloads
    /// sibling subtrees from there down, skipping anything with pending
    /// changes, until a tenth of the capacity has gone.
    pub fn trim_directories(&mut self) {
        let capacity = self.tree.capacity();
        if self.tree.len() <= capacity {
            return;
        }
        let goal = (capacity / 10).max(1);
        let chain = self
            .tree
            .chain(self.tree.active())
            .unwrap_or_else(|_| vec![self.tree.root()]);

        let loaded_count = |id: DirId| {
            self.tree
                .get(id)
                .map(|dir| dir.loaded.len())
                .unwrap_or(0)
        };
        let middle = (chain.len() - 1) / 2;
        let mut pivot = middle;
        let mut most = 0;
        for i in (0..=middle).rev() {
            let count = loaded_count(chain[i]);
            if count > most {
                pivot = i;
                most = count;
            }
        }

        let mut trimmed = 0;
        for i in pivot..chain.len() {
            let keep = chain.get(i + 1).copied();
            let children = match self.tree.get(chain[i]) {
                Ok(dir) => dir.loaded_children(),
                Err(_) => continue,
            };
            for child in children {
                if Some(child) == keep || self.subtree_has_changes(child) {
                    continue;
                }
                trimmed += self.tree.dispose(child);
                if trimmed >= goal {
                    debug!("Trimmed {} loaded directories", trimmed);
                    return;
                }
            }
        }
        debug!(
            "Directory trim unloaded {} of {} wanted; {} still loaded",
            trimmed,
            goal,
            self.tree.len()
        );
    }
}
