//! Transactions
//!
//! Every mutation runs under a [`TransactionId`]. The first time an inode is
//! touched under a transaction its before-image goes into that transaction's
//! [`TransactionLog`]; later touches are no-ops. File content never reaches
//! the store before commit: writes are buffered as [`WriteOp`]s and applied
//! in one pass.
//!
//! Transactions are isolated from each other. Allocations take bits from the
//! live bitmaps right away so no one else can hand them out, while releases
//! are only noted and take effect at commit. Group heads and bitmaps are
//! written from a per-group on-disk image that only ever absorbs committed
//! changes, and an inode with uncommitted changes belongs to its transaction
//! until that transaction finishes.
//!
//! Commit order:
//! 1. walk the directory tree from the root over the change markers and stage
//!    the slots this transaction owns as file writes on each directory inode
//! 2. apply buffered file writes, growing or defragmenting extents first
//! 3. fold the bit changes into the on-disk images, then write back group
//!    heads, bitmaps and touched inode records
//!
//! Rollback restores inode records, undoes its own allocations, reverts the
//! directory slots it owns, drops buffered writes and unbinds any stream
//! still attached to the transaction.

use crate::core::directory::DirId;
use crate::core::error::{Result, SlabError};
use crate::core::fsman::FsMan;
use crate::core::inode::{local_index, Inode};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

/// Transaction identifier, never zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u32);

impl TransactionId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long a transaction lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Scoped to one operation; committed and disposed when it ends
    Immediate,
    /// Caller-managed; survives any number of commits until ended
    Manual,
    /// Owned by one write handle; committed when that handle closes
    Temporary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionState {
    Open,
    Committing,
}

/// A buffered content write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub position: u64,
    pub data: Vec<u8>,
}

impl WriteOp {
    pub fn new(position: u64, data: Vec<u8>) -> Self {
        WriteOp { position, data }
    }

    pub fn end(&self) -> u64 {
        self.position + self.data.len() as u64
    }
}

/// Bitmap of a group a change applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapKind {
    Blocks,
    Inodes,
}

/// An allocation (`set`) or a release of a run of bits in one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitChange {
    pub kind: BitmapKind,
    pub start: usize,
    pub count: usize,
    pub set: bool,
}

/// Bit changes of one group, in the order they were made
#[derive(Debug, Clone, Default)]
pub struct GroupChanges {
    pub bits: Vec<BitChange>,
    /// Folded into the on-disk image by a commit that has not finished
    pub applied: bool,
}

/// Pending content changes for one inode
#[derive(Debug, Clone)]
pub struct FileChange {
    pub origin_length: i32,
    pub writes: Vec<WriteOp>,
    pub old_attributes: Option<Vec<u8>>,
}

/// Directory bookkeeping of one transaction. Slot before-images live in
/// the directory itself, keyed by owner.
#[derive(Debug, Clone, Default)]
pub struct DirChange {
    /// The entry table of this directory changed
    pub table: bool,
    /// Loaded children with changes somewhere below them
    pub children: BTreeSet<DirId>,
}

/// Before-images and buffered writes of one transaction
#[derive(Debug, Default)]
pub struct TransactionLog {
    groups: BTreeMap<i32, GroupChanges>,
    inodes: BTreeMap<i32, Inode>,
    files: BTreeMap<i32, FileChange>,
    dirs: BTreeMap<DirId, DirChange>,
}

impl TransactionLog {
    pub fn record_bits(&mut self, group: i32, change: BitChange) {
        self.groups.entry(group).or_default().bits.push(change);
    }

    pub fn bit_changes(&self, group: i32) -> &[BitChange] {
        self.groups
            .get(&group)
            .map(|changes| changes.bits.as_slice())
            .unwrap_or(&[])
    }

    /// Whether this log already releases the bit at `index`
    pub fn releases(&self, group: i32, kind: BitmapKind, index: usize) -> bool {
        self.bit_changes(group).iter().any(|change| {
            !change.set
                && change.kind == kind
                && index >= change.start
                && index < change.start + change.count
        })
    }

    pub fn record_inode(&mut self, global: i32, inode: &Inode) {
        self.inodes.entry(global).or_insert_with(|| inode.clone());
    }

    /// Change record for an inode, created with its current length
    pub fn file_change(&mut self, global: i32, current_length: i32) -> &mut FileChange {
        self.files.entry(global).or_insert_with(|| FileChange {
            origin_length: current_length,
            writes: Vec::new(),
            old_attributes: None,
        })
    }

    pub fn file(&self, global: i32) -> Option<&FileChange> {
        self.files.get(&global)
    }

    pub fn file_mut(&mut self, global: i32) -> Option<&mut FileChange> {
        self.files.get_mut(&global)
    }

    /// Drop buffered content for an inode that is being freed
    pub fn forget_file(&mut self, global: i32) {
        self.files.remove(&global);
    }

    pub fn has_pending_writes(&self, global: i32) -> bool {
        self.files
            .get(&global)
            .map(|change| !change.writes.is_empty())
            .unwrap_or(false)
    }

    /// Inode record or content of `global` changed under this log
    pub fn claims(&self, global: i32) -> bool {
        self.inodes.contains_key(&global) || self.files.contains_key(&global)
    }

    /// Groups holding anything this log changed
    pub fn touched_groups(&self, block_size: u16) -> BTreeSet<i32> {
        self.groups
            .keys()
            .copied()
            .chain(
                self.inodes
                    .keys()
                    .chain(self.files.keys())
                    .map(|&global| local_index(global, block_size).0),
            )
            .collect()
    }

    /// Note that the entry table of `dir` changes
    pub fn record_table(&mut self, dir: DirId) -> &mut DirChange {
        let change = self.dirs.entry(dir).or_default();
        change.table = true;
        change
    }

    /// Note that `child` (or something below it) changed
    pub fn mark_child(&mut self, parent: DirId, child: DirId) -> bool {
        self.dirs.entry(parent).or_default().children.insert(child)
    }

    pub fn inode_image(&self, global: i32) -> Option<&Inode> {
        self.inodes.get(&global)
    }

    pub fn dir_change(&self, dir: DirId) -> Option<&DirChange> {
        self.dirs.get(&dir)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
            && self.inodes.is_empty()
            && self.files.is_empty()
            && self.dirs.is_empty()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.inodes.clear();
        self.files.clear();
        self.dirs.clear();
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    name: Option<String>,
    mode: TransactionMode,
    pub(crate) state: TransactionState,
    pub(crate) log: TransactionLog,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Friendly name, falling back to the numeric id
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    pub fn is_committing(&self) -> bool {
        self.state == TransactionState::Committing
    }
}

/// Log of an existing transaction, whatever its state
pub(crate) fn log_mut(
    transactions: &mut BTreeMap<TransactionId, Transaction>,
    id: TransactionId,
) -> Result<&mut TransactionLog> {
    transactions
        .get_mut(&id)
        .map(|tx| &mut tx.log)
        .ok_or(SlabError::TransactionDisposed(id))
}

/// Collapse buffered writes into disjoint ranges in position order.
///
/// Later writes win where they overlap earlier ones, and ranges that touch
/// are merged into one.
pub fn compact_writes(ops: &[WriteOp]) -> Vec<WriteOp> {
    let mut ranges: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

    for op in ops.iter().filter(|op| !op.data.is_empty()) {
        let (start, end) = (op.position, op.end());

        // Ranges stay disjoint and non-touching, so everything that overlaps
        // or touches [start, end] is a contiguous run ending at the last
        // range starting at or before `end`.
        let touching: Vec<u64> = ranges
            .range(..=end)
            .rev()
            .take_while(|(s, data)| **s + data.len() as u64 >= start)
            .map(|(s, _)| *s)
            .collect();

        let mut merged_start = start;
        let mut merged_end = end;
        for &s in &touching {
            let len = ranges[&s].len() as u64;
            merged_start = merged_start.min(s);
            merged_end = merged_end.max(s + len);
        }

        let mut buffer = vec![0u8; (merged_end - merged_start) as usize];
        for s in touching {
            if let Some(data) = ranges.remove(&s) {
                let at = (s - merged_start) as usize;
                buffer[at..at + data.len()].copy_from_slice(&data);
            }
        }
        let at = (start - merged_start) as usize;
        buffer[at..at + op.data.len()].copy_from_slice(&op.data);
        ranges.insert(merged_start, buffer);
    }

    ranges
        .into_iter()
        .map(|(position, data)| WriteOp { position, data })
        .collect()
}

impl FsMan {
    /// Start a transaction
    pub fn begin_transaction(
        &mut self,
        mode: TransactionMode,
        name: Option<&str>,
    ) -> TransactionId {
        self.next_transaction = self.next_transaction.wrapping_add(1).max(1);
        while self
            .transactions
            .contains_key(&TransactionId(self.next_transaction))
        {
            self.next_transaction = self.next_transaction.wrapping_add(1).max(1);
        }
        let id = TransactionId(self.next_transaction);
        self.transactions.insert(
            id,
            Transaction {
                id,
                name: name.map(str::to_owned),
                mode,
                state: TransactionState::Open,
                log: TransactionLog::default(),
            },
        );
        debug!("Transaction {} ({:?}) started", id, mode);
        id
    }

    pub fn transaction(&self, id: TransactionId) -> Option<&Transaction> {
        self.transactions.get(&id)
    }

    /// Open transactions, in id order
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    /// Fail unless `id` exists and accepts new work
    pub fn require_open(&self, id: TransactionId) -> Result<()> {
        match self.transactions.get(&id) {
            None => Err(SlabError::TransactionDisposed(id)),
            Some(tx) if tx.is_committing() => Err(SlabError::TransactionCommitting(id)),
            Some(_) => Ok(()),
        }
    }

    /// Any open transaction buffering content for `global`
    pub fn has_pending_writes(&self, global: i32) -> bool {
        self.transactions
            .values()
            .any(|tx| tx.log.has_pending_writes(global))
    }

    /// Fail when a transaction other than `tx` holds uncommitted changes
    /// to the inode `global`
    pub(crate) fn check_claim(&self, tx: TransactionId, global: i32) -> Result<()> {
        match self
            .transactions
            .values()
            .find(|other| other.id != tx && other.log.claims(global))
        {
            Some(holder) => Err(SlabError::TransactionConflict {
                holder: holder.id,
                what: format!("inode {}", global),
            }),
            None => Ok(()),
        }
    }

    /// Apply everything recorded under `id` to the store. The transaction
    /// stays open with an empty log. A failure leaves it committing; only
    /// rollback is accepted afterwards.
    pub fn commit(&mut self, id: TransactionId) -> Result<()> {
        self.require_open(id)?;
        if let Some(tx) = self.transactions.get_mut(&id) {
            tx.state = TransactionState::Committing;
        }

        let saved = self.save_dirty_directories(id)?;

        let files = std::mem::take(&mut log_mut(&mut self.transactions, id)?.files);
        let file_count = files.len();
        for (global, change) in files {
            self.commit_file_change(id, global, change)?;
        }

        let (groups, inodes) = {
            let log = log_mut(&mut self.transactions, id)?;
            (
                log.groups.keys().copied().collect::<Vec<_>>(),
                log.inodes.keys().copied().collect::<Vec<_>>(),
            )
        };
        self.apply_bit_changes(id, &groups)?;
        self.write_back(&groups, &inodes)?;
        self.store.flush()?;

        for (dir, count) in saved {
            if let Ok(directory) = self.tree.get_mut(dir) {
                directory.settle(id, count);
            }
        }
        if let Some(tx) = self.transactions.get_mut(&id) {
            tx.log.clear();
            tx.state = TransactionState::Open;
        }
        self.trim_groups();
        debug!(
            "Transaction {} committed ({} files, {} groups, {} inodes)",
            id,
            file_count,
            groups.len(),
            inodes.len()
        );
        Ok(())
    }

    /// Commit and dispose
    pub fn end_transaction(&mut self, id: TransactionId) -> Result<()> {
        self.commit(id)?;
        self.dispose_transaction(id);
        Ok(())
    }

    /// Undo everything recorded under `id` and dispose it
    pub fn rollback(&mut self, id: TransactionId) -> Result<()> {
        let tx = self
            .transactions
            .remove(&id)
            .ok_or(SlabError::TransactionDisposed(id))?;
        let was_committing = tx.is_committing();
        let log = tx.log;
        let block_size = self.header.block_size;

        let inodes: Vec<i32> = log.inodes.keys().copied().collect();
        for (global, image) in log.inodes {
            let (group, local) = local_index(global, block_size);
            self.group(group)?.restore_inode(local, image);
        }

        let groups: Vec<i32> = log.groups.keys().copied().collect();
        for (group, changes) in &log.groups {
            self.group(*group)?.revert_changes(changes)?;
        }

        self.revert_directories(id, &log.dirs)?;
        self.files.unbind_transaction(id);

        if was_committing {
            // part of the failed commit may already be on disk
            self.write_back(&groups, &inodes)?;
            self.store.flush()?;
        }
        self.trim_groups();

        debug!(
            "Transaction {} rolled back ({} groups, {} inodes, {} files)",
            id,
            groups.len(),
            inodes.len(),
            log.files.len()
        );
        Ok(())
    }

    /// Run `work` under `tx`, or under a fresh immediate transaction that is
    /// committed on success and rolled back on failure. A caller-supplied
    /// transaction is left for the caller to finish.
    pub fn with_transaction<T, F>(&mut self, tx: Option<TransactionId>, work: F) -> Result<T>
    where
        F: FnOnce(&mut FsMan, TransactionId) -> Result<T>,
    {
        if let Some(id) = tx {
            self.require_open(id)?;
            return work(self, id);
        }

        let id = self.begin_transaction(TransactionMode::Immediate, None);
        let outcome = work(self, id).and_then(|value| {
            self.end_transaction(id)?;
            Ok(value)
        });
        if outcome.is_err() && self.transactions.contains_key(&id) {
            if let Err(err) = self.rollback(id) {
                warn!("Rollback of transaction {} failed: {}", id, err);
            }
        }
        outcome
    }

    pub(crate) fn dispose_transaction(&mut self, id: TransactionId) {
        if self.transactions.remove(&id).is_some() {
            self.files.unbind_transaction(id);
            debug!("Transaction {} disposed", id);
        }
    }

    /// Fold the bit changes of `id` into the on-disk images of its groups
    fn apply_bit_changes(&mut self, id: TransactionId, groups: &[i32]) -> Result<()> {
        for &index in groups {
            let bits = log_mut(&mut self.transactions, id)?.bit_changes(index).to_vec();
            self.group(index)?.apply_changes(&bits)?;
            if let Some(changes) = log_mut(&mut self.transactions, id)?.groups.get_mut(&index) {
                changes.applied = true;
            }
        }
        Ok(())
    }

    fn write_back(&mut self, groups: &[i32], inodes: &[i32]) -> Result<()> {
        let block_size = self.header.block_size;
        for &index in groups {
            self.ensure_group(index)?;
            if let Some(group) = self.groups.peek(&index) {
                group.save_meta(&mut self.store)?;
                self.window.update(index, group.saved_head());
            }
        }
        for &global in inodes {
            let (index, local) = local_index(global, block_size);
            self.ensure_group(index)?;
            if let Some(group) = self.groups.get_mut(&index) {
                group.save_inode(&mut self.store, local)?;
            }
        }
        Ok(())
    }

    /// Stage every changed directory reachable through the change markers.
    /// Returns each staged directory with the slot count it now has on disk.
    fn save_dirty_directories(&mut self, id: TransactionId) -> Result<Vec<(DirId, usize)>> {
        let order = {
            let log = log_mut(&mut self.transactions, id)?;
            if log.dirs.is_empty() {
                return Ok(Vec::new());
            }
            let mut order = Vec::new();
            let mut visited = BTreeSet::new();
            let mut stack = vec![self.tree.root()];
            while let Some(dir) = stack.pop() {
                if !visited.insert(dir) {
                    continue;
                }
                if let Some(change) = log.dirs.get(&dir) {
                    if change.table {
                        order.push(dir);
                    }
                    stack.extend(change.children.iter().rev().copied());
                }
            }
            order
        };

        let mut saved = Vec::with_capacity(order.len());
        for dir in order {
            if self.tree.contains(dir) {
                let count = self.save_directory(id, dir)?;
                saved.push((dir, count));
            }
        }
        Ok(saved)
    }

    fn revert_directories(
        &mut self,
        id: TransactionId,
        changes: &BTreeMap<DirId, DirChange>,
    ) -> Result<()> {
        let mut reverted = Vec::new();
        for (&dir, change) in changes {
            if !change.table {
                continue;
            }
            if let Ok(directory) = self.tree.get_mut(dir) {
                directory.revert(id);
                reverted.push(dir);
            }
        }
        for dir in reverted {
            self.drop_stale_children(dir);
        }
        Ok(())
    }
}
