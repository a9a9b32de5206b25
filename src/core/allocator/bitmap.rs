//! Bitmap allocator with a free-run index
//!
//! Every bit is one block (or one inode). Bit `i` lives in byte `i / 8`,
//! least significant bit first. Everything at or above `boundary` has never
//! been handed out and is known to be free; free runs below it are tracked in
//! a [`FragmentList`] so best-fit lookups never scan the raw bytes.

use crate::core::allocator::extent::{Extent, FragmentList};
use crate::core::error::{Result, SlabError};

/// Bit-level allocator over a fixed byte array
#[derive(Debug, Clone)]
pub struct Bitmap {
    bytes: Vec<u8>,
    /// First bit of the untouched tail
    boundary: usize,
    free: usize,
    fragments: FragmentList,
}

impl Bitmap {
    /// All-free bitmap of `byte_len * 8` bits
    pub fn new(byte_len: usize) -> Self {
        Bitmap {
            bytes: vec![0u8; byte_len],
            boundary: 0,
            free: byte_len * 8,
            fragments: FragmentList::new(),
        }
    }

    /// Rebuild the allocator state from raw bytes.
    ///
    /// The boundary is placed after the highest set bit, and every zero run
    /// below it becomes a fragment.
    pub fn load(bytes: Vec<u8>) -> Self {
        let size = bytes.len() * 8;
        let used: usize = bytes.iter().map(|b| b.count_ones() as usize).sum();

        let boundary = match bytes.iter().rposition(|&b| b != 0) {
            Some(byte) => byte * 8 + (8 - bytes[byte].leading_zeros() as usize),
            None => 0,
        };

        let mut fragments = FragmentList::new();
        let mut run_start = None;
        for index in 0..boundary {
            let set = bytes[index / 8] & (1 << (index % 8)) != 0;
            match (set, run_start) {
                (false, None) => run_start = Some(index),
                (true, Some(start)) => {
                    fragments.insert(Extent::new(start, index - start));
                    run_start = None;
                }
                _ => {}
            }
        }

        Bitmap {
            bytes,
            boundary,
            free: size - used,
            fragments,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total bits tracked
    pub fn size(&self) -> usize {
        self.bytes.len() * 8
    }

    pub fn free_bits(&self) -> usize {
        self.free
    }

    pub fn boundary(&self) -> usize {
        self.boundary
    }

    pub fn fragments(&self) -> &FragmentList {
        &self.fragments
    }

    pub fn is_set(&self, index: usize) -> bool {
        index < self.size() && self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    /// Whether `count` contiguous bits could be allocated right now
    pub fn can_allocate(&self, count: usize) -> bool {
        count == 0
            || self.boundary + count <= self.size()
            || self.fragments.best_fit(count).is_some()
    }

    /// Allocate `count` contiguous bits, returning the first index.
    ///
    /// The best-fitting fragment is used first; the tail only when no
    /// fragment is large enough.
    pub fn allocate(&mut self, count: usize) -> Result<Option<usize>> {
        if count == 0 {
            return Err(SlabError::InvalidArgument(
                "cannot allocate zero bits".into(),
            ));
        }

        if let Some(run) = self.fragments.best_fit(count) {
            self.fragments.carve(run.start, count);
            self.update(run.start, count, true)?;
            return Ok(Some(run.start));
        }

        if self.boundary + count <= self.size() {
            let start = self.boundary;
            self.update(start, count, true)?;
            self.boundary += count;
            return Ok(Some(start));
        }

        Ok(None)
    }

    /// Release `[start, start + count)`.
    ///
    /// Merges with neighbouring fragments; a run that reaches the boundary
    /// pulls the boundary back instead of becoming a fragment.
    pub fn free(&mut self, start: usize, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if start + count > self.boundary {
            return Err(SlabError::BitmapCorrupted(format!(
                "free of {}..{} crosses the allocation boundary {}",
                start,
                start + count,
                self.boundary
            )));
        }

        self.update(start, count, false)?;
        let merged = self.fragments.insert(Extent::new(start, count));
        if merged.end() == self.boundary {
            self.fragments.remove(merged.start);
            self.boundary = merged.start;
        }
        Ok(())
    }

    /// Claim exactly `count` bits starting at `index`, which must directly
    /// follow an existing allocation. Returns false and changes nothing when
    /// any of those bits is taken.
    pub fn expand_allocation(&mut self, index: usize, count: usize) -> Result<bool> {
        if count == 0 {
            return Ok(true);
        }

        if index == self.boundary {
            if self.boundary + count > self.size() {
                return Ok(false);
            }
            self.update(index, count, true)?;
            self.boundary += count;
            return Ok(true);
        }

        if index < self.boundary && self.fragments.carve(index, count) {
            self.update(index, count, true)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Claim as many bits as possible (up to `max`) starting at `index`.
    /// Returns how many were claimed.
    pub fn expand_at_best(&mut self, index: usize, max: usize) -> Result<usize> {
        if max == 0 {
            return Ok(0);
        }

        let available = if index == self.boundary {
            self.size() - self.boundary
        } else {
            match self.fragments.containing(index) {
                Some(run) => run.end() - index,
                None => 0,
            }
        };

        let count = available.min(max);
        if count > 0 && !self.expand_allocation(index, count)? {
            return Err(SlabError::BitmapCorrupted(format!(
                "expansion at {} for {} bits failed after sizing",
                index, count
            )));
        }
        Ok(count)
    }

    /// Mark exactly `[start, start + count)` as used, wherever it lies.
    /// Any gap between the boundary and `start` becomes a fragment.
    pub fn claim(&mut self, start: usize, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let end = start + count;
        if start < self.boundary && !self.fragments.carve(start, end.min(self.boundary) - start) {
            return Err(SlabError::BitmapCorrupted(format!(
                "claim of {}..{} overlaps used bits",
                start, end
            )));
        }
        if end > self.boundary {
            let from = start.max(self.boundary);
            if from > self.boundary {
                self.fragments
                    .insert(Extent::new(self.boundary, from - self.boundary));
            }
            self.boundary = end;
        }
        self.update(start, count, true)
    }

    fn update(&mut self, start: usize, count: usize, set: bool) -> Result<()> {
        if start + count > self.size() {
            return Err(SlabError::BitmapCorrupted(format!(
                "range {}..{} outside bitmap of {} bits",
                start,
                start + count,
                self.size()
            )));
        }

        for index in start..start + count {
            let mask = 1u8 << (index % 8);
            let byte = &mut self.bytes[index / 8];
            if (*byte & mask != 0) == set {
                return Err(SlabError::WrongBit { index, set });
            }
            if set {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }

        if set {
            self.free -= count;
        } else {
            self.free += count;
        }
        Ok(())
    }
}

/// Set or clear a range of raw bitmap bytes, without allocator bookkeeping
pub fn write_bits(bytes: &mut [u8], start: usize, count: usize, set: bool) {
    let end = (start + count).min(bytes.len() * 8);
    for index in start..end {
        let mask = 1u8 << (index % 8);
        if set {
            bytes[index / 8] |= mask;
        } else {
            bytes[index / 8] &= !mask;
        }
    }
}

/// Clear bits in raw bitmap bytes
pub fn zero_bits(bytes: &[u8]) -> usize {
    bytes.iter().map(|b| b.count_zeros() as usize).sum()
}
