//! Sliding cache of cold block-group heads
//!
//! Allocation only needs a group's free counters to decide whether loading
//! its bitmaps is worthwhile. The window keeps those counters for a bounded
//! range of groups and slides in fixed steps when a lookup falls outside.

use crate::core::block_group::{GroupHead, GroupLayout};
use crate::core::error::Result;
use crate::core::io::Store;
use tracing::debug;

/// Groups the window moves by when re-centring
pub const WINDOW_STEP: usize = 50;

#[derive(Debug)]
pub struct HeadWindow {
    start: i32,
    heads: Vec<Option<GroupHead>>,
}

impl HeadWindow {
    pub fn new(capacity: usize) -> Self {
        HeadWindow {
            start: 0,
            heads: vec![None; capacity.max(WINDOW_STEP)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.heads.len()
    }

    pub fn start(&self) -> i32 {
        self.start
    }

    pub fn contains(&self, index: i32) -> bool {
        index >= self.start && ((index - self.start) as usize) < self.capacity()
    }

    /// Cached head without touching the store
    pub fn get(&self, index: i32) -> Option<GroupHead> {
        if self.contains(index) {
            self.heads[(index - self.start) as usize]
        } else {
            None
        }
    }

    /// Refresh a cached head after the group changed on disk
    pub fn update(&mut self, index: i32, head: GroupHead) {
        if self.contains(index) {
            self.heads[(index - self.start) as usize] = Some(head);
        }
    }

    /// Head of `index`, sliding the window and reading the store as needed
    pub fn head(
        &mut self,
        store: &mut Store,
        layout: &GroupLayout,
        group_count: i32,
        index: i32,
    ) -> Result<GroupHead> {
        if !self.contains(index) {
            self.recenter(store, layout, group_count, index)?;
        }
        let slot = (index - self.start) as usize;
        match self.heads[slot] {
            Some(head) => Ok(head),
            None => {
                let head = GroupHead::read(store, layout, index)?;
                self.heads[slot] = Some(head);
                Ok(head)
            }
        }
    }

    /// Slide so `index` is covered, keeping overlapping entries and eagerly
    /// reading the newly exposed ones that exist on disk
    fn recenter(
        &mut self,
        store: &mut Store,
        layout: &GroupLayout,
        group_count: i32,
        index: i32,
    ) -> Result<()> {
        let capacity = self.capacity() as i64;
        let step = WINDOW_STEP as i64;
        let start = self.start as i64;
        let target = index as i64;

        let new_start = if target < start {
            let steps = (start - target + step - 1) / step;
            (start - steps * step).max(0)
        } else {
            let overshoot = target - (start + capacity) + 1;
            start + (overshoot + step - 1) / step * step
        };
        let new_start = new_start as i32;

        debug!(
            "Head window moves from {} to {} (group {})",
            self.start, new_start, index
        );

        let mut heads = vec![None; self.capacity()];
        for (slot, head) in heads.iter_mut().enumerate() {
            let group = new_start + slot as i32;
            *head = match self.get(group) {
                Some(cached) => Some(cached),
                None if group < group_count => Some(GroupHead::read(store, layout, group)?),
                None => None,
            };
        }
        self.start = new_start;
        self.heads = heads;
        Ok(())
    }
}
