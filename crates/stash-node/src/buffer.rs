//! The reserved physical buffer: real item stacks in a node's adjacent space.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use stash_types::{ItemBatch, ItemFilter, ItemHandle, ItemKey};

/// Source of unique [`ItemHandle`]s for stacks the engine materializes.
///
/// Clones share one counter, so every node handed the same allocator mints
/// distinct handles.
#[derive(Clone, Debug, Default)]
pub struct HandleAllocator {
    next: Arc<AtomicU64>,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting at `first`, e.g. above the host's own handle range.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(first)),
        }
    }

    pub fn allocate(&self) -> ItemHandle {
        ItemHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// One real stack sitting in the buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemStack {
    pub handle: ItemHandle,
    pub batch: ItemBatch,
}

/// Real stacks kept next to a node, keyed by handle.
///
/// Handles are kept in order so scans are deterministic.
#[derive(Clone, Debug, Default)]
pub struct PhysicalBuffer {
    stacks: BTreeMap<ItemHandle, ItemStack>,
}

impl PhysicalBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a stack into the buffer under `handle`, replacing any stack that
    /// already used it.
    pub fn place(&mut self, handle: ItemHandle, batch: ItemBatch) -> Option<ItemStack> {
        self.stacks.insert(handle, ItemStack { handle, batch })
    }

    /// Materialize `batch` as one or more stacks of at most `stack_limit`.
    pub fn materialize(
        &mut self,
        mut batch: ItemBatch,
        stack_limit: u32,
        handles: &HandleAllocator,
    ) -> Vec<ItemHandle> {
        let limit = stack_limit.max(1);
        let mut placed = Vec::new();
        while batch.count > limit {
            let chunk = ItemBatch {
                key: batch.key.clone(),
                count: limit,
                durability: batch.durability,
            };
            batch.count -= limit;
            let handle = handles.allocate();
            self.place(handle, chunk);
            placed.push(handle);
        }
        if !batch.is_empty() {
            let handle = handles.allocate();
            self.place(handle, batch);
            placed.push(handle);
        }
        placed
    }

    pub fn get(&self, handle: ItemHandle) -> Option<&ItemStack> {
        self.stacks.get(&handle)
    }

    pub fn remove(&mut self, handle: ItemHandle) -> Option<ItemStack> {
        self.stacks.remove(&handle)
    }

    /// Split up to `count` units off the stack at `handle`.
    ///
    /// The stack disappears once it is empty.
    pub fn take(&mut self, handle: ItemHandle, count: u32) -> Option<ItemBatch> {
        let stack = self.stacks.get_mut(&handle)?;
        let count = count.min(stack.batch.count);
        if count == 0 {
            return None;
        }
        if count == stack.batch.count {
            return self.stacks.remove(&handle).map(|s| s.batch);
        }
        stack.batch.split_off(count).ok()
    }

    /// Return units previously taken from `handle`.
    ///
    /// If the stack still exists the units are folded back into it;
    /// otherwise the stack is recreated under the same handle. A handle now
    /// holding a different kind of item gets a fresh handle for the units.
    pub fn put_back(&mut self, handle: ItemHandle, batch: ItemBatch, handles: &HandleAllocator) {
        match self.stacks.get_mut(&handle) {
            Some(stack) if stack.batch.key.same_kind(&batch.key) => {
                // Same kind, so absorb cannot fail.
                let _ = stack.batch.absorb(batch);
            }
            Some(_) => {
                self.place(handles.allocate(), batch);
            }
            None => {
                self.place(handle, batch);
            }
        }
    }

    pub fn stacks(&self) -> impl Iterator<Item = &ItemStack> {
        self.stacks.values()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Units of exactly `key`.
    pub fn quantity(&self, key: &ItemKey) -> u64 {
        self.stacks
            .values()
            .filter(|s| &s.batch.key == key)
            .map(|s| u64::from(s.batch.count))
            .sum()
    }

    /// Units of every stack matching `filter`.
    pub fn quantity_matching(&self, filter: &ItemFilter) -> u64 {
        self.stacks
            .values()
            .filter(|s| filter.matches(&s.batch.key))
            .map(|s| u64::from(s.batch.count))
            .sum()
    }

    /// Units per group, where `group_of` maps a stack key to its group.
    pub fn totals_by<F>(&self, group_of: F) -> HashMap<ItemKey, u64>
    where
        F: Fn(&ItemKey) -> ItemKey,
    {
        let mut totals = HashMap::new();
        for stack in self.stacks.values() {
            *totals.entry(group_of(&stack.batch.key)).or_insert(0) += u64::from(stack.batch.count);
        }
        totals
    }

    /// Remove and return every stack.
    pub fn drain(&mut self) -> Vec<ItemStack> {
        std::mem::take(&mut self.stacks).into_values().collect()
    }
}
