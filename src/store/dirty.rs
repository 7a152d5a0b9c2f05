//! # Dirty Tracker
//!
//! Tracks which rows have unsaved changes and, per row, which columns
//! changed. The pending row-id set is a `RoaringTreemap` (row ids are
//! u64 and monotonically allocated, which roaring compresses well); the
//! per-row column set is a u64 bitmask, bounded by
//! [`crate::config::MAX_COLUMNS`].
//!
//! Save drains the tracker in ascending row-id order, which is also
//! record-slot order, so incremental writes extend the file
//! sequentially.

use hashbrown::HashMap;
use roaring::RoaringTreemap;

#[derive(Debug, Default)]
pub(crate) struct DirtyTracker {
    rows: RoaringTreemap,
    masks: HashMap<u64, u64>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, row_id: u64, column: usize) {
        debug_assert!(column < 64);
        self.rows.insert(row_id);
        *self.masks.entry(row_id).or_insert(0) |= 1 << column;
    }

    /// Marks every column of a row dirty, as for a freshly created row.
    pub fn mark_all(&mut self, row_id: u64, column_count: usize) {
        debug_assert!(column_count <= 64);
        self.rows.insert(row_id);
        let mask = if column_count == 64 {
            u64::MAX
        } else {
            (1u64 << column_count) - 1
        };
        *self.masks.entry(row_id).or_insert(0) |= mask;
    }

    pub fn is_dirty(&self, row_id: u64) -> bool {
        self.rows.contains(row_id)
    }

    pub fn column_dirty(&self, row_id: u64, column: usize) -> bool {
        self.masks
            .get(&row_id)
            .is_some_and(|mask| mask & (1 << column) != 0)
    }

    /// Forgets a row entirely, as when an unsaved row is destroyed.
    pub fn forget(&mut self, row_id: u64) {
        self.rows.remove(row_id);
        self.masks.remove(&row_id);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> u64 {
        self.rows.len()
    }

    /// Every pending (row id, column mask) pair, ascending by row id.
    /// The tracker keeps them; save clears only once its writes landed,
    /// so a failed save leaves the rows pending.
    pub fn pending(&self) -> Vec<(u64, u64)> {
        self.rows
            .iter()
            .map(|row_id| (row_id, self.masks.get(&row_id).copied().unwrap_or(0)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.masks.clear();
    }

    /// [`DirtyTracker::pending`] and [`DirtyTracker::clear`] in one step.
    pub fn drain(&mut self) -> Vec<(u64, u64)> {
        let drained = self.pending();
        self.clear();
        drained
    }
}
