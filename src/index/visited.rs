//! Visited-node tracking for graph traversal.
//!
//! Each thread keeps one epoch-stamped table: starting a traversal bumps the
//! epoch instead of clearing memory, and the table grows on demand as the
//! shard grows.

use crate::types::Handle;
use std::cell::RefCell;

thread_local! {
    static VISITED: RefCell<Visited> = RefCell::new(Visited::default());
}

/// Epoch-stamped visited set.
#[derive(Default)]
pub(crate) struct Visited {
    stamps: Vec<u32>,
    epoch: u32,
    count: usize,
}

impl Visited {
    fn reset(&mut self, capacity: usize) {
        if self.stamps.len() < capacity {
            self.stamps.resize(capacity.next_power_of_two(), 0);
        }
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.stamps.fill(0);
            self.epoch = 1;
        }
        self.count = 0;
    }

    /// Mark `handle`; returns false if it was already marked.
    #[inline]
    pub(crate) fn insert(&mut self, handle: Handle) -> bool {
        let index = handle as usize;
        if index >= self.stamps.len() {
            self.stamps.resize((index + 1).next_power_of_two(), 0);
        }
        if self.stamps[index] == self.epoch {
            return false;
        }
        self.stamps[index] = self.epoch;
        self.count += 1;
        true
    }

    /// Number of handles marked since the traversal started.
    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count
    }
}

/// Run `f` with this thread's visited set, emptied and sized for `capacity`.
pub(crate) fn with_visited<R>(capacity: usize, f: impl FnOnce(&mut Visited) -> R) -> R {
    VISITED.with(|cell| match cell.try_borrow_mut() {
        Ok(mut visited) => {
            visited.reset(capacity);
            f(&mut visited)
        }
        // Re-entrant use on the same thread gets a private table.
        Err(_) => {
            let mut visited = Visited::default();
            visited.reset(capacity);
            f(&mut visited)
        }
    })
}
