//! Monotonic id allocation shared by sequence numbers, breakpoint ids and
//! variable references.

use std::collections::HashMap;

/// Hands out strictly increasing ids starting at `first`.
///
/// There is no way to rewind the counter: a reset of whatever the ids index
/// must never make an old id valid again.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: i64,
}

impl IdAllocator {
    pub fn starting_at(first: i64) -> Self {
        Self { next: first }
    }

    pub fn next_id(&mut self) -> i64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// The id the next call to [`IdAllocator::next_id`] returns.
    pub fn peek(&self) -> i64 {
        self.next
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

/// Maps allocator ids to values until the next [`HandleArena::clear`].
///
/// Handles start at 1 so `0` stays free for "no children" in DAP.
#[derive(Debug)]
pub struct HandleArena<T> {
    ids: IdAllocator,
    entries: HashMap<i64, T>,
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self {
            ids: IdAllocator::starting_at(1),
            entries: HashMap::new(),
        }
    }
}

impl<T> HandleArena<T> {
    pub fn insert(&mut self, value: T) -> i64 {
        let id = self.ids.next_id();
        self.entries.insert(id, value);
        id
    }

    pub fn get(&self, handle: i64) -> Option<&T> {
        self.entries.get(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry. Handles issued before the call stay dead forever.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
