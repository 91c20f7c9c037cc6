//! Slot-indexed LRU order.
//!
//! A doubly linked list over slot indices `0..capacity`, stored as two
//! index arrays. Every slot is always in the list: unused slots start at the
//! least-recent end, so eviction and allocation are the same operation.

const NIL: usize = usize::MAX;

#[derive(Debug)]
pub(crate) struct LruList {
    prev: Vec<usize>,
    next: Vec<usize>,
    /// Least recently used
    head: usize,
    /// Most recently used
    tail: usize,
}

impl LruList {
    /// All slots linked in index order, slot 0 least recent.
    pub fn new(capacity: usize) -> Self {
        let prev = (0..capacity)
            .map(|i| if i == 0 { NIL } else { i - 1 })
            .collect();
        let next = (0..capacity)
            .map(|i| if i + 1 == capacity { NIL } else { i + 1 })
            .collect();
        Self {
            prev,
            next,
            head: if capacity == 0 { NIL } else { 0 },
            tail: if capacity == 0 { NIL } else { capacity - 1 },
        }
    }

    pub fn capacity(&self) -> usize {
        self.prev.len()
    }

    /// Least recently used slot.
    pub fn lru(&self) -> Option<usize> {
        (self.head != NIL).then_some(self.head)
    }

    /// Move `slot` to the most-recent end.
    pub fn touch(&mut self, slot: usize) {
        if self.tail == slot {
            return;
        }
        self.unlink(slot);
        self.push_back(slot);
    }

    /// Move `slot` to the least-recent end so it is reused first.
    pub fn demote(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.prev[slot] = NIL;
        self.next[slot] = self.head;
        if self.head != NIL {
            self.prev[self.head] = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    /// Position counted from the least-recent end; used by tests to bound eviction.
    #[cfg(test)]
    pub fn position(&self, slot: usize) -> usize {
        let mut pos = 0;
        let mut cursor = self.head;
        while cursor != slot && cursor != NIL {
            cursor = self.next[cursor];
            pos += 1;
        }
        pos
    }

    fn unlink(&mut self, slot: usize) {
        let (p, n) = (self.prev[slot], self.next[slot]);
        if p != NIL {
            self.next[p] = n;
        } else {
            self.head = n;
        }
        if n != NIL {
            self.prev[n] = p;
        } else {
            self.tail = p;
        }
        self.prev[slot] = NIL;
        self.next[slot] = NIL;
    }

    fn push_back(&mut self, slot: usize) {
        self.prev[slot] = self.tail;
        self.next[slot] = NIL;
        if self.tail != NIL {
            self.next[self.tail] = slot;
        }
        self.tail = slot;
        if self.head == NIL {
            self.head = slot;
        }
    }
}
