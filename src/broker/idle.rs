//! FIFO of slot positions for workers waiting for a connection.

/// Bounded ring buffer of slot positions.
///
/// Capacity equals the slot table size, so every worker slot fits even when
/// all of them are idle at once.
#[derive(Debug)]
pub struct IdleQueue {
    ring: Box<[usize]>,
    head: usize,
    tail: usize,
    size: usize,
}

impl IdleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: vec![0; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Append a slot position at the tail.
    ///
    /// Panics if the queue is full: a slot is queued at most once per
    /// completed hello, so a full queue means that invariant broke.
    pub fn push(&mut self, pos: usize) {
        assert!(self.size < self.capacity(), "idle worker queue overflow");
        self.ring[self.tail] = pos;
        self.tail = (self.tail + 1) % self.capacity();
        self.size += 1;
    }

    /// Remove and return the position at the head.
    pub fn pop(&mut self) -> Option<usize> {
        if self.size == 0 {
            return None;
        }
        let pos = self.ring[self.head];
        self.head = (self.head + 1) % self.capacity();
        self.size -= 1;
        Some(pos)
    }

    pub fn contains(&self, pos: usize) -> bool {
        self.iter().any(|p| p == pos)
    }

    /// Drop `pos` from the queue, keeping the order of everything else.
    ///
    /// Returns whether the position was queued.
    pub fn remove(&mut self, pos: usize) -> bool {
        let Some(index) = self.iter().position(|p| p == pos) else {
            return false;
        };
        let cap = self.capacity();
        // Close the gap by shifting the later entries one step toward the head.
        for i in index..self.size - 1 {
            self.ring[(self.head + i) % cap] = self.ring[(self.head + i + 1) % cap];
        }
        self.tail = (self.tail + cap - 1) % cap;
        self.size -= 1;
        true
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.size = 0;
    }

    /// Positions from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).map(move |i| self.ring[(self.head + i) % self.capacity()])
    }
}
