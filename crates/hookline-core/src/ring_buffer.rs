//! Fixed-capacity ring buffer for sliding outcome windows.
//!
//! When full, a push overwrites the oldest item. Iteration yields items from
//! oldest to newest. The advisory state store keeps its fallback-ratio window
//! in one of these and persists it as a plain oldest-first list.

// =============================================================================
// RingBuffer
// =============================================================================

/// A fixed-capacity ring buffer.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: Vec<Option<T>>,
    head: usize, // next write position
    len: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer. A zero capacity is clamped to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);
        Self {
            buf,
            head: 0,
            len: 0,
        }
    }

    /// Rebuild a buffer from oldest-first items, keeping only the newest
    /// `capacity` of them.
    #[must_use]
    pub fn from_items(capacity: usize, items: impl IntoIterator<Item = T>) -> Self {
        let mut rb = Self::new(capacity);
        for item in items {
            rb.push(item);
        }
        rb
    }

    /// Push an item. If full, the oldest item is evicted and returned.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = self.buf[self.head].replace(item);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
            None
        } else {
            evicted
        }
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let start = self.start();
        let cap = self.capacity();
        (0..self.len).filter_map(move |i| self.buf[(start + i) % cap].as_ref())
    }

    /// Number of stored items matching `pred`.
    pub fn count_where(&self, mut pred: impl FnMut(&T) -> bool) -> usize {
        self.iter().filter(|item| pred(item)).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn start(&self) -> usize {
        if self.len < self.capacity() {
            0
        } else {
            self.head
        }
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Oldest-first copy of the contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_evicts_oldest_when_full() {
        let mut rb = RingBuffer::new(3);
        assert_eq!(rb.push(1), None);
        assert_eq!(rb.push(2), None);
        assert_eq!(rb.push(3), None);
        assert_eq!(rb.len(), rb.capacity());
        assert_eq!(rb.push(4), Some(1));
        assert_eq!(rb.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut rb = RingBuffer::new(0);
        assert_eq!(rb.capacity(), 1);
        rb.push('a');
        rb.push('b');
        assert_eq!(rb.to_vec(), vec!['b']);
    }

    #[test]
    fn from_items_keeps_newest() {
        let rb = RingBuffer::from_items(2, [1, 2, 3, 4, 5]);
        assert_eq!(rb.to_vec(), vec![4, 5]);
        assert_eq!(rb.len(), 2);
    }

    #[test]
    fn count_where_tracks_evictions() {
        let mut rb = RingBuffer::from_items(3, [true, false, true]);
        assert_eq!(rb.count_where(|b| *b), 2);
        rb.push(false);
        assert_eq!(rb.count_where(|b| *b), 1);
        assert!(RingBuffer::<bool>::new(4).is_empty());
    }
}
