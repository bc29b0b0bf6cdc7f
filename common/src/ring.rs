//! Fallible, capacity-bounded collections.
//!
//! The protocol engine never wants unbounded growth on a queue that mirrors kernel
//! socket buffers: a connection with a runaway writer should fail loudly rather than
//! grow memory without limit. [`BoundedQueue`] wraps a [`VecDeque`] and turns "queue is
//! full" into a recoverable `Err` that returns the rejected item to the caller instead
//! of panicking or reallocating past the configured bound.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    inner: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push to the back of the queue. On overflow, the item is handed back unchanged
    /// and the queue is left untouched.
    pub fn try_push_back(&mut self, item: T) -> Result<(), T> {
        if self.inner.len() == self.capacity {
            return Err(item);
        }
        self.inner.push_back(item);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        self.inner.front_mut()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.len() == self.capacity
    }

    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, T> {
        self.inner.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_past_capacity_without_mutating() {
        let mut q = BoundedQueue::new(2);
        assert!(q.try_push_back(1).is_ok());
        assert!(q.try_push_back(2).is_ok());
        assert_eq!(q.try_push_back(3), Err(3));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn fifo_order() {
        let mut q = BoundedQueue::new(4);
        q.try_push_back("a").unwrap();
        q.try_push_back("b").unwrap();
        assert_eq!(q.pop_front(), Some("a"));
        assert_eq!(q.pop_front(), Some("b"));
        assert_eq!(q.pop_front(), None);
    }
}
