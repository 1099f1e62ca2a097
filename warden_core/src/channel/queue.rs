//! Bounded FIFO used for channel request queues.

use std::collections::VecDeque;

/// A FIFO queue that refuses items past its capacity.
///
/// Not synchronized; the owning channel's lock covers it.
#[derive(Debug)]
pub(crate) struct BoundedQueue<T> {
    /// The internal queue
    items: VecDeque<T>,

    /// The maximum capacity of the queue
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a new bounded queue
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an item, handing it back when the queue is full
    pub(crate) fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Pop the oldest item
    pub(crate) fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Remove the first item matching `pred`, keeping the order of the rest
    pub(crate) fn remove_first(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let pos = self.items.iter().position(pred)?;
        self.items.remove(pos)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued item
    pub(crate) fn clear(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }
}
