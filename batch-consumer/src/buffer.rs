use std::collections::VecDeque;

use crate::batch::Batch;

/// Ordered accumulator for the window currently being filled.
///
/// The buffer performs no capacity check of its own: the windower compares
/// `len()` against the batch size right after every `add`.
#[derive(Debug)]
pub struct BatchBuffer<T> {
    items: VecDeque<T>,
}

impl<T> BatchBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Append an item at the tail.
    pub fn add(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Remove the oldest item, `None` once the buffer is exhausted.
    pub fn read(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Move every buffered item, oldest first, into a new batch.
    pub fn drain(&mut self) -> Batch<T> {
        let mut items = Vec::with_capacity(self.items.len());
        while let Some(item) = self.read() {
            items.push(item);
        }
        Batch::new(items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for BatchBuffer<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}
