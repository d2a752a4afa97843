use std::collections::VecDeque;

/// A fixed-capacity rolling window. Once full, every push evicts the oldest
/// sample and hands it back to the caller, which lets running sums be
/// maintained without recomputing over the whole window.
#[derive(Debug, Clone)]
pub(crate) struct Window<T> {
    data: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> Window<T> {
    /// Create a window that starts out full, every slot holding `seed`
    #[must_use]
    pub(crate) fn filled(capacity: usize, seed: T) -> Self {
        let mut data = VecDeque::with_capacity(capacity);
        data.resize(capacity, seed);
        Self { data, capacity }
    }
}

impl<T> Window<T> {
    /// Push an element to the window, returning the evicted oldest element
    /// if the window was at capacity
    pub(crate) fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.data.len() >= self.capacity {
            self.data.pop_front()
        } else {
            None
        };
        self.data.push_back(item);
        evicted
    }

    /// Get the number of elements currently in the window
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Get an iterator over the elements in the window, oldest first
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }
}
