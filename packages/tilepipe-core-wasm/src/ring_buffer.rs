use std::iter::FusedIterator;
use std::ops::Index;

use crate::error::PipelineError;

/// Fixed-capacity buffer holding the most recent `capacity` items.
///
/// Index 0 is always the newest live item and `len() - 1` the oldest. Once
/// full, every `push` overwrites the oldest slot. The buffer never shrinks
/// except through that eviction.
///
/// Not synchronised: a single owner writes to it, callers on other threads
/// must serialise access themselves.
#[derive(Debug, Clone)]
pub struct RecencyRingBuffer<T> {
    slots: Vec<T>,
    capacity: usize,
    // physical index the next push writes to
    head: usize,
}

impl<T> RecencyRingBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self, PipelineError> {
        if capacity == 0 {
            return Err(PipelineError::ZeroCapacity);
        }
        Ok(Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        })
    }

    /// Insert `item` as the newest entry, returning the evicted oldest entry
    /// when the buffer was already full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.slots.len() < self.capacity {
            self.slots.push(item);
            None
        } else {
            Some(std::mem::replace(&mut self.slots[self.head], item))
        };
        self.head = (self.head + 1) % self.capacity;
        evicted
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    /// Item `index` steps back from the newest one.
    pub fn get(&self, index: usize) -> Result<&T, PipelineError> {
        if index >= self.slots.len() {
            return Err(PipelineError::IndexOutOfRange {
                index,
                count: self.slots.len(),
            });
        }
        Ok(&self.slots[self.physical(index)])
    }

    pub fn newest(&self) -> Option<&T> {
        self.get(0).ok()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.slots.len().checked_sub(1).and_then(|i| self.get(i).ok())
    }

    /// Newest-to-oldest iteration. Each call starts over from the newest item.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            buffer: self,
            front: 0,
            back: self.slots.len(),
        }
    }

    pub fn find<P>(&self, mut predicate: P) -> Option<&T>
    where
        P: FnMut(&T) -> bool,
    {
        self.iter().find(|item| predicate(item))
    }

    fn physical(&self, index: usize) -> usize {
        (self.head + self.capacity - 1 - index) % self.capacity
    }
}

impl<T: PartialEq> RecencyRingBuffer<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.slots.contains(item)
    }
}

impl<T> Index<usize> for RecencyRingBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Ok(item) => item,
            Err(e) => panic!("{}", e),
        }
    }
}

impl<'a, T> IntoIterator for &'a RecencyRingBuffer<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct Iter<'a, T> {
    buffer: &'a RecencyRingBuffer<T>,
    front: usize,
    back: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.front >= self.back {
            return None;
        }
        let item = &self.buffer.slots[self.buffer.physical(self.front)];
        self.front += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<'a, T> DoubleEndedIterator for Iter<'a, T> {
    fn next_back(&mut self) -> Option<&'a T> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(&self.buffer.slots[self.buffer.physical(self.back)])
    }
}

impl<'a, T> ExactSizeIterator for Iter<'a, T> {}
impl<'a, T> FusedIterator for Iter<'a, T> {}
