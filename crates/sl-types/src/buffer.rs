//! FIFO queues that feed and drain blobs and channels.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// A thread-safe FIFO of items.
///
/// Implementations are shared between one producer and one consumer task;
/// `write` never blocks and hands the item back when the buffer is full.
pub trait Buffer<T>: Send + Sync {
    /// Number of items currently queued.
    fn size(&self) -> usize;

    /// Maximum number of items the buffer will hold.
    fn capacity(&self) -> usize;

    /// Pops the oldest item, if any.
    fn read(&self) -> Option<T>;

    /// Appends an item, returning it back if the buffer is full.
    fn write(&self, item: T) -> Result<(), T>;

    /// Pops everything currently queued, oldest first.
    fn read_all(&self) -> Vec<T>;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn is_full(&self) -> bool {
        self.size() >= self.capacity()
    }
}

/// Bounded [`Buffer`] backed by a mutex-protected ring.
#[derive(Debug)]
pub struct ConcurrentBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> ConcurrentBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// A buffer that never reports itself full.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }
}

impl<T: Send> Buffer<T> for ConcurrentBuffer<T> {
    fn size(&self) -> usize {
        self.items.lock().len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn read(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    fn write(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    fn read_all(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_fifo_order() {
        let buffer = ConcurrentBuffer::new(8);
        for i in 0..5 {
            buffer.write(i).unwrap();
        }
        assert_eq!(buffer.read(), Some(0));
        assert_eq!(buffer.read_all(), vec![1, 2, 3, 4]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn full_buffer_returns_item() {
        let buffer = ConcurrentBuffer::new(2);
        buffer.write("a").unwrap();
        buffer.write("b").unwrap();
        assert!(buffer.is_full());
        assert_eq!(buffer.write("c"), Err("c"));
        assert_eq!(buffer.size(), 2);
    }
}
