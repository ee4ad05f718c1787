// crates/lontalk-rs/src/queue.rs
//! Bounded single-producer/single-consumer ring buffer (spec §4.1), grounded
//! in `original_source/lcs_queue.c`'s `Queue` struct and its
//! `QueueFull`/`QueueEmpty`/`DeQueue`/size accessors, re-expressed as a small
//! generic Rust ring buffer instead of a raw byte array with a manually
//! tracked item size.
//!
//! Items are stored in place (`VecDeque`-style, but with a fixed capacity
//! enforced at push time) and transferred by value between layers within one
//! scheduler sweep (spec §5).

use alloc::collections::VecDeque;

/// A fixed-capacity FIFO queue of items of type `T`.
///
/// No internal synchronisation: the producer and consumer must run on the
/// same thread (spec §4.1, "cooperative scheduler").
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::with_capacity(capacity), capacity }
    }

    /// Capacity of the queue (`QueueCnt` in the original).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of items (`QueueSize` in the original).
    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Commits `item` to the tail slot. Returns the item back if the queue is
    /// full (mirrors the original's producer convention of checking `full()`
    /// before writing into `tail()`).
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        if self.full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Releases and returns the head slot (`DeQueue` + read of `head()` in
    /// the original, combined since Rust can move the value out directly).
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Read-only view of the head slot without removing it.
    pub fn head(&self) -> Option<&T> {
        self.items.front()
    }
}
