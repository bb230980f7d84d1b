use crossbeam::queue::ArrayQueue;
use serde::Deserialize;

/// Determines how a buffer stage behaves when its queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Only request from upstream what fits in the queue
    #[default]
    Backpressure,
    /// Request unbounded demand and evict the oldest element to make space
    DropOldest,
}

/// Bounded queue behind a buffer stage, scoped to one run
#[derive(Debug)]
pub struct StageBuffer<T> {
    queue: ArrayQueue<T>,
    policy: OverflowPolicy,
    dropped_count: u64,
}

impl<T> StageBuffer<T> {
    /// Create a new buffer with the specified capacity and overflow policy
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; stage graphs validate capacities first.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            policy,
            dropped_count: 0,
        }
    }

    /// Push an element, applying the overflow policy when full
    ///
    /// Returns the element back if the buffer is full and may not evict.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        match self.policy {
            OverflowPolicy::Backpressure => self.queue.push(item),
            OverflowPolicy::DropOldest => {
                if self.queue.force_push(item).is_some() {
                    self.dropped_count += 1;
                }
                Ok(())
            }
        }
    }

    /// Attempt to pop an element from the buffer
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Free slots left in the queue
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Get the utilization of the buffer as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() * 100) / self.capacity()).min(100) as u32
    }

    /// Number of elements evicted by [`OverflowPolicy::DropOldest`]
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    /// Discard every queued element
    pub fn clear(&mut self) {
        while self.queue.pop().is_some() {}
    }
}
