#![forbid(unsafe_code)]

//! Fast-path event queues.
//!
//! The fault handler is the only producer. Pushing never blocks: a full
//! queue rejects the event and bumps the drop counter, so the faulting
//! thread is released no matter how far behind enrichment is.

use crate::domain::FastPathEvent;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug)]
pub struct EventQueue {
    inner: ArrayQueue<FastPathEvent>,
    dropped: AtomicU64,
}

impl EventQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns `false` without waiting when the queue is full.
    pub fn enqueue(&self, event: FastPathEvent) -> bool {
        match self.inner.push(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dequeue(&self) -> Option<FastPathEvent> {
        self.inner.pop()
    }

    pub fn size(&self) -> usize {
        self.inner.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One queue per enrichment worker. A region always maps to the same
/// partition, so its mutations are enriched in the order they faulted.
///
/// `capacity` bounds the events waiting across all partitions together, so
/// a single busy region can use the whole budget.
#[derive(Debug)]
pub struct PartitionedQueue {
    partitions: Vec<EventQueue>,
    capacity: usize,
    depth: AtomicUsize,
    dropped: AtomicU64,
}

impl PartitionedQueue {
    pub fn new(capacity: usize, partitions: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            partitions: (0..partitions.max(1))
                .map(|_| EventQueue::new(capacity))
                .collect(),
            capacity,
            depth: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn partition_of(&self, region_base: usize) -> usize {
        // Region bases are page aligned; drop the always-zero low bits
        // before spreading.
        let key = (region_base >> 12) as u64;
        (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize % self.partitions.len()
    }

    /// Returns `false` without waiting when `capacity` events are already
    /// queued.
    pub fn enqueue(&self, event: FastPathEvent) -> bool {
        let reserved = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < self.capacity).then_some(depth + 1)
            })
            .is_ok();
        if reserved && self.partitions[self.partition_of(event.region_base)].enqueue(event) {
            return true;
        }
        if reserved {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Next event of partition `index`.
    pub fn dequeue(&self, index: usize) -> Option<FastPathEvent> {
        let event = self.partitions[index].dequeue()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events currently waiting across all partitions.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Empty every partition, returning how many events were discarded.
    pub fn discard_all(&self) -> u64 {
        let mut discarded = 0;
        for index in 0..self.partitions.len() {
            while self.dequeue(index).is_some() {
                discarded += 1;
            }
        }
        discarded
    }
}
