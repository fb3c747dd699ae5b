//! # Bounded Circular Queue
//!
//! Fixed-capacity ring buffer of fixed-size byte records, the building
//! block for message channels.
//!
//! ## Philosophy
//!
//! - **Preallocated, never reallocating**: storage is one flat array
//!   sized at init; enqueue and dequeue move indices only
//! - **Contracts, not errors**: the unchecked operations assert their
//!   preconditions; callers check `is_full`/`is_empty` first
//! - **Diagnosable**: the high-water mark records the worst occupancy
//!   ever reached, for capacity planning
//!
//! One slot is permanently reserved empty so full and empty are
//! distinguishable from head and tail alone; a second slot is reserved
//! as bookkeeping headroom, so the capacity reported to callers is
//! `slots - 2`.
//!
//! The thread-safety toggle of the classic design is expressed as two
//! types: [`RingQueue`] (`&mut self`, no locking) for callers that
//! pre-serialize access, and [`SyncRingQueue`] (internal mutex plus a
//! condvar for blocking waits) for cross-thread channels.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Queue error types for the checked operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// No capacity left for another record
    #[error("Queue full")]
    Full,
    /// Record does not fit in one slot
    #[error("Record larger than slot size")]
    Oversize,
}

/// Fixed-capacity ring of `slots` records, each `item_size` bytes.
#[derive(Debug)]
pub struct RingQueue {
    storage: Vec<u8>,
    slots: usize,
    item_size: usize,
    /// Next write index
    head: usize,
    /// Slot before the next read index
    tail: usize,
    used: usize,
    high_water: usize,
}

/// Byte overhead of a length-prefixed record within a slot.
pub const RECORD_PREFIX: usize = 4;

impl RingQueue {
    /// Creates a queue of `slots` slots, each holding `item_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `slots < 3` or `item_size == 0`; the ring needs the
    /// reserved empty slot plus at least one usable slot.
    pub fn new(slots: usize, item_size: usize) -> Self {
        assert!(slots >= 3, "ring needs at least 3 slots");
        assert!(item_size > 0, "item size must be non-zero");
        Self {
            storage: vec![0u8; slots * item_size],
            slots,
            item_size,
            head: 0,
            tail: slots - 1,
            used: 0,
            high_water: 0,
        }
    }

    /// Clears all state, including the high-water mark. Storage is kept.
    pub fn reinit(&mut self) {
        self.head = 0;
        self.tail = self.slots - 1;
        self.used = 0;
        self.high_water = 0;
    }

    /// Capacity reported to callers: total slots minus the reserved
    /// empty slot and the bookkeeping headroom slot.
    pub fn capacity(&self) -> usize {
        self.slots - 2
    }

    /// Slot payload size fixed at init.
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Records callers may still enqueue before reaching capacity.
    pub fn available_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.used)
    }

    /// Current number of queued records.
    pub fn current_occupancy(&self) -> usize {
        self.used
    }

    /// Maximum occupancy ever observed; reset only by [`reinit`].
    ///
    /// [`reinit`]: RingQueue::reinit
    pub fn high_water_mark(&self) -> usize {
        self.high_water
    }

    /// Returns whether every writable slot is in use.
    pub fn is_full(&self) -> bool {
        self.used == self.slots - 1
    }

    /// Returns whether no record is queued.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Adds a record at the head.
    ///
    /// # Panics
    ///
    /// Panics if the queue is full or `item` exceeds the slot size;
    /// callers check `is_full`/`available_capacity` first.
    pub fn enqueue(&mut self, item: &[u8]) {
        assert!(!self.is_full(), "enqueue on full ring");
        assert!(item.len() <= self.item_size, "record exceeds slot size");
        let offset = self.head * self.item_size;
        self.storage[offset..offset + item.len()].copy_from_slice(item);
        self.head = (self.head + 1) % self.slots;
        self.used += 1;
        if self.used > self.high_water {
            self.high_water = self.used;
        }
    }

    /// Reads the oldest slot without removing it.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty.
    pub fn peek_oldest(&self) -> &[u8] {
        assert!(!self.is_empty(), "peek on empty ring");
        let index = (self.tail + 1) % self.slots;
        let offset = index * self.item_size;
        &self.storage[offset..offset + self.item_size]
    }

    /// Removes the oldest record without reading it; the reader is
    /// expected to have copied it out via [`peek_oldest`] already.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty.
    ///
    /// [`peek_oldest`]: RingQueue::peek_oldest
    pub fn dequeue(&mut self) {
        assert!(!self.is_empty(), "dequeue on empty ring");
        self.tail = (self.tail + 1) % self.slots;
        self.used -= 1;
    }

    /// Removes the oldest `count` records in one step.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `count` records are queued.
    pub fn dequeue_n(&mut self, count: usize) {
        assert!(count <= self.used, "bulk dequeue past occupancy");
        self.tail = (self.tail + count) % self.slots;
        self.used -= count;
    }

    /// Non-destructive scan of queued records from oldest to newest.
    ///
    /// Yields the same decoded records [`peek_record`] would, so a scan
    /// and the read path agree; only meaningful for rings filled via
    /// [`push_record`].
    ///
    /// [`peek_record`]: RingQueue::peek_record
    /// [`push_record`]: RingQueue::push_record
    pub fn iter(&self) -> RingIter<'_> {
        RingIter {
            queue: self,
            index: (self.tail + 1) % self.slots,
            remaining: self.used,
        }
    }

    /// Checked enqueue of a length-prefixed record.
    ///
    /// Rejects with [`QueueError::Full`] once the reported capacity is
    /// reached and with [`QueueError::Oversize`] when the record plus its
    /// prefix does not fit one slot.
    pub fn push_record(&mut self, record: &[u8]) -> Result<(), QueueError> {
        if record.len() + RECORD_PREFIX > self.item_size {
            return Err(QueueError::Oversize);
        }
        if self.available_capacity() == 0 {
            return Err(QueueError::Full);
        }
        let mut slot = Vec::with_capacity(RECORD_PREFIX + record.len());
        slot.extend_from_slice(&(record.len() as u32).to_le_bytes());
        slot.extend_from_slice(record);
        self.enqueue(&slot);
        Ok(())
    }

    /// Reads the oldest length-prefixed record without removing it.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty.
    pub fn peek_record(&self) -> &[u8] {
        decode_record(self.peek_oldest())
    }
}

/// Strips the length prefix and padding from a slot written by
/// [`RingQueue::push_record`].
fn decode_record(slot: &[u8]) -> &[u8] {
    let mut prefix = [0u8; RECORD_PREFIX];
    prefix.copy_from_slice(&slot[..RECORD_PREFIX]);
    let len = u32::from_le_bytes(prefix) as usize;
    &slot[RECORD_PREFIX..RECORD_PREFIX + len]
}

/// Forward iterator over queued records, oldest first.
#[derive(Debug)]
pub struct RingIter<'a> {
    queue: &'a RingQueue,
    index: usize,
    remaining: usize,
}

impl<'a> Iterator for RingIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.remaining == 0 {
            return None;
        }
        let offset = self.index * self.queue.item_size;
        let slot = &self.queue.storage[offset..offset + self.queue.item_size];
        self.index = (self.index + 1) % self.queue.slots;
        self.remaining -= 1;
        Some(decode_record(slot))
    }
}

/// Mutex-wrapped ring for channels shared across threads.
///
/// Every operation is atomic with respect to concurrent callers; a
/// condvar lets consumers block for the next record.
#[derive(Debug)]
pub struct SyncRingQueue {
    inner: Mutex<RingQueue>,
    available: Condvar,
}

impl SyncRingQueue {
    /// Creates a threaded queue of `slots` slots of `item_size` bytes.
    pub fn new(slots: usize, item_size: usize) -> Self {
        Self {
            inner: Mutex::new(RingQueue::new(slots, item_size)),
            available: Condvar::new(),
        }
    }

    /// Checked enqueue of a length-prefixed record; wakes waiting
    /// consumers on success.
    pub fn push_record(&self, record: &[u8]) -> Result<(), QueueError> {
        let mut queue = self.inner.lock().expect("ring lock poisoned");
        queue.push_record(record)?;
        self.available.notify_all();
        Ok(())
    }

    /// Copies the oldest record out without removing it.
    pub fn peek_record(&self) -> Option<Vec<u8>> {
        let queue = self.inner.lock().expect("ring lock poisoned");
        if queue.is_empty() {
            return None;
        }
        Some(queue.peek_record().to_vec())
    }

    /// Blocks until a record is available or the timeout elapses.
    ///
    /// `None` timeout blocks indefinitely; a zero timeout is a
    /// non-blocking poll.
    pub fn wait_peek_record(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.inner.lock().expect("ring lock poisoned");
        loop {
            if !queue.is_empty() {
                return Some(queue.peek_record().to_vec());
            }
            match deadline {
                None => {
                    queue = self.available.wait(queue).expect("ring lock poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _timed_out) = self
                        .available
                        .wait_timeout(queue, deadline - now)
                        .expect("ring lock poisoned");
                    queue = guard;
                }
            }
        }
    }

    /// Removes the oldest record. Returns false when nothing is queued.
    pub fn dequeue(&self) -> bool {
        let mut queue = self.inner.lock().expect("ring lock poisoned");
        if queue.is_empty() {
            return false;
        }
        queue.dequeue();
        true
    }

    /// Current number of queued records.
    pub fn current_occupancy(&self) -> usize {
        self.inner.lock().expect("ring lock poisoned").current_occupancy()
    }

    /// Records callers may still enqueue.
    pub fn available_capacity(&self) -> usize {
        self.inner.lock().expect("ring lock poisoned").available_capacity()
    }

    /// Maximum occupancy ever observed.
    pub fn high_water_mark(&self) -> usize {
        self.inner.lock().expect("ring lock poisoned").high_water_mark()
    }

    /// Returns whether no record is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("ring lock poisoned").is_empty()
    }

    /// Clears all state, including the high-water mark.
    pub fn reinit(&self) {
        self.inner.lock().expect("ring lock poisoned").reinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ordering() {
        let mut ring = RingQueue::new(6, 8);
        ring.push_record(b"a").unwrap();
        ring.push_record(b"b").unwrap();
        ring.push_record(b"c").unwrap();

        assert_eq!(ring.peek_record(), b"a");
        ring.dequeue();
        assert_eq!(ring.peek_record(), b"b");
        ring.dequeue();
        assert_eq!(ring.peek_record(), b"c");
        ring.dequeue();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_capacity_invariant() {
        let mut ring = RingQueue::new(6, 8);
        assert_eq!(ring.capacity(), 4);

        for i in 0..ring.capacity() {
            assert_eq!(ring.available_capacity(), ring.capacity() - i);
            ring.push_record(&[i as u8]).unwrap();
        }
        assert_eq!(ring.available_capacity(), 0);
        assert_eq!(ring.push_record(b"x"), Err(QueueError::Full));
        assert_eq!(ring.current_occupancy(), ring.capacity());
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let mut ring = RingQueue::new(5, 8);
        for round in 0u8..20 {
            ring.push_record(&[round]).unwrap();
            ring.push_record(&[round, round]).unwrap();
            assert_eq!(ring.peek_record(), &[round]);
            ring.dequeue();
            assert_eq!(ring.peek_record(), &[round, round]);
            ring.dequeue();
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_high_water_monotonic() {
        let mut ring = RingQueue::new(8, 8);
        ring.push_record(b"1").unwrap();
        ring.push_record(b"2").unwrap();
        ring.push_record(b"3").unwrap();
        assert_eq!(ring.high_water_mark(), 3);

        ring.dequeue();
        ring.dequeue();
        assert_eq!(ring.high_water_mark(), 3);

        ring.push_record(b"4").unwrap();
        assert_eq!(ring.high_water_mark(), 3);

        ring.reinit();
        assert_eq!(ring.high_water_mark(), 0);
    }

    #[test]
    fn test_bulk_dequeue() {
        let mut ring = RingQueue::new(8, 8);
        for i in 0u8..5 {
            ring.push_record(&[i]).unwrap();
        }
        ring.dequeue_n(3);
        assert_eq!(ring.current_occupancy(), 2);
        assert_eq!(ring.peek_record(), &[3]);
    }

    #[test]
    fn test_iterator_yields_records_non_destructively() {
        let mut ring = RingQueue::new(6, 8);
        ring.push_record(b"x").unwrap();
        ring.push_record(b"y").unwrap();

        // The scan sees what the read path would, without consuming.
        let seen: Vec<Vec<u8>> = ring.iter().map(|record| record.to_vec()).collect();
        assert_eq!(seen, vec![b"x".to_vec(), b"y".to_vec()]);
        assert_eq!(ring.current_occupancy(), 2);
        assert_eq!(ring.peek_record(), b"x");
    }

    #[test]
    fn test_oversize_record_rejected() {
        let mut ring = RingQueue::new(6, 8);
        assert_eq!(ring.push_record(&[0u8; 8]), Err(QueueError::Oversize));
    }

    #[test]
    #[should_panic(expected = "dequeue on empty ring")]
    fn test_dequeue_empty_asserts() {
        let mut ring = RingQueue::new(4, 8);
        ring.dequeue();
    }

    #[test]
    #[should_panic(expected = "enqueue on full ring")]
    fn test_enqueue_full_asserts() {
        let mut ring = RingQueue::new(3, 4);
        ring.enqueue(b"a");
        ring.enqueue(b"b");
        ring.enqueue(b"c");
    }

    #[test]
    fn test_sync_blocking_consumer() {
        let ring = Arc::new(SyncRingQueue::new(6, 16));
        let consumer_ring = Arc::clone(&ring);
        let consumer = thread::spawn(move || {
            consumer_ring
                .wait_peek_record(Some(Duration::from_secs(5)))
                .expect("record should arrive")
        });

        thread::sleep(Duration::from_millis(20));
        ring.push_record(b"wakeup").unwrap();
        assert_eq!(consumer.join().unwrap(), b"wakeup");
    }

    #[test]
    fn test_sync_poll_times_out() {
        let ring = SyncRingQueue::new(6, 16);
        assert!(ring.wait_peek_record(Some(Duration::ZERO)).is_none());
        assert!(ring
            .wait_peek_record(Some(Duration::from_millis(10)))
            .is_none());
    }

    #[test]
    fn test_sync_concurrent_producers() {
        let ring = Arc::new(SyncRingQueue::new(66, 16));
        let mut producers = Vec::new();
        for _ in 0..4 {
            let ring = Arc::clone(&ring);
            producers.push(thread::spawn(move || {
                for i in 0u8..16 {
                    ring.push_record(&[i]).unwrap();
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(ring.current_occupancy(), 64);
        assert_eq!(ring.high_water_mark(), 64);
    }
}
