//! Bounded overwrite-on-full ring buffer.
//!
//! `RingBuffer<T>` is a fixed-capacity circular buffer over opaque items:
//! - One slot is always kept open so `head == tail` means empty and
//!   `head + 1 == tail` (mod capacity) means full. A ring of capacity `C`
//!   therefore holds at most `C - 1` live entries.
//! - Writes never block. When a write would make the ring look empty again,
//!   the oldest unread entry is evicted and counted in `dropped()`.
//! - Reads never block unless the caller asks for it with `get_timeout`, which
//!   parks on a condition variable signaled by every write.
//!
//! Each operation holds the internal lock only for the cursor update and the
//! slot access.

use anyhow::{anyhow, bail, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Smallest capacity that can distinguish empty from full.
pub const MIN_CAPACITY: usize = 2;

/// Upper bound on a single condition-variable park in `get_timeout`, so stop
/// predicates that cannot signal the ring are still observed.
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// Slot storage that can be populated in place from a byte slice.
pub trait SlotWrite {
    /// Copy `bytes` into the slot, returning the number of bytes written.
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize>;
}

impl SlotWrite for Vec<u8> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        // Slots are reserved at construction, so this stays within capacity.
        self.clear();
        self.extend_from_slice(bytes);
        Ok(bytes.len())
    }
}

struct RingState<T> {
    slots: Vec<T>,
    head: usize,
    tail: usize,
    dropped: u64,
}

impl<T> RingState<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        (self.head + 1) % self.capacity() == self.tail
    }

    fn len(&self) -> usize {
        (self.head + self.capacity() - self.tail) % self.capacity()
    }

    /// Advance `head`, evicting the oldest entry when the ring wraps onto it.
    fn advance_head(&mut self) -> bool {
        self.head = (self.head + 1) % self.capacity();
        if self.head == self.tail {
            self.tail = (self.tail + 1) % self.capacity();
            self.dropped += 1;
            return true;
        }
        false
    }
}

impl<T: Clone> RingState<T> {
    fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.slots[self.tail].clone();
        self.tail = (self.tail + 1) % self.capacity();
        Some(item)
    }
}

/// Fixed-capacity circular buffer with overwrite-on-full semantics.
pub struct RingBuffer<T> {
    state: Mutex<RingState<T>>,
    ready: Condvar,
    capacity: usize,
    stride: usize,
}

impl<T: Default> RingBuffer<T> {
    /// Create a ring of `capacity` default-initialised slots of `stride` bytes.
    pub fn new(capacity: usize, stride: usize) -> Result<Self> {
        validate_capacity(capacity)?;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|e| anyhow!("failed to allocate {} ring slots: {}", capacity, e))?;
        slots.resize_with(capacity, T::default);
        Self::with_slots(slots, stride)
    }
}

impl RingBuffer<Vec<u8>> {
    /// Create a ring whose slots each own `stride` bytes of reserved storage.
    pub fn with_byte_slots(capacity: usize, stride: usize) -> Result<Self> {
        validate_capacity(capacity)?;
        let mut slots = Vec::with_capacity(capacity);
        for index in 0..capacity {
            let mut slot = Vec::new();
            slot.try_reserve_exact(stride).map_err(|e| {
                anyhow!(
                    "failed to allocate ring slot {} ({} bytes): {}",
                    index,
                    stride,
                    e
                )
            })?;
            slots.push(slot);
        }
        Self::with_slots(slots, stride)
    }
}

impl<T> RingBuffer<T> {
    /// Create a ring over externally backed slots.
    pub fn with_slots(slots: Vec<T>, stride: usize) -> Result<Self> {
        let capacity = slots.len();
        validate_capacity(capacity)?;
        Ok(Self {
            state: Mutex::new(RingState {
                slots,
                head: 0,
                tail: 0,
                dropped: 0,
            }),
            ready: Condvar::new(),
            capacity,
            stride,
        })
    }

    // Every update leaves the cursors consistent, so a poisoned lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, RingState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `item` at the head. Returns `true` when the oldest entry was evicted.
    pub fn put(&self, item: T) -> bool {
        let evicted = {
            let mut state = self.lock();
            let head = state.head;
            state.slots[head] = item;
            state.advance_head()
        };
        self.ready.notify_one();
        evicted
    }

    /// Populate the head slot in place, then advance.
    ///
    /// The head slot is never a live entry, so `fill` cannot clobber unread data.
    /// If `fill` fails the cursors are left untouched.
    pub fn write_with<F>(&self, fill: F) -> Result<bool>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        Ok(self.write_with_if(|_| true, fill)?.unwrap_or(false))
    }

    /// Like `write_with`, but only when `writable` accepts the head slot.
    ///
    /// A refused write leaves the cursors and slot untouched, counts the item
    /// as dropped, and returns `Ok(None)`. Otherwise returns whether the oldest
    /// entry was evicted.
    pub fn write_with_if<W, F>(&self, writable: W, fill: F) -> Result<Option<bool>>
    where
        W: FnOnce(&T) -> bool,
        F: FnOnce(&mut T) -> Result<()>,
    {
        let evicted = {
            let mut state = self.lock();
            let head = state.head;
            if !writable(&state.slots[head]) {
                state.dropped += 1;
                return Ok(None);
            }
            fill(&mut state.slots[head])?;
            state.advance_head()
        };
        self.ready.notify_one();
        Ok(Some(evicted))
    }

    /// Discard every unread entry by moving `tail` up to `head`.
    pub fn reset(&self) {
        let mut state = self.lock();
        let discarded = state.len() as u64;
        state.dropped += discarded;
        state.tail = state.head;
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().is_full()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Maximum number of live entries (`capacity - 1`).
    pub fn usable(&self) -> usize {
        self.capacity - 1
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Entries lost to overwrite-on-full, `reset`, or a refused write.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Wake every thread parked in `get_timeout` so it re-checks its stop predicate.
    pub fn wake_all(&self) {
        self.ready.notify_all();
    }
}

impl<T: SlotWrite> RingBuffer<T> {
    /// Byte-copy `bytes` into the head slot and advance.
    ///
    /// Fails without advancing when `bytes` does not fit in one slot.
    pub fn copy(&self, bytes: &[u8]) -> Result<bool> {
        if bytes.len() > self.stride {
            bail!(
                "item of {} bytes exceeds ring stride of {} bytes",
                bytes.len(),
                self.stride
            );
        }
        self.write_with(|slot| slot.write_bytes(bytes).map(|_| ()))
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Pop the oldest entry, or `None` when empty. Never blocks.
    pub fn get(&self) -> Option<T> {
        self.lock().pop()
    }

    /// Pop the oldest entry, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or as soon as `should_stop` reports `true`.
    /// `Duration::MAX` waits until an entry arrives or `should_stop` fires.
    pub fn get_timeout<F>(&self, timeout: Duration, should_stop: F) -> Option<T>
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if let Some(item) = state.pop() {
                return Some(item);
            }
            if should_stop() {
                return None;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            state = self
                .ready
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity < MIN_CAPACITY {
        bail!(
            "ring capacity must be at least {} (got {})",
            MIN_CAPACITY,
            capacity
        );
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn drain<T: Clone>(ring: &RingBuffer<T>) -> Vec<T> {
        std::iter::from_fn(|| ring.get()).collect()
    }

    #[test]
    fn rejects_capacity_below_two() {
        assert!(RingBuffer::<u32>::new(0, 1).is_err());
        assert!(RingBuffer::<u32>::new(1, 1).is_err());
        assert!(RingBuffer::<u32>::new(2, 1).is_ok());
        assert!(RingBuffer::with_byte_slots(1, 64).is_err());
    }

    #[test]
    fn empty_ring_returns_none() {
        let ring = RingBuffer::<u32>::new(4, 1).unwrap();
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn partial_fill_is_fifo() {
        let ring = RingBuffer::<u32>::new(8, 1).unwrap();
        for item in 1..=5 {
            assert!(!ring.put(item));
        }
        assert!(!ring.is_empty());
        assert_eq!(ring.len(), 5);
        assert_eq!(drain(&ring), vec![1, 2, 3, 4, 5]);
        assert!(ring.is_empty());
    }

    #[test]
    fn full_at_capacity_minus_one() {
        let ring = RingBuffer::<u32>::new(4, 1).unwrap();
        ring.put(1);
        ring.put(2);
        assert!(!ring.is_full());
        ring.put(3);
        assert!(ring.is_full());
        assert_eq!(ring.len(), ring.usable());

        ring.get();
        assert!(!ring.is_full());
    }

    #[test]
    fn overwrite_evicts_oldest_entry() {
        let ring = RingBuffer::<char>::new(4, 1).unwrap();
        assert!(!ring.put('A'));
        assert!(!ring.put('B'));
        assert!(!ring.put('C'));
        assert!(ring.put('D'));

        assert_eq!(ring.dropped(), 1);
        assert_eq!(drain(&ring), vec!['B', 'C', 'D']);
        assert!(ring.is_empty());
    }

    #[test]
    fn sustained_overwrite_keeps_latest_entries() {
        let ring = RingBuffer::<u32>::new(5, 1).unwrap();
        for item in 0..100 {
            ring.put(item);
        }
        assert_eq!(ring.dropped(), 96);
        assert_eq!(drain(&ring), vec![96, 97, 98, 99]);
    }

    #[test]
    fn copy_writes_bytes_in_place() -> Result<()> {
        let ring = RingBuffer::with_byte_slots(3, 4)?;
        ring.copy(b"abcd")?;
        ring.copy(b"xy")?;

        assert_eq!(ring.get().as_deref(), Some(&b"abcd"[..]));
        assert_eq!(ring.get().as_deref(), Some(&b"xy"[..]));
        Ok(())
    }

    #[test]
    fn oversized_copy_is_rejected_without_advancing() -> Result<()> {
        let ring = RingBuffer::with_byte_slots(3, 4)?;
        assert!(ring.copy(b"too long").is_err());
        assert!(ring.is_empty());
        assert_eq!(ring.dropped(), 0);
        Ok(())
    }

    #[test]
    fn copy_evicts_like_put() -> Result<()> {
        let ring = RingBuffer::with_byte_slots(2, 1)?;
        assert!(!ring.copy(b"a")?);
        assert!(ring.copy(b"b")?);
        assert_eq!(drain(&ring), vec![b"b".to_vec()]);
        Ok(())
    }

    #[test]
    fn failed_fill_leaves_ring_untouched() {
        let ring = RingBuffer::<u32>::new(3, 1).unwrap();
        ring.put(7);
        let result = ring.write_with(|_| Err(anyhow!("device gone")));
        assert!(result.is_err());
        assert_eq!(drain(&ring), vec![7]);
    }

    #[test]
    fn refused_write_counts_a_drop_and_keeps_cursors() -> Result<()> {
        let ring = RingBuffer::<u32>::new(3, 1).unwrap();
        ring.put(1);

        let written = ring.write_with_if(
            |_| false,
            |slot| {
                *slot = 2;
                Ok(())
            },
        )?;
        assert_eq!(written, None);
        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.len(), 1);

        let written = ring.write_with_if(
            |_| true,
            |slot| {
                *slot = 3;
                Ok(())
            },
        )?;
        assert_eq!(written, Some(false));
        assert_eq!(drain(&ring), vec![1, 3]);
        Ok(())
    }

    #[test]
    fn reset_discards_unread_entries() {
        let ring = RingBuffer::<u32>::new(8, 1).unwrap();
        ring.put(1);
        ring.put(2);
        ring.put(3);
        ring.reset();

        assert!(ring.is_empty());
        assert_eq!(ring.dropped(), 3);

        ring.put(4);
        assert_eq!(drain(&ring), vec![4]);
    }

    #[test]
    fn get_timeout_expires_on_empty_ring() {
        let ring = RingBuffer::<u32>::new(4, 1).unwrap();
        let started = Instant::now();
        assert_eq!(ring.get_timeout(Duration::from_millis(30), || false), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn get_timeout_wakes_on_put() {
        let ring = Arc::new(RingBuffer::<u32>::new(4, 1).unwrap());
        let producer = ring.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.put(42);
        });

        assert_eq!(ring.get_timeout(Duration::from_secs(10), || false), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn get_timeout_honours_stop_predicate() {
        let ring = RingBuffer::<u32>::new(4, 1).unwrap();
        let started = Instant::now();
        assert_eq!(ring.get_timeout(Duration::MAX, || true), None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn concurrent_producer_and_consumer_preserve_order() {
        let ring = Arc::new(RingBuffer::<u64>::new(64, 8).unwrap());
        let producer = ring.clone();
        let handle = std::thread::spawn(move || {
            for item in 0..10_000u64 {
                producer.put(item);
            }
        });

        let mut seen = Vec::new();
        while seen.last() != Some(&9_999) {
            if let Some(item) = ring.get_timeout(Duration::from_secs(5), || false) {
                seen.push(item);
            } else {
                break;
            }
        }
        handle.join().unwrap();

        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(seen.len() as u64 + ring.dropped(), 10_000);
    }
}
