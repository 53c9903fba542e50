//! Zero-copy paired ring.
//!
//! `PairedBuffer` is a single `RingBuffer` whose element is the tuple
//! (mapped region, frame geometry, provenance). Each region is visible through
//! a host and an accelerator address, so a frame copied in through the host
//! view is readable by the accelerator without a second copy. With one cursor
//! pair for both views and the provenance, entry *k* of every view always
//! refers to the same physical frame.
//!
//! A popped `CapturedFrame` shares its slot's region. While any such handle is
//! alive the producer leaves that slot alone and drops incoming frames instead,
//! so a consumer never observes bytes changing underneath it.

use anyhow::{bail, Context, Result};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{CapturedFrame, RawFrame};
use crate::memory::{MappedRegion, PairedAllocator};
use crate::provenance::{Provenance, SourceId};
use crate::ring::{RingBuffer, SlotWrite};

/// One ring slot: a mapped region plus what is currently stored in it.
#[derive(Clone)]
pub struct PairedSlot {
    region: Arc<dyn MappedRegion>,
    len: usize,
    width: u32,
    height: u32,
    provenance: Provenance,
}

impl PairedSlot {
    fn new(region: Arc<dyn MappedRegion>) -> Self {
        Self {
            region,
            len: 0,
            width: 0,
            height: 0,
            provenance: Provenance::new(SourceId::default(), 0),
        }
    }

    /// Whether a `CapturedFrame` still refers to this slot's region.
    ///
    /// Only meaningful under the ring lock: new references are handed out by
    /// `pop`, which takes the same lock, so the count cannot rise concurrently.
    fn is_held(&self) -> bool {
        Arc::strong_count(&self.region) > 1
    }

    fn into_frame(self) -> CapturedFrame {
        CapturedFrame::new(
            self.region,
            self.len,
            self.width,
            self.height,
            self.provenance,
        )
    }
}

impl SlotWrite for PairedSlot {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.len() > self.region.len() {
            bail!(
                "frame of {} bytes does not fit a {} byte slot",
                bytes.len(),
                self.region.len()
            );
        }
        // SAFETY: the destination is valid for region.len() bytes and the
        // source is a distinct allocation. Writes only happen under the ring
        // lock, on the head slot (never a live entry), after `is_held` has
        // confirmed no `CapturedFrame` is reading it.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.region.host_ptr().as_ptr(),
                bytes.len(),
            );
        }
        self.len = bytes.len();
        Ok(bytes.len())
    }
}

/// What happened to a deposited frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deposit {
    Stored,
    /// Stored after evicting the oldest unread frame.
    Evicted,
    /// The write slot is still held by a `CapturedFrame`; the frame was dropped.
    SlotBusy,
}

impl Deposit {
    pub fn is_stored(&self) -> bool {
        !matches!(self, Deposit::SlotBusy)
    }
}

/// Overwrite-on-full ring of zero-copy frame slots with per-slot provenance.
pub struct PairedBuffer {
    ring: RingBuffer<PairedSlot>,
}

impl PairedBuffer {
    /// Allocate `capacity` slots of `stride` bytes each through `allocator`.
    ///
    /// Any allocation failure fails construction.
    pub fn new(capacity: usize, stride: usize, allocator: &dyn PairedAllocator) -> Result<Self> {
        let mut slots = Vec::with_capacity(capacity);
        for index in 0..capacity {
            let region = allocator.allocate_paired(stride).with_context(|| {
                format!(
                    "allocate paired slot {} of {} ({} bytes) via {} allocator",
                    index,
                    capacity,
                    stride,
                    allocator.name()
                )
            })?;
            if region.len() < stride {
                bail!(
                    "{} allocator returned {} bytes for a {} byte slot",
                    allocator.name(),
                    region.len(),
                    stride
                );
            }
            slots.push(PairedSlot::new(region));
        }
        let ring = RingBuffer::with_slots(slots, stride)?;
        log::debug!(
            "paired buffer ready: {} slots x {} bytes ({} allocator)",
            capacity,
            stride,
            allocator.name()
        );
        Ok(Self { ring })
    }

    /// Copy `frame` into the head slot together with its provenance.
    ///
    /// Evicts the oldest unread frame when the ring is full. When the head slot
    /// is still held by a consumer the frame is dropped and counted instead.
    pub fn deposit(&self, frame: &RawFrame, provenance: Provenance) -> Result<Deposit> {
        if frame.len() > self.ring.stride() {
            bail!(
                "frame of {} bytes from source {} exceeds slot size of {} bytes",
                frame.len(),
                provenance.source,
                self.ring.stride()
            );
        }
        let written = self.ring.write_with_if(
            |slot| !slot.is_held(),
            |slot| {
                slot.write_bytes(frame.data())?;
                slot.width = frame.width;
                slot.height = frame.height;
                slot.provenance = provenance;
                Ok(())
            },
        )?;
        Ok(match written {
            Some(false) => Deposit::Stored,
            Some(true) => Deposit::Evicted,
            None => Deposit::SlotBusy,
        })
    }

    /// Pop the oldest frame, or `None` when empty.
    pub fn get(&self) -> Option<CapturedFrame> {
        self.ring.get().map(PairedSlot::into_frame)
    }

    /// Pop the oldest frame, waiting up to `timeout` or until `should_stop`.
    pub fn get_timeout<F>(&self, timeout: Duration, should_stop: F) -> Option<CapturedFrame>
    where
        F: Fn() -> bool,
    {
        self.ring
            .get_timeout(timeout, should_stop)
            .map(PairedSlot::into_frame)
    }

    /// Discard every buffered frame, counting them as dropped. Used to
    /// resynchronise after a stream interruption.
    pub fn reset(&self) {
        self.ring.reset();
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Bytes per slot.
    pub fn stride(&self) -> usize {
        self.ring.stride()
    }

    /// Frames lost to overwrite-on-full, `reset`, or a held write slot.
    pub fn dropped(&self) -> u64 {
        self.ring.dropped()
    }

    pub fn wake_all(&self) {
        self.ring.wake_all();
    }
}
