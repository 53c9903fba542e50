//! Frame containers.
//!
//! - `RawFrame`: owned bytes handed over by a `FrameSource`.
//! - `CapturedFrame`: what the capture facade returns; a handle to a
//!   zero-copy ring slot plus the provenance of the frame stored there.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::memory::{AccelPtr, MappedRegion};
use crate::provenance::{Provenance, SourceId};

/// Bytes per pixel of the capture format (packed RGB8) every source delivers.
pub const RGB_BYTES_PER_PIXEL: u32 = 3;

// ----------------------------------------------------------------------------
// RawFrame: source output
// ----------------------------------------------------------------------------

/// One frame as retrieved from a device, already in the capture pixel format.
#[derive(Clone, PartialEq, Eq)]
pub struct RawFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// Pixel payloads are large; keep them out of logs.
impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("len", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// CapturedFrame: consumer view of a ring slot
// ----------------------------------------------------------------------------

/// A buffered frame popped from the paired ring.
///
/// Holds a reference to the slot's backing region. While this handle (or any
/// clone of it) is alive the producer will not write into the slot, so the
/// bytes stay valid and unchanged. Holding frames for long stalls the ring:
/// deposits that reach a held slot are dropped.
#[derive(Clone)]
pub struct CapturedFrame {
    region: Arc<dyn MappedRegion>,
    len: usize,
    width: u32,
    height: u32,
    provenance: Provenance,
}

impl CapturedFrame {
    pub(crate) fn new(
        region: Arc<dyn MappedRegion>,
        len: usize,
        width: u32,
        height: u32,
        provenance: Provenance,
    ) -> Self {
        Self {
            region,
            len,
            width,
            height,
            provenance,
        }
    }

    /// Host address of the frame bytes.
    pub fn host_ptr(&self) -> NonNull<u8> {
        self.region.host_ptr()
    }

    /// Accelerator address of the same bytes.
    pub fn accel_ptr(&self) -> AccelPtr {
        self.region.accel_ptr()
    }

    /// Number of valid frame bytes in the slot.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Index of the source that produced this frame.
    pub fn source(&self) -> SourceId {
        self.provenance.source
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Borrow the frame bytes through the host view.
    pub fn host_bytes(&self) -> &[u8] {
        // SAFETY: `MappedRegion` guarantees the host range is valid and
        // initialised, `len` never exceeds the region, and the producer skips
        // slots whose region is still shared with a handle like this one.
        unsafe { std::slice::from_raw_parts(self.region.host_ptr().as_ptr(), self.len) }
    }

    /// Copy the frame bytes out of the slot.
    pub fn to_vec(&self) -> Vec<u8> {
        self.host_bytes().to_vec()
    }
}

impl fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("source", &self.provenance.source)
            .field("sequence", &self.provenance.sequence)
            .field("host", &self.host_ptr())
            .field("accel", &self.accel_ptr())
            .field("len", &self.len)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}
