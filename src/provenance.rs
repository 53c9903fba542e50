//! Frame provenance.
//!
//! Every buffered frame carries a `Provenance` recording which source produced
//! it. The record lives in the same ring slot as the frame views, so one
//! `put`/`get` moves frame data and provenance together and the two can never
//! fall out of step.

use std::fmt;
use std::time::Instant;

use crate::paired::PairedBuffer;

/// Index of a frame source in the attached source list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub usize);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where and when a buffered frame came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Provenance {
    pub source: SourceId,
    /// Monotonic deposit number across all sources; gaps mark evicted frames.
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Provenance {
    pub fn new(source: SourceId, sequence: u64) -> Self {
        Self {
            source,
            sequence,
            captured_at: Instant::now(),
        }
    }
}

/// Drain every buffered frame and return the source of each, oldest first.
pub fn drain_sources(buffer: &PairedBuffer) -> Vec<SourceId> {
    std::iter::from_fn(|| buffer.get())
        .map(|frame| frame.source())
        .collect()
}
