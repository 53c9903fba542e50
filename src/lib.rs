//! Multi-camera frame capture
//!
//! This crate pulls frames from several cameras in round-robin order on a
//! background thread and buffers them in a fixed-size ring of paired
//! host/accelerator memory regions, so a consumer can hand frames to an
//! accelerator without copying them again.
//!
//! # Architecture
//!
//! The capture path holds a few properties by construction:
//!
//! 1. **Overwrite on full**: the producer never blocks; when the ring is full
//!    the oldest unread frame is evicted and counted.
//! 2. **Aligned provenance**: every buffered frame carries the index of the
//!    source that produced it in the same ring slot, so the two can never
//!    drift apart.
//! 3. **Fair scheduling**: the source index advances every cycle whether the
//!    retrieval succeeded or not.
//! 4. **Bounded waits**: device retrievals take a timeout and a cancel token;
//!    consumers block on a condition variable instead of spinning.
//!
//! # Module Structure
//!
//! - `ring`: Generic overwrite-on-full ring (RingBuffer)
//! - `memory`: Paired host/accelerator regions (PairedAllocator, HostAllocator)
//! - `paired`: Ring of paired regions plus per-slot metadata (PairedBuffer)
//! - `provenance`: Source identity of buffered frames
//! - `ingest`: Frame sources (synthetic, V4L2)
//! - `acquire`: Round-robin acquisition loop
//! - `capture`: Session facade (Capture)
//! - `config`: File and environment configuration

pub mod acquire;
pub mod cancel;
pub mod capture;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod memory;
pub mod paired;
pub mod provenance;
pub mod ring;

pub use acquire::{
    AcquisitionConfig, AcquisitionLoop, Acquirer, CycleOutcome, LoopState, LoopStats,
    RoundRobin, SourceStats,
};
pub use cancel::CancelToken;
pub use capture::{Capture, CaptureSettings};
pub use config::{CameraSettings, CaptureConfig};
pub use frame::{CapturedFrame, RawFrame, RGB_BYTES_PER_PIXEL};
pub use ingest::{FailurePlan, FrameSource, SyntheticConfig, SyntheticSource};
pub use memory::{AccelPtr, HostAllocator, MappedRegion, PairedAllocator};
pub use paired::{Deposit, PairedBuffer};
pub use provenance::{drain_sources, Provenance, SourceId};
pub use ring::{RingBuffer, SlotWrite, MIN_CAPACITY};
