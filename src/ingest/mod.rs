//! Frame ingestion sources.
//!
//! This module provides the `FrameSource` seam and the sources shipped with
//! the crate:
//! - Synthetic `stub://` sources (testing, demos)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! All sources hand `RawFrame` instances to the acquisition loop, which copies
//! them into the paired ring. A source is responsible for:
//! - Opening and configuring its device
//! - Converting to the capture pixel format before handing frames over
//! - Bounding every retrieval by the supplied timeout
//! - Returning promptly once the supplied `CancelToken` is cancelled

pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::Result;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::{CameraSettings, CaptureConfig};
use crate::frame::RawFrame;

pub use synthetic::{FailurePlan, SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// One physical (or simulated) capture device.
pub trait FrameSource: Send {
    /// Device identifier for logs (serial number, device path, stub URL).
    fn name(&self) -> &str;

    /// Open and configure the device. Called once before any retrieval.
    fn open(&mut self) -> Result<()>;

    /// Retrieve the next frame, waiting at most `timeout`.
    ///
    /// Timeouts and device errors are reported as `Err`. Implementations should
    /// poll `cancel` during long waits and bail out once it is cancelled.
    fn retrieve_next(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<RawFrame>;

    /// Release the device.
    fn close(&mut self) -> Result<()>;
}

/// Build the source for one configured camera.
///
/// `stub://` devices produce synthetic frames; anything else is treated as a
/// V4L2 device path.
pub fn source_for_camera(
    camera: &CameraSettings,
    config: &CaptureConfig,
) -> Result<Box<dyn FrameSource>> {
    if camera.device.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig {
            device: camera.device.clone(),
            width: config.width,
            height: config.height,
            frame_interval: frame_interval(config.fps),
            ..SyntheticConfig::default()
        })));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(V4l2Source::new(V4l2Config {
            device: camera.device.clone(),
            target_fps: config.fps,
            width: config.width,
            height: config.height,
        })))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        anyhow::bail!(
            "camera {} ({}) requires the ingest-v4l2 feature",
            camera.device,
            camera.description
        )
    }
}

/// Build one source per configured camera, in configuration order.
pub fn sources_from_config(config: &CaptureConfig) -> Result<Vec<Box<dyn FrameSource>>> {
    config
        .cameras
        .iter()
        .map(|camera| source_for_camera(camera, config))
        .collect()
}

fn frame_interval(fps: u32) -> Option<Duration> {
    (fps > 0).then(|| Duration::from_secs(1) / fps)
}
