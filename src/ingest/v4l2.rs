//! V4L2 frame source.
//!
//! This module provides `V4l2Source` for capturing from local V4L2 devices
//! (e.g., USB3 industrial cameras exposed through uvcvideo).
//!
//! The V4L2 source is responsible for:
//! - Opening the device node and requesting packed RGB at the configured size,
//!   refusing to open when the driver settles on anything else
//! - Requesting the configured frame rate
//! - Streaming through mmap buffers with a bounded dequeue wait
//! - Producing `RawFrame` instances

use anyhow::{bail, Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::cancel::CancelToken;
use crate::frame::RawFrame;

/// Number of mmap buffers queued with the driver.
const STREAM_BUFFERS: u32 = 4;

/// V4L2 fourcc of packed 24-bit RGB.
const RGB3: [u8; 4] = *b"RGB3";

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Requested frame rate. Zero leaves the driver default.
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

#[self_referencing]
struct V4l2Stream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// V4L2 frame source.
pub struct V4l2Source {
    config: V4l2Config,
    state: Option<V4l2Stream>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    active_width: u32,
    active_height: u32,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    /// Time since the last successful retrieval.
    pub fn since_last_frame(&self) -> Option<Duration> {
        self.last_frame_at.map(|at| at.elapsed())
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(&RGB3);

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        check_negotiated(&self.config, format.width, format.height, format.fourcc.repr)?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = V4l2StreamTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: opened {} ({}x{})",
            self.config.device,
            self.active_width,
            self.active_height
        );
        Ok(())
    }

    fn retrieve_next(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<RawFrame> {
        use v4l::io::traits::CaptureStream;

        if cancel.is_cancelled() {
            bail!("{}: retrieval cancelled", self.config.device);
        }
        let state = self
            .state
            .as_mut()
            .with_context(|| format!("{}: device not open", self.config.device))?;
        let data = state.with_stream_mut(|stream| {
            stream.set_timeout(timeout);
            stream.next().map(|(buf, _meta)| buf.to_vec())
        });
        let data = data.with_context(|| format!("capture frame from {}", self.config.device))?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(RawFrame::new(data, self.active_width, self.active_height))
    }

    fn close(&mut self) -> Result<()> {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Source: closed {} after {} frames",
                self.config.device,
                self.frame_count
            );
        }
        Ok(())
    }
}

/// Frames are copied into slots sized from the configured geometry, so any
/// other negotiated mode would be rejected on every retrieval.
fn check_negotiated(config: &V4l2Config, width: u32, height: u32, fourcc: [u8; 4]) -> Result<()> {
    if fourcc != RGB3 {
        bail!(
            "{}: device does not deliver packed RGB (got {})",
            config.device,
            String::from_utf8_lossy(&fourcc)
        );
    }
    if width != config.width || height != config.height {
        bail!(
            "{}: device settled on {}x{} instead of the configured {}x{}",
            config.device,
            width,
            height,
            config.width,
            config.height
        );
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
