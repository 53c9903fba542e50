//! Synthetic frame source.
//!
//! `SyntheticSource` stands in for a camera on `stub://` device names. It
//! produces deterministic pattern frames at the configured size and can be
//! scripted to fail, which is how the acquisition loop's fairness is exercised
//! without hardware.
//!
//! Frame layout: byte 0 carries the source tag, the rest is a ramp offset by
//! the frame count so consecutive frames differ.

use anyhow::{anyhow, bail, Result};
use std::time::Duration;

use super::FrameSource;
use crate::cancel::CancelToken;
use crate::frame::{RawFrame, RGB_BYTES_PER_PIXEL};

/// When a synthetic source reports a failure instead of a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FailurePlan {
    Never,
    /// Every retrieval fails immediately with a device error.
    Always,
    /// Every retrieval waits out the full timeout and then fails.
    AlwaysTimeout,
    /// Every `n`th retrieval (1-based) fails immediately.
    EveryNth(u64),
    /// Each retrieval fails with the given probability.
    Random(f64),
}

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Device name (e.g., "stub://camera0").
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Simulated time until the device has a new frame.
    pub frame_interval: Option<Duration>,
    /// Value written to byte 0 of every frame.
    pub tag: u8,
    pub failure: FailurePlan,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera0".to_string(),
            width: 640,
            height: 480,
            frame_interval: None,
            tag: 0,
            failure: FailurePlan::Never,
        }
    }
}

/// Synthetic frame source for tests and demos.
pub struct SyntheticSource {
    config: SyntheticConfig,
    open: bool,
    attempts: u64,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            open: false,
            attempts: 0,
            frame_count: 0,
        }
    }

    /// Retrievals requested so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn should_fail(&self) -> bool {
        match self.config.failure {
            FailurePlan::Never => false,
            FailurePlan::Always | FailurePlan::AlwaysTimeout => true,
            FailurePlan::EveryNth(n) => n > 0 && self.attempts % n == 0,
            FailurePlan::Random(p) => rand::random::<f64>() < p,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_bytes =
            (self.config.width * self.config.height * RGB_BYTES_PER_PIXEL) as usize;
        let mut pixels = vec![0u8; pixel_bytes];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        if let Some(first) = pixels.first_mut() {
            *first = self.config.tag;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn open(&mut self) -> Result<()> {
        if self.config.width == 0 || self.config.height == 0 {
            bail!(
                "{}: frame size {}x{} is empty",
                self.config.device,
                self.config.width,
                self.config.height
            );
        }
        self.open = true;
        log::info!(
            "SyntheticSource: opened {} ({}x{})",
            self.config.device,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn retrieve_next(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<RawFrame> {
        if !self.open {
            bail!("{}: source is not open", self.config.device);
        }
        self.attempts += 1;

        if self.config.failure == FailurePlan::AlwaysTimeout {
            if cancel.wait_timeout(timeout) {
                bail!("{}: retrieval cancelled", self.config.device);
            }
            bail!("{}: no frame within {:?}", self.config.device, timeout);
        }
        if self.should_fail() {
            return Err(anyhow!(
                "{}: simulated device error on attempt {}",
                self.config.device,
                self.attempts
            ));
        }

        if let Some(interval) = self.config.frame_interval {
            let wait = interval.min(timeout);
            if cancel.wait_timeout(wait) {
                bail!("{}: retrieval cancelled", self.config.device);
            }
            if interval > timeout {
                bail!("{}: no frame within {:?}", self.config.device, timeout);
            }
        }

        self.frame_count += 1;
        Ok(RawFrame::new(
            self.generate_pixels(),
            self.config.width,
            self.config.height,
        ))
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            log::info!(
                "SyntheticSource: closed {} after {} frames",
                self.config.device,
                self.frame_count
            );
        }
        self.open = false;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn small_config() -> SyntheticConfig {
        SyntheticConfig {
            device: "stub://test".to_string(),
            width: 4,
            height: 2,
            tag: 7,
            ..SyntheticConfig::default()
        }
    }

    #[test]
    fn produces_tagged_frames_of_configured_size() -> Result<()> {
        let mut source = SyntheticSource::new(small_config());
        source.open()?;

        let frame = source.retrieve_next(Duration::from_millis(100), &CancelToken::new())?;
        assert_eq!(frame.width, 4);
        assert_eq!(frame.height, 2);
        assert_eq!(frame.len(), 4 * 2 * 3);
        assert_eq!(frame.data()[0], 7);
        Ok(())
    }

    #[test]
    fn consecutive_frames_differ() -> Result<()> {
        let mut source = SyntheticSource::new(small_config());
        source.open()?;
        let cancel = CancelToken::new();

        let first = source.retrieve_next(Duration::from_millis(100), &cancel)?;
        let second = source.retrieve_next(Duration::from_millis(100), &cancel)?;
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn retrieval_requires_open() {
        let mut source = SyntheticSource::new(small_config());
        assert!(source
            .retrieve_next(Duration::from_millis(10), &CancelToken::new())
            .is_err());
    }

    #[test]
    fn every_nth_plan_fails_on_schedule() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig {
            failure: FailurePlan::EveryNth(3),
            ..small_config()
        });
        source.open()?;
        let cancel = CancelToken::new();

        let outcomes: Vec<bool> = (0..6)
            .map(|_| source.retrieve_next(Duration::from_millis(10), &cancel).is_ok())
            .collect();
        assert_eq!(outcomes, vec![true, true, false, true, true, false]);
        assert_eq!(source.attempts(), 6);
        assert_eq!(source.frames_captured(), 4);
        Ok(())
    }

    #[test]
    fn random_plan_honours_probability_bounds() -> Result<()> {
        let cancel = CancelToken::new();
        let mut reliable = SyntheticSource::new(SyntheticConfig {
            failure: FailurePlan::Random(0.0),
            ..small_config()
        });
        let mut broken = SyntheticSource::new(SyntheticConfig {
            failure: FailurePlan::Random(1.0),
            ..small_config()
        });
        reliable.open()?;
        broken.open()?;

        for _ in 0..50 {
            assert!(reliable.retrieve_next(Duration::from_millis(10), &cancel).is_ok());
            assert!(broken.retrieve_next(Duration::from_millis(10), &cancel).is_err());
        }
        assert_eq!(reliable.frames_captured(), 50);
        assert_eq!(broken.frames_captured(), 0);
        assert_eq!(broken.attempts(), 50);
        Ok(())
    }

    #[test]
    fn timeout_plan_is_cut_short_by_cancel() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig {
            failure: FailurePlan::AlwaysTimeout,
            ..small_config()
        });
        source.open()?;
        let cancel = CancelToken::new();
        cancel.cancel();

        let started = Instant::now();
        let err = source
            .retrieve_next(Duration::from_secs(30), &cancel)
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn slow_device_times_out() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig {
            frame_interval: Some(Duration::from_millis(200)),
            ..small_config()
        });
        source.open()?;

        let err = source
            .retrieve_next(Duration::from_millis(10), &CancelToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("no frame within"));
        Ok(())
    }
}
