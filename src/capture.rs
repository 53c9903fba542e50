//! Capture session.
//!
//! `Capture` ties the pieces together: it opens the sources, allocates the
//! paired ring, runs the acquisition loop on first use, and hands buffered
//! frames to any number of consumer threads. Consumers block on the ring's
//! condition variable; nothing spins.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::acquire::{AcquisitionConfig, AcquisitionLoop, Acquirer, LoopState, LoopStats};
use crate::cancel::CancelToken;
use crate::config::CaptureConfig;
use crate::frame::CapturedFrame;
use crate::ingest::FrameSource;
use crate::memory::PairedAllocator;
use crate::paired::PairedBuffer;

/// Sizing and timing for one capture session.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Ring slot count.
    pub depth: usize,
    /// Bytes reserved per slot.
    pub frame_bytes: usize,
    pub acquisition: AcquisitionConfig,
}

impl CaptureSettings {
    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        let acquisition = if config.pace {
            AcquisitionConfig::paced(config.retrieve_timeout, config.fps, config.cameras.len())
        } else {
            AcquisitionConfig {
                retrieve_timeout: config.retrieve_timeout,
                min_cycle_interval: None,
            }
        };
        Ok(Self {
            depth: config.buffer_depth,
            frame_bytes: config.frame_bytes()?,
            acquisition,
        })
    }
}

/// A running multi-camera capture session.
pub struct Capture {
    buffer: Arc<PairedBuffer>,
    acquisition: Mutex<AcquisitionLoop>,
    stats: Arc<LoopStats>,
    closed: CancelToken,
}

impl Capture {
    /// Open every source and allocate the ring.
    ///
    /// Any open or allocation failure is fatal; sources opened before the
    /// failure are closed again.
    pub fn new(
        settings: CaptureSettings,
        mut sources: Vec<Box<dyn FrameSource>>,
        allocator: &dyn PairedAllocator,
    ) -> Result<Self> {
        if sources.is_empty() {
            bail!("capture needs at least one frame source");
        }
        let buffer = Arc::new(
            PairedBuffer::new(settings.depth, settings.frame_bytes, allocator)
                .context("allocate capture ring")?,
        );

        let failure = sources
            .iter_mut()
            .enumerate()
            .find_map(|(index, source)| {
                source
                    .open()
                    .err()
                    .map(|err| (index, source.name().to_string(), err))
            });
        if let Some((index, name, err)) = failure {
            close_sources(&mut sources[..index]);
            return Err(err.context(format!("open source {} ({})", index, name)));
        }

        let acquirer = Acquirer::new(sources, buffer.clone(), settings.acquisition)?;
        let acquisition = AcquisitionLoop::new(acquirer);
        log::info!(
            "capture session ready: {} slots of {} bytes from {} allocator",
            buffer.capacity(),
            buffer.stride(),
            allocator.name()
        );
        Ok(Self {
            stats: acquisition.stats(),
            buffer,
            acquisition: Mutex::new(acquisition),
            closed: CancelToken::new(),
        })
    }

    fn acquisition(&self) -> MutexGuard<'_, AcquisitionLoop> {
        self.acquisition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_started(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            bail!("capture session is closed");
        }
        let mut acquisition = self.acquisition();
        if acquisition.state() == LoopState::Idle {
            acquisition.start()?;
        }
        Ok(())
    }

    /// Block until a frame is available.
    pub fn capture(&self) -> Result<CapturedFrame> {
        self.capture_timeout(Duration::MAX, None)?
            .ok_or_else(|| anyhow!("capture session closed while waiting for a frame"))
    }

    /// Wait up to `timeout` for a frame.
    ///
    /// Returns `Ok(None)` on timeout or once `cancel` fires, and an error if
    /// the session is (or becomes) closed.
    pub fn capture_timeout(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<CapturedFrame>> {
        self.ensure_started()?;
        let frame = self.buffer.get_timeout(timeout, || {
            self.closed.is_cancelled() || cancel.is_some_and(CancelToken::is_cancelled)
        });
        if frame.is_none() && self.closed.is_cancelled() {
            bail!("capture session is closed");
        }
        Ok(frame)
    }

    /// Stop acquisition and close every source. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.buffer.wake_all();

        let mut sources = match self.acquisition().stop() {
            Ok(sources) => sources,
            Err(err) => {
                log::error!("capture shutdown: {}", err);
                Vec::new()
            }
        };
        close_sources(&mut sources);
        log::info!(
            "capture session closed after {} cycles ({} frames dropped)",
            self.stats.cycles(),
            self.buffer.dropped()
        );
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        self.stats.clone()
    }

    /// Frames evicted unread because the ring was full.
    pub fn dropped_frames(&self) -> u64 {
        self.buffer.dropped()
    }

    /// Frames currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_running(&self) -> bool {
        self.acquisition().state() == LoopState::Running
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_sources(sources: &mut [Box<dyn FrameSource>]) {
    for source in sources.iter_mut() {
        if let Err(err) = source.close() {
            log::warn!("failed to close source {}: {:#}", source.name(), err);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;
    use crate::ingest::{FailurePlan, SyntheticConfig, SyntheticSource};
    use crate::memory::HostAllocator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> CaptureSettings {
        CaptureSettings {
            depth: 8,
            frame_bytes: 4 * 2 * 3,
            acquisition: AcquisitionConfig {
                retrieve_timeout: Duration::from_millis(20),
                min_cycle_interval: None,
            },
        }
    }

    fn synthetic(tag: u8, failure: FailurePlan) -> Box<dyn FrameSource> {
        Box::new(SyntheticSource::new(SyntheticConfig {
            device: format!("stub://cam{}", tag),
            width: 4,
            height: 2,
            tag,
            failure,
            ..SyntheticConfig::default()
        }))
    }

    /// Source whose device cannot be opened.
    struct Broken;

    impl FrameSource for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn open(&mut self) -> Result<()> {
            bail!("device unplugged")
        }

        fn retrieve_next(&mut self, _: Duration, _: &CancelToken) -> Result<RawFrame> {
            bail!("not open")
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn loop_starts_on_first_capture() -> Result<()> {
        let capture = Capture::new(
            settings(),
            vec![synthetic(0, FailurePlan::Never)],
            &HostAllocator::new(),
        )?;
        assert!(!capture.is_running());

        let frame = capture.capture()?;
        assert!(capture.is_running());
        assert_eq!(frame.len(), 24);
        assert_eq!(frame.source().0, 0);
        Ok(())
    }

    /// Source that only counts lifecycle calls.
    #[derive(Default)]
    struct Tracked {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl FrameSource for Tracked {
        fn name(&self) -> &str {
            "tracked"
        }

        fn open(&mut self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn retrieve_next(&mut self, _: Duration, _: &CancelToken) -> Result<RawFrame> {
            bail!("no frames")
        }

        fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn open_failure_closes_earlier_sources_only() {
        let before = Tracked::default();
        let after = Tracked::default();
        let (before_opens, before_closes) = (before.opens.clone(), before.closes.clone());
        let (after_opens, after_closes) = (after.opens.clone(), after.closes.clone());

        let sources: Vec<Box<dyn FrameSource>> =
            vec![Box::new(before), Box::new(Broken), Box::new(after)];
        let err = Capture::new(settings(), sources, &HostAllocator::new())
        .err()
        .expect("open failure must abort construction");

        assert!(format!("{:#}", err).contains("open source 1 (broken)"));
        assert_eq!(before_opens.load(Ordering::SeqCst), 1);
        assert_eq!(before_closes.load(Ordering::SeqCst), 1);
        assert_eq!(after_opens.load(Ordering::SeqCst), 0);
        assert_eq!(after_closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn open_failure_is_fatal() {
        let err = Capture::new(
            settings(),
            vec![
                synthetic(0, FailurePlan::Never),
                Box::new(Broken),
            ],
            &HostAllocator::new(),
        )
        .err()
        .expect("open failure must abort construction");
        assert!(format!("{:#}", err).contains("device unplugged"));
    }

    #[test]
    fn allocation_failure_is_fatal() {
        let result = Capture::new(
            settings(),
            vec![synthetic(0, FailurePlan::Never)],
            &HostAllocator::with_limit(64),
        );
        assert!(result.is_err());
    }

    #[test]
    fn empty_source_list_is_rejected() {
        assert!(Capture::new(settings(), Vec::new(), &HostAllocator::new()).is_err());
    }

    #[test]
    fn capture_timeout_returns_none_when_nothing_arrives() -> Result<()> {
        let capture = Capture::new(
            settings(),
            vec![synthetic(0, FailurePlan::Always)],
            &HostAllocator::new(),
        )?;
        let frame = capture.capture_timeout(Duration::from_millis(50), None)?;
        assert!(frame.is_none());
        assert!(capture.stats().cycles() > 0);
        Ok(())
    }

    #[test]
    fn caller_cancel_ends_the_wait() -> Result<()> {
        let capture = Capture::new(
            settings(),
            vec![synthetic(0, FailurePlan::AlwaysTimeout)],
            &HostAllocator::new(),
        )?;
        let cancel = CancelToken::new();
        cancel.cancel();
        let frame = capture.capture_timeout(Duration::from_secs(30), Some(&cancel))?;
        assert!(frame.is_none());
        Ok(())
    }

    #[test]
    fn capture_after_close_is_an_error() -> Result<()> {
        let capture = Capture::new(
            settings(),
            vec![synthetic(0, FailurePlan::Never)],
            &HostAllocator::new(),
        )?;
        capture.capture()?;
        capture.close();
        capture.close();
        assert!(!capture.is_running());
        assert!(capture.capture().is_err());
        Ok(())
    }

    #[test]
    fn close_wakes_blocked_consumer() -> Result<()> {
        let capture = Arc::new(Capture::new(
            settings(),
            vec![synthetic(0, FailurePlan::Always)],
            &HostAllocator::new(),
        )?);
        let waiter = {
            let capture = capture.clone();
            std::thread::spawn(move || capture.capture())
        };
        std::thread::sleep(Duration::from_millis(50));
        capture.close();
        let result = waiter.join().expect("consumer thread");
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn settings_follow_config() -> Result<()> {
        let config = CaptureConfig {
            pace: true,
            ..CaptureConfig::default()
        };
        let settings = CaptureSettings::from_config(&config)?;
        assert_eq!(settings.depth, 16);
        assert_eq!(settings.frame_bytes, 640 * 480 * 3);
        assert_eq!(
            settings.acquisition.min_cycle_interval,
            Some(Duration::from_millis(100))
        );
        Ok(())
    }
}
