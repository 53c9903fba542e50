//! capture_rig - multi-camera capture daemon
//!
//! This daemon:
//! 1. Loads the camera configuration (file + environment)
//! 2. Opens every camera and allocates the capture ring
//! 3. Pulls frames until Ctrl-C or the frame limit, logging their provenance
//! 4. Reports per-camera acquisition statistics periodically

use anyhow::Result;
use clap::Parser;
use std::time::{Duration, Instant};

use multicam_capture::{
    ingest::sources_from_config, CancelToken, Capture, CaptureConfig, CaptureSettings,
    HostAllocator, SourceId,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "capture_rig",
    about = "Round-robin multi-camera capture into a zero-copy ring"
)]
struct Args {
    /// Stop after this many frames (0 runs until Ctrl-C).
    #[arg(long, env = "CAPTURE_FRAMES", default_value_t = 0)]
    frames: u64,

    /// How long one wait for a frame may take before it is logged as idle.
    #[arg(long, env = "CAPTURE_WAIT_MS", default_value_t = 1000)]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = CaptureConfig::load()?;
    for (index, camera) in config.cameras.iter().enumerate() {
        log::info!("camera {}: {} ({})", index, camera.device, camera.description);
    }
    let settings = CaptureSettings::from_config(&config)?;
    let sources = sources_from_config(&config)?;
    let capture = Capture::new(settings, sources, &HostAllocator::new())?;

    let shutdown = CancelToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.cancel())
            .map_err(|e| anyhow::anyhow!("error setting Ctrl-C handler: {}", e))?;
    }
    log::info!("capture_rig running. waiting for frames (Ctrl-C to stop)...");

    let wait = Duration::from_millis(args.timeout_ms.max(1));
    let mut received = 0u64;
    let mut last_report = Instant::now();
    while !shutdown.is_cancelled() && (args.frames == 0 || received < args.frames) {
        match capture.capture_timeout(wait, Some(&shutdown))? {
            Some(frame) => {
                received += 1;
                log::debug!(
                    "frame {} from camera {}: {}x{} host={:p} accel={}",
                    frame.provenance().sequence,
                    frame.source(),
                    frame.width(),
                    frame.height(),
                    frame.host_ptr(),
                    frame.accel_ptr()
                );
            }
            None if !shutdown.is_cancelled() => {
                log::warn!("no frame within {:?}", wait);
            }
            None => {}
        }

        if last_report.elapsed() >= STATS_INTERVAL {
            report(&capture, received);
            last_report = Instant::now();
        }
    }

    log::info!("shutdown requested, closing cameras...");
    report(&capture, received);
    capture.close();
    Ok(())
}

fn report(capture: &Capture, received: u64) {
    let stats = capture.stats();
    log::info!(
        "received {} frames over {} cycles; {} buffered, {} dropped",
        received,
        stats.cycles(),
        capture.buffered(),
        capture.dropped_frames()
    );
    for (index, source) in stats.per_source().iter().enumerate() {
        log::info!(
            "camera {}: {} attempts, {} frames, {} failures",
            SourceId(index),
            source.attempts,
            source.successes,
            source.failures
        );
    }
}
