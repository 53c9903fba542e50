use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::frame::RGB_BYTES_PER_PIXEL;
use crate::ring::MIN_CAPACITY;

const DEFAULT_CAMERA: &str = "stub://camera0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 10;
const DEFAULT_BUFFER_DEPTH: usize = 16;
const DEFAULT_RETRIEVE_TIMEOUT_MS: u64 = 100;
const DEFAULT_BYTES_PER_PIXEL: u32 = RGB_BYTES_PER_PIXEL;
const DEFAULT_DESCRIPTION: &str = "no description";

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    cameras: Option<CamerasConfigFile>,
    buffer: Option<BufferConfigFile>,
    acquisition: Option<AcquisitionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CamerasConfigFile {
    devices: Option<Vec<CameraEntryFile>>,
    image_width: Option<u32>,
    image_height: Option<u32>,
    fps: Option<u32>,
    bytes_per_pixel: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CameraEntryFile {
    Device(String),
    Detailed {
        device: String,
        description: Option<String>,
    },
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AcquisitionConfigFile {
    retrieve_timeout_ms: Option<u64>,
    pace: Option<bool>,
}

/// One attached capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    /// Serial number, device path, or `stub://` name.
    pub device: String,
    pub description: String,
}

impl CameraSettings {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            description: DEFAULT_DESCRIPTION.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub cameras: Vec<CameraSettings>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bytes_per_pixel: u32,
    /// Ring slot count; `buffer_depth - 1` frames can be held at once.
    pub buffer_depth: usize,
    pub retrieve_timeout: Duration,
    /// Pace acquisition cycles to the configured frame rate.
    pub pace: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            cameras: vec![CameraSettings::new(DEFAULT_CAMERA)],
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            bytes_per_pixel: DEFAULT_BYTES_PER_PIXEL,
            buffer_depth: DEFAULT_BUFFER_DEPTH,
            retrieve_timeout: Duration::from_millis(DEFAULT_RETRIEVE_TIMEOUT_MS),
            pace: false,
        }
    }
}

impl CaptureConfig {
    /// Load from `$CAPTURE_CONFIG` (JSON, or TOML for `.toml` paths), apply
    /// environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAPTURE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Self {
        let defaults = Self::default();
        let cameras = file.cameras.unwrap_or_default();
        let buffer = file.buffer.unwrap_or_default();
        let acquisition = file.acquisition.unwrap_or_default();

        let devices = cameras
            .devices
            .map(|entries| entries.into_iter().map(CameraSettings::from).collect())
            .unwrap_or(defaults.cameras);

        Self {
            cameras: devices,
            width: cameras.image_width.unwrap_or(defaults.width),
            height: cameras.image_height.unwrap_or(defaults.height),
            fps: cameras.fps.unwrap_or(defaults.fps),
            bytes_per_pixel: cameras.bytes_per_pixel.unwrap_or(defaults.bytes_per_pixel),
            buffer_depth: buffer.depth.unwrap_or(defaults.buffer_depth),
            retrieve_timeout: acquisition
                .retrieve_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retrieve_timeout),
            pace: acquisition.pace.unwrap_or(defaults.pace),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(cameras) = std::env::var("CAPTURE_CAMERAS") {
            let parsed = split_csv(&cameras);
            if !parsed.is_empty() {
                self.cameras = parsed.into_iter().map(CameraSettings::new).collect();
            }
        }
        if let Ok(depth) = std::env::var("CAPTURE_BUFFER_DEPTH") {
            self.buffer_depth = depth
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAPTURE_BUFFER_DEPTH must be an integer slot count"))?;
        }
        if let Ok(fps) = std::env::var("CAPTURE_FPS") {
            self.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAPTURE_FPS must be an integer frame rate"))?;
        }
        if let Ok(timeout) = std::env::var("CAPTURE_RETRIEVE_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("CAPTURE_RETRIEVE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.retrieve_timeout = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            bail!("at least one camera must be configured");
        }
        if let Some(blank) = self.cameras.iter().position(|c| c.device.trim().is_empty()) {
            bail!("camera {} has an empty device identifier", blank);
        }
        if self.buffer_depth < MIN_CAPACITY {
            bail!(
                "buffer depth must be at least {} slots (got {})",
                MIN_CAPACITY,
                self.buffer_depth
            );
        }
        if self.width == 0 || self.height == 0 || self.bytes_per_pixel == 0 {
            bail!(
                "frame geometry must be non-zero (got {}x{} at {} bytes per pixel)",
                self.width,
                self.height,
                self.bytes_per_pixel
            );
        }
        // Sources hand over packed RGB8; any other slot size would reject
        // (or pad) every frame.
        if self.bytes_per_pixel != RGB_BYTES_PER_PIXEL {
            bail!(
                "bytes per pixel must be {} for packed RGB capture (got {})",
                RGB_BYTES_PER_PIXEL,
                self.bytes_per_pixel
            );
        }
        if self.retrieve_timeout.is_zero() {
            bail!("retrieve timeout must be greater than zero");
        }
        Ok(())
    }

    /// Bytes needed for one frame slot.
    pub fn frame_bytes(&self) -> Result<usize> {
        self.width
            .checked_mul(self.height)
            .and_then(|pixels| pixels.checked_mul(self.bytes_per_pixel))
            .map(|bytes| bytes as usize)
            .ok_or_else(|| {
                anyhow!(
                    "frame size overflows: {}x{} at {} bytes per pixel",
                    self.width,
                    self.height,
                    self.bytes_per_pixel
                )
            })
    }
}

impl From<CameraEntryFile> for CameraSettings {
    fn from(entry: CameraEntryFile) -> Self {
        match entry {
            CameraEntryFile::Device(device) => CameraSettings::new(device),
            CameraEntryFile::Detailed {
                device,
                description,
            } => Self {
                device,
                description: description.unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            },
        }
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
