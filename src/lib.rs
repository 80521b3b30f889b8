pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use capture::frame::PixelFormat;
use color_eyre::{eyre::eyre, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};

/// Prefix of environment overrides, e.g. `KMSCAM_CAPTURE__DEVICE=/dev/video2`
pub const ENV_PREFIX: &str = "KMSCAM";

/// Longest timeout `poll(2)` accepts
pub const MAX_STALL_TIMEOUT_MS: u64 = i32::MAX as u64;

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Empty means auto-detect
    pub device: String,
    /// 0 means the display mode's width
    pub width: u32,
    /// 0 means the display mode's height
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Empty means auto-detect
    pub card: String,
    /// Scale frames to the whole mode instead of showing them 1:1
    pub stretch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stall_timeout_ms: u64,
    /// Stop when a line arrives on stdin
    pub exit_on_stdin: bool,
    pub pin_cpu: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            format: PixelFormat::Xrgb8888,
            buffer_count: 3,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            card: "/dev/dri/card0".into(),
            stretch: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 3000,
            exit_on_stdin: true,
            pin_cpu: None,
        }
    }
}

impl PipelineConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `KMSCAM_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("kmscam").required(false),
        };

        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.buffer_count < 2 {
            return Err(eyre!(
                "capture.buffer_count must be at least 2, got {}",
                self.capture.buffer_count
            ));
        }
        if self.pipeline.stall_timeout_ms == 0 {
            return Err(eyre!("pipeline.stall_timeout_ms must be positive"));
        }
        if self.pipeline.stall_timeout_ms > MAX_STALL_TIMEOUT_MS {
            return Err(eyre!(
                "pipeline.stall_timeout_ms must be at most {}, got {}",
                MAX_STALL_TIMEOUT_MS,
                self.pipeline.stall_timeout_ms
            ));
        }
        Ok(())
    }
}

/// Frame counters of one session, mirrored to the `metrics` facade
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub captured: u64,
    pub displayed: u64,
    pub dropped: u64,
    pub submit_failures: u64,
    pub release_failures: u64,
    pub unknown_frames: u64,
}

impl PipelineStats {
    pub(crate) fn frame_captured(&mut self) {
        self.captured += 1;
        counter!("kmscam_frames_captured").increment(1);
    }

    pub(crate) fn frame_displayed(&mut self) {
        self.displayed += 1;
        counter!("kmscam_frames_displayed").increment(1);
    }

    pub(crate) fn frame_dropped(&mut self) {
        self.dropped += 1;
        counter!("kmscam_frames_dropped").increment(1);
    }

    pub(crate) fn submit_failed(&mut self) {
        self.submit_failures += 1;
        counter!("kmscam_submit_failures").increment(1);
    }

    pub(crate) fn release_failed(&mut self) {
        self.release_failures += 1;
        counter!("kmscam_release_failures").increment(1);
    }

    pub(crate) fn unknown_frame(&mut self) {
        self.unknown_frames += 1;
        counter!("kmscam_frames_unknown").increment(1);
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} captured, {} displayed, {} dropped, {} submit failures, {} release failures",
            self.captured, self.displayed, self.dropped, self.submit_failures, self.release_failures
        )?;
        if self.unknown_frames > 0 {
            write!(f, ", {} unknown frames", self.unknown_frames)?;
        }
        Ok(())
    }
}
