use std::time::Duration;

use serde::{Deserialize, Serialize};
use v4l::FourCC;

/// Metadata of a dequeued capture buffer. The pixels stay in the shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Capture queue index, resolved to a pool entry by the core
    pub index: u32,
    pub sequence: u32,
    pub bytes_used: u32,
    pub timestamp: Duration,
    /// Driver flagged the frame data as possibly corrupted
    pub corrupted: bool,
}

/// Outcome of a non-blocking dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    NotReady,
    Frame(CapturedFrame),
}

/// Pixel formats that both scanout and capture agree on without conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Xrgb8888,
    Argb8888,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            // V4L2_PIX_FMT_BGR32: B, G, R, X in memory, same layout as DRM XRGB8888
            PixelFormat::Xrgb8888 => FourCC::new(b"BGR4"),
            PixelFormat::Argb8888 => FourCC::new(b"AR24"),
        }
    }

    /// Colour depth handed to the legacy ADDFB ioctl.
    pub fn depth(self) -> u32 {
        match self {
            PixelFormat::Xrgb8888 => 24,
            PixelFormat::Argb8888 => 32,
        }
    }

    pub fn bpp(self) -> u32 {
        32
    }
}
