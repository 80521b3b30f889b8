use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::frame::PixelFormat;
use crate::display::Card;

/// Find the first streaming capture node offering `format`
pub fn auto_detect_device(format: PixelFormat) -> Result<String> {
    info!("Auto-detecting capture devices...");

    for i in 0..64 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE | Flags::STREAMING) {
            continue;
        }

        if let Ok(formats) = dev.enum_formats() {
            if formats.iter().any(|fmt| fmt.fourcc == format.fourcc()) {
                info!("Found {} device: {} - {}", format.fourcc(), path, caps.card);
                return Ok(path);
            }
            debug!("{} does not offer {}", path, format.fourcc());
        }
    }

    Err(eyre!("No capture device offering {} found", format.fourcc()))
}

/// Find the first DRM card able to export dumb buffers
pub fn auto_detect_card() -> Result<String> {
    info!("Auto-detecting DRM cards...");

    for i in 0..16 {
        let path = format!("/dev/dri/card{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        match Card::open(Path::new(&path)) {
            Ok(_) => {
                info!("Found DRM card: {}", path);
                return Ok(path);
            }
            Err(e) => debug!("Skipping {}: {}", path, e),
        }
    }

    Err(eyre!("No DRM card with dumb buffer export found"))
}
