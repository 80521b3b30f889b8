//! Atomic KMS presentation of dmabuf-backed dumb buffers

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use drm::buffer::{Buffer as _, DrmFourcc};
use drm::control::atomic::AtomicModeReq;
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{crtc, framebuffer, property, AtomicCommitFlags, Device as ControlDevice, Event};
use tracing::{debug, info, instrument, warn};

use crate::{
    capture::PixelFormat,
    display::{Card, DisplayEngine, Output, Submission},
    error::DisplayError,
    pipeline::pool::{Buffer, BufferId, PrimeHandle, SurfaceId},
    DisplayConfig,
};

/// Rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Source and destination rectangles for a frame of `frame` size on a `mode` sized output.
pub fn placement(frame: (u32, u32), mode: (u32, u32), stretch: bool) -> (Rect, Rect) {
    if stretch {
        let src = Rect { x: 0, y: 0, w: frame.0, h: frame.1 };
        let dst = Rect { x: 0, y: 0, w: mode.0, h: mode.1 };
        return (src, dst);
    }
    // 1:1, cropped to what the mode can show
    let visible = Rect {
        x: 0,
        y: 0,
        w: frame.0.min(mode.0),
        h: frame.1.min(mode.1),
    };
    (visible, visible)
}

struct Surface {
    dumb: Option<DumbBuffer>,
    fb: framebuffer::Handle,
    prime: OwnedFd,
}

pub struct KmsDisplay {
    card: Card,
    output: Output,
    stretch: bool,
    src: Rect,
    dst: Rect,
    pitch: Option<u32>,
    surfaces: Vec<Surface>,
    saved_crtc: Option<crtc::Info>,
    in_flight: Option<BufferId>,
}

impl KmsDisplay {
    pub fn open(config: &DisplayConfig) -> Result<Self> {
        info!("Initializing KMS display: {}", config.card);

        let card = Card::open(Path::new(&config.card))?;
        let output = Output::discover(&card)?;

        Ok(Self {
            card,
            output,
            stretch: config.stretch,
            src: Rect::default(),
            dst: Rect::default(),
            pitch: None,
            surfaces: Vec::new(),
            saved_crtc: None,
            in_flight: None,
        })
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    /// Pitch shared by all allocated buffers.
    pub fn pitch(&self) -> Option<u32> {
        self.pitch
    }

    /// Allocate `count` scanout buffers that can hold a `width`x`height` frame and export them.
    ///
    /// Buffers are at least as large as the mode so the initial modeset can scan them out.
    pub fn allocate(
        &mut self,
        count: usize,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Vec<Buffer>> {
        if !self.surfaces.is_empty() {
            return Err(eyre!("display buffers already allocated"));
        }

        let mode = self.output.size();
        let alloc = (width.max(mode.0), height.max(mode.1));
        let fourcc = match format {
            PixelFormat::Xrgb8888 => DrmFourcc::Xrgb8888,
            PixelFormat::Argb8888 => DrmFourcc::Argb8888,
        };

        let mut buffers = Vec::with_capacity(count);
        for i in 0..count {
            let dumb = self
                .card
                .create_dumb_buffer(alloc, fourcc, format.bpp())
                .map_err(|e| eyre!("DRM_IOCTL_MODE_CREATE_DUMB failed: {}", e))?;
            // Not in `surfaces` yet, so failures below clean up by hand
            let fb = match self.card.add_framebuffer(&dumb, format.depth(), format.bpp()) {
                Ok(fb) => fb,
                Err(e) => {
                    let _ = self.card.destroy_dumb_buffer(dumb);
                    return Err(eyre!("adding framebuffer failed: {}", e));
                }
            };
            let pitch = dumb.pitch();
            let prime = match self
                .card
                .buffer_to_prime_fd(dumb.handle(), (libc::O_CLOEXEC | libc::O_RDWR) as u32)
            {
                Ok(fd) => fd,
                Err(e) => {
                    let _ = self.card.destroy_framebuffer(fb);
                    let _ = self.card.destroy_dumb_buffer(dumb);
                    return Err(eyre!("could not export the dumb buffer: {}", e));
                }
            };
            debug!("DRM buffer {} exported as fd={}", i, prime.as_raw_fd());

            let mut buffer = Buffer::new(BufferId(i), PrimeHandle(prime.as_raw_fd()));
            buffer.surface = Some(SurfaceId(fb.into()));
            buffers.push(buffer);

            self.pitch = Some(pitch);
            self.surfaces.push(Surface {
                dumb: Some(dumb),
                fb,
                prime,
            });
        }

        let (src, dst) = placement((width, height), mode, self.stretch);
        self.src = src;
        self.dst = dst;
        info!(
            "DRM: {} buffers of {}x{}, pitch {} bytes, src {:?} dst {:?}",
            count,
            alloc.0,
            alloc.1,
            self.pitch.unwrap_or_default(),
            src,
            dst
        );
        Ok(buffers)
    }

    fn framebuffer(&self, buffer: &Buffer) -> Result<framebuffer::Handle, DisplayError> {
        buffer.surface.ok_or(DisplayError::Unregistered(buffer.id))?;
        self.surfaces
            .get(buffer.id.0)
            .map(|s| s.fb)
            .ok_or(DisplayError::Unregistered(buffer.id))
    }

    /// One request carrying every plane property, so no partial state reaches the screen.
    fn flip_request(&self, fb: framebuffer::Handle) -> AtomicModeReq {
        let plane = self.output.plane;
        let props = &self.output.props;
        let (src, dst) = (self.src, self.dst);

        let mut req = AtomicModeReq::new();
        req.add_property(plane, props.fb_id, property::Value::Framebuffer(Some(fb)));
        req.add_property(plane, props.crtc_id, property::Value::CRTC(Some(self.output.crtc)));
        // SRC_* are 16.16 fixed point
        req.add_property(plane, props.src_x, property::Value::UnsignedRange((src.x as u64) << 16));
        req.add_property(plane, props.src_y, property::Value::UnsignedRange((src.y as u64) << 16));
        req.add_property(plane, props.src_w, property::Value::UnsignedRange((src.w as u64) << 16));
        req.add_property(plane, props.src_h, property::Value::UnsignedRange((src.h as u64) << 16));
        req.add_property(plane, props.crtc_x, property::Value::SignedRange(dst.x as i64));
        req.add_property(plane, props.crtc_y, property::Value::SignedRange(dst.y as i64));
        req.add_property(plane, props.crtc_w, property::Value::UnsignedRange(dst.w as u64));
        req.add_property(plane, props.crtc_h, property::Value::UnsignedRange(dst.h as u64));
        req
    }
}

impl DisplayEngine for KmsDisplay {
    fn show_initial(&mut self, buffer: &Buffer) -> Result<(), DisplayError> {
        let fb = self.framebuffer(buffer)?;
        let crtc = self.output.crtc;

        // Must store crtc data to give the screen back on exit
        self.saved_crtc = self.card.get_crtc(crtc).ok();
        self.card
            .set_crtc(crtc, Some(fb), (0, 0), &[self.output.connector], Some(self.output.mode))
            .map_err(DisplayError::Modeset)?;
        info!("Buffer {} is the initial front buffer", buffer.id);
        Ok(())
    }

    #[instrument(level = "trace", skip(self, buffer), fields(buffer = %buffer.id))]
    fn submit(&mut self, buffer: &Buffer) -> Result<Submission, DisplayError> {
        if self.in_flight.is_some() {
            return Ok(Submission::Rejected);
        }

        let fb = self.framebuffer(buffer)?;
        let req = self.flip_request(fb);
        self.card
            .atomic_commit(
                AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK,
                req,
            )
            .map_err(DisplayError::Commit)?;

        self.in_flight = Some(buffer.id);
        Ok(Submission::Queued)
    }

    fn poll_completion(&mut self) -> Result<Option<BufferId>, DisplayError> {
        let events = self.card.receive_events().map_err(DisplayError::Events)?;

        let mut completed = None;
        for event in events {
            match event {
                Event::PageFlip(flip) if flip.crtc == self.output.crtc => {
                    match self.in_flight.take() {
                        Some(id) => {
                            debug!("Buffer rendered: {} at frame {}", id, flip.frame);
                            completed = Some(id);
                        }
                        None => debug!("Page flip without a submission, frame {}", flip.frame),
                    }
                }
                _ => {}
            }
        }
        Ok(completed)
    }

    fn revoke(&mut self, buffer: &Buffer) {
        if self.in_flight == Some(buffer.id) {
            warn!("Abandoning in-flight flip of buffer {}", buffer.id);
            self.in_flight = None;
        }
    }
}

impl AsFd for KmsDisplay {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }
}

impl Drop for KmsDisplay {
    fn drop(&mut self) {
        if let Some(saved) = self.saved_crtc.take() {
            if let Err(e) = self.card.set_crtc(
                saved.handle(),
                saved.framebuffer(),
                saved.position(),
                &[self.output.connector],
                saved.mode(),
            ) {
                warn!("Failed to restore crtc: {}", e);
            }
        }

        for surface in self.surfaces.drain(..) {
            if let Err(e) = self.card.destroy_framebuffer(surface.fb) {
                warn!("Failed to remove framebuffer: {}", e);
            }
            if let Some(dumb) = surface.dumb {
                if let Err(e) = self.card.destroy_dumb_buffer(dumb) {
                    warn!("Failed to destroy dumb buffer: {}", e);
                }
            }
            drop(surface.prime);
        }
        info!("Display released");
    }
}
