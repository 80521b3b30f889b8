//! V4L2 capture importing DMA-BUF buffers exported by the display

use std::io;
use std::mem;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::os::raw::c_void;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::format::{Colorspace, FieldOrder};
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, Format};

use crate::{
    capture::{Acquired, CaptureEngine, CapturedFrame, PixelFormat},
    error::CaptureError,
    pipeline::pool::{Buffer, BufferId, BufferPool},
    CaptureConfig,
};

const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;

/// Streaming capture device whose queue is backed by imported DMA-BUFs.
pub struct V4l2Capture {
    device: Device,
    fd: RawFd,
    buffer_count: u32,
    streaming: bool,
}

impl V4l2Capture {
    /// Open the capture node and verify it can stream.
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        info!("Initializing V4L2 capture: {}", config.device);

        // v4l opens the node with O_NONBLOCK, so DQBUF reports EAGAIN instead of waiting
        let device = Device::with_path(&config.device)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(eyre!("{} doesn't support video capture", config.device));
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(eyre!("{} doesn't support streaming I/O", config.device));
        }

        let fd = device.handle().fd();
        Ok(Self {
            device,
            fd,
            buffer_count: 0,
            streaming: false,
        })
    }

    /// Negotiate resolution and pixel format. `stride` is a hint the driver may ignore.
    pub fn negotiate(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: Option<u32>,
    ) -> Result<Format> {
        let mut fmt = self.device.format()?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = format.fourcc();
        fmt.field_order = FieldOrder::Progressive;
        fmt.colorspace = Colorspace::SRGB;
        if let Some(stride) = stride {
            fmt.stride = stride;
        }

        let actual = self.device.set_format(&fmt)?;
        if actual.fourcc != format.fourcc() {
            return Err(eyre!(
                "Device picked {} instead of {}",
                actual.fourcc,
                format.fourcc()
            ));
        }

        info!(
            "V4L2 negotiated format: size = {}x{}, pitch = {} bytes",
            actual.width, actual.height, actual.stride
        );
        Ok(actual)
    }

    /// Request one DMABUF slot per pool entry and record the queue indices in the pool.
    pub fn import(&mut self, pool: &mut BufferPool) -> Result<()> {
        let wanted = u32::try_from(pool.len())?;

        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = wanted;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::DmaBuf as u32;

        xioctl(self.fd, vidioc::VIDIOC_REQBUFS, &mut req).map_err(|e| {
            if e.raw_os_error() == Some(libc::EINVAL) {
                eyre!("Capture device does not support dmabuf")
            } else {
                eyre!("VIDIOC_REQBUFS failed: {}", e)
            }
        })?;
        self.buffer_count = req.count;

        if req.count < 2 {
            return Err(eyre!("Insufficient buffer memory"));
        }
        if req.count != wanted {
            return Err(eyre!(
                "Capture device granted {} buffers, pool holds {}",
                req.count,
                wanted
            ));
        }

        for i in 0..req.count {
            let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
            buf.type_ = Type::VideoCapture as u32;
            buf.memory = Memory::DmaBuf as u32;
            buf.index = i;

            xioctl(self.fd, vidioc::VIDIOC_QUERYBUF, &mut buf)
                .map_err(|e| eyre!("VIDIOC_QUERYBUF {} failed: {}", i, e))?;
            pool.register_capture(BufferId(i as usize), buf.index)?;
        }

        info!("Capture queue imports {} dmabuf buffers", req.count);
        Ok(())
    }

    fn stream_ioctl(&self, request: vidioc::_IOC_TYPE, op: &'static str) -> Result<(), CaptureError> {
        let mut typ = Type::VideoCapture as u32;
        xioctl(self.fd, request, &mut typ).map_err(|e| CaptureError::io(op, e))
    }
}

impl CaptureEngine for V4l2Capture {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.stream_ioctl(vidioc::VIDIOC_STREAMON, "VIDIOC_STREAMON")?;
        self.streaming = true;
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.streaming {
            return Ok(());
        }
        self.stream_ioctl(vidioc::VIDIOC_STREAMOFF, "VIDIOC_STREAMOFF")?;
        self.streaming = false;
        info!("Capture stream stopped");
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    fn acquire_frame(&mut self) -> Result<Acquired, CaptureError> {
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::DmaBuf as u32;

        match xioctl(self.fd, vidioc::VIDIOC_DQBUF, &mut buf) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Ok(Acquired::NotReady),
            Err(e) => return Err(CaptureError::io("VIDIOC_DQBUF", e)),
        }

        let timestamp = Duration::from_secs(buf.timestamp.tv_sec as u64)
            + Duration::from_micros(buf.timestamp.tv_usec as u64);

        Ok(Acquired::Frame(CapturedFrame {
            index: buf.index,
            sequence: buf.sequence,
            bytes_used: buf.bytesused,
            timestamp,
            corrupted: buf.flags & V4L2_BUF_FLAG_ERROR != 0,
        }))
    }

    fn release_frame(&mut self, buffer: &Buffer) -> Result<(), CaptureError> {
        let index = buffer
            .capture_index
            .ok_or(CaptureError::Unregistered(buffer.id))?;

        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::DmaBuf as u32;
        buf.index = index;
        buf.m.fd = buffer.prime.raw();

        xioctl(self.fd, vidioc::VIDIOC_QBUF, &mut buf)
            .map_err(|e| CaptureError::io("VIDIOC_QBUF", e))?;
        debug!("Queued buffer {} at capture index {}", buffer.id, index);
        Ok(())
    }
}

impl AsFd for V4l2Capture {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // The descriptor lives as long as `device`
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl Drop for V4l2Capture {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop capture stream: {}", e);
        }
        if self.buffer_count == 0 {
            return;
        }

        // Drop the queue's references to the imported dmabufs
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = 0;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::DmaBuf as u32;
        if let Err(e) = xioctl(self.fd, vidioc::VIDIOC_REQBUFS, &mut req) {
            warn!("Failed to free capture queue: {}", e);
        }
    }
}

fn xioctl<T>(fd: RawFd, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: `arg` is the exact struct the request expects
        let res = unsafe { v4l2::ioctl(fd, request, arg as *mut T as *mut c_void) };
        match res {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
