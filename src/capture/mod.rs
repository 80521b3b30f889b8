pub mod frame;
pub mod v4l2;

pub use frame::{Acquired, CapturedFrame, PixelFormat};
pub use v4l2::V4l2Capture;

use crate::error::CaptureError;
use crate::pipeline::pool::Buffer;

/// The capture half of the pipeline as seen by the frame loop.
///
/// Every method must return without blocking.
pub trait CaptureEngine {
    fn start(&mut self) -> Result<(), CaptureError>;

    fn stop(&mut self) -> Result<(), CaptureError>;

    /// Dequeues a filled buffer if the device has one.
    ///
    /// An error here means the device itself failed and is fatal for the session.
    fn acquire_frame(&mut self) -> Result<Acquired, CaptureError>;

    /// Hands a buffer back to the device for refilling.
    fn release_frame(&mut self, buffer: &Buffer) -> Result<(), CaptureError>;
}
