pub mod card;
pub mod kms;

pub use card::{Card, Output};
pub use kms::KmsDisplay;

use crate::error::DisplayError;
use crate::pipeline::pool::{Buffer, BufferId};

/// Result of asking the display to present a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Presentation is scheduled for the next vertical blank.
    Queued,
    /// Another submission is still outstanding; nothing was done.
    Rejected,
}

/// The display half of the pipeline as seen by the frame loop.
///
/// Every method except `show_initial` must return without blocking.
pub trait DisplayEngine {
    /// Put the first front buffer on screen during setup.
    fn show_initial(&mut self, buffer: &Buffer) -> Result<(), DisplayError>;

    /// Request presentation of `buffer` on the next refresh.
    fn submit(&mut self, buffer: &Buffer) -> Result<Submission, DisplayError>;

    /// Drain completion notifications. Returns the buffer that just became the front buffer.
    fn poll_completion(&mut self) -> Result<Option<BufferId>, DisplayError>;

    /// Forget a buffer at shutdown, whatever the display was doing with it.
    fn revoke(&mut self, buffer: &Buffer);
}
