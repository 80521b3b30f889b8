//! Readiness multiplexing over the three event sources of the frame loop

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::PipelineError;

/// Which sources woke the loop. An empty value is a spurious wakeup (EINTR).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub exit: bool,
    pub capture: bool,
    pub display: bool,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.exit || self.capture || self.display
    }
}

pub trait Poller {
    /// Block until a source is ready or `timeout` passes; `Ok(None)` means the timeout passed.
    fn wait(&mut self, timeout: Duration) -> Result<Option<Readiness>, PipelineError>;
}

/// `poll(2)` over duplicates of the exit, capture and display descriptors.
pub struct FdPoller {
    exit: OwnedFd,
    capture: OwnedFd,
    display: OwnedFd,
}

impl FdPoller {
    pub fn new(exit: &impl AsFd, capture: &impl AsFd, display: &impl AsFd) -> io::Result<Self> {
        Ok(Self {
            exit: exit.as_fd().try_clone_to_owned()?,
            capture: capture.as_fd().try_clone_to_owned()?,
            display: display.as_fd().try_clone_to_owned()?,
        })
    }
}

impl Poller for FdPoller {
    fn wait(&mut self, timeout: Duration) -> Result<Option<Readiness>, PipelineError> {
        let mut fds = [
            PollFd::new(self.exit.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.capture.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.display.as_fd(), PollFlags::POLLIN),
        ];
        let timeout = PollTimeout::try_from(timeout).map_err(|e| {
            PipelineError::EventSource(io::Error::new(io::ErrorKind::InvalidInput, e))
        })?;

        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Some(Readiness::default())),
            Err(e) => return Err(PipelineError::EventSource(e.into())),
        }

        let revents: Vec<PollFlags> = fds
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        if revents.iter().any(|r| r.contains(PollFlags::POLLNVAL)) {
            return Err(PipelineError::EventSource(io::Error::from_raw_os_error(
                libc::EBADF,
            )));
        }

        // POLLERR on the capture node only means its queue is empty right now
        if revents[1].contains(PollFlags::POLLHUP) {
            return Err(hangup("capture"));
        }
        if revents[2].intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
            return Err(hangup("display"));
        }

        Ok(Some(Readiness {
            exit: revents[0].intersects(PollFlags::POLLIN | PollFlags::POLLHUP),
            capture: revents[1].contains(PollFlags::POLLIN),
            display: revents[2].contains(PollFlags::POLLIN),
        }))
    }
}

fn hangup(source: &str) -> PipelineError {
    PipelineError::EventSource(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("{} device hung up", source),
    ))
}
