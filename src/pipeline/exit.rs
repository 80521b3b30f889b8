//! Self-pipe that turns "please stop" from any thread into a pollable fd

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

/// Read end of the exit pipe, polled by the frame loop.
pub struct ExitSignal {
    read: File,
    write: Arc<File>,
}

/// Cloneable handle that makes the [`ExitSignal`] readable.
#[derive(Clone)]
pub struct ExitTrigger(Arc<File>);

impl ExitSignal {
    pub fn new() -> io::Result<Self> {
        let (read, write) = nix::unistd::pipe().map_err(io::Error::from)?;
        Ok(Self {
            read: File::from(read),
            write: Arc::new(File::from(write)),
        })
    }

    pub fn trigger(&self) -> ExitTrigger {
        ExitTrigger(Arc::clone(&self.write))
    }
}

impl AsFd for ExitSignal {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

impl ExitTrigger {
    pub fn fire(&self) -> io::Result<()> {
        let mut pipe: &File = &self.0;
        pipe.write_all(&[1])
    }
}
