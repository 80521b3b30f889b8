//! Scripted stand-ins for the capture and display devices.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::capture::{Acquired, CaptureEngine, CapturedFrame};
use crate::display::{DisplayEngine, Submission};
use crate::error::{CaptureError, DisplayError, PipelineError};
use crate::pipeline::poller::{Poller, Readiness};
use crate::pipeline::pool::{Buffer, BufferId, BufferPool, PrimeHandle, SurfaceId};
use crate::pipeline::sync::SyncCore;

/// Pool of `n` registered buffers; capture indices run backwards to exercise the lookup.
pub fn pool(n: usize) -> BufferPool {
    let buffers = (0..n)
        .map(|i| {
            let mut buf = Buffer::new(BufferId(i), PrimeHandle(100 + i as i32));
            buf.surface = Some(SurfaceId(40 + i as u32));
            buf.capture_index = Some((n - 1 - i) as u32);
            buf
        })
        .collect();
    BufferPool::new(buffers).unwrap()
}

pub fn running(n: usize) -> SyncCore<FakeCapture, FakeDisplay> {
    SyncCore::start(
        pool(n),
        FakeCapture::default(),
        FakeDisplay::default(),
        Duration::from_millis(50),
    )
    .unwrap()
}

/// Appends `name` to a shared log when dropped, to observe teardown order.
pub struct DropRecorder {
    name: &'static str,
    log: Rc<RefCell<Vec<&'static str>>>,
}

impl DropRecorder {
    pub fn new(name: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> Self {
        Self {
            name,
            log: Rc::clone(log),
        }
    }
}

impl Drop for DropRecorder {
    fn drop(&mut self) {
        self.log.borrow_mut().push(self.name);
    }
}

/// Device queue model: `queued` buffers wait for data, `ready` ones can be dequeued.
#[derive(Default)]
pub struct FakeCapture {
    pub streaming: bool,
    pub fail_acquire: bool,
    pub fail_releases: usize,
    pub recorder: Option<DropRecorder>,
    queued: VecDeque<u32>,
    ready: VecDeque<u32>,
    owners: HashMap<u32, BufferId>,
    sequence: u32,
}

impl FakeCapture {
    /// The device finishes the oldest queued buffer.
    pub fn fill(&mut self) -> Option<BufferId> {
        let index = self.queued.pop_front()?;
        self.ready.push_back(index);
        self.owners.get(&index).copied()
    }

    /// Make the device report a buffer index the pool never registered.
    pub fn inject(&mut self, index: u32) {
        self.ready.push_back(index);
    }

    pub fn queued_ids(&self) -> Vec<BufferId> {
        self.queued.iter().filter_map(|i| self.owners.get(i).copied()).collect()
    }

    pub fn held_ids(&self) -> Vec<BufferId> {
        self.queued
            .iter()
            .chain(self.ready.iter())
            .filter_map(|i| self.owners.get(i).copied())
            .collect()
    }
}

impl CaptureEngine for FakeCapture {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.streaming = false;
        self.queued.clear();
        self.ready.clear();
        Ok(())
    }

    fn acquire_frame(&mut self) -> Result<Acquired, CaptureError> {
        if self.fail_acquire {
            return Err(CaptureError::io(
                "VIDIOC_DQBUF",
                io::Error::from_raw_os_error(libc::EIO),
            ));
        }
        let Some(index) = self.ready.pop_front() else {
            return Ok(Acquired::NotReady);
        };
        self.sequence += 1;
        Ok(Acquired::Frame(CapturedFrame {
            index,
            sequence: self.sequence,
            bytes_used: 640 * 480 * 4,
            timestamp: Duration::from_millis(self.sequence as u64 * 33),
            corrupted: false,
        }))
    }

    fn release_frame(&mut self, buffer: &Buffer) -> Result<(), CaptureError> {
        if self.fail_releases > 0 {
            self.fail_releases -= 1;
            return Err(CaptureError::io(
                "VIDIOC_QBUF",
                io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        let index = buffer
            .capture_index
            .ok_or(CaptureError::Unregistered(buffer.id))?;
        assert!(
            !self.queued.contains(&index) && !self.ready.contains(&index),
            "buffer {} queued twice",
            buffer.id
        );
        self.owners.insert(index, buffer.id);
        self.queued.push_back(index);
        Ok(())
    }
}

/// One flip slot; `vblank` lets the outstanding flip complete on the next poll.
#[derive(Default)]
pub struct FakeDisplay {
    pub initial: Option<BufferId>,
    pub submitted: Vec<BufferId>,
    pub revoked: Vec<BufferId>,
    pub fail_modeset: bool,
    pub fail_next_submit: bool,
    pub fail_events: bool,
    /// Completion to report regardless of what is in flight
    pub spurious: Option<BufferId>,
    pub recorder: Option<DropRecorder>,
    in_flight: Option<BufferId>,
    vblank: bool,
}

impl FakeDisplay {
    pub fn vblank(&mut self) {
        self.vblank = true;
    }
}

impl DisplayEngine for FakeDisplay {
    fn show_initial(&mut self, buffer: &Buffer) -> Result<(), DisplayError> {
        if self.fail_modeset {
            return Err(DisplayError::Modeset(io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }
        self.initial = Some(buffer.id);
        Ok(())
    }

    fn submit(&mut self, buffer: &Buffer) -> Result<Submission, DisplayError> {
        if self.in_flight.is_some() {
            return Ok(Submission::Rejected);
        }
        if std::mem::take(&mut self.fail_next_submit) {
            return Err(DisplayError::Commit(io::Error::from_raw_os_error(
                libc::EBUSY,
            )));
        }
        buffer.surface.ok_or(DisplayError::Unregistered(buffer.id))?;
        self.in_flight = Some(buffer.id);
        self.submitted.push(buffer.id);
        Ok(Submission::Queued)
    }

    fn poll_completion(&mut self) -> Result<Option<BufferId>, DisplayError> {
        if self.fail_events {
            return Err(DisplayError::Events(io::Error::from_raw_os_error(
                libc::EIO,
            )));
        }
        if let Some(id) = self.spurious.take() {
            return Ok(Some(id));
        }
        if std::mem::take(&mut self.vblank) {
            return Ok(self.in_flight.take());
        }
        Ok(None)
    }

    fn revoke(&mut self, buffer: &Buffer) {
        if self.in_flight == Some(buffer.id) {
            self.in_flight = None;
        }
        self.revoked.push(buffer.id);
    }
}

/// Replays readiness results; reports exit once the script runs out.
pub struct ScriptedPoller {
    script: VecDeque<Option<Readiness>>,
}

impl ScriptedPoller {
    pub fn new(script: Vec<Option<Readiness>>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl Poller for ScriptedPoller {
    fn wait(&mut self, _timeout: Duration) -> Result<Option<Readiness>, PipelineError> {
        Ok(self.script.pop_front().unwrap_or(Some(Readiness {
            exit: true,
            ..Readiness::default()
        })))
    }
}
