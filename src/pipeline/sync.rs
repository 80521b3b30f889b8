//! Ownership state machine and frame loop.
//!
//! Buffers move `Free → CaptureOwned → DisplayPending → DisplayOwned →
//! CaptureOwned`. At most one buffer is ever `DisplayPending`; a frame that
//! arrives while one is in flight goes straight back to the capture device.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::{
    capture::{Acquired, CaptureEngine},
    display::{DisplayEngine, Submission},
    error::PipelineError,
    pipeline::poller::{Poller, Readiness},
    pipeline::pool::{BufferId, BufferPool, Ownership},
    PipelineStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Everything handed back by [`SyncCore::shutdown`].
///
/// Drop `capture` before `display`: the capture queue still references the
/// display's dmabufs until it is released.
pub struct Teardown<C, D> {
    pub pool: BufferPool,
    pub capture: C,
    pub display: D,
    /// Buffer that was still waiting for its flip when the loop ended
    pub abandoned: Option<BufferId>,
    /// Every buffer with the role it had before being revoked
    pub revoked: Vec<(BufferId, Ownership)>,
    pub stats: PipelineStats,
}

pub struct SyncCore<C, D> {
    pool: BufferPool,
    capture: C,
    display: D,
    front: BufferId,
    pending: Option<BufferId>,
    stall_timeout: Duration,
    stats: PipelineStats,
}

impl<C: CaptureEngine, D: DisplayEngine> SyncCore<C, D> {
    /// Put buffer 0 on screen, queue the rest for capture and start streaming.
    pub fn start(
        pool: BufferPool,
        capture: C,
        display: D,
        stall_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let mut core = Self {
            pool,
            capture,
            display,
            front: BufferId(0),
            pending: None,
            stall_timeout,
            stats: PipelineStats::default(),
        };
        if let Err(e) = core.prime() {
            // Capture still references the display's dmabufs
            drop(core.capture);
            drop(core.display);
            return Err(e);
        }
        Ok(core)
    }

    fn prime(&mut self) -> Result<(), PipelineError> {
        let front = self.front;
        self.display.show_initial(self.pool.get(front)?)?;
        self.pool
            .transition(front, Ownership::Free, Ownership::DisplayOwned)?;

        let rest: Vec<BufferId> = self.pool.ids().filter(|&id| id != front).collect();
        for id in rest {
            self.capture.release_frame(self.pool.get(id)?)?;
            self.pool
                .transition(id, Ownership::Free, Ownership::CaptureOwned)?;
        }
        self.capture.start()?;
        Ok(())
    }

    pub fn front(&self) -> BufferId {
        self.front
    }

    pub fn pending(&self) -> Option<BufferId> {
        self.pending
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    #[cfg(test)]
    pub(crate) fn capture_mut(&mut self) -> &mut C {
        &mut self.capture
    }

    #[cfg(test)]
    pub(crate) fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    /// Wait for events and handle them until the user asks to stop or something fatal happens.
    pub fn run<P: Poller>(&mut self, poller: &mut P) -> Result<(), PipelineError> {
        loop {
            let ready = match poller.wait(self.stall_timeout)? {
                Some(ready) => ready,
                None => {
                    let timeout_ms = self.stall_timeout.as_millis() as u64;
                    error!("timeout in poll after {}ms", timeout_ms);
                    return Err(PipelineError::Stall { timeout_ms });
                }
            };

            if !ready.any() {
                debug!("Interrupted wakeup");
            }
            if self.step(ready)? == Flow::Exit {
                return Ok(());
            }
        }
    }

    /// Handle one wakeup: exit first, then completions, then captures.
    ///
    /// Completions go before captures so a slot freed by a flip admits the
    /// frame captured in the same wakeup.
    pub fn step(&mut self, ready: Readiness) -> Result<Flow, PipelineError> {
        if ready.exit {
            info!("User requested exit");
            return Ok(Flow::Exit);
        }
        // Buffers the device refused last time get one more try per wakeup
        self.retry_stranded();
        if ready.display {
            self.on_completion()?;
        }
        if ready.capture {
            self.on_capture_ready()?;
        }

        debug_assert_eq!(self.pool.check(self.front, self.pending), Ok(()));
        Ok(Flow::Continue)
    }

    fn on_completion(&mut self) -> Result<(), PipelineError> {
        let Some(done) = self.display.poll_completion()? else {
            return Ok(());
        };
        if self.pending != Some(done) {
            warn!(
                "Completion for buffer {} but {:?} is pending, ignoring",
                done, self.pending
            );
            return Ok(());
        }

        // Back-buffer is now front-buffer, and the former front-buffer can go to capture
        let stale = self.front;
        self.pool
            .transition(done, Ownership::DisplayPending, Ownership::DisplayOwned)?;
        self.pool
            .transition(stale, Ownership::DisplayOwned, Ownership::CaptureOwned)?;
        self.front = done;
        self.pending = None;
        self.stats.frame_displayed();
        debug!("Buffer {} on screen, {} back to capture", done, stale);

        self.release(stale);
        Ok(())
    }

    fn on_capture_ready(&mut self) -> Result<(), PipelineError> {
        let frame = match self.capture.acquire_frame()? {
            Acquired::NotReady => return Ok(()),
            Acquired::Frame(frame) => frame,
        };

        let Some(id) = self.pool.by_capture_index(frame.index) else {
            error!("Buffer captured index={}, not found!", frame.index);
            self.stats.unknown_frame();
            return Ok(());
        };
        self.stats.frame_captured();
        debug!(
            "Buffer captured: {}, index={}, seq={}, {} bytes, t={:?}",
            id, frame.index, frame.sequence, frame.bytes_used, frame.timestamp
        );
        if frame.corrupted {
            debug!("Driver flagged frame {} as corrupted", frame.sequence);
        }

        let owner = self.pool.get(id)?.owner();
        if owner != Ownership::CaptureOwned {
            warn!("Capture handed back buffer {} which is {}", id, owner);
            return Ok(());
        }

        if let Some(pending) = self.pending {
            // Display busy: no queue, the newest frame goes straight back to capture
            debug!("Display busy with {}, dropping captured frame", pending);
            self.drop_frame(id);
            return Ok(());
        }
        self.admit(id)
    }

    fn admit(&mut self, id: BufferId) -> Result<(), PipelineError> {
        let submitted = self.display.submit(self.pool.get(id)?);
        match submitted {
            Ok(Submission::Queued) => {
                self.pool
                    .transition(id, Ownership::CaptureOwned, Ownership::DisplayPending)?;
                self.pending = Some(id);
            }
            Ok(Submission::Rejected) => {
                warn!("Display rejected buffer {} with nothing pending", id);
                self.drop_frame(id);
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("Failed to submit buffer {}: {}", id, e);
                self.stats.submit_failed();
                self.release(id);
            }
        }
        Ok(())
    }

    fn drop_frame(&mut self, id: BufferId) {
        self.stats.frame_dropped();
        self.release(id);
    }

    /// Hand a `CaptureOwned` buffer to the device; on failure keep it and retry later.
    fn release(&mut self, id: BufferId) {
        let Ok(buffer) = self.pool.get(id) else {
            return;
        };
        let stranded = match self.capture.release_frame(buffer) {
            Ok(()) => false,
            Err(e) => {
                warn!("Failed to return buffer {} to capture: {}", id, e);
                self.stats.release_failed();
                true
            }
        };
        if let Err(e) = self.pool.mark_stranded(id, stranded) {
            warn!("{}", e);
        }
    }

    fn retry_stranded(&mut self) {
        for id in self.pool.stranded() {
            debug!("Retrying release of buffer {}", id);
            self.release(id);
        }
    }

    /// Stop capture and revoke every buffer according to its last owner.
    ///
    /// An outstanding flip is not waited for.
    pub fn shutdown(mut self) -> Teardown<C, D> {
        if let Err(e) = self.capture.stop() {
            warn!("Failed to stop capture: {}", e);
        }

        let abandoned = self.pending.take();
        if let Some(id) = abandoned {
            warn!("Buffer {} still pending on display at shutdown", id);
        }

        let ids: Vec<BufferId> = self.pool.ids().collect();
        let mut revoked = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(buffer) = self.pool.get(id) else {
                continue;
            };
            match buffer.owner() {
                Ownership::DisplayPending | Ownership::DisplayOwned => self.display.revoke(buffer),
                // Stream-off already pulled these off the device queue
                Ownership::CaptureOwned | Ownership::Free => {}
            }
            match self.pool.revoke(id) {
                Ok(last) => revoked.push((id, last)),
                Err(e) => warn!("{}", e),
            }
        }

        info!("Pipeline stopped: {}", self.stats);
        Teardown {
            pool: self.pool,
            capture: self.capture,
            display: self.display,
            abandoned,
            revoked,
            stats: self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::error::PoolError;
    use crate::pipeline::testing::{running, DropRecorder, FakeCapture, FakeDisplay, ScriptedPoller};

    const CAPTURE: Readiness = Readiness {
        exit: false,
        capture: true,
        display: false,
    };
    const FLIP: Readiness = Readiness {
        exit: false,
        capture: false,
        display: true,
    };
    const BOTH: Readiness = Readiness {
        exit: false,
        capture: true,
        display: true,
    };

    fn owner(core: &SyncCore<FakeCapture, FakeDisplay>, id: usize) -> Ownership {
        core.pool().get(BufferId(id)).unwrap().owner()
    }

    /// Fill the next queued buffer and let the core pick it up.
    fn capture_one(core: &mut SyncCore<FakeCapture, FakeDisplay>) -> BufferId {
        let id = core.capture_mut().fill().expect("a queued buffer");
        core.step(CAPTURE).unwrap();
        id
    }

    fn flip(core: &mut SyncCore<FakeCapture, FakeDisplay>) {
        core.display_mut().vblank();
        core.step(FLIP).unwrap();
    }

    #[test]
    fn start_shows_first_buffer_and_queues_the_rest() {
        let core = running(3);

        assert_eq!(core.front(), BufferId(0));
        assert_eq!(core.pending(), None);
        assert_eq!(core.display().initial, Some(BufferId(0)));
        assert_eq!(owner(&core, 0), Ownership::DisplayOwned);
        assert_eq!(owner(&core, 1), Ownership::CaptureOwned);
        assert_eq!(owner(&core, 2), Ownership::CaptureOwned);
        assert_eq!(core.capture().queued_ids(), vec![BufferId(1), BufferId(2)]);
        assert!(core.capture().streaming);
    }

    #[test]
    fn steady_state_cycle() {
        let mut core = running(2);
        let (a, b) = (BufferId(0), BufferId(1));

        assert_eq!(capture_one(&mut core), b);
        assert_eq!(core.pending(), Some(b));
        assert_eq!(owner(&core, 1), Ownership::DisplayPending);
        assert_eq!(core.front(), a);
        assert_eq!(core.display().submitted, vec![b]);

        flip(&mut core);
        assert_eq!(core.front(), b);
        assert_eq!(core.pending(), None);
        assert_eq!(owner(&core, 1), Ownership::DisplayOwned);
        assert_eq!(owner(&core, 0), Ownership::CaptureOwned);
        assert_eq!(core.capture().queued_ids(), vec![a]);
        assert_eq!(core.stats().displayed, 1);
    }

    #[test]
    fn backpressure_drops_new_frame() {
        let mut core = running(3);
        let first = capture_one(&mut core);
        assert_eq!(core.pending(), Some(first));

        let second = capture_one(&mut core);
        assert_ne!(first, second);
        assert_eq!(core.pending(), Some(first));
        assert_eq!(core.front(), BufferId(0));
        assert_eq!(owner(&core, second.0), Ownership::CaptureOwned);
        assert_eq!(core.capture().queued_ids(), vec![second]);
        assert_eq!(core.display().submitted, vec![first]);
        assert_eq!(core.stats().dropped, 1);
        assert_eq!(core.stats().captured, 2);
    }

    #[test]
    fn completion_is_handled_before_capture_in_one_wakeup() {
        let mut core = running(3);
        let first = capture_one(&mut core);

        let second = core.capture_mut().fill().unwrap();
        core.display_mut().vblank();
        core.step(BOTH).unwrap();

        assert_eq!(core.front(), first);
        assert_eq!(core.pending(), Some(second));
        assert_eq!(core.stats().dropped, 0);
    }

    #[test]
    fn exit_wins_over_other_sources() {
        let mut core = running(3);
        let first = capture_one(&mut core);
        core.capture_mut().fill().unwrap();
        core.display_mut().vblank();

        let flow = core
            .step(Readiness {
                exit: true,
                capture: true,
                display: true,
            })
            .unwrap();

        assert_eq!(flow, Flow::Exit);
        assert_eq!(core.front(), BufferId(0));
        assert_eq!(core.pending(), Some(first));
        assert_eq!(core.stats().captured, 1);
    }

    #[test]
    fn front_only_moves_on_completion_of_pending() {
        let mut core = running(3);
        let first = capture_one(&mut core);

        core.display_mut().spurious = Some(BufferId(2));
        core.step(FLIP).unwrap();
        assert_eq!(core.front(), BufferId(0));
        assert_eq!(core.pending(), Some(first));

        // Vblank with nothing for us
        core.step(FLIP).unwrap();
        assert_eq!(core.front(), BufferId(0));
    }

    #[test]
    fn not_ready_capture_is_not_an_error() {
        let mut core = running(2);
        core.step(CAPTURE).unwrap();
        assert_eq!(core.stats().captured, 0);
        assert_eq!(core.pending(), None);
    }

    #[test]
    fn unknown_capture_index_is_ignored() {
        let mut core = running(2);
        core.capture_mut().inject(42);
        core.step(CAPTURE).unwrap();
        assert_eq!(core.stats().unknown_frames, 1);
        assert_eq!(core.pending(), None);
    }

    #[test]
    fn failed_submit_returns_buffer_to_capture() {
        let mut core = running(2);
        core.display_mut().fail_next_submit = true;

        let id = capture_one(&mut core);
        assert_eq!(core.pending(), None);
        assert_eq!(owner(&core, id.0), Ownership::CaptureOwned);
        assert_eq!(core.capture().queued_ids(), vec![id]);
        assert_eq!(core.stats().submit_failures, 1);

        // Next frame goes through
        assert_eq!(capture_one(&mut core), id);
        assert_eq!(core.pending(), Some(id));
    }

    #[test]
    fn failed_release_strands_and_retries() {
        let mut core = running(3);
        capture_one(&mut core);

        core.capture_mut().fail_releases = 1;
        let dropped = capture_one(&mut core);
        assert!(core.pool().get(dropped).unwrap().is_stranded());
        assert!(!core.capture().queued_ids().contains(&dropped));
        assert_eq!(core.stats().release_failures, 1);

        core.step(Readiness::default()).unwrap();
        assert!(!core.pool().get(dropped).unwrap().is_stranded());
        assert!(core.capture().queued_ids().contains(&dropped));
    }

    #[test]
    fn capture_io_failure_is_fatal() {
        let mut core = running(2);
        core.capture_mut().fail_acquire = true;
        let err = core.step(CAPTURE).unwrap_err();
        assert!(matches!(err, PipelineError::Capture(_)));
    }

    #[test]
    fn display_event_failure_is_fatal() {
        let mut core = running(2);
        core.display_mut().fail_events = true;
        let err = core.step(FLIP).unwrap_err();
        assert!(matches!(err, PipelineError::Display(_)));
    }

    #[test]
    fn stall_ends_the_loop() {
        let mut core = running(2);
        let mut poller = ScriptedPoller::new(vec![Some(Readiness::default()), None]);

        let err = core.run(&mut poller).unwrap_err();
        assert!(matches!(err, PipelineError::Stall { timeout_ms: 50 }));
    }

    #[test]
    fn run_stops_on_exit() {
        let mut core = running(2);
        core.capture_mut().fill().unwrap();
        let mut poller = ScriptedPoller::new(vec![
            Some(CAPTURE),
            Some(Readiness {
                exit: true,
                ..Readiness::default()
            }),
        ]);

        core.run(&mut poller).unwrap();
        assert_eq!(core.pending(), Some(BufferId(1)));
    }

    #[test]
    fn shutdown_revokes_pending_buffer() {
        let mut core = running(3);
        let pending = capture_one(&mut core);

        let teardown = core.shutdown();
        assert_eq!(teardown.abandoned, Some(pending));
        assert!(teardown
            .revoked
            .contains(&(pending, Ownership::DisplayPending)));
        assert!(teardown.revoked.contains(&(BufferId(0), Ownership::DisplayOwned)));
        assert_eq!(teardown.revoked.len(), 3);
        assert!(teardown.display.revoked.contains(&pending));
        assert!(!teardown.capture.streaming);
        assert_eq!(teardown.pool.census().free, 3);
    }

    #[test]
    fn start_rejects_failed_modeset() {
        let pool = crate::pipeline::testing::pool(2);
        let display = FakeDisplay {
            fail_modeset: true,
            ..FakeDisplay::default()
        };
        let result = SyncCore::start(pool, FakeCapture::default(), display, Duration::from_millis(50));
        assert!(matches!(result, Err(PipelineError::Display(_))));
    }

    #[test]
    fn failed_start_drops_capture_before_display() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let capture = FakeCapture {
            recorder: Some(DropRecorder::new("capture", &log)),
            ..FakeCapture::default()
        };
        let display = FakeDisplay {
            fail_modeset: true,
            recorder: Some(DropRecorder::new("display", &log)),
            ..FakeDisplay::default()
        };

        let result = SyncCore::start(
            crate::pipeline::testing::pool(2),
            capture,
            display,
            Duration::from_millis(50),
        );
        assert!(result.is_err());
        assert_eq!(*log.borrow(), vec!["capture", "display"]);
    }

    #[test]
    fn pool_guard_backs_up_the_core() {
        let mut core = running(3);
        capture_one(&mut core);
        let mut pool = core.shutdown().pool;
        for id in [BufferId(0), BufferId(1)] {
            pool.transition(id, Ownership::Free, Ownership::CaptureOwned).unwrap();
        }
        pool.transition(BufferId(0), Ownership::CaptureOwned, Ownership::DisplayPending)
            .unwrap();
        assert_eq!(
            pool.transition(BufferId(1), Ownership::CaptureOwned, Ownership::DisplayPending),
            Err(PoolError::PendingOccupied { pending: BufferId(0) })
        );
    }

    /// Capture-owned buffers are exactly those on the device queue plus the stranded ones.
    fn assert_capture_side_consistent(core: &SyncCore<FakeCapture, FakeDisplay>) {
        let mut on_device = core.capture().held_ids();
        on_device.extend(core.pool().stranded());
        on_device.sort();
        let mut capture_owned: Vec<BufferId> = core.pool().owned_by(Ownership::CaptureOwned).collect();
        capture_owned.sort();
        assert_eq!(on_device, capture_owned);
    }

    #[test]
    fn random_event_sequences_keep_invariants() {
        for seed in 0..200u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let n = rng.gen_range(2..=5);
            let mut core = running(n);

            for _ in 0..300 {
                match rng.gen_range(0..10) {
                    0..=2 => {
                        core.capture_mut().fill();
                    }
                    3..=4 => core.display_mut().vblank(),
                    5 => core.capture_mut().fail_releases = 1,
                    6 => core.display_mut().fail_next_submit = true,
                    _ => {}
                }

                let ready = Readiness {
                    exit: false,
                    capture: rng.gen_bool(0.6),
                    display: rng.gen_bool(0.5),
                };
                let front_before = core.front();
                let pending_before = core.pending();

                core.step(ready).unwrap();

                let census = core.pool().census();
                assert_eq!(census.total(), n, "seed {seed}");
                assert!(census.pending <= 1, "seed {seed}");
                assert_eq!(census.free, 0, "seed {seed}");
                assert_eq!(core.pool().check(core.front(), core.pending()), Ok(()), "seed {seed}");
                assert_capture_side_consistent(&core);

                if core.front() != front_before {
                    assert!(ready.display, "seed {seed}: front moved without a completion");
                    assert_eq!(Some(core.front()), pending_before, "seed {seed}");
                }
            }

            let teardown = core.shutdown();
            assert_eq!(teardown.pool.census().free, n);
            assert_eq!(teardown.revoked.len(), n);
        }
    }
}
