//! Fixed pool of DMA-BUF backed frame buffers and their ownership tags.

use std::fmt;
use std::os::fd::RawFd;

use crate::error::PoolError;

/// Stable pool index of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub usize);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw DMA-BUF descriptor shared between the two devices.
///
/// The descriptor itself is owned by whoever allocated the memory (the display
/// engine); the pool only carries the number around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimeHandle(pub RawFd);

impl PrimeHandle {
    pub fn raw(self) -> RawFd {
        self.0
    }
}

/// Display-side framebuffer id, assigned when the display engine registers the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    Free,
    CaptureOwned,
    DisplayPending,
    DisplayOwned,
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Ownership::Free => "free",
            Ownership::CaptureOwned => "capture-owned",
            Ownership::DisplayPending => "display-pending",
            Ownership::DisplayOwned => "display-owned",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Buffer {
    pub id: BufferId,
    pub prime: PrimeHandle,
    pub surface: Option<SurfaceId>,
    pub capture_index: Option<u32>,
    owner: Ownership,
    stranded: bool,
}

impl Buffer {
    pub fn new(id: BufferId, prime: PrimeHandle) -> Self {
        Self {
            id,
            prime,
            surface: None,
            capture_index: None,
            owner: Ownership::Free,
            stranded: false,
        }
    }

    pub fn owner(&self) -> Ownership {
        self.owner
    }

    /// Enqueue to the capture device failed and has not been retried successfully yet.
    pub fn is_stranded(&self) -> bool {
        self.stranded
    }
}

/// Number of buffers per ownership state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Census {
    pub free: usize,
    pub capture: usize,
    pub pending: usize,
    pub display: usize,
}

impl Census {
    pub fn total(&self) -> usize {
        self.free + self.capture + self.pending + self.display
    }
}

pub struct BufferPool {
    buffers: Vec<Buffer>,
}

impl BufferPool {
    pub fn new(buffers: Vec<Buffer>) -> Result<Self, PoolError> {
        if buffers.len() < 2 {
            return Err(PoolError::TooFew {
                count: buffers.len(),
            });
        }
        // Ids double as indices into `buffers`.
        let buffers = buffers
            .into_iter()
            .enumerate()
            .map(|(i, mut buf)| {
                buf.id = BufferId(i);
                buf
            })
            .collect();
        Ok(Self { buffers })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers.iter().map(|b| b.id)
    }

    pub fn get(&self, id: BufferId) -> Result<&Buffer, PoolError> {
        self.buffers.get(id.0).ok_or(PoolError::UnknownBuffer(id))
    }

    fn get_mut(&mut self, id: BufferId) -> Result<&mut Buffer, PoolError> {
        self.buffers.get_mut(id.0).ok_or(PoolError::UnknownBuffer(id))
    }

    /// Resolves a dequeued capture buffer back to its pool entry.
    pub fn by_capture_index(&self, index: u32) -> Option<BufferId> {
        self.buffers
            .iter()
            .find(|b| b.capture_index == Some(index))
            .map(|b| b.id)
    }

    pub fn register_surface(&mut self, id: BufferId, surface: SurfaceId) -> Result<(), PoolError> {
        self.get_mut(id)?.surface = Some(surface);
        Ok(())
    }

    pub fn register_capture(&mut self, id: BufferId, index: u32) -> Result<(), PoolError> {
        self.get_mut(id)?.capture_index = Some(index);
        Ok(())
    }

    /// Moves one buffer from `expected` to `next`.
    ///
    /// Nothing changes unless the buffer is currently `expected`, and no
    /// second buffer may enter `DisplayPending` while one is there.
    pub fn transition(
        &mut self,
        id: BufferId,
        expected: Ownership,
        next: Ownership,
    ) -> Result<(), PoolError> {
        if next == Ownership::DisplayPending {
            if let Some(pending) = self.pending() {
                if pending != id {
                    return Err(PoolError::PendingOccupied { pending });
                }
            }
        }

        let buf = self.get_mut(id)?;
        if buf.owner != expected {
            return Err(PoolError::InvalidTransition {
                id,
                expected,
                actual: buf.owner,
                next,
            });
        }
        buf.owner = next;
        if next != Ownership::CaptureOwned {
            buf.stranded = false;
        }
        Ok(())
    }

    /// Forces a buffer back to `Free`, returning the role it had.
    pub fn revoke(&mut self, id: BufferId) -> Result<Ownership, PoolError> {
        let buf = self.get_mut(id)?;
        let last = buf.owner;
        buf.owner = Ownership::Free;
        buf.stranded = false;
        Ok(last)
    }

    pub fn mark_stranded(&mut self, id: BufferId, stranded: bool) -> Result<(), PoolError> {
        let buf = self.get_mut(id)?;
        buf.stranded = stranded && buf.owner == Ownership::CaptureOwned;
        Ok(())
    }

    pub fn stranded(&self) -> Vec<BufferId> {
        self.buffers
            .iter()
            .filter(|b| b.stranded)
            .map(|b| b.id)
            .collect()
    }

    pub fn owned_by(&self, owner: Ownership) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers
            .iter()
            .filter(move |b| b.owner == owner)
            .map(|b| b.id)
    }

    fn pending(&self) -> Option<BufferId> {
        self.owned_by(Ownership::DisplayPending).next()
    }

    pub fn census(&self) -> Census {
        let mut census = Census::default();
        for buf in &self.buffers {
            match buf.owner {
                Ownership::Free => census.free += 1,
                Ownership::CaptureOwned => census.capture += 1,
                Ownership::DisplayPending => census.pending += 1,
                Ownership::DisplayOwned => census.display += 1,
            }
        }
        census
    }

    /// Verifies the pipeline invariants against the core's view of `front`/`pending`.
    pub fn check(&self, front: BufferId, pending: Option<BufferId>) -> Result<(), String> {
        let census = self.census();
        if census.total() != self.len() {
            return Err(format!("census {census:?} does not cover {} buffers", self.len()));
        }
        if census.pending > 1 {
            return Err(format!("{} buffers pending on display", census.pending));
        }
        if census.display != 1 {
            return Err(format!("{} buffers owned by display", census.display));
        }

        let front_owner = self.get(front).map_err(|e| e.to_string())?.owner;
        if front_owner != Ownership::DisplayOwned {
            return Err(format!("front {front} is {front_owner}"));
        }
        match pending {
            Some(id) => {
                let owner = self.get(id).map_err(|e| e.to_string())?.owner;
                if owner != Ownership::DisplayPending {
                    return Err(format!("pending {id} is {owner}"));
                }
            }
            None if census.pending != 0 => {
                return Err("a buffer is pending but the core tracks none".into());
            }
            None => {}
        }
        Ok(())
    }
}
