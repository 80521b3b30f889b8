pub mod exit;
pub mod poller;
pub mod pool;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use exit::{ExitSignal, ExitTrigger};
pub use poller::{FdPoller, Poller, Readiness};
pub use pool::{Buffer, BufferId, BufferPool, Ownership};
pub use sync::{Flow, SyncCore, Teardown};
