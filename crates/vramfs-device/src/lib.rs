#![deny(unsafe_code)]
//! Compute device backends.
//!
//! This crate is the narrow seam between the filesystem and the GPU: a
//! [`ComputeDevice`] owns device buffers and one in-order submission queue.
//! Reads are blocking; writes may be submitted asynchronously, in which
//! case the backend takes ownership of the host bytes and keeps them alive
//! until the transfer completes.
//!
//! Two implementations exist: [`OclDevice`] (behind the `opencl` feature)
//! talks to a real GPU, and [`HostDevice`] models the same queue contract
//! in host memory for leak-detection runs and tests.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use vramfs_error::{Result, VramfsError};
use vramfs_types::BufferId;

mod host;
#[cfg(feature = "opencl")]
mod opencl;

pub use host::HostDevice;
#[cfg(feature = "opencl")]
pub use opencl::{list_gpus, OclDevice};

// ── Completion events ───────────────────────────────────────────────────────

/// Backend-specific wait handle for one submitted transfer.
pub trait EventWait: Send + Sync {
    /// Block until the transfer has completed, propagating its outcome.
    fn wait(&self) -> Result<()>;
}

/// Waitable handle for an asynchronously submitted write.
///
/// Cheap to clone; all clones observe the same completion.
#[derive(Clone)]
pub struct WriteEvent {
    inner: Arc<dyn EventWait>,
}

impl WriteEvent {
    #[must_use]
    pub fn new(inner: Arc<dyn EventWait>) -> Self {
        Self { inner }
    }

    /// An event that is already complete, for blocking submissions.
    #[must_use]
    pub fn completed() -> Self {
        let state = Arc::new(EventState::new());
        state.complete();
        Self { inner: state }
    }

    /// Wait for the transfer to finish.
    pub fn wait(&self) -> Result<()> {
        self.inner.wait()
    }
}

impl std::fmt::Debug for WriteEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteEvent").finish_non_exhaustive()
    }
}

/// Host-side completion flag shared between submitter and executor.
pub(crate) struct EventState {
    state: Mutex<EventInner>,
    cond: Condvar,
}

struct EventInner {
    done: bool,
    error: Option<String>,
}

impl EventState {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(EventInner {
                done: false,
                error: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self) {
        let mut inner = self.state.lock();
        inner.done = true;
        self.cond.notify_all();
    }

    pub(crate) fn fail(&self, detail: String) {
        let mut inner = self.state.lock();
        inner.done = true;
        inner.error = Some(detail);
        self.cond.notify_all();
    }
}

impl EventWait for EventState {
    fn wait(&self) -> Result<()> {
        let mut inner = self.state.lock();
        while !inner.done {
            self.cond.wait(&mut inner);
        }
        match &inner.error {
            None => Ok(()),
            Some(detail) => Err(VramfsError::device(detail.clone())),
        }
    }
}

// ── Device trait ────────────────────────────────────────────────────────────

/// A compute device holding opaque fixed-purpose buffers behind one
/// in-order submission queue.
///
/// Queue semantics: operations on the same device complete in submission
/// order. A blocking read therefore acts as a barrier for every write
/// submitted before it.
pub trait ComputeDevice: Send + Sync {
    /// Allocate a device buffer of `len` bytes.
    ///
    /// Failure is an expected out-of-memory condition during pool growth,
    /// reported as [`VramfsError::NoSpace`].
    fn allocate(&self, len: usize) -> Result<BufferId>;

    /// Enqueue a zero fill of the whole buffer.
    fn fill_zero(&self, buf: BufferId) -> Result<()>;

    /// Blocking read of `out.len()` bytes starting at `offset`.
    fn read_at(&self, buf: BufferId, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Blocking write of `data` starting at `offset`.
    fn write_at(&self, buf: BufferId, offset: usize, data: &[u8]) -> Result<()>;

    /// Submit a write without waiting for it.
    ///
    /// The device owns `data` until the transfer completes; the returned
    /// event can be waited on to observe completion.
    fn write_async(&self, buf: BufferId, offset: usize, data: Vec<u8>) -> Result<WriteEvent>;

    /// Wait for every submitted operation to complete.
    fn finish(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_event_waits_immediately() {
        WriteEvent::completed().wait().expect("completed event");
    }

    #[test]
    fn failed_event_propagates_detail() {
        let state = Arc::new(EventState::new());
        state.fail("transfer aborted".to_owned());
        let err = WriteEvent::new(state).wait().unwrap_err();
        assert!(err.to_string().contains("transfer aborted"));
        assert!(err.is_fatal());
    }

    #[test]
    fn event_completion_crosses_threads() {
        let state = Arc::new(EventState::new());
        let event = WriteEvent::new(Arc::clone(&state) as Arc<dyn EventWait>);
        let handle = std::thread::spawn(move || event.wait());
        state.complete();
        handle.join().expect("join").expect("wait");
    }
}
