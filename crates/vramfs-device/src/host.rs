//! Host-memory stub backend.
//!
//! Models the device contract in plain RAM: one worker thread drains an
//! in-order job queue, so submission order is completion order exactly as
//! on the real queue. Used for leak-detection runs and for every test that
//! does not have a GPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::trace;
use vramfs_error::{Result, VramfsError};
use vramfs_types::BufferId;

use crate::{ComputeDevice, EventState, EventWait, WriteEvent};

enum Job {
    Write {
        buf: BufferId,
        offset: usize,
        data: Vec<u8>,
        done: Arc<EventState>,
    },
    Fill {
        buf: BufferId,
        done: Arc<EventState>,
    },
    Barrier {
        done: Arc<EventState>,
    },
}

struct HostShared {
    buffers: Mutex<HashMap<BufferId, Vec<u8>>>,
}

/// In-order host-memory device.
pub struct HostDevice {
    shared: Arc<HostShared>,
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    max_buffers: Option<usize>,
    fills: AtomicUsize,
}

impl HostDevice {
    /// Device with no allocation limit.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Device that refuses to allocate more than `max_buffers` buffers,
    /// simulating VRAM exhaustion.
    #[must_use]
    pub fn with_capacity(max_buffers: usize) -> Self {
        Self::build(Some(max_buffers))
    }

    fn build(max_buffers: Option<usize>) -> Self {
        let shared = Arc::new(HostShared {
            buffers: Mutex::new(HashMap::new()),
        });
        let (tx, rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("vramfs-host-queue".to_owned())
            .spawn(move || queue_loop(&worker_shared, &rx))
            .ok();
        Self {
            shared,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
            next_id: AtomicU64::new(1),
            max_buffers,
            fills: AtomicUsize::new(0),
        }
    }

    /// Number of zero fills enqueued so far (test instrumentation).
    #[must_use]
    pub fn fill_count(&self) -> usize {
        self.fills.load(Ordering::SeqCst)
    }

    /// Number of buffers currently allocated.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.shared.buffers.lock().len()
    }

    fn submit(&self, job: Job) -> Result<()> {
        let guard = self.jobs.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| VramfsError::device("host queue shut down"))?;
        sender
            .send(job)
            .map_err(|_| VramfsError::device("host queue worker exited"))
    }

    fn barrier(&self) -> Result<()> {
        let done = Arc::new(EventState::new());
        self.submit(Job::Barrier {
            done: Arc::clone(&done),
        })?;
        done.wait()
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        // Close the queue, then join so no job outlives the buffers.
        self.jobs.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn queue_loop(shared: &HostShared, jobs: &Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Write {
                buf,
                offset,
                data,
                done,
            } => {
                let mut buffers = shared.buffers.lock();
                match buffers.get_mut(&buf) {
                    Some(bytes) if offset + data.len() <= bytes.len() => {
                        bytes[offset..offset + data.len()].copy_from_slice(&data);
                        done.complete();
                    }
                    Some(bytes) => done.fail(format!(
                        "write out of bounds: buf={buf} offset={offset} len={} buffer_len={}",
                        data.len(),
                        bytes.len()
                    )),
                    None => done.fail(format!("write to unknown buffer {buf}")),
                }
            }
            Job::Fill { buf, done } => {
                let mut buffers = shared.buffers.lock();
                match buffers.get_mut(&buf) {
                    Some(bytes) => {
                        bytes.fill(0);
                        done.complete();
                    }
                    None => done.fail(format!("fill of unknown buffer {buf}")),
                }
            }
            Job::Barrier { done } => done.complete(),
        }
    }
}

impl ComputeDevice for HostDevice {
    fn allocate(&self, len: usize) -> Result<BufferId> {
        let mut buffers = self.shared.buffers.lock();
        if let Some(max) = self.max_buffers {
            if buffers.len() >= max {
                return Err(VramfsError::NoSpace);
            }
        }
        let id = BufferId(self.next_id.fetch_add(1, Ordering::SeqCst));
        buffers.insert(id, vec![0_u8; len]);
        trace!(target: "vramfs::device", buf = %id, len, "host buffer allocated");
        Ok(id)
    }

    fn fill_zero(&self, buf: BufferId) -> Result<()> {
        self.fills.fetch_add(1, Ordering::SeqCst);
        // Completion is observed through queue ordering, like the real
        // device's enqueued fill.
        self.submit(Job::Fill {
            buf,
            done: Arc::new(EventState::new()),
        })
    }

    fn read_at(&self, buf: BufferId, offset: usize, out: &mut [u8]) -> Result<()> {
        // In-order queue: drain everything submitted before this read.
        self.barrier()?;
        let buffers = self.shared.buffers.lock();
        let bytes = buffers
            .get(&buf)
            .ok_or_else(|| VramfsError::device(format!("read of unknown buffer {buf}")))?;
        let end = offset
            .checked_add(out.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                VramfsError::device(format!(
                    "read out of bounds: buf={buf} offset={offset} len={}",
                    out.len()
                ))
            })?;
        out.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    fn write_at(&self, buf: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        let done = Arc::new(EventState::new());
        self.submit(Job::Write {
            buf,
            offset,
            data: data.to_vec(),
            done: Arc::clone(&done),
        })?;
        done.wait()
    }

    fn write_async(&self, buf: BufferId, offset: usize, data: Vec<u8>) -> Result<WriteEvent> {
        let done = Arc::new(EventState::new());
        self.submit(Job::Write {
            buf,
            offset,
            data,
            done: Arc::clone(&done),
        })?;
        Ok(WriteEvent::new(done as Arc<dyn EventWait>))
    }

    fn finish(&self) -> Result<()> {
        self.barrier()
    }
}
