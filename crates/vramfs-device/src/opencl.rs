//! OpenCL backend.
//!
//! One context and one in-order command queue per mounted device. Buffers
//! are plain `CL_MEM_READ_WRITE` allocations; on platforms older than
//! OpenCL 1.2 (no fill primitive) a single context-lifetime zero buffer is
//! kept and copied from instead.
//!
//! Asynchronous writes hand their host bytes to a pending-transfer ledger
//! that is reaped front-to-back as events complete; the in-order queue
//! guarantees completion order matches submission order, so the front of
//! the ledger is always the oldest outstanding transfer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ocl::flags::{DeviceType, MemFlags};
use ocl::{Buffer, Context, Device, Event, Platform, Queue};
use parking_lot::Mutex;
use tracing::{debug, trace};
use vramfs_error::{Result, VramfsError};
use vramfs_types::{BufferId, BLOCK_SIZE};

use crate::{ComputeDevice, EventWait, WriteEvent};

fn ocl_err(err: &ocl::Error) -> VramfsError {
    VramfsError::device(err.to_string())
}

/// Names of every GPU across all platforms, in selection order.
pub fn list_gpus() -> Vec<String> {
    let mut names = Vec::new();
    for platform in Platform::list() {
        // A platform with no GPUs reports CL_DEVICE_NOT_FOUND; treat it
        // as empty and keep scanning.
        let devices = Device::list(platform, Some(DeviceType::GPU)).unwrap_or_default();
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
    }
    names
}

/// Flattened Nth-GPU selection across platforms.
fn nth_gpu(index: usize) -> Result<(Platform, Device)> {
    let mut remaining = index;
    for platform in Platform::list() {
        let devices = Device::list(platform, Some(DeviceType::GPU)).unwrap_or_default();
        let count = devices.len();
        if remaining < count {
            if let Some(device) = devices.into_iter().nth(remaining) {
                return Ok((platform, device));
            }
            break;
        }
        remaining -= count;
    }
    Err(VramfsError::device(format!(
        "no opencl capable gpu at index {index}"
    )))
}

/// Parse "OpenCL <major>.<minor> ..." platform version strings.
fn parse_platform_version(version: &str) -> Option<(u32, u32)> {
    let rest = version.strip_prefix("OpenCL ")?;
    let mut parts = rest.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Wait adapter for an OpenCL event.
///
/// `ocl::Event` is not `Sync`; the mutex makes the wrapper shareable.
struct OclEventWait(Mutex<Event>);

impl EventWait for OclEventWait {
    fn wait(&self) -> Result<()> {
        self.0.lock().wait_for().map_err(|e| VramfsError::device(e.to_string()))
    }
}

/// A single GPU behind one in-order queue.
pub struct OclDevice {
    queue: Queue,
    // Kept alive for the lifetime of the mount.
    _context: Context,
    device_name: String,
    buffers: Mutex<HashMap<BufferId, Buffer<u8>>>,
    next_id: AtomicU64,
    has_fill: bool,
    zero_buffer: Option<Buffer<u8>>,
    pending: Mutex<VecDeque<(Event, Vec<u8>)>>,
}

impl OclDevice {
    /// Open the `index`-th GPU in enumeration order.
    pub fn open(index: usize) -> Result<Self> {
        let (platform, device) = nth_gpu(index)?;
        let device_name = device.name().map_err(|e| ocl_err(&e))?;
        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(|e| ocl_err(&e))?;
        // No properties: the queue executes in submission order.
        let queue = Queue::new(&context, device, None).map_err(|e| ocl_err(&e))?;

        let version = platform.version().map_err(|e| ocl_err(&e))?;
        let has_fill = parse_platform_version(&version).is_some_and(|v| v >= (1, 2));

        let zero_buffer = if has_fill {
            None
        } else {
            let zeros = vec![0_u8; BLOCK_SIZE];
            let buffer = Buffer::<u8>::builder()
                .queue(queue.clone())
                .flags(MemFlags::new().read_only())
                .len(BLOCK_SIZE)
                .copy_host_slice(&zeros)
                .build()
                .map_err(|e| ocl_err(&e))?;
            Some(buffer)
        };

        debug!(
            target: "vramfs::device",
            device = %device_name,
            platform = %version,
            has_fill,
            "opened opencl device"
        );

        Ok(Self {
            queue,
            _context: context,
            device_name,
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            has_fill,
            zero_buffer,
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Human-readable name of the selected GPU.
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn buffer(&self, buf: BufferId) -> Result<Buffer<u8>> {
        self.buffers
            .lock()
            .get(&buf)
            .cloned()
            .ok_or_else(|| VramfsError::device(format!("unknown buffer {buf}")))
    }

    /// Drop completed transfers from the front of the pending ledger,
    /// releasing their host-byte copies.
    fn reap_completed(&self) {
        let mut pending = self.pending.lock();
        while let Some((event, _)) = pending.front() {
            match event.is_complete() {
                Ok(true) => {
                    pending.pop_front();
                }
                _ => break,
            }
        }
    }
}

impl ComputeDevice for OclDevice {
    fn allocate(&self, len: usize) -> Result<BufferId> {
        let built = Buffer::<u8>::builder()
            .queue(self.queue.clone())
            .flags(MemFlags::new().read_write())
            .len(len)
            .build();
        match built {
            Ok(buffer) => {
                let id = BufferId(self.next_id.fetch_add(1, Ordering::SeqCst));
                self.buffers.lock().insert(id, buffer);
                trace!(target: "vramfs::device", buf = %id, len, "device buffer allocated");
                Ok(id)
            }
            // Out of VRAM is the expected failure here.
            Err(_) => Err(VramfsError::NoSpace),
        }
    }

    fn fill_zero(&self, buf: BufferId) -> Result<()> {
        let buffer = self.buffer(buf)?;
        if self.has_fill {
            buffer
                .cmd()
                .fill(0_u8, None)
                .enq()
                .map_err(|e| ocl_err(&e))
        } else if let Some(zero) = &self.zero_buffer {
            zero.cmd()
                .copy(&buffer, None, None)
                .enq()
                .map_err(|e| ocl_err(&e))
        } else {
            Err(VramfsError::device("no zero fill path available"))
        }
    }

    fn read_at(&self, buf: BufferId, offset: usize, out: &mut [u8]) -> Result<()> {
        let buffer = self.buffer(buf)?;
        // Blocking read; the in-order queue has already retired every
        // earlier write to this buffer by the time it returns.
        buffer
            .cmd()
            .offset(offset)
            .read(out)
            .enq()
            .map_err(|e| ocl_err(&e))?;
        self.reap_completed();
        Ok(())
    }

    fn write_at(&self, buf: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(buf)?;
        buffer
            .cmd()
            .offset(offset)
            .write(data)
            .enq()
            .map_err(|e| ocl_err(&e))
    }

    #[allow(unsafe_code)]
    fn write_async(&self, buf: BufferId, offset: usize, data: Vec<u8>) -> Result<WriteEvent> {
        self.reap_completed();
        let buffer = self.buffer(buf)?;
        let mut event = Event::empty();
        // SAFETY: a non-blocking write requires the host bytes to stay
        // valid until the transfer completes. `data` moves into the
        // pending ledger below (its heap allocation does not move) and is
        // only released once the event reports completion.
        unsafe {
            buffer
                .cmd()
                .offset(offset)
                .write(&data)
                .block(false)
                .enew(&mut event)
                .enq()
                .map_err(|e| ocl_err(&e))?;
        }
        self.pending.lock().push_back((event.clone(), data));
        Ok(WriteEvent::new(Arc::new(OclEventWait(Mutex::new(event)))))
    }

    fn finish(&self) -> Result<()> {
        self.queue.finish().map_err(|e| ocl_err(&e))?;
        self.pending.lock().clear();
        Ok(())
    }
}

impl Drop for OclDevice {
    fn drop(&mut self) {
        // Drain the queue before the pending host copies are released.
        let _ = self.queue.finish();
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_version_parsing() {
        assert_eq!(parse_platform_version("OpenCL 1.1 Mesa"), Some((1, 1)));
        assert_eq!(parse_platform_version("OpenCL 1.2 "), Some((1, 2)));
        assert_eq!(
            parse_platform_version("OpenCL 3.0 CUDA 12.2.138"),
            Some((3, 0))
        );
        assert_eq!(parse_platform_version("FooCL 2.0"), None);
        assert_eq!(parse_platform_version("OpenCL"), None);
    }

    #[test]
    fn fill_support_threshold() {
        let newer = parse_platform_version("OpenCL 2.1 vendor").unwrap();
        let exact = parse_platform_version("OpenCL 1.2 vendor").unwrap();
        let older = parse_platform_version("OpenCL 1.1 vendor").unwrap();
        assert!(newer >= (1, 2));
        assert!(exact >= (1, 2));
        assert!(older < (1, 2));
    }
}
