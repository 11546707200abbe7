#![forbid(unsafe_code)]
//! vramfs mount driver.
//!
//! Wires the OpenCL backend, the block pool, and the operation layer into
//! a foreground FUSE mount. Exits non-zero when no GPU is found, when the
//! pool comes up short without `-f`, or when the bridge fails.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vramfs_core::VramFs;
use vramfs_device::{list_gpus, ComputeDevice, OclDevice};
use vramfs_pool::BlockPool;
use vramfs_types::{parse_byte_size, BLOCK_SIZE_U64};

#[derive(Parser)]
#[command(
    name = "vramfs",
    about = "Mount GPU video memory as a scratch filesystem"
)]
struct Cli {
    /// Directory to mount the filesystem at.
    mountdir: PathBuf,

    /// Pool size, e.g. 512M or 4G. K/M/G are powers of two, KB/MB/GB
    /// powers of ten.
    size: String,

    /// Index of the GPU to use, in enumeration order.
    #[arg(short = 'd', long = "device", default_value_t = 0)]
    device: usize,

    /// Mount even if less VRAM than requested could be allocated.
    #[arg(short = 'f', long = "force")]
    force: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let requested = parse_byte_size(&cli.size)
        .with_context(|| format!("invalid size argument {:?}", cli.size))?;
    if requested < BLOCK_SIZE_U64 {
        bail!("size must be at least one block ({BLOCK_SIZE_U64} bytes)");
    }

    let gpus = list_gpus();
    if gpus.is_empty() {
        bail!("no opencl capable gpu found");
    }
    if cli.device >= gpus.len() {
        bail!(
            "device index {} out of range ({} gpu(s) found)",
            cli.device,
            gpus.len()
        );
    }

    let device = OclDevice::open(cli.device).context("failed to open gpu")?;
    info!(device = device.device_name(), "selected gpu");

    let pool = BlockPool::new(Arc::new(device) as Arc<dyn ComputeDevice>);
    let allocated = pool.grow(requested);
    if allocated < requested {
        if cli.force {
            warn!(
                requested,
                allocated, "mounting with a smaller pool than requested"
            );
        } else {
            bail!(
                "allocated only {allocated} of {requested} requested bytes of VRAM \
                 (pass -f to mount anyway)"
            );
        }
    }
    if pool.pool_size() == 0 {
        bail!("could not allocate any VRAM blocks");
    }

    info!(
        blocks = pool.pool_size(),
        bytes = allocated,
        mountdir = %cli.mountdir.display(),
        "mounting"
    );

    let fs = Arc::new(VramFs::new(pool));
    vramfs_fuse::mount(fs, &cli.mountdir)
        .with_context(|| format!("FUSE mount failed at {}", cli.mountdir.display()))?;

    Ok(())
}
