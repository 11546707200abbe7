//! Parallel-thread exercise of the global-lock discipline.
//!
//! The bridge drives the operation layer from many kernel threads; this
//! suite replays that shape with plain `std::thread` workers over one
//! shared filesystem, leaning on the read path's unlock window.

use std::sync::Arc;
use std::thread;

use vramfs_core::{Caller, VramFs};
use vramfs_device::{ComputeDevice, HostDevice};
use vramfs_pool::BlockPool;
use vramfs_types::{BLOCK_SIZE, BLOCK_SIZE_U64};

const CALLER: Caller = Caller {
    uid: 1000,
    gid: 1000,
};

fn mounted_fs(pool_blocks: u64) -> Arc<VramFs> {
    let device: Arc<dyn ComputeDevice> = Arc::new(HostDevice::new());
    let pool = BlockPool::new(device);
    assert_eq!(
        pool.grow(pool_blocks * BLOCK_SIZE_U64),
        pool_blocks * BLOCK_SIZE_U64
    );
    let fs = VramFs::new(pool);
    fs.init(CALLER);
    Arc::new(fs)
}

#[test]
fn concurrent_readers_on_distinct_blocks() {
    let fs = mounted_fs(8);
    let (fh, _) = fs.create("/big", CALLER).expect("create");
    for i in 0..4_u64 {
        let fill = u8::try_from(i + 1).unwrap();
        fs.write(fh, i * BLOCK_SIZE_U64, &vec![fill; BLOCK_SIZE])
            .expect("write");
    }
    fs.release(fh).expect("release");

    let mut workers = Vec::new();
    for i in 0..4_u64 {
        let fs = Arc::clone(&fs);
        workers.push(thread::spawn(move || {
            let expected = u8::try_from(i + 1).unwrap();
            for _ in 0..16 {
                let fh = fs.open("/big").expect("open");
                let data = fs
                    .read(fh, i * BLOCK_SIZE_U64, u32::try_from(BLOCK_SIZE).unwrap())
                    .expect("read");
                assert!(data.iter().all(|b| *b == expected));
                fs.release(fh).expect("release");
            }
        }));
    }
    for worker in workers {
        worker.join().expect("join");
    }
}

#[test]
fn readers_and_writers_interleave_without_corruption() {
    let fs = mounted_fs(8);
    let (fh, _) = fs.create("/data", CALLER).expect("create");
    fs.write(fh, 0, &vec![0xAB_u8; BLOCK_SIZE]).expect("seed");
    fs.release(fh).expect("release");

    let reader_fs = Arc::clone(&fs);
    let reader = thread::spawn(move || {
        for _ in 0..64 {
            let fh = reader_fs.open("/data").expect("open");
            let data = reader_fs.read(fh, 0, 4096).expect("read");
            // Writers only ever store 0xAB into this region.
            assert!(data.iter().all(|b| *b == 0xAB));
            reader_fs.release(fh).expect("release");
        }
    });

    let writer_fs = Arc::clone(&fs);
    let writer = thread::spawn(move || {
        for _ in 0..64 {
            let fh = writer_fs.open("/data").expect("open");
            writer_fs
                .write(fh, 0, &vec![0xAB_u8; 4096])
                .expect("write");
            writer_fs.release(fh).expect("release");
        }
    });

    reader.join().expect("reader");
    writer.join().expect("writer");
}

#[test]
fn namespace_churn_from_many_threads() {
    // Every live file pins one block; four threads with eight files each
    // need the headroom.
    let fs = mounted_fs(32);
    let mut workers = Vec::new();
    for t in 0..4 {
        let fs = Arc::clone(&fs);
        workers.push(thread::spawn(move || {
            let dir = format!("/dir{t}");
            fs.mkdir(&dir, CALLER).expect("mkdir");
            for i in 0..8 {
                let path = format!("{dir}/f{i}");
                let (fh, _) = fs.create(&path, CALLER).expect("create");
                fs.write(fh, 0, path.as_bytes()).expect("write");
                fs.release(fh).expect("release");
            }
            for i in 0..8 {
                let path = format!("{dir}/f{i}");
                fs.unlink(&path).expect("unlink");
            }
            fs.rmdir(&dir).expect("rmdir");
        }));
    }
    for worker in workers {
        worker.join().expect("join");
    }

    let stats = fs.statfs();
    assert_eq!(stats.entry_count, 1);
    assert_eq!(stats.pool_available, stats.pool_total);
}
