#![forbid(unsafe_code)]
//! The vramfs operation layer.
//!
//! One method per bridge callback, all serialized by a single process-wide
//! mutex held for the whole body of every operation. The one exception is
//! `read`, which releases the mutex around each per-block device read so
//! that reads against distinct blocks can wait on the GPU concurrently;
//! writes only submit and never wait, so they hold the lock throughout.

use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info};
use vramfs_error::{Result, VramfsError};
use vramfs_index::{find, split_path, Entry, EntryKind, EntryRef, TypeFilter};
use vramfs_pool::{BlockHandle, BlockPool};
use vramfs_types::{block_start, BLOCK_SIZE, BLOCK_SIZE_U64};

/// Mode bits for files created through the bridge.
pub const DEFAULT_FILE_MODE: u32 = 0o664;
/// Mode bits for directories created through the bridge.
pub const DEFAULT_DIR_MODE: u32 = 0o775;

// ── Bridge-facing value types ───────────────────────────────────────────────

/// Identity of the process driving an operation, as reported by the
/// bridge request context.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

/// Snapshot for statfs.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub block_size: u64,
    pub pool_total: u64,
    pub pool_available: u64,
    pub entry_count: u64,
}

/// Attribute copy for getattr-style replies.
#[derive(Debug, Clone, Copy)]
pub struct Attributes {
    pub kind: EntryKind,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    /// Allocated block count in 512-byte units, st_blocks style.
    pub blocks: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// One readdir row.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

// ── Sessions ────────────────────────────────────────────────────────────────

/// Per-open-handle state.
///
/// Owns the file entry, so unlinking while open is safe: the file and its
/// blocks are retained until the last session drops. Tracks the most
/// recently written block for fsync and the release-time flush.
struct Session {
    file: EntryRef,
    last_written: Option<BlockHandle>,
}

struct FsState {
    sessions: HashMap<u64, Session>,
    next_fh: u64,
    /// Live entries in the graph, root included.
    entry_count: u64,
}

// ── Filesystem ──────────────────────────────────────────────────────────────

pub struct VramFs {
    root: EntryRef,
    pool: BlockPool,
    state: Mutex<FsState>,
}

fn now() -> SystemTime {
    SystemTime::now()
}

impl VramFs {
    /// Build the filesystem over an initialized pool. The root exists from
    /// construction; `init` re-owns it for the mounting caller.
    #[must_use]
    pub fn new(pool: BlockPool) -> Self {
        Self {
            root: Entry::new_root(0, 0),
            pool,
            state: Mutex::new(FsState {
                sessions: HashMap::new(),
                next_fh: 1,
                entry_count: 1,
            }),
        }
    }

    /// Bridge init: hand the root to the mounting caller.
    pub fn init(&self, caller: Caller) {
        let _state = self.state.lock();
        let t = now();
        let mut meta = self.root.meta();
        meta.uid = caller.uid;
        meta.gid = caller.gid;
        meta.atime = t;
        meta.mtime = t;
        meta.ctime = t;
        info!(
            target: "vramfs::ops",
            uid = caller.uid,
            gid = caller.gid,
            pool_blocks = self.pool.pool_size(),
            "filesystem initialized"
        );
    }

    /// Bridge destroy: drain the device queue so every submitted write has
    /// landed before buffers are torn down.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.sessions.clear();
        self.pool.device().finish()
    }

    pub fn statfs(&self) -> FsStats {
        let state = self.state.lock();
        FsStats {
            block_size: BLOCK_SIZE_U64,
            pool_total: self.pool.pool_size() as u64,
            pool_available: self.pool.pool_available() as u64,
            entry_count: state.entry_count,
        }
    }

    // ── Metadata operations ────────────────────────────────────────────

    pub fn getattr(&self, path: &str) -> Result<Attributes> {
        let _state = self.state.lock();
        let entry = find(&self.root, path, TypeFilter::ANY)?;
        Ok(attributes_of(&entry))
    }

    /// getattr through an open handle; keeps fstat working on files that
    /// were unlinked while open.
    pub fn getattr_session(&self, fh: u64) -> Result<Attributes> {
        let state = self.state.lock();
        let session = state.sessions.get(&fh).ok_or(VramfsError::TryAgain)?;
        Ok(attributes_of(&session.file))
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let _state = self.state.lock();
        let entry = find(&self.root, path, TypeFilter::SYMLINK)?;
        let target = entry
            .symlink_target()
            .ok_or(VramfsError::OperationNotPermitted)?;
        Ok(target.to_owned())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let _state = self.state.lock();
        let entry = find(&self.root, path, TypeFilter::FILE | TypeFilter::DIR)?;
        let mut meta = entry.meta();
        meta.mode = mode & 0o7777;
        meta.ctime = now();
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let _state = self.state.lock();
        let entry = find(&self.root, path, TypeFilter::FILE | TypeFilter::DIR)?;
        let mut meta = entry.meta();
        if let Some(uid) = uid {
            meta.uid = uid;
        }
        if let Some(gid) = gid {
            meta.gid = gid;
        }
        meta.ctime = now();
        Ok(())
    }

    pub fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let _state = self.state.lock();
        let entry = find(&self.root, path, TypeFilter::FILE | TypeFilter::DIR)?;
        let mut meta = entry.meta();
        if let Some(atime) = atime {
            meta.atime = atime;
        }
        if let Some(mtime) = mtime {
            meta.mtime = mtime;
        }
        meta.ctime = now();
        Ok(())
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let _state = self.state.lock();
        let entry = find(&self.root, path, TypeFilter::DIR)?;
        let dir = entry.dir().ok_or(VramfsError::NotADirectory)?;

        let mut entries = vec![
            DirEntry {
                name: ".".to_owned(),
                kind: EntryKind::Dir,
            },
            DirEntry {
                name: "..".to_owned(),
                kind: EntryKind::Dir,
            },
        ];
        for (name, child) in &dir.lock().children {
            entries.push(DirEntry {
                name: name.clone(),
                kind: child.kind(),
            });
        }

        entry.meta().atime = now();
        Ok(entries)
    }

    // ── Namespace operations ───────────────────────────────────────────

    /// Create a file, replacing an existing file entry at the same path.
    /// Returns the new session handle along with the attributes.
    pub fn create(&self, path: &str, caller: Caller) -> Result<(u64, Attributes)> {
        let mut state = self.state.lock();

        match find(&self.root, path, TypeFilter::ANY) {
            Ok(existing) => match existing.kind() {
                EntryKind::File => {
                    existing.unlink()?;
                    state.entry_count -= 1;
                }
                EntryKind::Dir => return Err(VramfsError::IsADirectory),
                EntryKind::Symlink => return Err(VramfsError::OperationNotPermitted),
            },
            Err(VramfsError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let (dir_path, name) = split_path(path);
        let parent = find(&self.root, dir_path, TypeFilter::DIR)?;
        let file = Entry::make_file(&parent, name, DEFAULT_FILE_MODE, caller.uid, caller.gid)?;
        state.entry_count += 1;

        let fh = state.next_fh;
        state.next_fh += 1;
        state.sessions.insert(
            fh,
            Session {
                file: file.clone(),
                last_written: None,
            },
        );
        debug!(target: "vramfs::ops", path, fh, "file created");
        Ok((fh, attributes_of(&file)))
    }

    pub fn mkdir(&self, path: &str, caller: Caller) -> Result<Attributes> {
        let mut state = self.state.lock();

        if find(&self.root, path, TypeFilter::ANY).is_ok() {
            return Err(VramfsError::AlreadyExists);
        }

        let (dir_path, name) = split_path(path);
        let parent = find(&self.root, dir_path, TypeFilter::DIR)?;
        let dir = Entry::make_dir(&parent, name, DEFAULT_DIR_MODE, caller.uid, caller.gid)?;
        state.entry_count += 1;
        debug!(target: "vramfs::ops", path, "directory created");
        Ok(attributes_of(&dir))
    }

    /// The target is stored verbatim; it is resolved by the kernel at use.
    pub fn symlink(&self, target: &str, path: &str, caller: Caller) -> Result<Attributes> {
        let mut state = self.state.lock();

        if find(&self.root, path, TypeFilter::ANY).is_ok() {
            return Err(VramfsError::AlreadyExists);
        }

        let (dir_path, name) = split_path(path);
        let parent = find(&self.root, dir_path, TypeFilter::DIR)?;
        let link = Entry::make_symlink(&parent, name, target, caller.uid, caller.gid)?;
        state.entry_count += 1;
        Ok(attributes_of(&link))
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = find(&self.root, path, TypeFilter::SYMLINK | TypeFilter::FILE)?;
        entry.unlink()?;
        state.entry_count -= 1;
        debug!(target: "vramfs::ops", path, "entry unlinked");
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = find(&self.root, path, TypeFilter::DIR)?;
        let dir = entry.dir().ok_or(VramfsError::NotADirectory)?;
        if !dir.lock().children.is_empty() {
            return Err(VramfsError::DirectoryNotEmpty);
        }
        entry.unlink()?;
        state.entry_count -= 1;
        Ok(())
    }

    /// POSIX rename: an existing destination entry is unlinked first.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.lock();

        if from == to {
            return Ok(());
        }

        let entry = find(&self.root, from, TypeFilter::ANY)?;
        let (dir_path, new_name) = split_path(to);
        let new_parent = find(&self.root, dir_path, TypeFilter::DIR)?;

        if let Ok(dest) = find(&self.root, to, TypeFilter::ANY) {
            dest.unlink()?;
            state.entry_count -= 1;
        }

        entry.move_to(&new_parent, new_name)?;
        debug!(target: "vramfs::ops", from, to, "entry renamed");
        Ok(())
    }

    // ── File I/O operations ────────────────────────────────────────────

    pub fn open(&self, path: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let entry = find(&self.root, path, TypeFilter::FILE)?;
        let fh = state.next_fh;
        state.next_fh += 1;
        state.sessions.insert(
            fh,
            Session {
                file: entry,
                last_written: None,
            },
        );
        Ok(fh)
    }

    /// Read up to `size` bytes at `offset`, clamped to the file size.
    ///
    /// The global lock is released around each per-block device read and
    /// reacquired before the next lookup, so reads against distinct
    /// blocks wait on the GPU concurrently. Unmapped regions read as
    /// zeros.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        let file = state
            .sessions
            .get(&fh)
            .ok_or(VramfsError::TryAgain)?
            .file
            .clone();
        let content = file.file().ok_or(VramfsError::TryAgain)?;

        let file_size = content.lock().size();
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let len = usize::try_from((file_size - offset).min(u64::from(size)))
            .map_err(|_| VramfsError::TryAgain)?;

        let mut buf = vec![0_u8; len];
        let mut pos = offset;
        let mut filled = 0_usize;

        while filled < len {
            let bstart = block_start(pos);
            let boff = usize::try_from(pos - bstart).unwrap_or(0);
            let step = (BLOCK_SIZE - boff).min(len - filled);
            let block = content.lock().block_at(bstart);

            // Let other operations run while this thread waits on the
            // device; the block handle keeps the buffer alive meanwhile.
            drop(state);
            if let Some(block) = &block {
                block.read(boff, &mut buf[filled..filled + step])?;
            }
            state = self.state.lock();

            pos += step as u64;
            filled += step;
        }

        file.meta().atime = now();
        drop(state);
        Ok(buf)
    }

    /// Write `data` at `offset`, allocating blocks from the pool as
    /// needed. Writes are submitted asynchronously and never wait. On
    /// pool exhaustion the bytes written so far are returned, or
    /// `no-space` when nothing was written.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let file = state
            .sessions
            .get(&fh)
            .ok_or(VramfsError::TryAgain)?
            .file
            .clone();
        let content = file.file().ok_or(VramfsError::TryAgain)?;

        let mut pos = offset;
        let mut written = 0_usize;
        let mut last_written: Option<BlockHandle> = None;

        while written < data.len() {
            let bstart = block_start(pos);
            let boff = usize::try_from(pos - bstart).unwrap_or(0);
            let step = (BLOCK_SIZE - boff).min(data.len() - written);

            let block = {
                let mut guard = content.lock();
                match guard.block_at(bstart) {
                    Some(block) => block,
                    None => match self.pool.acquire() {
                        Some(block) => {
                            guard.insert_block(bstart, block.clone());
                            block
                        }
                        // Out of VRAM; report what made it through.
                        None => break,
                    },
                }
            };

            block.write(boff, &data[written..written + step], true)?;
            last_written = Some(block);

            pos += step as u64;
            written += step;
        }

        if let Some(block) = last_written {
            if let Some(session) = state.sessions.get_mut(&fh) {
                session.last_written = Some(block);
            }
        }

        if written > 0 {
            content.lock().extend_to(pos);
            let t = now();
            let mut meta = file.meta();
            meta.mtime = t;
            meta.ctime = t;
        }

        if written == 0 && !data.is_empty() {
            return Err(VramfsError::NoSpace);
        }
        Ok(written)
    }

    /// Wait for every write submitted through this session.
    ///
    /// The device queue is in-order and each write records its own event,
    /// so waiting on the last written block covers the rest by
    /// transitivity.
    pub fn fsync(&self, fh: u64) -> Result<()> {
        let state = self.state.lock();
        let session = state.sessions.get(&fh).ok_or(VramfsError::TryAgain)?;
        match &session.last_written {
            Some(block) => block.sync(),
            None => Ok(()),
        }
    }

    /// Destroy the session, flushing its writes first. Dropping the file
    /// reference here frees an unlinked file's blocks back to the pool.
    pub fn release(&self, fh: u64) -> Result<()> {
        let mut state = self.state.lock();
        let session = state.sessions.remove(&fh).ok_or(VramfsError::TryAgain)?;
        if let Some(block) = &session.last_written {
            block.sync()?;
        }
        Ok(())
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let _state = self.state.lock();
        let entry = find(&self.root, path, TypeFilter::FILE)?;
        let content = entry.file().ok_or(VramfsError::TryAgain)?;
        content.lock().truncate(size);
        let t = now();
        let mut meta = entry.meta();
        meta.mtime = t;
        meta.ctime = t;
        Ok(())
    }

    /// The pool backing this filesystem (statfs, tests).
    #[must_use]
    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }
}

fn attributes_of(entry: &EntryRef) -> Attributes {
    let (nlink, blocks) = match entry.kind() {
        EntryKind::Dir => (2, 0),
        EntryKind::File => {
            let held = entry.file().map_or(0, |c| c.lock().block_count() as u64);
            (1, held * (BLOCK_SIZE_U64 / 512))
        }
        EntryKind::Symlink => (1, 0),
    };
    let size = entry.size();
    let meta = entry.meta();
    Attributes {
        kind: entry.kind(),
        mode: meta.mode,
        nlink,
        size,
        blocks,
        uid: meta.uid,
        gid: meta.gid,
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.ctime,
    }
}
