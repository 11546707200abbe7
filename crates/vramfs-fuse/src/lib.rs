#![forbid(unsafe_code)]
//! FUSE adapter for vramfs.
//!
//! A thin translation layer: kernel requests arrive via the `fuser` crate
//! addressed by inode number, get mapped onto the path-based operation
//! layer in `vramfs-core`, and errors go back through
//! [`VramfsError::to_errno()`]. The adapter owns the only inode-number
//! state in the system: an interning table from ino to path, maintained
//! through lookup counts and rewritten on rename.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use thiserror::Error;
use tracing::{error, warn};
use vramfs_core::{Attributes, Caller, VramFs};
use vramfs_error::VramfsError;
use vramfs_index::{split_path, EntryKind};
use vramfs_types::BLOCK_SIZE;

/// TTL for cached attributes and entries. The filesystem is mutable, so
/// keep the kernel on a short leash.
const ATTR_TTL: Duration = Duration::from_secs(1);

const ROOT_INO: u64 = 1;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Dir => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
    }
}

fn to_file_attr(ino: u64, attrs: &Attributes) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.blocks,
        atime: attrs.atime,
        mtime: attrs.mtime,
        ctime: attrs.ctime,
        crtime: attrs.ctime,
        kind: to_fuser_file_type(attrs.kind),
        perm: u16::try_from(attrs.mode & 0o7777).unwrap_or(0),
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: 0,
        blksize: u32::try_from(BLOCK_SIZE).unwrap_or(u32::MAX),
        flags: 0,
    }
}

fn caller_of(req: &Request<'_>) -> Caller {
    Caller {
        uid: req.uid(),
        gid: req.gid(),
    }
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Entry names must be UTF-8; anything else is rejected at the boundary.
fn name_str(name: &OsStr) -> Option<&str> {
    name.to_str()
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

// ── Inode interning table ───────────────────────────────────────────────────

struct InodeSlot {
    path: String,
    nlookup: u64,
}

/// ino ↔ path interning, scoped to one mounted session.
///
/// The kernel's view of an inode is pinned by its lookup count; slots die
/// on `forget`. Renames rewrite the affected subtree's paths in place, so
/// a held ino keeps resolving after its entry moves.
struct InodeTable {
    by_ino: HashMap<u64, InodeSlot>,
    by_path: HashMap<String, u64>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };
        table.by_ino.insert(
            ROOT_INO,
            InodeSlot {
                path: "/".to_owned(),
                nlookup: 1,
            },
        );
        table.by_path.insert("/".to_owned(), ROOT_INO);
        table
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).map(|slot| slot.path.clone())
    }

    /// Get or create the ino for a path without touching lookup counts
    /// (readdir rows are not kernel lookups).
    fn assign(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_ino.insert(
            ino,
            InodeSlot {
                path: path.to_owned(),
                nlookup: 0,
            },
        );
        self.by_path.insert(path.to_owned(), ino);
        ino
    }

    /// Like [`assign`], plus one kernel lookup reference.
    fn remember(&mut self, path: &str) -> u64 {
        let ino = self.assign(path);
        if let Some(slot) = self.by_ino.get_mut(&ino) {
            slot.nlookup += 1;
        }
        ino
    }

    fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(slot) = self.by_ino.get_mut(&ino) else {
            return;
        };
        slot.nlookup = slot.nlookup.saturating_sub(nlookup);
        if slot.nlookup == 0 {
            let path = slot.path.clone();
            self.by_ino.remove(&ino);
            // Only drop the reverse mapping if it still points here.
            if self.by_path.get(&path) == Some(&ino) {
                self.by_path.remove(&path);
            }
        }
    }

    /// Rewrite paths after a rename: the moved entry itself plus every
    /// interned descendant.
    fn apply_rename(&mut self, from: &str, to: &str) {
        let prefix = format!("{from}/");
        let affected: Vec<(String, u64)> = self
            .by_path
            .iter()
            .filter(|(path, _)| path.as_str() == from || path.starts_with(&prefix))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();

        for (old_path, ino) in affected {
            let new_path = if old_path == from {
                to.to_owned()
            } else {
                format!("{to}{}", &old_path[from.len()..])
            };
            self.by_path.remove(&old_path);
            self.by_path.insert(new_path.clone(), ino);
            if let Some(slot) = self.by_ino.get_mut(&ino) {
                slot.path = new_path;
            }
        }
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter delegating all operations to a shared [`VramFs`].
pub struct VramFuse {
    fs: Arc<VramFs>,
    inodes: InodeTable,
}

impl VramFuse {
    #[must_use]
    pub fn new(fs: Arc<VramFs>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    /// Resolve an ino to its interned path or reply ENOENT.
    fn path_or_enoent(&self, ino: u64) -> Result<String, c_int> {
        self.inodes.path_of(ino).ok_or(libc::ENOENT)
    }
}

impl Filesystem for VramFuse {
    fn init(&mut self, req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        self.fs.init(caller_of(req));
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.fs.destroy() {
            error!(error = %e, "device drain failed during unmount");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Ok(parent_path) = self.path_or_enoent(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = child_path(&parent_path, name);
        match self.fs.getattr(&path) {
            Ok(attrs) => {
                let ino = self.inodes.remember(&path);
                reply.entry(&ATTR_TTL, &to_file_attr(ino, &attrs), 0);
            }
            Err(e) => {
                // ENOENT is expected for missing entries; don't warn.
                if e.to_errno() != libc::ENOENT {
                    warn!(parent, ?name, error = %e, "lookup failed");
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        // A supplied handle serves fstat on unlinked-but-open files.
        if let Some(fh) = fh {
            if let Ok(attrs) = self.fs.getattr_session(fh) {
                reply.attr(&ATTR_TTL, &to_file_attr(ino, &attrs));
                return;
            }
        }
        let Ok(path) = self.path_or_enoent(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attrs) => reply.attr(&ATTR_TTL, &to_file_attr(ino, &attrs)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Ok(path) = self.path_or_enoent(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = (|| -> Result<(), VramfsError> {
            if let Some(mode) = mode {
                self.fs.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.fs.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                self.fs.truncate(&path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.fs
                    .utimens(&path, atime.map(resolve_time), mtime.map(resolve_time))?;
            }
            Ok(())
        })();

        match result.and_then(|()| match fh {
            Some(fh) => self
                .fs
                .getattr_session(fh)
                .or_else(|_| self.fs.getattr(&path)),
            None => self.fs.getattr(&path),
        }) {
            Ok(attrs) => reply.attr(&ATTR_TTL, &to_file_attr(ino, &attrs)),
            Err(e) => {
                warn!(ino, error = %e, "setattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Ok(path) = self.path_or_enoent(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.readlink(&path) {
            // The target goes out as raw bytes, not NUL-terminated; the
            // kernel truncates to the caller's buffer.
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => {
                warn!(ino, error = %e, "readlink failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Ok(parent_path) = self.path_or_enoent(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = child_path(&parent_path, name);
        match self.fs.mkdir(&path, caller_of(req)) {
            Ok(attrs) => {
                let ino = self.inodes.remember(&path);
                reply.entry(&ATTR_TTL, &to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Ok(parent_path) = self.path_or_enoent(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.unlink(&child_path(&parent_path, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Ok(parent_path) = self.path_or_enoent(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.rmdir(&child_path(&parent_path, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Ok(parent_path) = self.path_or_enoent(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (Some(name), Some(target)) = (name_str(link_name), target.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = child_path(&parent_path, name);
        match self.fs.symlink(target, &path, caller_of(req)) {
            Ok(attrs) => {
                let ino = self.inodes.remember(&path);
                reply.entry(&ATTR_TTL, &to_file_attr(ino, &attrs), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Ok(parent_path), Ok(newparent_path)) = (
            self.path_or_enoent(parent),
            self.path_or_enoent(newparent),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (Some(name), Some(newname)) = (name_str(name), name_str(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        let from = child_path(&parent_path, name);
        let to = child_path(&newparent_path, newname);
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                self.inodes.apply_rename(&from, &to);
                reply.ok();
            }
            Err(e) => {
                warn!(%from, %to, error = %e, "rename failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Ok(path) = self.path_or_enoent(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.open(&path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(ino, fh, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.write(fh, offset, data) {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(e) => {
                // ENOSPC is a normal full-pool condition.
                if e.to_errno() != libc::ENOSPC {
                    warn!(ino, fh, offset, error = %e, "write failed");
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(ino, fh, error = %e, "fsync failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Ok(path) = self.path_or_enoent(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.fs.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(ino, error = %e, "readdir failed");
                reply.error(e.to_errno());
                return;
            }
        };

        let start = usize::try_from(offset).unwrap_or(0);
        for (idx, entry) in entries.iter().enumerate().skip(start) {
            let child_ino = match entry.name.as_str() {
                "." => ino,
                ".." => {
                    let (parent_path, _) = split_path(&path);
                    self.inodes.assign(parent_path)
                }
                name => self.inodes.assign(&child_path(&path, name)),
            };
            let next_offset = i64::try_from(idx + 1).unwrap_or(i64::MAX);
            let full = reply.add(
                child_ino,
                next_offset,
                to_fuser_file_type(entry.kind),
                OsStr::new(&entry.name),
            );
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.fs.statfs();
        let bsize = u32::try_from(stats.block_size).unwrap_or(u32::MAX);
        reply.statfs(
            stats.pool_total,
            stats.pool_available,
            stats.pool_available,
            stats.entry_count,
            u64::from(u32::MAX),
            bsize,
            255,
            bsize,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Ok(parent_path) = self.path_or_enoent(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = child_path(&parent_path, name);
        match self.fs.create(&path, caller_of(req)) {
            Ok((fh, attrs)) => {
                let ino = self.inodes.remember(&path);
                reply.created(&ATTR_TTL, &to_file_attr(ino, &attrs), 0, fh, 0);
            }
            Err(e) => {
                warn!(parent, ?name, error = %e, "create failed");
                reply.error(e.to_errno());
            }
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

/// Options forced by the driver: kernel-side permission checks, automatic
/// unmount on process exit, and a recognizable fsname.
fn forced_mount_options() -> Vec<MountOption> {
    vec![
        MountOption::FSName("vramfs".to_owned()),
        MountOption::Subtype("vramfs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ]
}

fn validate_mountpoint(mountpoint: &Path) -> Result<(), MountError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(MountError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    Ok(())
}

/// Mount at `mountpoint` and block until unmounted (foreground mode).
pub fn mount(fs: Arc<VramFs>, mountpoint: impl AsRef<Path>) -> Result<(), MountError> {
    let mountpoint = mountpoint.as_ref();
    validate_mountpoint(mountpoint)?;
    let adapter = VramFuse::new(fs);
    fuser::mount2(adapter, mountpoint, &forced_mount_options())?;
    Ok(())
}

/// Mount in the background; the filesystem unmounts when the returned
/// session handle is dropped. Test and tooling convenience.
pub fn mount_background(
    fs: Arc<VramFs>,
    mountpoint: impl AsRef<Path>,
) -> Result<fuser::BackgroundSession, MountError> {
    let mountpoint = mountpoint.as_ref();
    validate_mountpoint(mountpoint)?;
    let adapter = VramFuse::new(fs);
    let session = fuser::spawn_mount2(adapter, mountpoint, &forced_mount_options())?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vramfs_device::{ComputeDevice, HostDevice};
    use vramfs_pool::BlockPool;

    fn test_fs() -> Arc<VramFs> {
        let device: Arc<dyn ComputeDevice> = Arc::new(HostDevice::new());
        let pool = BlockPool::new(device);
        pool.grow(vramfs_types::BLOCK_SIZE_U64);
        Arc::new(VramFs::new(pool))
    }

    #[test]
    fn file_type_conversion() {
        assert_eq!(to_fuser_file_type(EntryKind::File), FileType::RegularFile);
        assert_eq!(to_fuser_file_type(EntryKind::Dir), FileType::Directory);
        assert_eq!(to_fuser_file_type(EntryKind::Symlink), FileType::Symlink);
    }

    #[test]
    fn attributes_to_file_attr() {
        let t = SystemTime::UNIX_EPOCH;
        let attrs = Attributes {
            kind: EntryKind::File,
            mode: 0o664,
            nlink: 1,
            size: 5,
            blocks: 256,
            uid: 1000,
            gid: 1000,
            atime: t,
            mtime: t,
            ctime: t,
        };
        let fattr = to_file_attr(42, &attrs);
        assert_eq!(fattr.ino, 42);
        assert_eq!(fattr.size, 5);
        assert_eq!(fattr.blocks, 256);
        assert_eq!(fattr.perm, 0o664);
        assert_eq!(fattr.kind, FileType::RegularFile);
        assert_eq!(fattr.uid, 1000);
        assert_eq!(fattr.blksize, u32::try_from(BLOCK_SIZE).unwrap());
    }

    #[test]
    fn child_path_joins_against_root_and_nested() {
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/a", "b"), "/a/b");
        assert_eq!(child_path("/a/b", "c"), "/a/b/c");
    }

    #[test]
    fn inode_table_interns_and_reuses() {
        let mut table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).as_deref(), Some("/"));
        let a = table.remember("/a");
        assert_eq!(table.remember("/a"), a);
        assert_ne!(table.remember("/b"), a);
        assert_eq!(table.path_of(a).as_deref(), Some("/a"));
    }

    #[test]
    fn inode_table_forget_drops_slots_at_zero() {
        let mut table = InodeTable::new();
        let a = table.remember("/a");
        table.remember("/a");
        table.forget(a, 1);
        assert_eq!(table.path_of(a).as_deref(), Some("/a"));
        table.forget(a, 1);
        assert_eq!(table.path_of(a), None);
        // Root is never forgotten.
        table.forget(ROOT_INO, 100);
        assert_eq!(table.path_of(ROOT_INO).as_deref(), Some("/"));
    }

    #[test]
    fn inode_table_rename_rewrites_subtree() {
        let mut table = InodeTable::new();
        let dir = table.remember("/old");
        let leaf = table.remember("/old/leaf");
        let deep = table.remember("/old/sub/deep");
        let other = table.remember("/older");

        table.apply_rename("/old", "/new");

        assert_eq!(table.path_of(dir).as_deref(), Some("/new"));
        assert_eq!(table.path_of(leaf).as_deref(), Some("/new/leaf"));
        assert_eq!(table.path_of(deep).as_deref(), Some("/new/sub/deep"));
        // Prefix match is component-wise: "/older" is untouched.
        assert_eq!(table.path_of(other).as_deref(), Some("/older"));
        assert_eq!(table.assign("/new/leaf"), leaf);
    }

    #[test]
    fn mount_rejects_empty_mountpoint() {
        let err = mount(test_fs(), "").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
