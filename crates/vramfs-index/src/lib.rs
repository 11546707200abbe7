#![forbid(unsafe_code)]
//! In-memory filesystem index.
//!
//! The entry graph is a tree of [`Entry`] nodes: directories own their
//! children through a name map, every non-root entry keeps a weak
//! back-pointer to its parent, and file entries map block-aligned offsets
//! to shared VRAM block handles. All of it lives in host RAM; only file
//! bytes go to the device.

use std::collections::BTreeMap;
use std::ops;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;
use vramfs_error::{Result, VramfsError};
use vramfs_pool::BlockHandle;
use vramfs_types::round_up_to_block;

/// Size reported for every directory, independent of child count.
pub const DIR_SIZE: u64 = 4096;

// ── Entry kinds and filters ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Bitset over entry kinds, used to constrain path resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeFilter(u8);

impl TypeFilter {
    pub const FILE: Self = Self(1);
    pub const DIR: Self = Self(2);
    pub const SYMLINK: Self = Self(4);
    pub const ANY: Self = Self(7);

    #[must_use]
    pub fn contains(self, kind: EntryKind) -> bool {
        let bit = match kind {
            EntryKind::File => Self::FILE.0,
            EntryKind::Dir => Self::DIR.0,
            EntryKind::Symlink => Self::SYMLINK.0,
        };
        self.0 & bit != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for TypeFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ── Entry ───────────────────────────────────────────────────────────────────

/// Mutable attributes common to every entry.
pub struct Metadata {
    /// Non-owning link; dangling only for the root.
    pub parent: Weak<Entry>,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

pub struct DirContent {
    pub children: BTreeMap<String, EntryRef>,
}

/// Kind-specific payload.
pub enum Body {
    File(Mutex<FileContent>),
    Dir(Mutex<DirContent>),
    /// Symlink target, opaque to the filesystem; resolution is the
    /// kernel's job.
    Symlink(String),
}

pub struct Entry {
    meta: Mutex<Metadata>,
    body: Body,
}

pub type EntryRef = Arc<Entry>;

fn now() -> SystemTime {
    SystemTime::now()
}

impl Entry {
    fn new(parent: Weak<Entry>, name: String, mode: u32, uid: u32, gid: u32, body: Body) -> Self {
        let t = now();
        Self {
            meta: Mutex::new(Metadata {
                parent,
                name,
                mode,
                uid,
                gid,
                atime: t,
                mtime: t,
                ctime: t,
            }),
            body,
        }
    }

    /// The mount-time root: a directory with no parent and an empty name.
    #[must_use]
    pub fn new_root(uid: u32, gid: u32) -> EntryRef {
        Arc::new(Self::new(
            Weak::new(),
            String::new(),
            0o775,
            uid,
            gid,
            Body::Dir(Mutex::new(DirContent {
                children: BTreeMap::new(),
            })),
        ))
    }

    /// Create a file entry and link it under `parent`.
    pub fn make_file(
        parent: &EntryRef,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<EntryRef> {
        let entry = Arc::new(Self::new(
            Arc::downgrade(parent),
            name.to_owned(),
            mode,
            uid,
            gid,
            Body::File(Mutex::new(FileContent::new())),
        ));
        link_child(parent, name, &entry)?;
        Ok(entry)
    }

    /// Create a directory entry and link it under `parent`.
    pub fn make_dir(
        parent: &EntryRef,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<EntryRef> {
        let entry = Arc::new(Self::new(
            Arc::downgrade(parent),
            name.to_owned(),
            mode,
            uid,
            gid,
            Body::Dir(Mutex::new(DirContent {
                children: BTreeMap::new(),
            })),
        ));
        link_child(parent, name, &entry)?;
        Ok(entry)
    }

    /// Create a symlink entry and link it under `parent`.
    pub fn make_symlink(
        parent: &EntryRef,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<EntryRef> {
        let entry = Arc::new(Self::new(
            Arc::downgrade(parent),
            name.to_owned(),
            0o777,
            uid,
            gid,
            Body::Symlink(target.to_owned()),
        ));
        link_child(parent, name, &entry)?;
        Ok(entry)
    }

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        match &self.body {
            Body::File(_) => EntryKind::File,
            Body::Dir(_) => EntryKind::Dir,
            Body::Symlink(_) => EntryKind::Symlink,
        }
    }

    pub fn meta(&self) -> MutexGuard<'_, Metadata> {
        self.meta.lock()
    }

    #[must_use]
    pub fn file(&self) -> Option<&Mutex<FileContent>> {
        match &self.body {
            Body::File(content) => Some(content),
            _ => None,
        }
    }

    #[must_use]
    pub fn dir(&self) -> Option<&Mutex<DirContent>> {
        match &self.body {
            Body::Dir(content) => Some(content),
            _ => None,
        }
    }

    #[must_use]
    pub fn symlink_target(&self) -> Option<&str> {
        match &self.body {
            Body::Symlink(target) => Some(target),
            _ => None,
        }
    }

    /// Reported size: logical size for files, a constant for directories,
    /// the target length for symlinks.
    #[must_use]
    pub fn size(&self) -> u64 {
        match &self.body {
            Body::File(content) => content.lock().size(),
            Body::Dir(_) => DIR_SIZE,
            Body::Symlink(target) => target.len() as u64,
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<EntryRef> {
        self.meta.lock().parent.upgrade()
    }

    /// Detach this entry from its parent's children map, bumping the
    /// parent's mtime and ctime. The entry's memory is freed once the
    /// last session holding it drops.
    pub fn unlink(self: &Arc<Self>) -> Result<()> {
        let parent = self.parent().ok_or(VramfsError::OperationNotPermitted)?;
        let name = self.meta.lock().name.clone();
        let dir = parent.dir().ok_or(VramfsError::NotADirectory)?;
        dir.lock().children.remove(&name);
        let t = now();
        let mut meta = parent.meta();
        meta.mtime = t;
        meta.ctime = t;
        trace!(target: "vramfs::index", name = %name, "entry unlinked");
        Ok(())
    }

    /// Re-link this entry under `new_parent` as `new_name`.
    ///
    /// The destination slot must already be free; replace-on-rename is
    /// handled by the caller unlinking the destination first. Both
    /// parents' mtime/ctime and this entry's ctime advance.
    pub fn move_to(self: &Arc<Self>, new_parent: &EntryRef, new_name: &str) -> Result<()> {
        let t = now();

        if let Some(old_parent) = self.parent() {
            let name = self.meta.lock().name.clone();
            if let Some(dir) = old_parent.dir() {
                dir.lock().children.remove(&name);
            }
            let mut meta = old_parent.meta();
            meta.mtime = t;
            meta.ctime = t;
        }

        {
            let mut meta = self.meta.lock();
            meta.parent = Arc::downgrade(new_parent);
            meta.name = new_name.to_owned();
            meta.ctime = t;
        }

        let dir = new_parent.dir().ok_or(VramfsError::NotADirectory)?;
        dir.lock().children.insert(new_name.to_owned(), self.clone());
        let mut meta = new_parent.meta();
        meta.mtime = t;
        meta.ctime = t;
        Ok(())
    }
}

fn link_child(parent: &EntryRef, name: &str, entry: &EntryRef) -> Result<()> {
    let dir = parent.dir().ok_or(VramfsError::NotADirectory)?;
    dir.lock().children.insert(name.to_owned(), entry.clone());
    let t = now();
    let mut meta = parent.meta();
    meta.mtime = t;
    meta.ctime = t;
    Ok(())
}

// ── Path resolution ─────────────────────────────────────────────────────────

/// Resolve `path` relative to `start`, constrained to `filter`.
///
/// Empty path (or "/") resolves to `start` itself. Every intermediate
/// component must be a directory. A resolved entry whose kind falls
/// outside the filter maps to a type-specific error:
/// a file where a symlink was wanted is `NotFound`, a file where a
/// directory was wanted is `IsADirectory`, a directory where a file was
/// wanted is `NotADirectory`, and the remaining mismatches are
/// `OperationNotPermitted`.
pub fn find(start: &EntryRef, path: &str, filter: TypeFilter) -> Result<EntryRef> {
    // An empty filter can never match anything.
    if filter.is_empty() {
        return Err(VramfsError::NotFound);
    }

    let mut entry = start.clone();
    for part in path.split('/').filter(|part| !part.is_empty()) {
        let dir = entry.dir().ok_or(VramfsError::NotADirectory)?;
        let next = dir.lock().children.get(part).cloned();
        entry = next.ok_or(VramfsError::NotFound)?;
    }

    let kind = entry.kind();
    if !filter.contains(kind) {
        return Err(match kind {
            EntryKind::File => {
                if filter.contains(EntryKind::Symlink) {
                    VramfsError::NotFound
                } else {
                    VramfsError::IsADirectory
                }
            }
            EntryKind::Dir => {
                if filter.contains(EntryKind::File) {
                    VramfsError::NotADirectory
                } else {
                    VramfsError::OperationNotPermitted
                }
            }
            EntryKind::Symlink => VramfsError::OperationNotPermitted,
        });
    }

    Ok(entry)
}

/// Split a path into its parent directory and final component.
///
/// `"/a/b"` becomes `("/a", "b")`; entries directly under the root give
/// `("/", name)`.
#[must_use]
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("/", path),
    }
}

// ── File content ────────────────────────────────────────────────────────────

/// Block map and logical size of one file.
///
/// Keys are block-aligned byte offsets; a key exists only for regions
/// that have been written. Reads of absent regions produce zeros, so
/// sparse files cost nothing.
pub struct FileContent {
    size: u64,
    blocks: BTreeMap<u64, BlockHandle>,
}

impl FileContent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            size: 0,
            blocks: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn block_at(&self, block_start: u64) -> Option<BlockHandle> {
        self.blocks.get(&block_start).cloned()
    }

    pub fn insert_block(&mut self, block_start: u64, block: BlockHandle) {
        self.blocks.insert(block_start, block);
    }

    /// Grow the recorded size to at least `end`.
    pub fn extend_to(&mut self, end: u64) {
        if end > self.size {
            self.size = end;
        }
    }

    /// Set the size to `new_size` and drop every block lying entirely
    /// beyond the new end. Partial trailing data inside the last kept
    /// block is not zeroed; reads clamp to the recorded size anyway.
    pub fn truncate(&mut self, new_size: u64) {
        if let Some(bound) = round_up_to_block(new_size) {
            // Dropped handles return their buffers to the pool.
            let _beyond = self.blocks.split_off(&bound);
        }
        self.size = new_size;
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Offsets of all mapped blocks, ascending.
    #[must_use]
    pub fn block_offsets(&self) -> Vec<u64> {
        self.blocks.keys().copied().collect()
    }
}

impl Default for FileContent {
    fn default() -> Self {
        Self::new()
    }
}
