#![forbid(unsafe_code)]
//! In-memory filesystem over an extent allocator.
//!
//! [`OshFs`] owns the allocator and a single flat directory behind one
//! mutex. It is driven two ways: inode-based through [`FsOps`] (what the
//! FUSE adapter calls) and path-based through the `*_path` methods.

pub mod dir;
pub mod file;

use dir::{Directory, FileNode, NodeMeta};
use osh_alloc::FreeListAllocator;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::time::SystemTime;
use tracing::{debug, trace};

pub use osh_alloc::{AllocConfig as FsConfig, AllocStats};
pub use osh_error::{OshError, Result};
pub use osh_types::{BLOCK_SIZE, InodeNumber, MAX_NAME_LEN, ROOT_INO};

/// Permission bits of files created through the path API.
pub const DEFAULT_FILE_PERM: u16 = 0o644;

/// Permission bits of the root directory.
pub const ROOT_DIR_PERM: u16 = 0o755;

// ── VFS types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
}

/// Inode attributes returned by [`FsOps::getattr`] and [`FsOps::lookup`].
///
/// The semantics-level stat structure, analogous to POSIX `struct stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    /// File size in bytes.
    pub size: u64,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: FileType,
    /// POSIX permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
}

/// A directory entry returned by [`FsOps::readdir`].
///
/// `offset` is the cookie FUSE hands back to resume listing after this
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub offset: u64,
    pub kind: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// VFS operation kind, used to tag metrics and log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestOp {
    Getattr,
    Lookup,
    Open,
    Opendir,
    Read,
    Readdir,
    Write,
    Create,
    Mknod,
    Setattr,
    Unlink,
    Statfs,
}

impl RequestOp {
    /// Whether the operation can change filesystem state.
    #[must_use]
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::Write | Self::Create | Self::Mknod | Self::Setattr | Self::Unlink
        )
    }
}

/// Attribute changes requested by `setattr`. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    pub mode: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// New size; truncates or extends the file.
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// Capacity report for `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Identity of the process issuing a create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

// ── FsOps trait ─────────────────────────────────────────────────────────────

/// Inode-based filesystem operations.
///
/// This is the interface the FUSE adapter calls. Errors are returned as
/// [`OshError`], which maps to POSIX errnos via [`OshError::to_errno`].
/// The trait is `Send + Sync` so requests may arrive from any thread.
pub trait FsOps: Send + Sync {
    /// Get file attributes by inode number.
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr>;

    /// Look up `name` in the directory `parent`.
    ///
    /// Returns `NotFound` if the name does not exist, or `NotDirectory` if
    /// `parent` is a regular file.
    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr>;

    /// List directory entries after the cookie `offset` (0 for the start).
    /// An empty result marks the end of the directory.
    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>>;

    /// Read up to `size` bytes at `offset`; fewer at EOF.
    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written.
    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<u32>;

    /// Create an empty regular file `name` in `parent`.
    fn create(
        &self,
        parent: InodeNumber,
        name: &OsStr,
        mode: u16,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr>;

    /// Apply attribute changes; a size change truncates or extends.
    fn setattr(&self, ino: InodeNumber, attrs: &SetAttrRequest) -> Result<InodeAttr>;

    /// Remove `name` from `parent` and release its blocks.
    fn unlink(&self, parent: InodeNumber, name: &OsStr) -> Result<()>;

    fn statfs(&self, ino: InodeNumber) -> Result<FsStats>;
}

// ── Filesystem object ───────────────────────────────────────────────────────

struct FsState {
    alloc: FreeListAllocator,
    dir: Directory,
    root: NodeMeta,
}

/// The mounted filesystem: allocator, header pool and directory guarded as
/// a unit.
pub struct OshFs {
    state: Mutex<FsState>,
    config: FsConfig,
}

impl std::fmt::Debug for OshFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OshFs")
            .field("config", &self.config)
            .field("files", &state.dir.len())
            .field("alloc", &state.alloc)
            .finish()
    }
}

// Compile-time assertion: OshFs may be shared across FUSE threads.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<OshFs>;
};

/// Where a path points.
enum Target<'p> {
    Root,
    File(&'p [u8]),
}

fn resolve(path: &str) -> Result<Target<'_>> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(OshError::InvalidArgument(format!(
            "path {path:?} is not absolute"
        )));
    };
    if rest.is_empty() {
        Ok(Target::Root)
    } else {
        Ok(Target::File(rest.as_bytes()))
    }
}

fn not_found(what: impl std::fmt::Display) -> OshError {
    OshError::NotFound(what.to_string())
}

impl OshFs {
    /// Build an empty filesystem whose root is owned by uid/gid 0.
    pub fn new(config: FsConfig) -> Result<Self> {
        Self::with_root_owner(config, Caller::default())
    }

    /// Build an empty filesystem whose root is owned by `owner`.
    pub fn with_root_owner(config: FsConfig, owner: Caller) -> Result<Self> {
        let alloc = FreeListAllocator::new(config)?;
        let root = NodeMeta::new(ROOT_DIR_PERM, owner.uid, owner.gid, SystemTime::now());
        debug!(
            total_blocks = config.total_blocks,
            block_size = config.block_size,
            header_slots = config.header_slots,
            "filesystem created"
        );
        Ok(Self {
            state: Mutex::new(FsState {
                alloc,
                dir: Directory::new(),
                root,
            }),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    #[must_use]
    pub fn alloc_stats(&self) -> AllocStats {
        self.state.lock().alloc.stats()
    }

    /// Check the allocator's invariants.
    pub fn verify(&self) -> Result<()> {
        self.state.lock().alloc.verify()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.state.lock().dir.len()
    }

    // ── Path API ────────────────────────────────────────────────────────

    /// Attributes of `path`; `/` is the root directory.
    pub fn getattr_path(&self, path: &str) -> Result<InodeAttr> {
        let state = self.state.lock();
        match resolve(path)? {
            Target::Root => Ok(root_attr(&state, self.config.block_size)),
            Target::File(name) => state
                .dir
                .get(name)
                .map(|node| file_attr(node, self.config.block_size))
                .ok_or_else(|| not_found(path)),
        }
    }

    /// List `path`, which must be the root, including `.` and `..`.
    pub fn readdir_path(&self, path: &str) -> Result<Vec<(Vec<u8>, InodeAttr)>> {
        let state = self.state.lock();
        match resolve(path)? {
            Target::Root => Ok(list_with_attrs(&state, self.config.block_size)),
            Target::File(name) => match state.dir.get(name) {
                Some(_) => Err(OshError::NotDirectory),
                None => Err(not_found(path)),
            },
        }
    }

    /// Create an empty file at `path` with default permissions.
    pub fn create_path(&self, path: &str, caller: &Caller) -> Result<InodeAttr> {
        match resolve(path)? {
            Target::Root => Err(OshError::Exists),
            Target::File(name) => {
                let mut state = self.state.lock();
                self.create_locked(&mut state, name, DEFAULT_FILE_PERM, caller.uid, caller.gid)
            }
        }
    }

    /// Write `buf` at `offset` of the file at `path`.
    pub fn write_path(&self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        let name = file_name(path)?;
        let mut state = self.state.lock();
        let FsState { alloc, dir, .. } = &mut *state;
        let node = dir.get_mut(name).ok_or_else(|| not_found(path))?;
        write_node(alloc, node, offset, buf)
    }

    /// Set the size of the file at `path`.
    pub fn truncate_path(&self, path: &str, newsize: u64) -> Result<()> {
        let name = file_name(path)?;
        let mut state = self.state.lock();
        let FsState { alloc, dir, .. } = &mut *state;
        let node = dir.get_mut(name).ok_or_else(|| not_found(path))?;
        truncate_node(alloc, node, newsize)
    }

    /// Read up to `maxlen` bytes at `offset` of the file at `path`.
    pub fn read_path(&self, path: &str, offset: u64, maxlen: usize) -> Result<Vec<u8>> {
        let name = file_name(path)?;
        let state = self.state.lock();
        let node = state.dir.get(name).ok_or_else(|| not_found(path))?;
        node.content.read(&state.alloc, offset, maxlen)
    }

    /// Remove the file at `path` and return its blocks.
    pub fn unlink_path(&self, path: &str) -> Result<()> {
        let name = file_name(path)?;
        let mut state = self.state.lock();
        unlink_locked(&mut state, name)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn create_locked(
        &self,
        state: &mut FsState,
        name: &[u8],
        perm: u16,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr> {
        let now = SystemTime::now();
        let node = state.dir.create(name, NodeMeta::new(perm, uid, gid, now))?;
        let attr = file_attr(node, self.config.block_size);
        state.root.touch_modified(now);
        debug!(
            ino = attr.ino.0,
            name = %String::from_utf8_lossy(name),
            "file created"
        );
        Ok(attr)
    }

    fn node_by_ino<'s>(&self, state: &'s FsState, ino: InodeNumber) -> Result<&'s FileNode> {
        if ino == ROOT_INO {
            return Err(OshError::IsDirectory);
        }
        state
            .dir
            .get_by_ino(ino)
            .ok_or_else(|| not_found(format_args!("inode {ino}")))
    }
}

/// Name of a regular file addressed by `path`.
fn file_name(path: &str) -> Result<&[u8]> {
    match resolve(path)? {
        Target::Root => Err(OshError::IsDirectory),
        Target::File(name) => Ok(name),
    }
}

fn root_attr(state: &FsState, block_size: u32) -> InodeAttr {
    let meta = &state.root;
    InodeAttr {
        ino: ROOT_INO,
        size: 0,
        blocks: 0,
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.ctime,
        crtime: meta.crtime,
        kind: FileType::Directory,
        perm: meta.perm,
        nlink: 2,
        uid: meta.uid,
        gid: meta.gid,
        rdev: 0,
        blksize: block_size,
    }
}

fn file_attr(node: &FileNode, block_size: u32) -> InodeAttr {
    let meta = &node.meta;
    InodeAttr {
        ino: node.ino,
        size: node.content.size(),
        blocks: node.content.blocks_512(block_size),
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.ctime,
        crtime: meta.crtime,
        kind: FileType::RegularFile,
        perm: meta.perm,
        nlink: 1,
        uid: meta.uid,
        gid: meta.gid,
        rdev: 0,
        blksize: block_size,
    }
}

fn list_with_attrs(state: &FsState, block_size: u32) -> Vec<(Vec<u8>, InodeAttr)> {
    state
        .dir
        .list()
        .into_iter()
        .map(|(name, ino)| {
            let attr = match state.dir.get_by_ino(ino) {
                Some(node) => file_attr(node, block_size),
                None => root_attr(state, block_size),
            };
            (name.to_vec(), attr)
        })
        .collect()
}

fn write_node(
    alloc: &mut FreeListAllocator,
    node: &mut FileNode,
    offset: u64,
    data: &[u8],
) -> Result<usize> {
    let written = node.content.write(alloc, offset, data)?;
    if written > 0 {
        node.meta.touch_modified(SystemTime::now());
    }
    Ok(written)
}

fn truncate_node(alloc: &mut FreeListAllocator, node: &mut FileNode, newsize: u64) -> Result<()> {
    let old = node.content.size();
    node.content.truncate(alloc, newsize)?;
    if old != newsize {
        node.meta.touch_modified(SystemTime::now());
        debug!(ino = node.ino.0, old, new = newsize, "file truncated");
    }
    Ok(())
}

fn unlink_locked(state: &mut FsState, name: &[u8]) -> Result<()> {
    let mut node = state.dir.remove(name)?;
    let blocks = node.content.chain().map_or(0, |c| c.blocks());
    node.content.release(&mut state.alloc);
    state.root.touch_modified(SystemTime::now());
    debug!(ino = node.ino.0, blocks, "file unlinked");
    Ok(())
}

// ── FsOps for OshFs ─────────────────────────────────────────────────────────

impl FsOps for OshFs {
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let state = self.state.lock();
        if ino == ROOT_INO {
            return Ok(root_attr(&state, self.config.block_size));
        }
        let node = self.node_by_ino(&state, ino)?;
        Ok(file_attr(node, self.config.block_size))
    }

    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        let state = self.state.lock();
        if parent != ROOT_INO {
            self.node_by_ino(&state, parent)?;
            return Err(OshError::NotDirectory);
        }
        let name = name.as_encoded_bytes();
        match name {
            b"." | b".." => Ok(root_attr(&state, self.config.block_size)),
            _ => state
                .dir
                .get(name)
                .map(|node| file_attr(node, self.config.block_size))
                .ok_or_else(|| not_found(String::from_utf8_lossy(name))),
        }
    }

    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        let state = self.state.lock();
        if ino != ROOT_INO {
            self.node_by_ino(&state, ino)?;
            return Err(OshError::NotDirectory);
        }
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(state
            .dir
            .list()
            .into_iter()
            .enumerate()
            .skip(skip)
            .map(|(idx, (name, entry_ino))| DirEntry {
                ino: entry_ino,
                offset: idx as u64 + 1,
                kind: if entry_ino == ROOT_INO {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                },
                name: name.to_vec(),
            })
            .collect())
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let node = self.node_by_ino(&state, ino)?;
        let maxlen = usize::try_from(size).unwrap_or(usize::MAX);
        node.content.read(&state.alloc, offset, maxlen)
    }

    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<u32> {
        let len = u32::try_from(data.len()).map_err(|_| {
            OshError::InvalidArgument(format!("write of {} bytes too large", data.len()))
        })?;
        if ino == ROOT_INO {
            return Err(OshError::IsDirectory);
        }
        let mut state = self.state.lock();
        let FsState { alloc, dir, .. } = &mut *state;
        let node = dir
            .get_by_ino_mut(ino)
            .ok_or_else(|| not_found(format_args!("inode {ino}")))?;
        write_node(alloc, node, offset, data)?;
        Ok(len)
    }

    fn create(
        &self,
        parent: InodeNumber,
        name: &OsStr,
        mode: u16,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr> {
        let mut state = self.state.lock();
        if parent != ROOT_INO {
            self.node_by_ino(&state, parent)?;
            return Err(OshError::NotDirectory);
        }
        self.create_locked(&mut state, name.as_encoded_bytes(), mode, uid, gid)
    }

    fn setattr(&self, ino: InodeNumber, attrs: &SetAttrRequest) -> Result<InodeAttr> {
        let mut state = self.state.lock();
        let now = SystemTime::now();

        if ino == ROOT_INO {
            if attrs.size.is_some() {
                return Err(OshError::IsDirectory);
            }
            apply_meta(&mut state.root, attrs, now);
            return Ok(root_attr(&state, self.config.block_size));
        }

        let FsState { alloc, dir, .. } = &mut *state;
        let node = dir
            .get_by_ino_mut(ino)
            .ok_or_else(|| not_found(format_args!("inode {ino}")))?;
        if let Some(size) = attrs.size {
            truncate_node(alloc, node, size)?;
        }
        apply_meta(&mut node.meta, attrs, now);
        trace!(ino = ino.0, ?attrs, "setattr applied");
        Ok(file_attr(node, self.config.block_size))
    }

    fn unlink(&self, parent: InodeNumber, name: &OsStr) -> Result<()> {
        let mut state = self.state.lock();
        if parent != ROOT_INO {
            self.node_by_ino(&state, parent)?;
            return Err(OshError::NotDirectory);
        }
        unlink_locked(&mut state, name.as_encoded_bytes())
    }

    fn statfs(&self, _ino: InodeNumber) -> Result<FsStats> {
        let state = self.state.lock();
        let files = state.dir.len() as u64 + 1;
        Ok(FsStats {
            blocks: state.alloc.total_blocks(),
            bfree: state.alloc.free_blocks(),
            bavail: state.alloc.free_blocks(),
            files,
            ffree: u64::MAX - files,
            bsize: self.config.block_size,
            namelen: MAX_NAME_LEN as u32,
            frsize: self.config.block_size,
        })
    }
}

fn apply_meta(meta: &mut NodeMeta, attrs: &SetAttrRequest, now: SystemTime) {
    let mut changed = false;
    if let Some(mode) = attrs.mode {
        meta.perm = mode & 0o7777;
        changed = true;
    }
    if let Some(uid) = attrs.uid {
        meta.uid = uid;
        changed = true;
    }
    if let Some(gid) = attrs.gid {
        meta.gid = gid;
        changed = true;
    }
    if let Some(atime) = attrs.atime {
        meta.atime = atime;
        changed = true;
    }
    if let Some(mtime) = attrs.mtime {
        meta.mtime = mtime;
        changed = true;
    }
    if changed {
        meta.ctime = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_fs() -> OshFs {
        OshFs::new(FsConfig {
            total_blocks: 64,
            block_size: BLOCK_SIZE,
            header_slots: 128,
        })
        .unwrap()
    }

    fn caller() -> Caller {
        Caller {
            uid: 1000,
            gid: 100,
        }
    }

    #[test]
    fn root_is_a_directory() {
        let fs = small_fs();
        let attr = fs.getattr(ROOT_INO).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.nlink, 2);
        assert_eq!(fs.getattr_path("/").unwrap(), attr);
    }

    #[test]
    fn created_file_has_default_attributes() {
        let fs = small_fs();
        let attr = fs.create_path("/a", &caller()).unwrap();
        assert_eq!(attr.ino, InodeNumber(2));
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, DEFAULT_FILE_PERM);
        assert_eq!((attr.uid, attr.gid), (1000, 100));
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.blocks, 0);
    }

    #[test]
    fn relative_and_nested_paths() {
        let fs = small_fs();
        assert!(matches!(
            fs.getattr_path("a"),
            Err(OshError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.create_path("/a/b", &caller()),
            Err(OshError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.getattr_path("/a/b"),
            Err(OshError::NotFound(_))
        ));
        assert!(matches!(fs.create_path("/", &caller()), Err(OshError::Exists)));
    }

    #[test]
    fn file_ops_on_root_are_rejected() {
        let fs = small_fs();
        assert!(matches!(
            fs.write_path("/", b"x", 0),
            Err(OshError::IsDirectory)
        ));
        assert!(matches!(fs.read(ROOT_INO, 0, 10), Err(OshError::IsDirectory)));
        assert!(matches!(
            fs.write(ROOT_INO, 0, b"x"),
            Err(OshError::IsDirectory)
        ));
        let truncate_root = SetAttrRequest {
            size: Some(0),
            ..SetAttrRequest::default()
        };
        assert!(matches!(
            fs.setattr(ROOT_INO, &truncate_root),
            Err(OshError::IsDirectory)
        ));
    }

    #[test]
    fn directory_ops_on_file_are_rejected() {
        let fs = small_fs();
        let attr = fs.create_path("/f", &caller()).unwrap();
        assert!(matches!(
            fs.readdir_path("/f"),
            Err(OshError::NotDirectory)
        ));
        assert!(matches!(
            fs.readdir(attr.ino, 0),
            Err(OshError::NotDirectory)
        ));
        assert!(matches!(
            fs.lookup(attr.ino, OsStr::new("x")),
            Err(OshError::NotDirectory)
        ));
    }

    #[test]
    fn lookup_and_readdir_by_inode() {
        let fs = small_fs();
        fs.create_path("/one", &caller()).unwrap();
        fs.create_path("/two", &caller()).unwrap();

        let one = fs.lookup(ROOT_INO, OsStr::new("one")).unwrap();
        assert_eq!(one.ino, InodeNumber(2));
        assert!(matches!(
            fs.lookup(ROOT_INO, OsStr::new("three")),
            Err(OshError::NotFound(_))
        ));

        let all = fs.readdir(ROOT_INO, 0).unwrap();
        let names: Vec<String> = all.iter().map(DirEntry::name_str).collect();
        assert_eq!(names, vec![".", "..", "one", "two"]);
        assert_eq!(all[0].kind, FileType::Directory);
        assert_eq!(all[2].kind, FileType::RegularFile);

        // Resuming after the cookie of "one" yields only "two".
        let rest = fs.readdir(ROOT_INO, all[2].offset).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, b"two");
        assert!(fs.readdir(ROOT_INO, all[3].offset).unwrap().is_empty());
    }

    #[test]
    fn inode_write_read_and_setattr() {
        let fs = small_fs();
        let attr = fs
            .create(ROOT_INO, OsStr::new("data"), 0o600, 7, 8)
            .unwrap();
        assert_eq!(attr.perm, 0o600);
        assert_eq!(fs.write(attr.ino, 0, b"hello world").unwrap(), 11);
        assert_eq!(fs.read(attr.ino, 6, 100).unwrap(), b"world");

        let shrink = SetAttrRequest {
            size: Some(5),
            mode: Some(0o640),
            ..SetAttrRequest::default()
        };
        let after = fs.setattr(attr.ino, &shrink).unwrap();
        assert_eq!(after.size, 5);
        assert_eq!(after.perm, 0o640);
        assert_eq!(fs.read(attr.ino, 0, 100).unwrap(), b"hello");
    }

    #[test]
    fn statfs_tracks_free_blocks() {
        let fs = small_fs();
        let before = fs.statfs(ROOT_INO).unwrap();
        assert_eq!(before.blocks, 64);
        assert_eq!(before.bfree, 64);
        assert_eq!(before.files, 1);
        assert_eq!(before.namelen, 255);

        fs.create_path("/f", &caller()).unwrap();
        fs.write_path("/f", &[1u8; 10_000], 0).unwrap();
        let after = fs.statfs(ROOT_INO).unwrap();
        assert_eq!(after.bfree, 61);
        assert_eq!(after.files, 2);
    }

    #[test]
    fn unlink_by_inode_api() {
        let fs = small_fs();
        fs.create_path("/x", &caller()).unwrap();
        fs.write_path("/x", b"abc", 0).unwrap();
        fs.unlink(ROOT_INO, OsStr::new("x")).unwrap();
        assert!(matches!(
            fs.unlink(ROOT_INO, OsStr::new("x")),
            Err(OshError::NotFound(_))
        ));
        assert_eq!(fs.alloc_stats().free_blocks, 64);
        fs.verify().unwrap();
    }

    #[test]
    fn request_op_classification() {
        assert!(RequestOp::Write.is_mutating());
        assert!(RequestOp::Unlink.is_mutating());
        assert!(!RequestOp::Read.is_mutating());
        assert!(!RequestOp::Statfs.is_mutating());
    }
}
