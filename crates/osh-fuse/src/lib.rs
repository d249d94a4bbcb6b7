#![forbid(unsafe_code)]
//! FUSE adapter for OshFS.
//!
//! This crate is a thin translation layer: kernel FUSE requests arrive via the
//! `fuser` crate, get forwarded to a [`FsOps`] implementation (from `osh-core`),
//! and errors are mapped through [`OshError::to_errno()`].
//!
//! A fatal error (see [`OshError::is_fatal`]) raises the adapter's shutdown
//! flag, and so does the end of the session; a managed mount observes the
//! flag and unmounts.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use osh_core::{
    DirEntry, FileType as OshFileType, FsOps, InodeAttr, RequestOp, SetAttrRequest,
};
use osh_error::OshError;
use osh_types::InodeNumber;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{error, info, trace, warn};

/// TTL for cached attributes and entries.
///
/// Contents change under the kernel's feet only through this mount, so a
/// short TTL keeps `stat` coherent after writes from other handles.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── FUSE error context ─────────────────────────────────────────────────────

/// Operation name, inode and offset of a failed request, for logging.
pub struct FuseErrorContext<'a> {
    pub error: &'a OshError,
    pub operation: &'static str,
    pub ino: u64,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log this error context via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        if self.error.is_fatal() {
            error!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "fatal filesystem error"
            );
        } else if errno == libc::ENOENT {
            // ENOENT on lookup is routine.
            trace!(
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "FUSE op returned ENOENT"
            );
        } else {
            warn!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "FUSE op failed"
            );
        }
        errno
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(ft: OshFileType) -> FileType {
    match ft {
        OshFileType::RegularFile => FileType::RegularFile,
        OshFileType::Directory => FileType::Directory,
    }
}

/// Raw name bytes of a listed entry, exactly as `lookup` will see them.
fn entry_name(entry: &DirEntry) -> &OsStr {
    OsStr::from_bytes(&entry.name)
}

fn to_file_attr(attr: &InodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

/// Permission bits of a FUSE `mode` after applying `umask`.
#[allow(clippy::cast_possible_truncation)] // masked to 12 bits
fn perm_bits(mode: u32, umask: u32) -> u16 {
    (mode & !umask & 0o7777) as u16
}

fn is_regular_mode(mode: u32) -> bool {
    let fmt = mode & u32::from(libc::S_IFMT);
    fmt == 0 || fmt == u32::from(libc::S_IFREG)
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── Cache-line padding ──────────────────────────────────────────────────────

/// Pad a value to 64 bytes to avoid false sharing between hot counters.
#[repr(C, align(64))]
pub struct CacheLinePadded<T>(pub T);

impl<T: std::fmt::Debug> std::fmt::Debug for CacheLinePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ── Atomic metrics ──────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
#[repr(C)]
pub struct AtomicMetrics {
    pub requests_total: CacheLinePadded<AtomicU64>,
    pub requests_ok: CacheLinePadded<AtomicU64>,
    pub requests_err: CacheLinePadded<AtomicU64>,
    /// Failed requests whose error was fatal to the mount.
    pub requests_fatal: CacheLinePadded<AtomicU64>,
    pub bytes_read: CacheLinePadded<AtomicU64>,
    pub bytes_written: CacheLinePadded<AtomicU64>,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_total: CacheLinePadded(AtomicU64::new(0)),
            requests_ok: CacheLinePadded(AtomicU64::new(0)),
            requests_err: CacheLinePadded(AtomicU64::new(0)),
            requests_fatal: CacheLinePadded(AtomicU64::new(0)),
            bytes_read: CacheLinePadded(AtomicU64::new(0)),
            bytes_written: CacheLinePadded(AtomicU64::new(0)),
        }
    }

    fn record_ok(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_ok.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_err(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_err.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fatal(&self) {
        self.requests_fatal.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes_read(&self, n: u64) {
        self.bytes_read.0.fetch_add(n, Ordering::Relaxed);
    }

    fn record_bytes_written(&self, n: u64) {
        self.bytes_written.0.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.0.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.0.load(Ordering::Relaxed),
            requests_err: self.requests_err.0.load(Ordering::Relaxed),
            requests_fatal: self.requests_fatal.0.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.0.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.0.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AtomicMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();
        f.debug_struct("AtomicMetrics")
            .field("requests_total", &s.requests_total)
            .field("requests_ok", &s.requests_ok)
            .field("requests_err", &s.requests_err)
            .field("requests_fatal", &s.requests_fatal)
            .field("bytes_read", &s.bytes_read)
            .field("bytes_written", &s.bytes_written)
            .finish()
    }
}

/// Point-in-time snapshot of metrics (all plain `u64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub requests_fatal: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

// ── Shared FUSE inner state ─────────────────────────────────────────────────

struct FuseInner {
    ops: Arc<dyn FsOps>,
    metrics: Arc<AtomicMetrics>,
    /// Raised on the first fatal error and when the session ends.
    shutdown: Arc<AtomicBool>,
    read_only: bool,
}

impl std::fmt::Debug for FuseInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseInner")
            .field("metrics", &self.metrics)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter that delegates all operations to a [`FsOps`] implementation.
pub struct OshFuse {
    inner: Arc<FuseInner>,
}

// Compile-time assertions: OshFuse must be Send + Sync.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<OshFuse>;
};

impl OshFuse {
    /// Create an adapter with default mount options.
    #[must_use]
    pub fn new(ops: Box<dyn FsOps>) -> Self {
        Self::with_options(ops, &MountOptions::default())
    }

    #[must_use]
    pub fn with_options(ops: Box<dyn FsOps>, options: &MountOptions) -> Self {
        info!(read_only = options.read_only, "OshFuse initialized");
        Self {
            inner: Arc::new(FuseInner {
                ops: Arc::from(ops),
                metrics: Arc::new(AtomicMetrics::new()),
                shutdown: Arc::new(AtomicBool::new(false)),
                read_only: options.read_only,
            }),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &AtomicMetrics {
        &self.inner.metrics
    }

    /// Flag raised when a request hits a fatal error or the session ends.
    #[must_use]
    pub fn shutdown_flag(&self) -> &Arc<AtomicBool> {
        &self.inner.shutdown
    }

    /// Run one request body, updating metrics and raising the shutdown flag
    /// on fatal errors.
    fn run_op<T, F>(&self, op: RequestOp, f: F) -> osh_error::Result<T>
    where
        F: FnOnce(&dyn FsOps) -> osh_error::Result<T>,
    {
        match f(self.inner.ops.as_ref()) {
            Ok(value) => {
                self.inner.metrics.record_ok();
                Ok(value)
            }
            Err(err) => {
                self.inner.metrics.record_err();
                if err.is_fatal() {
                    self.inner.metrics.record_fatal();
                    if !self.inner.shutdown.swap(true, Ordering::Relaxed) {
                        error!(?op, error = %err, "raising shutdown after fatal error");
                    }
                }
                Err(err)
            }
        }
    }

    /// Reject mutating requests on a read-only mount.
    fn deny_write(&self, op: RequestOp) -> Option<c_int> {
        if self.inner.read_only && op.is_mutating() {
            self.inner.metrics.record_err();
            Some(libc::EROFS)
        } else {
            None
        }
    }
}

impl Filesystem for OshFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(read_only = self.inner.read_only, "FUSE session started");
        Ok(())
    }

    fn destroy(&mut self) {
        let snap = self.inner.metrics.snapshot();
        info!(
            requests_total = snap.requests_total,
            requests_err = snap.requests_err,
            "FUSE session ended"
        );
        // Wakes a `MountHandle::wait` after an external unmount.
        self.inner.shutdown.store(true, Ordering::Relaxed);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.run_op(RequestOp::Getattr, |ops| ops.getattr(InodeNumber(ino))) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "getattr",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.run_op(RequestOp::Lookup, |ops| {
            ops.lookup(InodeNumber(parent), name)
        }) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "lookup",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        // Stateless open: no file handles are tracked.
        match self.run_op(RequestOp::Open, |ops| ops.getattr(InodeNumber(ino))) {
            Ok(_) => reply.opened(0, 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "open",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.run_op(RequestOp::Opendir, |ops| {
            let attr = ops.getattr(InodeNumber(ino))?;
            if attr.kind == OshFileType::Directory {
                Ok(())
            } else {
                Err(OshError::NotDirectory)
            }
        }) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "opendir",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.run_op(RequestOp::Read, |ops| {
            ops.read(InodeNumber(ino), byte_offset, size)
        }) {
            Ok(data) => {
                self.inner
                    .metrics
                    .record_bytes_read(u64::try_from(data.len()).unwrap_or(u64::MAX));
                reply.data(&data);
            }
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "read",
                    ino,
                    offset: Some(byte_offset),
                }
                .log_and_errno(),
            ),
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
        let fs_offset = u64::try_from(offset).unwrap_or(0);
        match self.run_op(RequestOp::Readdir, |ops| {
            ops.readdir(InodeNumber(ino), fs_offset)
        }) {
            Ok(entries) => {
                for entry in &entries {
                    let full = reply.add(
                        entry.ino.0,
                        i64::try_from(entry.offset).unwrap_or(i64::MAX),
                        to_fuser_file_type(entry.kind),
                        entry_name(entry),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "readdir",
                    ino,
                    offset: Some(fs_offset),
                }
                .log_and_errno(),
            ),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.run_op(RequestOp::Statfs, |ops| ops.statfs(InodeNumber(ino))) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "statfs",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    // ── Write operations ─────────────────────────────────────────────────

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
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if let Some(errno) = self.deny_write(RequestOp::Setattr) {
            reply.error(errno);
            return;
        }
        let resolve_time = |t: TimeOrNow| -> SystemTime {
            match t {
                TimeOrNow::SpecificTime(st) => st,
                TimeOrNow::Now => SystemTime::now(),
            }
        };
        let attrs = SetAttrRequest {
            mode: mode.map(|m| perm_bits(m, 0)),
            uid,
            gid,
            size,
            atime: atime.map(resolve_time),
            mtime: mtime.map(resolve_time),
        };
        match self.run_op(RequestOp::Setattr, |ops| {
            ops.setattr(InodeNumber(ino), &attrs)
        }) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "setattr",
                    ino,
                    offset: size,
                }
                .log_and_errno(),
            ),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if let Some(errno) = self.deny_write(RequestOp::Mknod) {
            reply.error(errno);
            return;
        }
        if !is_regular_mode(mode) {
            warn!(parent, mode, "mknod of non-regular file refused");
            self.inner.metrics.record_err();
            reply.error(libc::EPERM);
            return;
        }
        match self.run_op(RequestOp::Mknod, |ops| {
            ops.create(
                InodeNumber(parent),
                name,
                perm_bits(mode, umask),
                req.uid(),
                req.gid(),
            )
        }) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "mknod",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if let Some(errno) = self.deny_write(RequestOp::Unlink) {
            reply.error(errno);
            return;
        }
        match self.run_op(RequestOp::Unlink, |ops| {
            ops.unlink(InodeNumber(parent), name)
        }) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "unlink",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if let Some(errno) = self.deny_write(RequestOp::Write) {
            reply.error(errno);
            return;
        }
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.run_op(RequestOp::Write, |ops| {
            ops.write(InodeNumber(ino), byte_offset, data)
        }) {
            Ok(written) => {
                self.inner
                    .metrics
                    .record_bytes_written(u64::from(written));
                reply.written(written);
            }
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "write",
                    ino,
                    offset: Some(byte_offset),
                }
                .log_and_errno(),
            ),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        if let Some(errno) = self.deny_write(RequestOp::Create) {
            reply.error(errno);
            return;
        }
        match self.run_op(RequestOp::Create, |ops| {
            ops.create(
                InodeNumber(parent),
                name,
                perm_bits(mode, umask),
                req.uid(),
                req.gid(),
            )
        }) {
            Ok(attr) => reply.created(&ATTR_TTL, &to_file_attr(&attr), 0, 0, 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "create",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("oshfs".to_owned()),
        MountOption::Subtype("oshfs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];

    if options.read_only {
        opts.push(MountOption::RO);
    } else {
        opts.push(MountOption::RW);
    }
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

fn check_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    if !mountpoint.is_dir() {
        return Err(FuseError::InvalidMountpoint(format!(
            "mountpoint does not exist or is not a directory: {}",
            mountpoint.display()
        )));
    }
    Ok(())
}

/// Mount at `mountpoint` and block until the filesystem is unmounted.
pub fn mount(
    ops: Box<dyn FsOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    let fs = OshFuse::with_options(ops, options);
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background. Dropping the returned session unmounts.
pub fn mount_background(
    ops: Box<dyn FsOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    let fs = OshFuse::with_options(ops, options);
    let session = fuser::spawn_mount2(fs, mountpoint, &fuse_opts)?;
    Ok(session)
}

// ── Mount lifecycle ─────────────────────────────────────────────────────────

/// Handle for a live FUSE mount with lifecycle control.
///
/// Dropping the handle unmounts. [`MountHandle::wait`] blocks until the
/// shutdown flag is set: by the owner (a signal handler or another
/// thread), by the adapter after a fatal error, or by the session ending
/// after an external unmount. `requests_fatal` in the returned snapshot
/// tells a fatal shutdown apart from a clean one.
pub struct MountHandle {
    session: Option<fuser::BackgroundSession>,
    mountpoint: PathBuf,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<AtomicMetrics>,
}

impl MountHandle {
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Shared shutdown flag; storing `true` triggers a graceful unmount.
    #[must_use]
    pub fn shutdown_flag(&self) -> &Arc<AtomicBool> {
        &self.shutdown
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Block until the shutdown flag is set, then unmount cleanly.
    ///
    /// Returns the final metrics snapshot.
    #[must_use]
    pub fn wait(mut self) -> MetricsSnapshot {
        info!(mountpoint = %self.mountpoint.display(), "waiting for shutdown signal");
        while !self.shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
        }
        info!(mountpoint = %self.mountpoint.display(), "shutdown signal received");
        self.do_unmount()
    }

    /// Unmount now and return the final metrics snapshot.
    #[must_use]
    pub fn unmount(mut self) -> MetricsSnapshot {
        self.do_unmount()
    }

    fn do_unmount(&mut self) -> MetricsSnapshot {
        let snap = self.metrics.snapshot();
        if let Some(session) = self.session.take() {
            info!(
                mountpoint = %self.mountpoint.display(),
                requests_total = snap.requests_total,
                requests_ok = snap.requests_ok,
                requests_err = snap.requests_err,
                bytes_read = snap.bytes_read,
                bytes_written = snap.bytes_written,
                "unmounting FUSE filesystem"
            );
            drop(session);
            info!(mountpoint = %self.mountpoint.display(), "unmount complete");
        }
        snap
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.do_unmount();
        }
    }
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("active", &self.session.is_some())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

/// Mount with full lifecycle control.
///
/// # Example
/// ```no_run
/// # use osh_fuse::{MountOptions, mount_managed};
/// # use osh_core::{FsConfig, OshFs};
/// let fs = OshFs::new(FsConfig::default()).unwrap();
/// let handle = mount_managed(Box::new(fs), "/mnt/osh", &MountOptions::default()).unwrap();
/// let flag = handle.shutdown_flag().clone();
/// // ... register a signal handler that stores `true` into `flag` ...
/// let stats = handle.wait();
/// println!("served {} requests", stats.requests_total);
/// ```
pub fn mount_managed(
    ops: Box<dyn FsOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<MountHandle, FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;

    info!(
        mountpoint = %mountpoint.display(),
        read_only = options.read_only,
        allow_other = options.allow_other,
        "mounting OshFS"
    );

    let fuse_opts = build_mount_options(options);
    let fs = OshFuse::with_options(ops, options);
    let metrics = Arc::clone(&fs.inner.metrics);
    let shutdown = Arc::clone(&fs.inner.shutdown);

    let session = fuser::spawn_mount2(fs, mountpoint, &fuse_opts)?;

    info!(mountpoint = %mountpoint.display(), "FUSE mount active");

    Ok(MountHandle {
        session: Some(session),
        mountpoint: mountpoint.to_owned(),
        shutdown,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use osh_core::{Caller, FsConfig, FsStats, OshFs, ROOT_INO};

    /// Minimal FsOps stub for tests that don't need real filesystem behavior.
    struct StubFs;
    impl FsOps for StubFs {
        fn getattr(&self, _ino: InodeNumber) -> osh_error::Result<InodeAttr> {
            Err(OshError::NotFound("stub".into()))
        }
        fn lookup(&self, _parent: InodeNumber, _name: &OsStr) -> osh_error::Result<InodeAttr> {
            Err(OshError::NotFound("stub".into()))
        }
        fn readdir(&self, _ino: InodeNumber, _offset: u64) -> osh_error::Result<Vec<DirEntry>> {
            Ok(vec![])
        }
        fn read(&self, _ino: InodeNumber, _offset: u64, _size: u32) -> osh_error::Result<Vec<u8>> {
            Ok(vec![])
        }
        fn write(&self, _ino: InodeNumber, _offset: u64, data: &[u8]) -> osh_error::Result<u32> {
            Ok(u32::try_from(data.len()).unwrap())
        }
        fn create(
            &self,
            _parent: InodeNumber,
            _name: &OsStr,
            _mode: u16,
            _uid: u32,
            _gid: u32,
        ) -> osh_error::Result<InodeAttr> {
            Err(OshError::PoolExhausted { capacity: 1 })
        }
        fn setattr(
            &self,
            _ino: InodeNumber,
            _attrs: &SetAttrRequest,
        ) -> osh_error::Result<InodeAttr> {
            Err(OshError::NotFound("stub".into()))
        }
        fn unlink(&self, _parent: InodeNumber, _name: &OsStr) -> osh_error::Result<()> {
            Ok(())
        }
        fn statfs(&self, _ino: InodeNumber) -> osh_error::Result<FsStats> {
            Err(OshError::NotFound("stub".into()))
        }
    }

    fn sample_attr() -> InodeAttr {
        InodeAttr {
            ino: InodeNumber(42),
            size: 1024,
            blocks: 8,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind: OshFileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            blksize: 4096,
        }
    }

    fn handle_without_session(mountpoint: &str) -> MountHandle {
        MountHandle {
            session: None,
            mountpoint: PathBuf::from(mountpoint),
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(AtomicMetrics::new()),
        }
    }

    #[test]
    fn file_type_conversion() {
        assert_eq!(
            to_fuser_file_type(OshFileType::RegularFile),
            FileType::RegularFile
        );
        assert_eq!(
            to_fuser_file_type(OshFileType::Directory),
            FileType::Directory
        );
    }

    #[test]
    fn inode_attr_to_file_attr_conversion() {
        let fattr = to_file_attr(&sample_attr());
        assert_eq!(fattr.ino, 42);
        assert_eq!(fattr.size, 1024);
        assert_eq!(fattr.blocks, 8);
        assert_eq!(fattr.kind, FileType::RegularFile);
        assert_eq!(fattr.perm, 0o644);
        assert_eq!(fattr.nlink, 1);
        assert_eq!(fattr.uid, 1000);
        assert_eq!(fattr.blksize, 4096);
        assert_eq!(fattr.flags, 0);
    }

    #[test]
    fn mode_helpers() {
        assert_eq!(perm_bits(0o100_666, 0o022), 0o644);
        assert_eq!(perm_bits(0o4755, 0), 0o4755);
        assert!(is_regular_mode(0o100_644));
        assert!(is_regular_mode(0o644));
        assert!(!is_regular_mode(u32::from(libc::S_IFIFO) | 0o644));
        assert!(!is_regular_mode(u32::from(libc::S_IFCHR) | 0o600));
    }

    #[test]
    fn mount_options_default_is_read_write() {
        let opts = MountOptions::default();
        assert!(!opts.read_only);
        assert!(!opts.allow_other);
        assert!(opts.auto_unmount);
    }

    #[test]
    fn build_mount_options_reflects_flags() {
        let rw = build_mount_options(&MountOptions::default());
        assert!(rw.contains(&MountOption::RW));
        assert!(!rw.contains(&MountOption::RO));
        assert!(rw.contains(&MountOption::AutoUnmount));
        assert!(rw.contains(&MountOption::FSName("oshfs".to_owned())));

        let ro = build_mount_options(&MountOptions {
            read_only: true,
            allow_other: true,
            auto_unmount: false,
        });
        assert!(ro.contains(&MountOption::RO));
        assert!(ro.contains(&MountOption::AllowOther));
        assert!(!ro.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn fuse_error_context_returns_correct_errno() {
        let cases: Vec<(OshError, libc::c_int)> = vec![
            (OshError::NotFound("test".into()), libc::ENOENT),
            (OshError::IsDirectory, libc::EISDIR),
            (OshError::NotDirectory, libc::ENOTDIR),
            (OshError::NoSpace, libc::ENOSPC),
            (OshError::NameTooLong, libc::ENAMETOOLONG),
            (OshError::Exists, libc::EEXIST),
            (OshError::InvalidArgument("bad".into()), libc::EINVAL),
            (OshError::PoolExhausted { capacity: 4096 }, libc::EIO),
            (
                OshError::Corruption {
                    block: 0,
                    detail: "adjacent".into(),
                },
                libc::EIO,
            ),
        ];

        for (error, expected) in &cases {
            let ctx = FuseErrorContext {
                error,
                operation: "test_op",
                ino: 42,
                offset: None,
            };
            assert_eq!(ctx.log_and_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn run_op_updates_metrics() {
        let fuse = OshFuse::new(Box::new(StubFs));
        let _ = fuse.run_op(RequestOp::Read, |ops| ops.read(InodeNumber(2), 0, 10));
        let _ = fuse.run_op(RequestOp::Getattr, |ops| ops.getattr(InodeNumber(2)));

        let s = fuse.metrics().snapshot();
        assert_eq!(s.requests_total, 2);
        assert_eq!(s.requests_ok, 1);
        assert_eq!(s.requests_err, 1);
        assert!(!fuse.shutdown_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn fatal_error_raises_shutdown_flag() {
        let fuse = OshFuse::new(Box::new(StubFs));
        let err = fuse
            .run_op(RequestOp::Create, |ops| {
                ops.create(InodeNumber(1), OsStr::new("x"), 0o644, 0, 0)
            })
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(fuse.shutdown_flag().load(Ordering::Relaxed));
        assert_eq!(fuse.metrics().snapshot().requests_fatal, 1);
    }

    #[test]
    fn session_end_raises_shutdown_without_fatal_errors() {
        let mut fuse = OshFuse::new(Box::new(StubFs));
        let _ = fuse.run_op(RequestOp::Getattr, |ops| ops.getattr(InodeNumber(2)));
        assert!(!fuse.shutdown_flag().load(Ordering::Relaxed));

        Filesystem::destroy(&mut fuse);
        assert!(fuse.shutdown_flag().load(Ordering::Relaxed));
        let snap = fuse.metrics().snapshot();
        assert_eq!(snap.requests_err, 1);
        assert_eq!(snap.requests_fatal, 0);
    }

    #[test]
    fn listed_non_utf8_name_resolves_to_the_same_file() {
        let fs = OshFs::new(FsConfig {
            total_blocks: 16,
            block_size: 4096,
            header_slots: 16,
        })
        .unwrap();
        let raw: &[u8] = b"bad\xFFname";
        let created = fs
            .create(ROOT_INO, OsStr::from_bytes(raw), 0o644, 0, 0)
            .unwrap();

        let entries = fs.readdir(ROOT_INO, 0).unwrap();
        let listed = entry_name(&entries[2]);
        assert_eq!(listed.as_bytes(), raw);

        let found = fs.lookup(ROOT_INO, listed).unwrap();
        assert_eq!(found.ino, created.ino);
        fs.unlink(ROOT_INO, listed).unwrap();
        assert_eq!(fs.file_count(), 0);
    }

    #[test]
    fn pool_exhaustion_in_real_filesystem_requests_shutdown() {
        let fs = OshFs::new(FsConfig {
            total_blocks: 64,
            block_size: 4096,
            header_slots: 2,
        })
        .unwrap();
        let a = fs.create_path("/a", &Caller::default()).unwrap();
        let b = fs.create_path("/b", &Caller::default()).unwrap();
        let fuse = OshFuse::new(Box::new(fs));

        fuse.run_op(RequestOp::Write, |ops| ops.write(a.ino, 0, b"one"))
            .unwrap();
        assert!(!fuse.shutdown_flag().load(Ordering::Relaxed));

        let err = fuse
            .run_op(RequestOp::Write, |ops| ops.write(b.ino, 0, b"two"))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(fuse.shutdown_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn read_only_denies_only_mutations() {
        let opts = MountOptions {
            read_only: true,
            ..MountOptions::default()
        };
        let fuse = OshFuse::with_options(Box::new(StubFs), &opts);
        assert_eq!(fuse.deny_write(RequestOp::Write), Some(libc::EROFS));
        assert_eq!(fuse.deny_write(RequestOp::Unlink), Some(libc::EROFS));
        assert_eq!(fuse.deny_write(RequestOp::Read), None);
        assert_eq!(fuse.metrics().snapshot().requests_err, 2);

        let rw = OshFuse::new(Box::new(StubFs));
        assert_eq!(rw.deny_write(RequestOp::Write), None);
    }

    #[test]
    fn oshfuse_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OshFuse>();
        assert_send_sync::<FuseInner>();
        assert_send_sync::<AtomicMetrics>();
    }

    #[test]
    fn atomic_metrics_record_and_snapshot() {
        let m = AtomicMetrics::new();
        assert_eq!(m.snapshot().requests_total, 0);
        m.record_ok();
        m.record_ok();
        m.record_err();
        m.record_bytes_read(1024);
        m.record_bytes_written(512);
        let s = m.snapshot();
        assert_eq!(s.requests_total, 3);
        assert_eq!(s.requests_ok, 2);
        assert_eq!(s.requests_err, 1);
        assert_eq!(s.bytes_read, 1024);
        assert_eq!(s.bytes_written, 512);
    }

    #[test]
    fn cache_line_padded_alignment() {
        assert_eq!(std::mem::align_of::<CacheLinePadded<AtomicU64>>(), 64);
    }

    #[test]
    fn concurrent_metrics_stress() {
        let metrics = Arc::new(AtomicMetrics::new());
        let barrier = Arc::new(std::sync::Barrier::new(10));

        std::thread::scope(|s| {
            for _ in 0..10 {
                let m = Arc::clone(&metrics);
                let b = Arc::clone(&barrier);
                s.spawn(move || {
                    b.wait();
                    for _ in 0..1000 {
                        m.record_ok();
                        m.record_bytes_written(512);
                    }
                });
            }
        });

        let s = metrics.snapshot();
        assert_eq!(s.requests_total, 10_000);
        assert_eq!(s.bytes_written, 10_000 * 512);
    }

    #[test]
    fn concurrent_writers_share_one_filesystem() {
        let fs = OshFs::new(FsConfig {
            total_blocks: 1024,
            block_size: 4096,
            header_slots: 1024,
        })
        .unwrap();
        let inos: Vec<InodeNumber> = (0..8)
            .map(|i| fs.create_path(&format!("/f{i}"), &Caller::default()).unwrap().ino)
            .collect();
        let fuse = OshFuse::new(Box::new(fs));

        std::thread::scope(|s| {
            for &ino in &inos {
                let fuse = &fuse;
                s.spawn(move || {
                    for chunk in 0..16u64 {
                        fuse.run_op(RequestOp::Write, |ops| {
                            ops.write(ino, chunk * 1000, &[7u8; 1000])
                        })
                        .unwrap();
                    }
                });
            }
        });

        for &ino in &inos {
            let attr = fuse.inner.ops.getattr(ino).unwrap();
            assert_eq!(attr.size, 16_000);
        }
        assert_eq!(fuse.metrics().snapshot().requests_ok, 8 * 16);
    }

    // ── Mount lifecycle tests ─────────────────────────────────────────

    #[test]
    fn mount_managed_rejects_empty_mountpoint() {
        let err = mount_managed(Box::new(StubFs), "", &MountOptions::default()).unwrap_err();
        assert!(
            err.to_string().contains("empty"),
            "expected 'empty' in error: {err}"
        );
    }

    #[test]
    fn mount_managed_rejects_nonexistent_mountpoint() {
        let err = mount_managed(
            Box::new(StubFs),
            "/tmp/oshfs_no_such_dir_xyzzy",
            &MountOptions::default(),
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("does not exist"),
            "expected 'does not exist' in error: {err}"
        );
    }

    #[test]
    fn mount_handle_shutdown_flag_lifecycle() {
        let handle = handle_without_session("/mnt/test");
        handle.metrics.record_ok();
        handle.metrics.record_bytes_read(8192);

        assert!(!handle.shutdown_flag().load(Ordering::Relaxed));
        let snap = handle.metrics_snapshot();
        assert_eq!(snap.requests_ok, 1);
        assert_eq!(snap.bytes_read, 8192);

        let final_snap = handle.unmount();
        assert_eq!(final_snap.requests_ok, 1);
    }

    #[test]
    fn mount_handle_debug_format() {
        let handle = handle_without_session("/mnt/dbg");
        let dbg = format!("{handle:?}");
        assert!(dbg.contains("MountHandle"), "missing struct name: {dbg}");
        assert!(dbg.contains("/mnt/dbg"), "missing mountpoint: {dbg}");
        assert!(dbg.contains("active: false"), "missing active: {dbg}");
        assert!(dbg.contains("shutdown: false"), "missing shutdown: {dbg}");
    }

    #[test]
    fn mount_handle_drop_is_safe_without_session() {
        drop(handle_without_session("/mnt/drop"));
    }

    #[test]
    fn mount_handle_wait_returns_on_shutdown() {
        let handle = handle_without_session("/mnt/wait");
        handle.metrics.record_ok();
        let trigger = Arc::clone(handle.shutdown_flag());

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.store(true, Ordering::Relaxed);
        });

        let snap = handle.wait();
        assert_eq!(snap.requests_ok, 1);
    }
}
