#![forbid(unsafe_code)]
//! Error types for OshFS.
//!
//! # Error Taxonomy
//!
//! Every layer (header pool, extent allocator, file store, directory, FUSE
//! adapter) reports failures through the single [`OshError`] type. Errors are
//! per-call: the mount stays usable after any of them except the fatal ones
//! listed below.
//!
//! ## Severity
//!
//! | Variant | Fatal | Reason |
//! |---------|-------|--------|
//! | `PoolExhausted` | yes | the allocator's own bookkeeping storage is saturated |
//! | `Corruption` | yes | an allocator invariant was found violated |
//! | everything else | no | reported to the caller, mount continues |
//!
//! The FUSE adapter consults [`OshError::is_fatal`] and raises the mount's
//! shutdown flag when it returns `true`.
//!
//! ## FUSE errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`OshError::to_errno`].
//! The match is exhaustive, so a new variant does not compile until its errno
//! is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `PoolExhausted` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `InvalidArgument` | `EINVAL` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotDirectory` | `ENOTDIR` |

use thiserror::Error;

/// Unified error type for all OshFS operations.
#[derive(Debug, Error)]
pub enum OshError {
    /// Every extent-header slot is in use.
    ///
    /// No further allocation or split can proceed, so the mount is expected
    /// to shut down.
    #[error("extent header pool exhausted ({capacity} slots in use)")]
    PoolExhausted { capacity: usize },

    /// An allocator invariant does not hold.
    ///
    /// `block` is the first block of the offending range.
    #[error("allocator corruption at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// No free blocks remain to satisfy a request.
    #[error("no space left on device")]
    NoSpace,

    /// Path or inode not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target name already exists.
    #[error("file exists")]
    Exists,

    /// Name exceeds the directory's length limit.
    #[error("name too long")]
    NameTooLong,

    /// Malformed argument (bad file name, zero-length allocation, bad config).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Attempted a file operation on the root directory.
    #[error("is a directory")]
    IsDirectory,

    /// A directory operation addressed a regular file.
    #[error("not a directory")]
    NotDirectory,
}

impl OshError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// `PoolExhausted` maps to `EIO` rather than `ENOSPC`: data blocks may
    /// well be free, it is the metadata that cannot grow.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::PoolExhausted { .. } | Self::Corruption { .. } => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::IsDirectory => libc::EISDIR,
            Self::NotDirectory => libc::ENOTDIR,
        }
    }

    /// Whether the error leaves the mount unable to continue safely.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Corruption { .. })
    }
}

/// Result alias using `OshError`.
pub type Result<T> = std::result::Result<T, OshError>;
