#![forbid(unsafe_code)]
//! OshFS public API facade.
//!
//! Re-exports the filesystem from `osh-core` through a stable external
//! interface. Downstream consumers embed [`OshFs`] through this crate and
//! drive it with the path API or [`FsOps`].

pub use osh_core::*;
