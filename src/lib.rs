//! Read-only virtual filesystem over archives.
//!
//! Archives (tar, compressed tar, zip) and host directories are exposed
//! through one [`MountSource`](source::MountSource) contract. Archive
//! metadata lives in a SQLite [`PathIndex`](storage::PathIndex) that can be
//! persisted next to the archive and reused. Sources compose through the
//! layers in [`layer`] and can be mounted with FUSE.

pub mod backends;
pub mod config;
pub mod fs;
pub mod fuse;
pub mod layer;
pub mod source;
pub mod storage;
