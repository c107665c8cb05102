// Mount source contract
//
// Every archive backend and every composing source implements MountSource.
// The FUSE adapter and the CLI only ever talk to this trait, so a mounted
// tree can mix plain archives, nested archives, persisted indexes and
// synthetic sources freely.

use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::collections::BTreeMap;

use super::file_info::FileInfo;
use super::handle::FileHandle;
use crate::fs::error::{SourceError, SourceResult};

/// Capability contract for a read-only tree of entries.
///
/// Paths are normalized absolute paths. All methods take `&self` and may be
/// called concurrently; reads through one [`FileHandle`] are sequential.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait MountSource: Send + Sync {
    /// Latest version of `path`, or `None` when absent.
    async fn lookup(&self, path: &str) -> SourceResult<Option<FileInfo>>;

    /// A specific 1-based version of `path`.
    async fn lookup_version(&self, path: &str, version: u32) -> SourceResult<Option<FileInfo>>;

    /// Number of versions stored for `path`; 0 when absent.
    async fn versions(&self, path: &str) -> SourceResult<u32>;

    /// Children of a directory keyed by name.
    async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>>;

    /// Like `list` but only the mode bits of each child.
    async fn list_modes(&self, path: &str) -> SourceResult<BTreeMap<String, u32>> {
        let children = self.list(path).await?;
        Ok(children.into_iter().map(|(name, info)| (name, info.mode)).collect())
    }

    /// Acquire a handle that streams the entry's bytes.
    async fn open(&self, info: &FileInfo) -> SourceResult<FileHandle>;

    /// Read `size` bytes at `offset` of the entry's logical content.
    ///
    /// Returns fewer bytes only at end of file. The default opens a new
    /// handle per call; callers issuing many small reads should hold a
    /// [`FileHandle`] from `open` instead.
    async fn read(&self, info: &FileInfo, size: usize, offset: u64) -> SourceResult<Vec<u8>> {
        let mut handle = self.open(info).await?;
        tokio::task::spawn_blocking(move || handle.read_range(size, offset)).await?
    }

    /// Release archive descriptors and index connections.
    async fn close(&self) -> SourceResult<()> {
        Ok(())
    }
}

/// Fail unless `info` can be opened for reading.
pub fn ensure_readable(info: &FileInfo) -> SourceResult<()> {
    if info.is_dir() {
        return Err(SourceError::not_a_file(info.path.clone()));
    }
    Ok(())
}

/// Resolve `path` for a listing: `NotFound` when absent, `NotADirectory`
/// when it is something else.
pub async fn require_directory<S: MountSource + ?Sized>(
    source: &S,
    path: &str,
) -> SourceResult<FileInfo> {
    match source.lookup(path).await? {
        Some(info) if info.is_dir() => Ok(info),
        Some(_) => Err(SourceError::not_a_directory(path)),
        None => Err(SourceError::not_found(path)),
    }
}
