//! The entry value type shared by every mount source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::fs::path::split_path;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Default mode for directories that exist only because something below
/// them does.
pub const IMPLICIT_DIR_MODE: u32 = S_IFDIR | 0o755;

/// File type derived from the mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            S_IFIFO => FileKind::Fifo,
            S_IFCHR => FileKind::CharDevice,
            S_IFBLK => FileKind::BlockDevice,
            S_IFSOCK => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }
}

/// Where and how a backend materializes an entry's bytes.
///
/// Composing sources never look inside a locator. They only wrap it in
/// [`Locator::Layer`] to remember which child produced the entry, and
/// unwrap that layer again before delegating a read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    /// Directory synthesized from a descendant path; has no content.
    Synthetic,
    /// Entry inside a (possibly compressed) tar stream. Offsets are in the
    /// decompressed stream.
    Tar { header_offset: u64, data_offset: u64, sparse: bool },
    /// Entry inside a zip central directory.
    Zip { entry_index: usize },
    /// File on the host filesystem.
    Host { path: PathBuf },
    /// Content held in memory by the owning source.
    Memory,
    /// Entry produced by child `index` of a composing source.
    Layer { index: usize, inner: Box<Locator> },
}

impl Locator {
    pub fn layer(index: usize, inner: Locator) -> Self {
        Locator::Layer { index, inner: Box::new(inner) }
    }
}

/// One concrete filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub linkname: Option<String>,
    pub locator: Locator,
    pub version: u32,
}

impl FileInfo {
    pub fn directory(path: impl Into<String>, mode: u32, mtime: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            mode: S_IFDIR | (mode & 0o7777),
            size: 0,
            mtime,
            linkname: None,
            locator: Locator::Synthetic,
            version: 1,
        }
    }

    pub fn implicit_directory(path: impl Into<String>) -> Self {
        Self::directory(path, IMPLICIT_DIR_MODE, DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn file(
        path: impl Into<String>,
        mode: u32,
        size: u64,
        mtime: DateTime<Utc>,
        locator: Locator,
    ) -> Self {
        Self {
            path: path.into(),
            mode: S_IFREG | (mode & 0o7777),
            size,
            mtime,
            linkname: None,
            locator,
            version: 1,
        }
    }

    pub fn symlink(
        path: impl Into<String>,
        target: impl Into<String>,
        mtime: DateTime<Utc>,
        locator: Locator,
    ) -> Self {
        let target = target.into();
        Self {
            path: path.into(),
            mode: S_IFLNK | 0o777,
            size: target.len() as u64,
            mtime,
            linkname: Some(target),
            locator,
            version: 1,
        }
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind() == FileKind::RegularFile
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == FileKind::Symlink
    }

    /// Permission bits without the file type.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Last path component; empty for the root.
    pub fn name(&self) -> &str {
        split_path(&self.path).map(|(_, name)| name).unwrap_or("")
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_locator(mut self, locator: Locator) -> Self {
        self.locator = locator;
        self
    }
}
