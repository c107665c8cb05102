use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::archive_file::{ArchiveFile, Compression, PositionedReader, SpoolCache, spool_file};
use super::{ScannedEntry, emit, inline_reader, load_index};
use crate::config::Config;
use crate::fs::error::{SourceError, SourceResult};
use crate::fs::path::normalize_path;
use crate::source::file_info::{S_IFBLK, S_IFCHR, S_IFIFO};
use crate::source::{FileHandle, FileInfo, Locator, MountSource, ensure_readable};
use crate::storage::PathIndex;

pub const BACKEND_NAME: &str = "tar";

/// A tar archive, optionally zstd- or xz-compressed.
#[derive(Debug)]
pub struct TarSource {
    archive: ArchiveFile,
    index: PathIndex,
    // Sparse members, keyed by header offset.
    spooled: SpoolCache,
}

impl TarSource {
    /// Open `path`, reusing its index when one matches, scanning otherwise.
    pub async fn open(path: impl AsRef<Path>, config: &Config) -> SourceResult<Self> {
        let archive = ArchiveFile::open(path.as_ref())?;
        archive.ensure_supported()?;

        let ignore_zeros = config.scan.ignore_zeros;
        let scan_archive = archive.clone();
        let index = load_index(&archive, BACKEND_NAME, config, move |tx| {
            scan(&scan_archive, ignore_zeros, &tx)
        })
        .await?;

        Ok(Self { archive, index, spooled: SpoolCache::default() })
    }

    /// Wrap an archive whose index is already available.
    pub fn with_index(archive: ArchiveFile, index: PathIndex) -> Self {
        Self { archive, index, spooled: SpoolCache::default() }
    }

    pub fn archive(&self) -> &ArchiveFile {
        &self.archive
    }

    pub fn index(&self) -> &PathIndex {
        &self.index
    }
}

/// Enumerate the archive in stream order and emit one entry per member.
pub fn scan(
    archive: &ArchiveFile,
    ignore_zeros: bool,
    tx: &mpsc::Sender<ScannedEntry>,
) -> SourceResult<()> {
    match archive.compression() {
        Compression::None => {
            let mut tar = tar::Archive::new(PositionedReader::new(archive.file(), 0));
            tar.set_ignore_zeros(ignore_zeros);
            let entries = tar.entries_with_seek().map_err(corrupt)?;
            emit_entries(entries, tx)
        }
        _ => {
            let mut tar = tar::Archive::new(archive.stream()?);
            tar.set_ignore_zeros(ignore_zeros);
            let entries = tar.entries().map_err(corrupt)?;
            emit_entries(entries, tx)
        }
    }
}

fn emit_entries<R: Read>(
    entries: tar::Entries<'_, R>,
    tx: &mpsc::Sender<ScannedEntry>,
) -> SourceResult<()> {
    // Regular files seen so far, for resolving hard links.
    let mut link_targets: HashMap<String, FileInfo> = HashMap::new();
    let mut count = 0u64;

    for entry in entries {
        let entry = entry.map_err(corrupt)?;
        let header = entry.header();
        let header_offset = entry.raw_header_position();
        let data_offset = entry.raw_file_position();

        let raw_path = entry.path_bytes();
        let path = normalize_path(&String::from_utf8_lossy(&raw_path));
        let permissions = header.mode().unwrap_or(0o644) & 0o7777;
        let mtime = DateTime::<Utc>::from_timestamp(header.mtime().unwrap_or(0) as i64, 0)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let mut entry_type = header.entry_type();
        // Old archives mark directories only with a trailing slash.
        if entry_type == tar::EntryType::Regular && raw_path.ends_with(b"/") {
            entry_type = tar::EntryType::Directory;
        }

        let info = match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
                let locator = Locator::Tar {
                    header_offset,
                    data_offset,
                    sparse: entry_type.is_gnu_sparse(),
                };
                let info = FileInfo::file(path.clone(), permissions, entry.size(), mtime, locator);
                link_targets.insert(path, info.clone());
                info
            }
            tar::EntryType::Directory => FileInfo::directory(path, permissions, mtime),
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name_bytes()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default();
                let locator = Locator::Tar { header_offset, data_offset, sparse: false };
                FileInfo::symlink(path, target, mtime, locator)
            }
            tar::EntryType::Link => {
                let target = entry
                    .link_name_bytes()
                    .map(|bytes| normalize_path(&String::from_utf8_lossy(&bytes)))
                    .unwrap_or_default();
                match link_targets.get(&target) {
                    Some(resolved) => {
                        let mut info = resolved.clone().with_path(path);
                        info.mtime = mtime;
                        info
                    }
                    None => {
                        tracing::warn!(path = %path, target = %target, "Skipping hard link to unknown target");
                        continue;
                    }
                }
            }
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
                let kind = match entry_type {
                    tar::EntryType::Char => S_IFCHR,
                    tar::EntryType::Block => S_IFBLK,
                    _ => S_IFIFO,
                };
                FileInfo {
                    path,
                    mode: kind | permissions,
                    size: 0,
                    mtime,
                    linkname: None,
                    locator: Locator::Synthetic,
                    version: 1,
                }
            }
            other => {
                tracing::warn!(path = %path, entry_type = ?other, "Skipping unsupported tar entry");
                continue;
            }
        };

        tracing::debug!(path = %info.path, mode = info.mode, size = info.size, "Scanned tar entry");
        emit(tx, header_offset, info)?;
        count += 1;
    }

    tracing::debug!(entries = count, "Tar scan complete");
    Ok(())
}

fn corrupt(e: std::io::Error) -> SourceError {
    SourceError::corrupt(format!("tar: {}", e))
}

/// Re-parse a sparse member at its header and materialize its content.
fn read_sparse(archive: &ArchiveFile, header_offset: u64, size: u64) -> SourceResult<Arc<File>> {
    let stream = archive.stream_at(header_offset)?;
    let mut tar = tar::Archive::new(stream);
    let mut entries = tar.entries().map_err(corrupt)?;
    let entry = entries
        .next()
        .ok_or_else(|| SourceError::corrupt(format!("no tar header at offset {}", header_offset)))?
        .map_err(corrupt)?;
    spool_file(entry, size)
}

#[async_trait]
impl MountSource for TarSource {
    async fn lookup(&self, path: &str) -> SourceResult<Option<FileInfo>> {
        self.index.lookup(path, None).await
    }

    async fn lookup_version(&self, path: &str, version: u32) -> SourceResult<Option<FileInfo>> {
        self.index.lookup(path, Some(version)).await
    }

    async fn versions(&self, path: &str) -> SourceResult<u32> {
        self.index.versions(path).await
    }

    async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>> {
        self.index.list(path).await
    }

    async fn list_modes(&self, path: &str) -> SourceResult<BTreeMap<String, u32>> {
        self.index.list_modes(path).await
    }

    async fn open(&self, info: &FileInfo) -> SourceResult<FileHandle> {
        ensure_readable(info)?;
        if let Some(reader) = inline_reader(info) {
            return Ok(FileHandle::new(info.clone(), reader));
        }
        let reader = match info.locator {
            Locator::Tar { sparse: false, data_offset, .. } => {
                self.archive.range_reader(data_offset, info.size)
            }
            Locator::Tar { sparse: true, header_offset, .. } => {
                let size = info.size;
                match self.spooled.reader(header_offset, size).await {
                    Some(reader) => reader,
                    None => {
                        let archive = self.archive.clone();
                        let file = tokio::task::spawn_blocking(move || {
                            read_sparse(&archive, header_offset, size)
                        })
                        .await??;
                        self.spooled.keep(header_offset, file, size).await
                    }
                }
            }
            ref other => {
                return Err(SourceError::unsupported(format!(
                    "{}: locator {:?} does not belong to a tar archive",
                    info.path, other
                )));
            }
        };
        Ok(FileHandle::new(info.clone(), reader))
    }

    async fn close(&self) -> SourceResult<()> {
        self.index.close().await;
        Ok(())
    }
}
