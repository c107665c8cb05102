use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use zip::{CompressionMethod, ZipArchive};

use super::archive_file::{ArchiveFile, SpoolCache, spool_file};
use super::{ScannedEntry, emit, inline_reader, load_index};
use crate::config::Config;
use crate::fs::error::{SourceError, SourceResult};
use crate::fs::path::normalize_path;
use crate::source::file_info::{S_IFLNK, S_IFMT};
use crate::source::{
    EntryReader, FileHandle, FileInfo, HostRangeReader, Locator, MountSource, ensure_readable,
};
use crate::storage::PathIndex;

pub const BACKEND_NAME: &str = "zip";

type SharedZip = Arc<Mutex<ZipArchive<File>>>;

/// A zip archive. The central directory is shared behind a mutex; stored
/// members are read in place, compressed ones are spooled on first open.
pub struct ZipSource {
    archive: ArchiveFile,
    zip: SharedZip,
    index: PathIndex,
    spooled: SpoolCache,
}

impl std::fmt::Debug for ZipSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipSource").field("archive", &self.archive.path()).finish()
    }
}

impl ZipSource {
    pub async fn open(path: impl AsRef<Path>, config: &Config) -> SourceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let archive = ArchiveFile::open(&path)?;
        let zip = open_central_directory(&path).await?;

        let scan_zip = Arc::clone(&zip);
        let index =
            load_index(&archive, BACKEND_NAME, config, move |tx| scan(&scan_zip, &tx)).await?;

        Ok(Self { archive, zip, index, spooled: SpoolCache::default() })
    }

    /// Wrap an archive whose index is already available.
    pub async fn with_index(archive: ArchiveFile, index: PathIndex) -> SourceResult<Self> {
        let zip = open_central_directory(archive.path()).await?;
        Ok(Self { archive, zip, index, spooled: SpoolCache::default() })
    }

    pub fn index(&self) -> &PathIndex {
        &self.index
    }
}

async fn open_central_directory(path: &Path) -> SourceResult<SharedZip> {
    let path = path.to_path_buf();
    let zip = tokio::task::spawn_blocking(move || -> SourceResult<ZipArchive<File>> {
        Ok(ZipArchive::new(File::open(&path)?)?)
    })
    .await??;
    Ok(Arc::new(Mutex::new(zip)))
}

fn lock(zip: &SharedZip) -> SourceResult<std::sync::MutexGuard<'_, ZipArchive<File>>> {
    zip.lock().map_err(|_| SourceError::index("zip archive lock poisoned"))
}

/// Emit one entry per central directory record, in directory order.
pub fn scan(zip: &SharedZip, tx: &mpsc::Sender<ScannedEntry>) -> SourceResult<()> {
    let mut zip = lock(zip)?;
    for entry_index in 0..zip.len() {
        let (path, is_dir, unix_mode, size, mtime) = {
            let file = zip.by_index_raw(entry_index)?;
            (
                normalize_path(file.name()),
                file.is_dir(),
                file.unix_mode(),
                file.size(),
                zip_mtime(file.last_modified()),
            )
        };
        let locator = Locator::Zip { entry_index };

        let info = match unix_mode {
            Some(mode) if mode & S_IFMT == S_IFLNK => {
                let mut target = String::new();
                zip.by_index(entry_index)?.read_to_string(&mut target)?;
                FileInfo::symlink(path, target, mtime, locator)
            }
            _ if is_dir => FileInfo::directory(path, unix_mode.unwrap_or(0o755), mtime),
            _ => FileInfo::file(path, unix_mode.unwrap_or(0o644), size, mtime, locator),
        };

        tracing::debug!(path = %info.path, entry_index, size = info.size, "Scanned zip entry");
        emit(tx, entry_index as u64, info)?;
    }
    Ok(())
}

fn zip_mtime(dt: zip::DateTime) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)
        .and_then(|date| date.and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32))
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

enum Member {
    InPlace(Box<dyn EntryReader>),
    Spooled(Arc<File>),
}

fn open_member(
    archive: &ArchiveFile,
    zip: &SharedZip,
    entry_index: usize,
    size: u64,
) -> SourceResult<Member> {
    let mut zip = lock(zip)?;
    let member = zip.by_index(entry_index)?;
    if member.compression() == CompressionMethod::Stored {
        let reader = HostRangeReader::new(archive.file(), member.data_start(), size);
        return Ok(Member::InPlace(Box::new(reader)));
    }
    Ok(Member::Spooled(spool_file(member, size)?))
}

#[async_trait]
impl MountSource for ZipSource {
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
        let Locator::Zip { entry_index } = info.locator else {
            return Err(SourceError::unsupported(format!(
                "{}: locator {:?} does not belong to a zip archive",
                info.path, info.locator
            )));
        };
        let size = info.size;
        if let Some(reader) = self.spooled.reader(entry_index as u64, size).await {
            return Ok(FileHandle::new(info.clone(), reader));
        }

        let archive = self.archive.clone();
        let zip = Arc::clone(&self.zip);
        let member =
            tokio::task::spawn_blocking(move || open_member(&archive, &zip, entry_index, size))
                .await??;
        let reader = match member {
            Member::InPlace(reader) => reader,
            Member::Spooled(file) => self.spooled.keep(entry_index as u64, file, size).await,
        };
        Ok(FileHandle::new(info.clone(), reader))
    }

    async fn close(&self) -> SourceResult<()> {
        self.index.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_mtime_conversion() {
        let dt = zip::DateTime::from_date_and_time(2021, 3, 4, 5, 6, 8).unwrap();
        let converted = zip_mtime(dt);
        assert_eq!(converted.to_rfc3339(), "2021-03-04T05:06:08+00:00");
    }
}
