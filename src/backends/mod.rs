//! Format backends: leaves of a mounted tree.

pub mod archive_file;
pub mod folder;
pub mod persisted;
pub mod single_file;
pub mod tar_source;
pub mod zip_source;

pub use archive_file::{ArchiveFile, Compression};
pub use folder::FolderSource;
pub use persisted::PersistedIndexSource;
pub use single_file::SingleFileSource;
pub use tar_source::TarSource;
pub use zip_source::ZipSource;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::fs::error::{SourceError, SourceResult};
use crate::source::{EntryReader, FileInfo, MemoryReader, MountSource};
use crate::storage::models::{
    KEY_ARCHIVE_FINGERPRINT, KEY_ARCHIVE_PATH, KEY_ARCHIVE_SIZE, KEY_BACKEND,
};
use crate::storage::{IndexLocation, PathIndex, index_location_for};

const SCAN_CHANNEL_CAPACITY: usize = 1024;

/// An entry emitted by a scanner together with its scan position.
pub type ScannedEntry = (u64, FileInfo);

/// Container formats recognized by [`open_archive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar(Compression),
    Zip,
    Folder,
}

impl ArchiveFormat {
    /// Sniff the format of `path` from its leading bytes.
    pub fn detect(path: &Path) -> SourceResult<Self> {
        if path.is_dir() {
            return Ok(ArchiveFormat::Folder);
        }
        let archive = ArchiveFile::open(path)?;
        let mut head = [0u8; 4];
        let n = std::os::unix::fs::FileExt::read_at(&*archive.file(), &mut head, 0)?;
        if n == 4 && (head == *b"PK\x03\x04" || head == *b"PK\x05\x06") {
            return Ok(ArchiveFormat::Zip);
        }

        archive.ensure_supported()?;
        let mut block = Vec::with_capacity(512);
        archive.stream()?.take(512).read_to_end(&mut block)?;
        if block.len() >= 262 && &block[257..262] == b"ustar" {
            return Ok(ArchiveFormat::Tar(archive.compression()));
        }
        // Pre-POSIX tar has no magic, only a header checksum.
        if block.len() == 512 && tar_checksum_valid(&block) {
            return Ok(ArchiveFormat::Tar(archive.compression()));
        }

        Err(SourceError::unsupported(format!(
            "{}: unrecognized archive format",
            path.display()
        )))
    }
}

fn tar_checksum_valid(block: &[u8]) -> bool {
    let field = &block[148..156];
    let text: String = field
        .iter()
        .take_while(|b| **b != 0 && **b != b' ')
        .map(|b| *b as char)
        .collect();
    let Ok(expected) = u32::from_str_radix(text.trim(), 8) else {
        return false;
    };
    let sum: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| if (148..156).contains(&i) { b' ' as u32 } else { *b as u32 })
        .sum();
    sum == expected
}

/// Open `path` with the backend matching its format.
pub async fn open_archive(path: &Path, config: &Config) -> SourceResult<Arc<dyn MountSource>> {
    let format = {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || ArchiveFormat::detect(&path)).await??
    };
    tracing::debug!(path = %path.display(), format = ?format, "Detected archive format");

    let source: Arc<dyn MountSource> = match format {
        ArchiveFormat::Tar(_) => Arc::new(TarSource::open(path, config).await?),
        ArchiveFormat::Zip => Arc::new(ZipSource::open(path, config).await?),
        ArchiveFormat::Folder => Arc::new(FolderSource::new(path)?),
    };
    Ok(source)
}

/// Reuse the index recorded for `archive` when it still matches, otherwise
/// run `scan` on the blocking pool and build a fresh one from its output.
pub(crate) async fn load_index<F>(
    archive: &ArchiveFile,
    backend: &'static str,
    config: &Config,
    scan: F,
) -> SourceResult<PathIndex>
where
    F: FnOnce(mpsc::Sender<ScannedEntry>) -> SourceResult<()> + Send + 'static,
{
    let fingerprint = {
        let archive = archive.clone();
        tokio::task::spawn_blocking(move || archive.fingerprint()).await??
    };
    let location = index_location_for(archive.path(), &config.index);

    if config.index.reuse_existing {
        if let Some(index) = reuse_index(&location, archive, backend, &fingerprint, config).await {
            return Ok(index);
        }
    }

    let mut builder = match PathIndex::create(&location, &config.index, &config.cache).await {
        Ok(builder) => builder,
        Err(e) if location != IndexLocation::Memory => {
            tracing::warn!(
                location = ?location,
                error = %e,
                "Cannot write index file, keeping the index in memory"
            );
            PathIndex::create(&IndexLocation::Memory, &config.index, &config.cache).await?
        }
        Err(e) => return Err(e),
    };

    tracing::info!(archive = %archive.path().display(), backend, "Scanning archive");

    let (tx, mut rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
    let scanner = tokio::task::spawn_blocking(move || scan(tx));

    let mut inserted = Ok(());
    while let Some((order, info)) = rx.recv().await {
        if let Err(e) = builder.insert_at(order, info).await {
            inserted = Err(e);
            break;
        }
    }
    drop(rx);
    let scanned = scanner.await?;
    inserted?;
    scanned?;

    let archive_path = std::path::absolute(archive.path())?;
    builder.set_metadata(KEY_BACKEND, backend).await?;
    builder.set_metadata(KEY_ARCHIVE_PATH, &archive_path.to_string_lossy()).await?;
    builder.set_metadata(KEY_ARCHIVE_SIZE, &archive.size().to_string()).await?;
    builder.set_metadata(KEY_ARCHIVE_FINGERPRINT, &fingerprint).await?;

    tracing::info!(
        archive = %archive.path().display(),
        entries = builder.inserted(),
        "Archive scanned"
    );

    builder.finalize().await
}

async fn reuse_index(
    location: &IndexLocation,
    archive: &ArchiveFile,
    backend: &str,
    fingerprint: &str,
    config: &Config,
) -> Option<PathIndex> {
    let path = location.file_path()?;
    if !path.is_file() {
        return None;
    }
    let index = match PathIndex::open(path, &config.index, &config.cache).await {
        Ok(index) => index,
        Err(e) => {
            tracing::warn!(index = %path.display(), error = %e, "Cannot reuse index, rebuilding");
            return None;
        }
    };
    match index.metadata().await {
        Ok(meta)
            if meta.matches_archive(archive.size(), fingerprint)
                && meta.backend.as_deref() == Some(backend) =>
        {
            tracing::info!(index = %path.display(), "Reusing existing index");
            Some(index)
        }
        _ => {
            tracing::warn!(index = %path.display(), "Index does not match archive, rebuilding");
            index.close().await;
            None
        }
    }
}

/// Send a scanned entry to the index builder. Fails once the builder has
/// given up.
pub(crate) fn emit(
    tx: &mpsc::Sender<ScannedEntry>,
    order: u64,
    info: FileInfo,
) -> SourceResult<()> {
    tx.blocking_send((order, info))
        .map_err(|_| SourceError::index("index builder stopped accepting entries"))
}

/// Content of entries that carry no archive data of their own: a
/// symlink reads as its target, special files read as empty.
pub(crate) fn inline_reader(info: &FileInfo) -> Option<Box<dyn EntryReader>> {
    if info.is_symlink() {
        let target = info.linkname.clone().unwrap_or_default().into_bytes();
        return Some(Box::new(MemoryReader::new(Arc::new(target))));
    }
    if !info.is_file() && !info.is_dir() {
        return Some(Box::new(MemoryReader::new(Arc::new(Vec::new()))));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_detect_plain_tar() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "a.txt", &b"abc"[..]).unwrap();
        let data = builder.into_inner().unwrap();

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        assert_eq!(
            ArchiveFormat::detect(tmp.path()).unwrap(),
            ArchiveFormat::Tar(Compression::None)
        );
    }

    #[test]
    fn test_detect_zip_and_folder() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let mut zip = zip::ZipWriter::new(tmp.as_file_mut());
            zip.start_file("a.txt", zip::write::FileOptions::default()).unwrap();
            zip.write_all(b"abc").unwrap();
            zip.finish().unwrap();
        }
        assert_eq!(ArchiveFormat::detect(tmp.path()).unwrap(), ArchiveFormat::Zip);

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ArchiveFormat::detect(dir.path()).unwrap(), ArchiveFormat::Folder);
    }

    #[test]
    fn test_detect_rejects_unknown() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"just some text, not an archive").unwrap();
        assert!(matches!(ArchiveFormat::detect(tmp.path()), Err(SourceError::Unsupported(_))));
    }

    #[test]
    fn test_inline_reader_for_symlink() {
        let info = FileInfo::symlink(
            "/jet",
            "fighter",
            chrono::Utc::now(),
            crate::source::Locator::Memory,
        );
        let mut reader = inline_reader(&info).unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"fighter");
    }
}
