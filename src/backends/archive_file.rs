//! Host archive files: compression detection, decompressed streams and
//! random access into them.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::future::Cache;

use crate::fs::error::{SourceError, SourceResult};
use crate::source::{EntryReader, HostRangeReader};

const FINGERPRINT_WINDOW: u64 = 64 * 1024;

/// Spooled entries kept open per source.
const SPOOL_CACHE_ENTRIES: u64 = 16;

/// Whole-file compression wrapped around an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
    Xz,
    Gzip,
    Bzip2,
}

impl Compression {
    /// Identify the compression from the first bytes of a file.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            Compression::Zstd
        } else if magic.starts_with(&[0xFD, b'7', b'z', b'X', b'Z', 0x00]) {
            Compression::Xz
        } else if magic.starts_with(&[0x1F, 0x8B]) {
            Compression::Gzip
        } else if magic.starts_with(b"BZh") {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
            Compression::Xz => "xz",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, Compression::None | Compression::Zstd | Compression::Xz)
    }
}

/// Sequential reader over a shared file using positioned reads.
pub struct PositionedReader {
    file: Arc<File>,
    position: u64,
}

impl PositionedReader {
    pub fn new(file: Arc<File>, position: u64) -> Self {
        Self { file, position }
    }
}

impl Read for PositionedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(buf, self.position)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for PositionedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.file.metadata()?.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        self.position = target
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        Ok(self.position)
    }
}

/// An opened archive on the host filesystem.
#[derive(Debug, Clone)]
pub struct ArchiveFile {
    path: PathBuf,
    file: Arc<File>,
    size: u64,
    compression: Compression,
}

impl ArchiveFile {
    pub fn open(path: impl AsRef<Path>) -> SourceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();

        let mut magic = [0u8; 6];
        let n = file.read_at(&mut magic, 0)?;
        let compression = Compression::detect(&magic[..n]);

        tracing::debug!(
            path = %path.display(),
            size,
            compression = compression.name(),
            "Opened archive file"
        );

        Ok(Self { path, file: Arc::new(file), size, compression })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn file(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    /// Fail with `Unsupported` for compressions without a decoder.
    pub fn ensure_supported(&self) -> SourceResult<()> {
        if self.compression.is_supported() {
            Ok(())
        } else {
            Err(self.unsupported())
        }
    }

    fn unsupported(&self) -> SourceError {
        SourceError::unsupported(format!(
            "{}: {} compression is not supported",
            self.path.display(),
            self.compression.name()
        ))
    }

    /// Decompressed stream from the start of the archive.
    pub fn stream(&self) -> SourceResult<Box<dyn Read + Send>> {
        let raw = PositionedReader::new(self.file(), 0);
        let stream: Box<dyn Read + Send> = match self.compression {
            Compression::None => Box::new(raw),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(raw)?),
            Compression::Xz => Box::new(xz2::read::XzDecoder::new(raw)),
            Compression::Gzip | Compression::Bzip2 => return Err(self.unsupported()),
        };
        Ok(stream)
    }

    /// Decompressed stream positioned at `offset`.
    pub fn stream_at(&self, offset: u64) -> SourceResult<Box<dyn Read + Send>> {
        if self.compression == Compression::None {
            return Ok(Box::new(PositionedReader::new(self.file(), offset)));
        }
        let mut stream = self.stream()?;
        discard(&mut stream, offset)?;
        Ok(stream)
    }

    /// Random-access reader over `len` decompressed bytes at `start`.
    pub fn range_reader(&self, start: u64, len: u64) -> Box<dyn EntryReader> {
        match self.compression {
            Compression::None => Box::new(HostRangeReader::new(self.file(), start, len)),
            _ => Box::new(StreamRangeReader::new(self.clone(), start, len)),
        }
    }

    /// Cheap identity of the archive contents: blake3 over the size and
    /// the first and last 64 KiB.
    pub fn fingerprint(&self) -> SourceResult<String> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.size.to_le_bytes());

        let head_len = self.size.min(FINGERPRINT_WINDOW) as usize;
        let mut head = vec![0u8; head_len];
        self.file.read_exact_at(&mut head, 0)?;
        hasher.update(&head);

        if self.size > FINGERPRINT_WINDOW {
            let tail_start = self.size.saturating_sub(FINGERPRINT_WINDOW).max(FINGERPRINT_WINDOW);
            let mut tail = vec![0u8; (self.size - tail_start) as usize];
            self.file.read_exact_at(&mut tail, tail_start)?;
            hasher.update(&tail);
        }

        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// Skip `count` bytes of a stream. Running out early is corruption.
pub fn discard(stream: &mut dyn Read, count: u64) -> io::Result<()> {
    let copied = io::copy(&mut stream.take(count), &mut io::sink())?;
    if copied < count {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stream ended after {} of {} bytes", copied, count),
        ));
    }
    Ok(())
}

/// Reader over a byte range of a compressed stream.
///
/// Keeps one decoder per handle. Forward reads continue the decoder,
/// backward seeks restart it from the beginning of the archive.
pub struct StreamRangeReader {
    archive: ArchiveFile,
    start: u64,
    len: u64,
    stream: Option<Box<dyn Read + Send>>,
    // Offset within the entry that the decoder will produce next.
    cursor: u64,
}

impl StreamRangeReader {
    pub fn new(archive: ArchiveFile, start: u64, len: u64) -> Self {
        Self { archive, start, len, stream: None, cursor: 0 }
    }

    fn position_at(&mut self, offset: u64) -> io::Result<&mut Box<dyn Read + Send>> {
        let restart = match self.stream {
            Some(_) => offset < self.cursor,
            None => true,
        };
        if restart {
            tracing::debug!(
                archive = %self.archive.path().display(),
                start = self.start,
                offset,
                "Restarting decompression stream"
            );
            let stream = self.archive.stream_at(self.start).map_err(io::Error::from)?;
            self.stream = Some(stream);
            self.cursor = 0;
        }
        let skip = offset - self.cursor;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::other("decoder missing after restart"))?;
        if skip > 0 {
            discard(stream.as_mut(), skip)?;
        }
        self.cursor = offset;
        Ok(stream)
    }
}

impl EntryReader for StreamRangeReader {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let wanted = (self.len - offset).min(buf.len() as u64) as usize;
        let result = {
            let stream = self.position_at(offset)?;
            stream.read(&mut buf[..wanted])
        };
        match result {
            Ok(n) => {
                self.cursor += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }
}

/// Copy a stream into an anonymous temporary file. Used for content that
/// cannot be addressed in place.
pub fn spool_file(mut content: impl Read, expected_len: u64) -> SourceResult<Arc<File>> {
    let mut file = tempfile::tempfile()?;
    let written = io::copy(&mut content, &mut file)?;
    file.flush()?;
    if written != expected_len {
        return Err(SourceError::corrupt(format!(
            "expected {} bytes of entry content, got {}",
            expected_len, written
        )));
    }
    Ok(Arc::new(file))
}

/// Recently spooled entries keyed by their position in the archive.
///
/// Repeated `open`/`read` calls on one compressed entry decompress it once
/// while it stays cached. Spooled files are read with positioned reads, so
/// one file serves any number of handles.
#[derive(Clone)]
pub struct SpoolCache {
    files: Cache<u64, Arc<File>>,
}

impl SpoolCache {
    pub fn new(capacity: u64) -> Self {
        Self { files: Cache::new(capacity) }
    }

    /// Reader over the cached spool of `key`, if any.
    pub async fn reader(&self, key: u64, len: u64) -> Option<Box<dyn EntryReader>> {
        let file = self.files.get(&key).await?;
        Some(Box::new(HostRangeReader::new(file, 0, len)))
    }

    /// Cache a freshly spooled file and return a reader over it.
    pub async fn keep(&self, key: u64, file: Arc<File>, len: u64) -> Box<dyn EntryReader> {
        self.files.insert(key, Arc::clone(&file)).await;
        Box::new(HostRangeReader::new(file, 0, len))
    }
}

impl std::fmt::Debug for SpoolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolCache").field("entries", &self.files.entry_count()).finish()
    }
}

impl Default for SpoolCache {
    fn default() -> Self {
        Self::new(SPOOL_CACHE_ENTRIES)
    }
}
