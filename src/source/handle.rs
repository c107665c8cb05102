//! Scoped readable handles returned by `MountSource::open`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use super::file_info::FileInfo;
use crate::fs::error::{SourceError, SourceResult};

/// Random-access reader over one entry's logical content.
///
/// Offsets are relative to the start of the entry. Implementations may keep
/// internal stream state; callers never share one reader across threads.
pub trait EntryReader: Send {
    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at end of data.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// Entry content held in memory.
pub struct MemoryReader {
    data: Arc<Vec<u8>>,
}

impl MemoryReader {
    pub fn new(data: Arc<Vec<u8>>) -> Self {
        Self { data }
    }
}

impl EntryReader for MemoryReader {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let end = std::cmp::min(start + buf.len(), self.data.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(end - start)
    }
}

/// A byte range of a host file read with positioned reads.
///
/// Positioned reads do not move a shared cursor, so one `Arc<File>` can
/// back any number of concurrent readers.
pub struct HostRangeReader {
    file: Arc<File>,
    start: u64,
    len: u64,
}

impl HostRangeReader {
    pub fn new(file: Arc<File>, start: u64, len: u64) -> Self {
        Self { file, start, len }
    }
}

impl EntryReader for HostRangeReader {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let available = (self.len - offset).min(buf.len() as u64) as usize;
        self.file.read_at(&mut buf[..available], self.start + offset)
    }
}

/// Open handle on one entry. Dropping the handle releases its resources.
pub struct FileHandle {
    info: FileInfo,
    reader: Box<dyn EntryReader>,
    position: u64,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.info.path)
            .field("position", &self.position)
            .finish()
    }
}

impl FileHandle {
    pub fn new(info: FileInfo, reader: Box<dyn EntryReader>) -> Self {
        Self { info, reader, position: 0 }
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// Re-label a handle obtained from a child source.
    pub fn with_info(mut self, info: FileInfo) -> Self {
        self.info = info;
        self
    }

    /// Read exactly `size` bytes at `offset`, or fewer when the entry ends
    /// first. Running out of data before the entry's recorded size is a
    /// corruption error, never a short read.
    pub fn read_range(&mut self, size: usize, offset: u64) -> SourceResult<Vec<u8>> {
        if size == 0 || offset >= self.info.size {
            return Ok(Vec::new());
        }
        let wanted = (self.info.size - offset).min(size as u64) as usize;
        let mut buf = vec![0u8; wanted];
        let mut filled = 0;
        while filled < wanted {
            let at = offset + filled as u64;
            let n = self
                .reader
                .read_at(&mut buf[filled..], at)
                .map_err(|e| read_error(&self.info.path, at, e))?;
            if n == 0 {
                return Err(SourceError::corrupt(format!(
                    "{}: data ends at offset {} but entry size is {}",
                    self.info.path, at, self.info.size
                )));
            }
            filled += n;
        }
        Ok(buf)
    }
}

fn read_error(path: &str, offset: u64, e: io::Error) -> SourceError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
            SourceError::corrupt(format!("{}: {} at offset {}", path, e, offset))
        }
        _ => SourceError::Io(e),
    }
}

impl Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.read_range(buf.len(), self.position).map_err(io::Error::from)?;
        buf[..data.len()].copy_from_slice(&data);
        self.position += data.len() as u64;
        Ok(data.len())
    }
}

impl Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.info.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(n) => {
                self.position = n;
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start")),
        }
    }
}

impl From<SourceError> for io::Error {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Io(e) => e,
            SourceError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            SourceError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            SourceError::NotAFile(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            SourceError::Unsupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            SourceError::InvalidPath(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            SourceError::CorruptArchive(msg) => io::Error::new(io::ErrorKind::InvalidData, msg),
            SourceError::Index(msg) => io::Error::other(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::file_info::Locator;
    use chrono::Utc;
    use std::io::Write;

    fn memory_handle(data: &[u8]) -> FileHandle {
        let info = FileInfo::file("/f", 0o644, data.len() as u64, Utc::now(), Locator::Memory);
        FileHandle::new(info, Box::new(MemoryReader::new(Arc::new(data.to_vec()))))
    }

    #[test]
    fn test_read_range_exact_and_eof() {
        let mut handle = memory_handle(b"hello world");
        assert_eq!(handle.read_range(5, 0).unwrap(), b"hello");
        assert_eq!(handle.read_range(100, 6).unwrap(), b"world");
        assert!(handle.read_range(4, 11).unwrap().is_empty());
        assert!(handle.read_range(0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_short_content_is_corruption() {
        let info = FileInfo::file("/f", 0o644, 10, Utc::now(), Locator::Memory);
        let mut handle =
            FileHandle::new(info, Box::new(MemoryReader::new(Arc::new(b"abc".to_vec()))));
        let err = handle.read_range(10, 0).unwrap_err();
        assert!(matches!(err, SourceError::CorruptArchive(_)));
    }

    #[test]
    fn test_read_and_seek() {
        let mut handle = memory_handle(b"0123456789");
        handle.seek(SeekFrom::Start(4)).unwrap();
        let mut buf = [0u8; 3];
        handle.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"456");
        handle.seek(SeekFrom::End(-2)).unwrap();
        let mut rest = Vec::new();
        handle.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"89");
        assert!(handle.seek(SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn test_host_range_reader() {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"headerPAYLOADtrailer").unwrap();
        let mut reader = HostRangeReader::new(Arc::new(tmp), 6, 7);
        let mut buf = [0u8; 32];
        let n = reader.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"PAYLOAD");
        let n = reader.read_at(&mut buf, 3).unwrap();
        assert_eq!(&buf[..n], b"LOAD");
        assert_eq!(reader.read_at(&mut buf, 7).unwrap(), 0);
    }
}
