use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::inline_reader;
use crate::fs::error::{SourceError, SourceResult};
use crate::fs::path::{join_path, normalize_path, path_components};
use crate::source::{FileHandle, FileInfo, HostRangeReader, Locator, MountSource, ensure_readable};

/// A directory on the host filesystem.
#[derive(Debug, Clone)]
pub struct FolderSource {
    root: PathBuf,
}

impl FolderSource {
    pub fn new(root: impl AsRef<Path>) -> SourceResult<Self> {
        let root = std::path::absolute(root.as_ref())?;
        if !root.is_dir() {
            return Err(SourceError::not_a_directory(root.display().to_string()));
        }
        Ok(Self { root })
    }

    fn host_path(&self, path: &str) -> (String, PathBuf) {
        let normalized = normalize_path(path);
        let mut host = self.root.clone();
        for component in path_components(&normalized) {
            host.push(component);
        }
        (normalized, host)
    }

    async fn stat(&self, path: &str) -> SourceResult<Option<FileInfo>> {
        let (normalized, host) = self.host_path(path);
        let metadata = match tokio::fs::symlink_metadata(&host).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let linkname = if metadata.file_type().is_symlink() {
            Some(tokio::fs::read_link(&host).await?.to_string_lossy().into_owned())
        } else {
            None
        };
        Ok(Some(to_file_info(normalized, host, &metadata, linkname)))
    }
}

fn to_file_info(path: String, host: PathBuf, metadata: &Metadata, linkname: Option<String>) -> FileInfo {
    let mtime = DateTime::<Utc>::from_timestamp(metadata.mtime(), 0)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let size = match &linkname {
        Some(target) => target.len() as u64,
        None if metadata.is_dir() => 0,
        None => metadata.size(),
    };
    FileInfo {
        path,
        mode: metadata.mode(),
        size,
        mtime,
        linkname,
        locator: Locator::Host { path: host },
        version: 1,
    }
}

#[async_trait]
impl MountSource for FolderSource {
    async fn lookup(&self, path: &str) -> SourceResult<Option<FileInfo>> {
        self.stat(path).await
    }

    async fn lookup_version(&self, path: &str, version: u32) -> SourceResult<Option<FileInfo>> {
        if version != 1 {
            return Ok(None);
        }
        self.stat(path).await
    }

    async fn versions(&self, path: &str) -> SourceResult<u32> {
        Ok(self.stat(path).await?.map_or(0, |_| 1))
    }

    async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>> {
        let dir = match self.stat(path).await? {
            Some(info) if info.is_dir() => info,
            Some(_) => return Err(SourceError::not_a_directory(normalize_path(path))),
            None => return Err(SourceError::not_found(normalize_path(path))),
        };

        let mut children = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(self.host_path(&dir.path).1).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = join_path(&dir.path, &name);
            // Entries can vanish between read_dir and stat.
            if let Some(info) = self.stat(&child).await? {
                children.insert(name, info);
            }
        }
        Ok(children)
    }

    async fn open(&self, info: &FileInfo) -> SourceResult<FileHandle> {
        ensure_readable(info)?;
        if let Some(reader) = inline_reader(info) {
            return Ok(FileHandle::new(info.clone(), reader));
        }
        let Locator::Host { path } = &info.locator else {
            return Err(SourceError::unsupported(format!(
                "{}: locator {:?} does not belong to a host folder",
                info.path, info.locator
            )));
        };
        let file = tokio::fs::File::open(path).await?.into_std().await;
        let reader = HostRangeReader::new(Arc::new(file), 0, info.size);
        Ok(FileHandle::new(info.clone(), Box::new(reader)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_folder_lookup_list_and_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("a.txt"), b"hello").unwrap();
        std::os::unix::fs::symlink("sub/a.txt", dir.path().join("link")).unwrap();

        let source = FolderSource::new(dir.path()).unwrap();

        let root = source.lookup("/").await.unwrap().unwrap();
        assert!(root.is_dir());

        let children = source.list("/").await.unwrap();
        assert_eq!(children.keys().collect::<Vec<_>>(), vec!["link", "sub"]);
        assert!(children["link"].is_symlink());
        assert_eq!(children["link"].linkname.as_deref(), Some("sub/a.txt"));

        let file = source.lookup("/sub/a.txt").await.unwrap().unwrap();
        assert_eq!(file.size, 5);
        assert_eq!(source.read(&file, 10, 1).await.unwrap(), b"ello");

        assert!(source.lookup("/sub/a.txt/x").await.unwrap().is_none());
        assert!(matches!(
            source.list("/sub/a.txt").await,
            Err(SourceError::NotADirectory(_))
        ));
        assert_eq!(source.versions("/missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_folder_paths_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inside"), b"x").unwrap();
        let source = FolderSource::new(dir.path()).unwrap();
        let info = source.lookup("/../../inside").await.unwrap().unwrap();
        assert_eq!(info.path, "/inside");
    }
}
