use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::fs::error::{SourceError, SourceResult};
use crate::fs::path::{ancestors, normalize_path, split_path};
use crate::source::{
    FileHandle, FileInfo, HostRangeReader, Locator, MemoryReader, MountSource, ensure_readable,
};

#[derive(Debug, Clone)]
enum Content {
    Memory(Arc<Vec<u8>>),
    Host(PathBuf),
}

/// Exactly one file plus the directories leading to it.
#[derive(Debug, Clone)]
pub struct SingleFileSource {
    info: FileInfo,
    content: Content,
}

impl SingleFileSource {
    /// Serve `data` at `path`. The path may be unnormalized; it is
    /// normalized once here.
    pub fn new(path: &str, data: Vec<u8>) -> Self {
        let info = FileInfo::file(
            normalize_path(path),
            0o644,
            data.len() as u64,
            Utc::now(),
            Locator::Memory,
        );
        Self { info, content: Content::Memory(Arc::new(data)) }
    }

    /// Serve an existing host file at `path`.
    pub fn from_host_file(path: &str, host: impl AsRef<Path>) -> SourceResult<Self> {
        let host = host.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&host)?;
        if metadata.is_dir() {
            return Err(SourceError::not_a_file(host.display().to_string()));
        }
        let mtime = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
        let info = FileInfo::file(
            normalize_path(path),
            0o644,
            metadata.len(),
            mtime,
            Locator::Host { path: host.clone() },
        );
        Ok(Self { info, content: Content::Host(host) })
    }

    pub fn path(&self) -> &str {
        &self.info.path
    }

    fn directory(&self, path: &str) -> FileInfo {
        FileInfo::directory(path, 0o755, self.info.mtime)
    }

    fn is_ancestor(&self, path: &str) -> bool {
        ancestors(&self.info.path).iter().any(|a| a == path)
    }

    fn resolve(&self, path: &str) -> Option<FileInfo> {
        let path = normalize_path(path);
        if path == self.info.path {
            Some(self.info.clone())
        } else if self.is_ancestor(&path) {
            Some(self.directory(&path))
        } else {
            None
        }
    }
}

#[async_trait]
impl MountSource for SingleFileSource {
    async fn lookup(&self, path: &str) -> SourceResult<Option<FileInfo>> {
        Ok(self.resolve(path))
    }

    async fn lookup_version(&self, path: &str, version: u32) -> SourceResult<Option<FileInfo>> {
        Ok(if version == 1 { self.resolve(path) } else { None })
    }

    async fn versions(&self, path: &str) -> SourceResult<u32> {
        Ok(self.resolve(path).map_or(0, |_| 1))
    }

    async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>> {
        let path = normalize_path(path);
        match self.resolve(&path) {
            Some(info) if !info.is_dir() => return Err(SourceError::not_a_directory(path)),
            None => return Err(SourceError::not_found(path)),
            Some(_) => {}
        }

        // The only child of an ancestor is the next component toward the file.
        let mut chain = ancestors(&self.info.path);
        chain.push(self.info.path.clone());
        let child = chain
            .iter()
            .find(|candidate| split_path(candidate).is_some_and(|(parent, _)| parent == path))
            .and_then(|candidate| self.resolve(candidate));

        let mut children = BTreeMap::new();
        if let Some(child) = child {
            children.insert(child.name().to_string(), child);
        }
        Ok(children)
    }

    async fn open(&self, info: &FileInfo) -> SourceResult<FileHandle> {
        ensure_readable(info)?;
        let reader: Box<dyn crate::source::EntryReader> = match &self.content {
            Content::Memory(data) => Box::new(MemoryReader::new(Arc::clone(data))),
            Content::Host(host) => {
                let file = tokio::fs::File::open(host).await?.into_std().await;
                Box::new(HostRangeReader::new(Arc::new(file), 0, self.info.size))
            }
        };
        Ok(FileHandle::new(info.clone(), reader))
    }
}
