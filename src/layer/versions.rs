use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::fs::error::{SourceError, SourceResult};
use crate::fs::path::{join_path, normalize_path, split_path};
use crate::source::{FileHandle, FileInfo, MountSource};

pub const VERSIONS_SUFFIX: &str = ".versions";

/// Exposes every stored version of a file `f` under a hidden directory
/// `f.versions/`, with entries named `1` through `N`.
///
/// Real entries always win over the synthesized ones, and the hidden
/// directories never show up in listings.
pub struct FileVersionLayer {
    inner: Arc<dyn MountSource>,
}

impl std::fmt::Debug for FileVersionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileVersionLayer").finish_non_exhaustive()
    }
}

/// What a path means in the versions view.
enum Target {
    /// `/dir/f.versions`
    Listing { file: String },
    /// `/dir/f.versions/N`
    Version { file: String, version: u32 },
}

impl FileVersionLayer {
    pub fn new(inner: Arc<dyn MountSource>) -> Self {
        Self { inner }
    }

    fn parse(path: &str) -> Option<Target> {
        if let Some(file) = path.strip_suffix(VERSIONS_SUFFIX) {
            if split_path(path).is_some_and(|(_, name)| name != VERSIONS_SUFFIX) {
                return Some(Target::Listing { file: file.to_string() });
            }
        }
        let (parent, name) = split_path(path)?;
        let version = name.parse::<u32>().ok().filter(|v| *v > 0)?;
        match Self::parse(parent)? {
            Target::Listing { file } => Some(Target::Version { file, version }),
            Target::Version { .. } => None,
        }
    }

    /// The file behind a `.versions` directory, if it exists and is not a
    /// directory itself.
    async fn versioned_file(&self, file: &str) -> SourceResult<Option<FileInfo>> {
        Ok(self.inner.lookup(file).await?.filter(|info| !info.is_dir()))
    }

    async fn synthesize(&self, path: &str) -> SourceResult<Option<FileInfo>> {
        match Self::parse(path) {
            Some(Target::Listing { file }) => Ok(self
                .versioned_file(&file)
                .await?
                .map(|info| FileInfo::directory(path, 0o555, info.mtime))),
            Some(Target::Version { file, version }) => {
                if self.versioned_file(&file).await?.is_none() {
                    return Ok(None);
                }
                let info = self.inner.lookup_version(&file, version).await?;
                Ok(info.map(|info| info.with_path(path)))
            }
            None => Ok(None),
        }
    }

    async fn version_listing(&self, path: &str, file: &str) -> SourceResult<BTreeMap<String, FileInfo>> {
        let count = self.inner.versions(file).await?;
        let mut children = BTreeMap::new();
        for version in 1..=count {
            let name = version.to_string();
            if let Some(info) = self.inner.lookup_version(file, version).await? {
                children.insert(name.clone(), info.with_path(join_path(path, &name)));
            }
        }
        Ok(children)
    }
}

#[async_trait]
impl MountSource for FileVersionLayer {
    async fn lookup(&self, path: &str) -> SourceResult<Option<FileInfo>> {
        let path = normalize_path(path);
        if let Some(info) = self.inner.lookup(&path).await? {
            return Ok(Some(info));
        }
        self.synthesize(&path).await
    }

    async fn lookup_version(&self, path: &str, version: u32) -> SourceResult<Option<FileInfo>> {
        let path = normalize_path(path);
        if self.inner.versions(&path).await? > 0 {
            return self.inner.lookup_version(&path, version).await;
        }
        if version != 1 {
            return Ok(None);
        }
        self.synthesize(&path).await
    }

    async fn versions(&self, path: &str) -> SourceResult<u32> {
        let path = normalize_path(path);
        let count = self.inner.versions(&path).await?;
        if count > 0 {
            return Ok(count);
        }
        Ok(self.synthesize(&path).await?.map_or(0, |_| 1))
    }

    async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>> {
        let path = normalize_path(path);
        if self.inner.lookup(&path).await?.is_some() {
            return self.inner.list(&path).await;
        }
        match Self::parse(&path) {
            Some(Target::Listing { file }) if self.versioned_file(&file).await?.is_some() => {
                self.version_listing(&path, &file).await
            }
            Some(Target::Version { .. }) if self.synthesize(&path).await?.is_some() => {
                Err(SourceError::not_a_directory(path))
            }
            _ => Err(SourceError::not_found(path)),
        }
    }

    async fn list_modes(&self, path: &str) -> SourceResult<BTreeMap<String, u32>> {
        let normalized = normalize_path(path);
        if self.inner.lookup(&normalized).await?.is_some() {
            return self.inner.list_modes(&normalized).await;
        }
        Ok(self.list(&normalized).await?.into_iter().map(|(n, i)| (n, i.mode)).collect())
    }

    async fn open(&self, info: &FileInfo) -> SourceResult<FileHandle> {
        self.inner.open(info).await
    }

    async fn read(&self, info: &FileInfo, size: usize, offset: u64) -> SourceResult<Vec<u8>> {
        self.inner.read(info, size, offset).await
    }

    async fn close(&self) -> SourceResult<()> {
        self.inner.close().await
    }
}
