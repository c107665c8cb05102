use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::archive_file::ArchiveFile;
use super::{TarSource, ZipSource, tar_source, zip_source};
use crate::config::Config;
use crate::fs::error::{SourceError, SourceResult};
use crate::source::{FileHandle, FileInfo, MountSource, ensure_readable};
use crate::storage::{IndexMetadata, PathIndex};

/// A mount source answered entirely from a reopened index file.
///
/// Metadata queries never touch the archive. Content is only available
/// while the archive recorded in the index is present and unchanged.
pub struct PersistedIndexSource {
    index: PathIndex,
    metadata: IndexMetadata,
    content: Option<Arc<dyn MountSource>>,
}

impl std::fmt::Debug for PersistedIndexSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedIndexSource")
            .field("index", &self.index)
            .field("archive", &self.metadata.archive_path)
            .field("has_content", &self.content.is_some())
            .finish()
    }
}

impl PersistedIndexSource {
    pub async fn open(index_path: &Path, config: &Config) -> SourceResult<Self> {
        let index = PathIndex::open(index_path, &config.index, &config.cache).await?;
        let metadata = index.metadata().await?;
        let content = attach_archive(&index, &metadata).await;
        Ok(Self { index, metadata, content })
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// Whether `open` and `read` can be served.
    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    fn content(&self, info: &FileInfo) -> SourceResult<&Arc<dyn MountSource>> {
        self.content.as_ref().ok_or_else(|| {
            let archive = self
                .metadata
                .archive_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unrecorded>".to_string());
            SourceError::unsupported(format!(
                "{}: content unavailable, archive {} is missing or changed",
                info.path, archive
            ))
        })
    }
}

async fn attach_archive(index: &PathIndex, meta: &IndexMetadata) -> Option<Arc<dyn MountSource>> {
    let path = meta.archive_path.as_ref()?;
    let archive = match ArchiveFile::open(path) {
        Ok(archive) => archive,
        Err(e) => {
            tracing::warn!(archive = %path.display(), error = %e, "Indexed archive is not available");
            return None;
        }
    };

    let fingerprint = {
        let archive = archive.clone();
        match tokio::task::spawn_blocking(move || archive.fingerprint()).await {
            Ok(Ok(fingerprint)) => fingerprint,
            Ok(Err(e)) => {
                tracing::warn!(archive = %path.display(), error = %e, "Cannot fingerprint archive");
                return None;
            }
            Err(e) => {
                tracing::warn!(archive = %path.display(), error = %e, "Fingerprint task failed");
                return None;
            }
        }
    };
    if !meta.matches_archive(archive.size(), &fingerprint) {
        tracing::warn!(archive = %path.display(), "Archive changed since it was indexed");
        return None;
    }

    let source: Arc<dyn MountSource> = match meta.backend.as_deref() {
        Some(tar_source::BACKEND_NAME) => Arc::new(TarSource::with_index(archive, index.clone())),
        Some(zip_source::BACKEND_NAME) => match ZipSource::with_index(archive, index.clone()).await {
            Ok(source) => Arc::new(source),
            Err(e) => {
                tracing::warn!(archive = %path.display(), error = %e, "Cannot reopen zip archive");
                return None;
            }
        },
        other => {
            tracing::warn!(backend = ?other, "Index was written by an unknown backend");
            return None;
        }
    };
    Some(source)
}

#[async_trait]
impl MountSource for PersistedIndexSource {
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
        self.content(info)?.open(info).await
    }

    async fn read(&self, info: &FileInfo, size: usize, offset: u64) -> SourceResult<Vec<u8>> {
        ensure_readable(info)?;
        self.content(info)?.read(info, size, offset).await
    }

    async fn close(&self) -> SourceResult<()> {
        self.index.close().await;
        Ok(())
    }
}
