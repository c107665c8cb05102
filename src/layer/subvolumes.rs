use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::fs::error::{SourceError, SourceResult};
use crate::fs::path::{normalize_path, path_components};
use crate::source::{FileHandle, FileInfo, Locator, MountSource, ensure_readable};

/// Named child sources mounted side by side as top-level directories.
#[derive(Clone, Default)]
pub struct SubvolumesSource {
    volumes: Vec<(String, Arc<dyn MountSource>)>,
}

impl std::fmt::Debug for SubvolumesSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.volumes.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("SubvolumesSource").field("volumes", &names).finish()
    }
}

impl SubvolumesSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `source` at `/name`.
    pub fn add(&mut self, name: &str, source: Arc<dyn MountSource>) -> SourceResult<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(SourceError::InvalidPath(format!("invalid subvolume name {:?}", name)));
        }
        if self.volumes.iter().any(|(existing, _)| existing == name) {
            return Err(SourceError::InvalidPath(format!("subvolume {} already exists", name)));
        }
        tracing::debug!(name, "Added subvolume");
        self.volumes.push((name.to_string(), source));
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().map(|(name, _)| name.as_str())
    }

    /// Split `/name/rest` into the volume index and the path inside it.
    fn resolve(&self, path: &str) -> Option<(usize, String)> {
        let normalized = normalize_path(path);
        let components = path_components(&normalized);
        let (first, rest) = components.split_first()?;
        let index = self.volumes.iter().position(|(name, _)| name == first)?;
        Some((index, format!("/{}", rest.join("/"))))
    }

    fn present(&self, index: usize, info: FileInfo) -> FileInfo {
        let name = &self.volumes[index].0;
        let path = if info.path == "/" {
            format!("/{}", name)
        } else {
            format!("/{}{}", name, info.path)
        };
        let locator = Locator::layer(index, info.locator.clone());
        info.with_path(path).with_locator(locator)
    }

    fn root(&self) -> FileInfo {
        FileInfo::directory("/", 0o755, DateTime::<Utc>::UNIX_EPOCH)
    }

    fn route(&self, info: &FileInfo) -> SourceResult<(&Arc<dyn MountSource>, FileInfo)> {
        let (index, inner_path) = self
            .resolve(&info.path)
            .ok_or_else(|| SourceError::not_found(info.path.clone()))?;
        let Locator::Layer { inner, .. } = &info.locator else {
            return Err(SourceError::InvalidPath(format!(
                "{}: locator {:?} was not produced by a subvolume",
                info.path, info.locator
            )));
        };
        let inner = info.clone().with_path(inner_path).with_locator((**inner).clone());
        Ok((&self.volumes[index].1, inner))
    }
}

#[async_trait]
impl MountSource for SubvolumesSource {
    async fn lookup(&self, path: &str) -> SourceResult<Option<FileInfo>> {
        if normalize_path(path) == "/" {
            return Ok(Some(self.root()));
        }
        let Some((index, inner)) = self.resolve(path) else {
            return Ok(None);
        };
        let info = self.volumes[index].1.lookup(&inner).await?;
        Ok(info.map(|info| self.present(index, info)))
    }

    async fn lookup_version(&self, path: &str, version: u32) -> SourceResult<Option<FileInfo>> {
        if normalize_path(path) == "/" {
            return Ok((version == 1).then(|| self.root()));
        }
        let Some((index, inner)) = self.resolve(path) else {
            return Ok(None);
        };
        let info = self.volumes[index].1.lookup_version(&inner, version).await?;
        Ok(info.map(|info| self.present(index, info)))
    }

    async fn versions(&self, path: &str) -> SourceResult<u32> {
        if normalize_path(path) == "/" {
            return Ok(1);
        }
        match self.resolve(path) {
            Some((index, inner)) => self.volumes[index].1.versions(&inner).await,
            None => Ok(0),
        }
    }

    async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>> {
        let normalized = normalize_path(path);
        if normalized == "/" {
            let mut children = BTreeMap::new();
            for (index, (name, source)) in self.volumes.iter().enumerate() {
                let root = source
                    .lookup("/")
                    .await?
                    .unwrap_or_else(|| FileInfo::implicit_directory("/"));
                children.insert(name.clone(), self.present(index, root));
            }
            return Ok(children);
        }
        let (index, inner) = self
            .resolve(&normalized)
            .ok_or_else(|| SourceError::not_found(normalized.clone()))?;
        let children = self.volumes[index].1.list(&inner).await?;
        Ok(children
            .into_iter()
            .map(|(name, info)| (name, self.present(index, info)))
            .collect())
    }

    async fn list_modes(&self, path: &str) -> SourceResult<BTreeMap<String, u32>> {
        let normalized = normalize_path(path);
        if normalized == "/" {
            return Ok(self.list("/").await?.into_iter().map(|(n, i)| (n, i.mode)).collect());
        }
        let (index, inner) = self
            .resolve(&normalized)
            .ok_or_else(|| SourceError::not_found(normalized.clone()))?;
        self.volumes[index].1.list_modes(&inner).await
    }

    async fn open(&self, info: &FileInfo) -> SourceResult<FileHandle> {
        ensure_readable(info)?;
        let (source, inner) = self.route(info)?;
        Ok(source.open(&inner).await?.with_info(info.clone()))
    }

    async fn read(&self, info: &FileInfo, size: usize, offset: u64) -> SourceResult<Vec<u8>> {
        ensure_readable(info)?;
        let (source, inner) = self.route(info)?;
        source.read(&inner, size, offset).await
    }

    async fn close(&self) -> SourceResult<()> {
        for (name, source) in &self.volumes {
            if let Err(e) = source.close().await {
                tracing::warn!(name = %name, error = %e, "Failed to close subvolume");
            }
        }
        Ok(())
    }
}
