//! Union view module.
//!
//! Overlays several mount sources into one tree. Sources are searched in
//! registration order and the first one holding a path decides what the
//! path is.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::fs::error::{SourceError, SourceResult};
use crate::fs::path::{join_path, normalize_path};
use crate::source::{FileHandle, FileInfo, Locator, MountSource, ensure_readable};

/// Ordered overlay of mount sources; earlier sources shadow later ones.
#[derive(Clone, Default)]
pub struct UnionSource {
    sources: Vec<Arc<dyn MountSource>>,
}

impl std::fmt::Debug for UnionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnionSource").field("sources", &self.sources.len()).finish()
    }
}

impl UnionSource {
    pub fn new(sources: Vec<Arc<dyn MountSource>>) -> Self {
        Self { sources }
    }

    /// Register a source below every source added so far.
    pub fn push(&mut self, source: Arc<dyn MountSource>) {
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[Arc<dyn MountSource>] {
        &self.sources
    }

    /// First source holding `path`, with its entry.
    async fn find(&self, path: &str) -> SourceResult<Option<(usize, FileInfo)>> {
        for (index, source) in self.sources.iter().enumerate() {
            if let Some(info) = source.lookup(path).await? {
                return Ok(Some((index, info)));
            }
        }
        Ok(None)
    }

    /// Global version of `local` within source `index`: versions of every
    /// later-registered source come first.
    async fn global_version(&self, path: &str, index: usize, local: u32) -> u32 {
        let mut offset = 0;
        for source in &self.sources[index + 1..] {
            offset += Self::version_count(source, path).await;
        }
        offset + local
    }

    /// Versions `source` holds at `path` for numbering purposes. A source
    /// that cannot answer contributes none, so it cannot fail a lookup
    /// another source already satisfied.
    async fn version_count(source: &Arc<dyn MountSource>, path: &str) -> u32 {
        match source.versions(path).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(path, error = %e, "Union layer failed to count versions");
                0
            }
        }
    }

    fn tag(index: usize, info: FileInfo) -> FileInfo {
        let locator = Locator::layer(index, info.locator.clone());
        info.with_locator(locator)
    }

    /// Undo [`tag`](Self::tag): the child source and the entry as it knows it.
    fn route(&self, info: &FileInfo) -> SourceResult<(&Arc<dyn MountSource>, FileInfo)> {
        match &info.locator {
            Locator::Layer { index, inner } => {
                let source = self.sources.get(*index).ok_or_else(|| {
                    SourceError::InvalidPath(format!("{}: no union layer {}", info.path, index))
                })?;
                Ok((source, info.clone().with_locator((**inner).clone())))
            }
            other => Err(SourceError::InvalidPath(format!(
                "{}: locator {:?} was not produced by a union",
                info.path, other
            ))),
        }
    }

    /// Sources contributing children to a listing of `path`, or the error
    /// the first holder dictates.
    async fn listing_sources(&self, path: &str) -> SourceResult<Vec<usize>> {
        let mut contributors = Vec::new();
        let mut first = true;
        for (index, source) in self.sources.iter().enumerate() {
            match source.lookup(path).await? {
                Some(info) if info.is_dir() => contributors.push(index),
                Some(_) if first => return Err(SourceError::not_a_directory(path)),
                Some(_) => {}
                None => continue,
            }
            first = false;
        }
        if contributors.is_empty() {
            return Err(SourceError::not_found(path));
        }
        Ok(contributors)
    }
}

#[async_trait]
impl MountSource for UnionSource {
    async fn lookup(&self, path: &str) -> SourceResult<Option<FileInfo>> {
        let path = normalize_path(path);
        let Some((index, info)) = self.find(&path).await? else {
            return Ok(None);
        };
        let version = self.global_version(&path, index, info.version).await;
        Ok(Some(Self::tag(index, info).with_version(version)))
    }

    async fn lookup_version(&self, path: &str, version: u32) -> SourceResult<Option<FileInfo>> {
        if version == 0 {
            return Ok(None);
        }
        let path = normalize_path(path);
        let mut remaining = version;
        for (index, source) in self.sources.iter().enumerate().rev() {
            let count = Self::version_count(source, &path).await;
            if remaining <= count {
                let info = source.lookup_version(&path, remaining).await?;
                return Ok(info.map(|info| Self::tag(index, info).with_version(version)));
            }
            remaining -= count;
        }
        Ok(None)
    }

    async fn versions(&self, path: &str) -> SourceResult<u32> {
        let path = normalize_path(path);
        let mut total = 0;
        for source in &self.sources {
            total += source.versions(&path).await?;
        }
        Ok(total)
    }

    async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>> {
        let path = normalize_path(path);
        let mut merged = BTreeMap::new();
        for index in self.listing_sources(&path).await? {
            for (name, info) in self.sources[index].list(&path).await? {
                merged.entry(name).or_insert((index, info));
            }
        }

        // Listed entries carry the same global version a lookup reports.
        let mut children = BTreeMap::new();
        for (name, (index, info)) in merged {
            let child = join_path(&path, &name);
            let version = self.global_version(&child, index, info.version).await;
            children.insert(name, Self::tag(index, info).with_version(version));
        }
        Ok(children)
    }

    async fn list_modes(&self, path: &str) -> SourceResult<BTreeMap<String, u32>> {
        let path = normalize_path(path);
        let mut merged = BTreeMap::new();
        for index in self.listing_sources(&path).await? {
            for (name, mode) in self.sources[index].list_modes(&path).await? {
                merged.entry(name).or_insert(mode);
            }
        }
        Ok(merged)
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
        let mut first_error = None;
        for source in &self.sources {
            if let Err(e) = source.close().await {
                tracing::warn!(error = %e, "Failed to close union layer");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
