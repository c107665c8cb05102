use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::backends::open_archive;
use crate::config::Config;
use crate::fs::error::{SourceError, SourceResult};
use crate::fs::path::{join_path, normalize_path, path_components, strip_prefix};
use crate::source::{FileHandle, FileInfo, Locator, MountSource, ensure_readable};

const ARCHIVE_SUFFIXES: &[&str] = &[".tar", ".tar.zst", ".tzst", ".tar.xz", ".txz", ".zip"];

/// Whether a file name looks like an archive worth mounting.
pub fn is_archive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ARCHIVE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix) && lower.len() > suffix.len())
}

struct Mount {
    mount_point: String,
    source: Arc<dyn MountSource>,
    // Keeps spooled content alive as long as the mount.
    _spool: Option<tempfile::NamedTempFile>,
}

#[derive(Default)]
struct Mounts {
    by_path: HashMap<String, usize>,
    // Archive paths that failed to mount and stay plain files.
    rejected: HashMap<String, String>,
    slots: Vec<Mount>,
}

/// Presents archives found inside a source as directories holding their
/// contents, recursively up to a depth limit.
///
/// Entries of the wrapped source carry `Locator::Layer { index: 0 }`,
/// entries of the n-th mounted archive `Locator::Layer { index: n }`.
pub struct AutoMountLayer {
    base: Arc<dyn MountSource>,
    config: Config,
    depth: usize,
    mounts: Mutex<Mounts>,
}

impl std::fmt::Debug for AutoMountLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoMountLayer").field("depth", &self.depth).finish_non_exhaustive()
    }
}

/// Where a path lives once nested archives are taken into account.
enum Resolved {
    Base,
    Mounted { slot: usize, mount_point: String, inner: String },
}

impl AutoMountLayer {
    pub fn new(base: Arc<dyn MountSource>, config: &Config) -> Self {
        Self::with_depth(base, config, config.scan.max_recursion_depth)
    }

    fn with_depth(base: Arc<dyn MountSource>, config: &Config, depth: usize) -> Self {
        // Spooled archives live in temporary files; their indexes need not
        // outlive the process.
        let mut config = config.clone();
        config.index.in_memory = true;
        config.index.reuse_existing = false;
        Self { base, config, depth, mounts: Mutex::new(Mounts::default()) }
    }

    fn is_mountable(&self, info: &FileInfo) -> bool {
        self.depth > 0 && info.is_file() && is_archive_name(info.name())
    }

    async fn resolve(&self, path: &str) -> SourceResult<Resolved> {
        let mut prefix = String::from("/");
        for component in path_components(path) {
            prefix = join_path(&prefix, component);
            if let Some(slot) = self.mounts.lock().await.by_path.get(&prefix).copied() {
                let inner = strip_prefix(path, &prefix).unwrap_or("/").to_string();
                return Ok(Resolved::Mounted { slot, mount_point: prefix, inner });
            }
            let Some(info) = self.base.lookup(&prefix).await? else {
                return Ok(Resolved::Base);
            };
            if info.is_dir() {
                continue;
            }
            if self.is_mountable(&info) {
                if let Some(slot) = self.mount(&info).await? {
                    let inner = strip_prefix(path, &prefix).unwrap_or("/").to_string();
                    return Ok(Resolved::Mounted { slot, mount_point: prefix, inner });
                }
            }
            return Ok(Resolved::Base);
        }
        Ok(Resolved::Base)
    }

    /// Mount the archive `info` of the base source. `None` when it turns
    /// out not to be a readable archive.
    ///
    /// The mount table is only locked to check and record; spooling and
    /// scanning happen unlocked. Two tasks racing on one archive may both
    /// scan it, the first to record wins.
    async fn mount(&self, info: &FileInfo) -> SourceResult<Option<usize>> {
        {
            let mounts = self.mounts.lock().await;
            if let Some(slot) = mounts.by_path.get(&info.path) {
                return Ok(Some(*slot));
            }
            if mounts.rejected.contains_key(&info.path) {
                return Ok(None);
            }
        }

        match self.open_nested(info).await {
            Ok((source, spool)) => {
                let child = AutoMountLayer::with_depth(source, &self.config, self.depth - 1);
                let mut mounts = self.mounts.lock().await;
                if let Some(slot) = mounts.by_path.get(&info.path).copied() {
                    drop(mounts);
                    if let Err(e) = child.close().await {
                        tracing::warn!(path = %info.path, error = %e, "Failed to close duplicate mount");
                    }
                    return Ok(Some(slot));
                }
                mounts.slots.push(Mount {
                    mount_point: info.path.clone(),
                    source: Arc::new(child),
                    _spool: spool,
                });
                let slot = mounts.slots.len();
                mounts.by_path.insert(info.path.clone(), slot);
                tracing::info!(path = %info.path, depth = self.depth, "Mounted nested archive");
                Ok(Some(slot))
            }
            Err(SourceError::Unsupported(reason)) | Err(SourceError::CorruptArchive(reason)) => {
                tracing::warn!(path = %info.path, reason = %reason, "Not mounting nested archive");
                self.mounts.lock().await.rejected.insert(info.path.clone(), reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn open_nested(
        &self,
        info: &FileInfo,
    ) -> SourceResult<(Arc<dyn MountSource>, Option<tempfile::NamedTempFile>)> {
        if let Some(host) = host_path(&info.locator) {
            return Ok((open_archive(&host, &self.config).await?, None));
        }

        let mut handle = self.base.open(info).await?;
        let spool = tokio::task::spawn_blocking(move || -> SourceResult<tempfile::NamedTempFile> {
            let mut spool = tempfile::NamedTempFile::new()?;
            std::io::copy(&mut handle, &mut spool)?;
            spool.flush()?;
            Ok(spool)
        })
        .await??;
        tracing::debug!(path = %info.path, spool = %spool.path().display(), "Spooled nested archive");
        let source = open_archive(spool.path(), &self.config).await?;
        Ok((source, Some(spool)))
    }

    async fn mounted(&self, slot: usize) -> SourceResult<Arc<dyn MountSource>> {
        Ok(self.mounted_at(slot).await?.0)
    }

    async fn mounted_at(&self, slot: usize) -> SourceResult<(Arc<dyn MountSource>, String)> {
        let mounts = self.mounts.lock().await;
        slot.checked_sub(1)
            .and_then(|i| mounts.slots.get(i))
            .map(|mount| (Arc::clone(&mount.source), mount.mount_point.clone()))
            .ok_or_else(|| SourceError::InvalidPath(format!("no nested mount {}", slot)))
    }

    /// Present an entry of the base source.
    async fn present_base(&self, info: FileInfo) -> SourceResult<FileInfo> {
        if self.is_mountable(&info) {
            if let Some(slot) = self.mount(&info).await? {
                let root = self.mounted(slot).await?.lookup("/").await?;
                let root = root.unwrap_or_else(|| FileInfo::implicit_directory("/"));
                return Ok(present_mounted(slot, &info.path, root));
            }
        }
        let locator = Locator::layer(0, info.locator.clone());
        Ok(info.with_locator(locator))
    }

    fn route(&self, info: &FileInfo) -> SourceResult<(usize, FileInfo)> {
        let Locator::Layer { index, inner } = &info.locator else {
            return Err(SourceError::InvalidPath(format!(
                "{}: locator {:?} was not produced by an automount layer",
                info.path, info.locator
            )));
        };
        Ok((*index, info.clone().with_locator((**inner).clone())))
    }

    async fn source_for(&self, info: &FileInfo) -> SourceResult<(Arc<dyn MountSource>, FileInfo)> {
        let (slot, inner) = self.route(info)?;
        if slot == 0 {
            return Ok((Arc::clone(&self.base), inner));
        }
        let (source, mount_point) = self.mounted_at(slot).await?;
        // Paths inside a mount are relative to its archive root.
        let inner_path = strip_prefix(&info.path, &mount_point).unwrap_or("/").to_string();
        Ok((source, inner.with_path(inner_path)))
    }
}

fn host_path(locator: &Locator) -> Option<PathBuf> {
    match locator {
        Locator::Host { path } => Some(path.clone()),
        _ => None,
    }
}

/// Re-root an entry of mounted archive `slot` under `mount_point`.
fn present_mounted(slot: usize, mount_point: &str, info: FileInfo) -> FileInfo {
    let path = if info.path == "/" {
        mount_point.to_string()
    } else {
        format!("{}{}", mount_point, info.path)
    };
    let locator = Locator::layer(slot, info.locator.clone());
    info.with_path(path).with_locator(locator)
}

#[async_trait]
impl MountSource for AutoMountLayer {
    async fn lookup(&self, path: &str) -> SourceResult<Option<FileInfo>> {
        let path = normalize_path(path);
        match self.resolve(&path).await? {
            Resolved::Base => match self.base.lookup(&path).await? {
                Some(info) => Ok(Some(self.present_base(info).await?)),
                None => Ok(None),
            },
            Resolved::Mounted { slot, mount_point, inner } => {
                let info = self.mounted(slot).await?.lookup(&inner).await?;
                Ok(info.map(|info| present_mounted(slot, &mount_point, info)))
            }
        }
    }

    async fn lookup_version(&self, path: &str, version: u32) -> SourceResult<Option<FileInfo>> {
        let path = normalize_path(path);
        match self.resolve(&path).await? {
            Resolved::Mounted { slot, mount_point, inner } => {
                let info = self.mounted(slot).await?.lookup_version(&inner, version).await?;
                Ok(info.map(|info| present_mounted(slot, &mount_point, info)))
            }
            // Older versions of an archive are served as plain files.
            Resolved::Base => Ok(self
                .base
                .lookup_version(&path, version)
                .await?
                .map(|info| {
                    let locator = Locator::layer(0, info.locator.clone());
                    info.with_locator(locator)
                })),
        }
    }

    async fn versions(&self, path: &str) -> SourceResult<u32> {
        let path = normalize_path(path);
        match self.resolve(&path).await? {
            Resolved::Base => self.base.versions(&path).await,
            Resolved::Mounted { slot, inner, .. } => self.mounted(slot).await?.versions(&inner).await,
        }
    }

    async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>> {
        let path = normalize_path(path);
        match self.resolve(&path).await? {
            Resolved::Base => {
                let mut children = BTreeMap::new();
                for (name, info) in self.base.list(&path).await? {
                    children.insert(name, self.present_base(info).await?);
                }
                Ok(children)
            }
            Resolved::Mounted { slot, mount_point, inner } => {
                let children = self.mounted(slot).await?.list(&inner).await?;
                Ok(children
                    .into_iter()
                    .map(|(name, info)| (name, present_mounted(slot, &mount_point, info)))
                    .collect())
            }
        }
    }

    async fn open(&self, info: &FileInfo) -> SourceResult<FileHandle> {
        ensure_readable(info)?;
        let (source, inner) = self.source_for(info).await?;
        Ok(source.open(&inner).await?.with_info(info.clone()))
    }

    async fn read(&self, info: &FileInfo, size: usize, offset: u64) -> SourceResult<Vec<u8>> {
        ensure_readable(info)?;
        let (source, inner) = self.source_for(info).await?;
        source.read(&inner, size, offset).await
    }

    async fn close(&self) -> SourceResult<()> {
        let mounts = std::mem::take(&mut *self.mounts.lock().await);
        for mount in mounts.slots {
            if let Err(e) = mount.source.close().await {
                tracing::warn!(error = %e, "Failed to close nested archive");
            }
        }
        self.base.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SingleFileSource;
    use crate::layer::UnionSource;
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    /// Holds every `open` until a permit is released.
    struct GatedSource {
        inner: Arc<dyn MountSource>,
        entered: Arc<Notify>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl MountSource for GatedSource {
        async fn lookup(&self, path: &str) -> SourceResult<Option<FileInfo>> {
            self.inner.lookup(path).await
        }

        async fn lookup_version(&self, path: &str, version: u32) -> SourceResult<Option<FileInfo>> {
            self.inner.lookup_version(path, version).await
        }

        async fn versions(&self, path: &str) -> SourceResult<u32> {
            self.inner.versions(path).await
        }

        async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>> {
            self.inner.list(path).await
        }

        async fn open(&self, info: &FileInfo) -> SourceResult<FileHandle> {
            self.entered.notify_one();
            let _permit = self.gate.acquire().await.unwrap();
            self.inner.open(info).await
        }
    }

    fn tar_with(path: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, data).unwrap();
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_lookups_proceed_while_archive_mounts() {
        let base = UnionSource::new(vec![
            Arc::new(SingleFileSource::new("/nested.tar", tar_with("inside", b"deep"))),
            Arc::new(SingleFileSource::new("/plain.txt", b"flat".to_vec())),
        ]);
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Semaphore::new(0));
        let gated = GatedSource {
            inner: Arc::new(base),
            entered: Arc::clone(&entered),
            gate: Arc::clone(&gate),
        };
        let mut config = Config::default();
        config.index.in_memory = true;
        let layer = Arc::new(AutoMountLayer::new(Arc::new(gated), &config));

        let mounting = tokio::spawn({
            let layer = Arc::clone(&layer);
            async move { layer.lookup("/nested.tar/inside").await }
        });
        entered.notified().await;

        let plain = tokio::time::timeout(Duration::from_secs(5), layer.lookup("/plain.txt"))
            .await
            .expect("lookup waited for the nested mount")
            .unwrap()
            .unwrap();
        assert!(plain.is_file());

        gate.add_permits(1);
        let inside = mounting.await.unwrap().unwrap().unwrap();
        assert_eq!(inside.path, "/nested.tar/inside");
        assert_eq!(layer.read(&inside, 10, 0).await.unwrap(), b"deep");
    }

    #[test]
    fn test_archive_names() {
        assert!(is_archive_name("lighter.tar"));
        assert!(is_archive_name("Backup.TAR.ZST"));
        assert!(is_archive_name("data.zip"));
        assert!(is_archive_name("logs.txz"));
        assert!(!is_archive_name(".tar"));
        assert!(!is_archive_name("notes.txt"));
        assert!(!is_archive_name("archive.tar.gz"));
    }
}
