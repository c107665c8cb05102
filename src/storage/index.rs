use moka::future::Cache;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::builder::IndexBuilder;
use super::models::{
    FileRow, IndexMetadata, KEY_FINALIZED, KEY_SCHEMA_VERSION, SCHEMA_VERSION,
};
use super::pool::{DatabasePool, IndexLocation};
use crate::config::{CacheConfig, IndexConfig};
use crate::fs::error::{SourceError, SourceResult};
use crate::fs::path::normalize_path;
use crate::source::FileInfo;

/// Queryable, versioned path index backed by SQLite.
///
/// Built once through [`IndexBuilder`], then read-only. Lookups of the
/// latest version go through an in-process cache since the index never
/// changes after finalization.
#[derive(Clone)]
pub struct PathIndex {
    db: DatabasePool,
    cache: Cache<String, Option<FileInfo>>,
}

impl std::fmt::Debug for PathIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathIndex").field("location", self.db.location()).finish()
    }
}

impl PathIndex {
    /// Start building a new index at `location`.
    pub async fn create(
        location: &IndexLocation,
        index_config: &IndexConfig,
        cache_config: &CacheConfig,
    ) -> SourceResult<IndexBuilder> {
        let db = DatabasePool::create(location, index_config).await?;
        sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)")
            .bind(KEY_SCHEMA_VERSION)
            .bind(SCHEMA_VERSION.to_string())
            .execute(db.pool())
            .await?;
        let index = Self::from_pool(db, cache_config);
        Ok(IndexBuilder::new(index, index_config.batch_size))
    }

    /// Reopen a finalized index file.
    pub async fn open(
        path: &Path,
        index_config: &IndexConfig,
        cache_config: &CacheConfig,
    ) -> SourceResult<Self> {
        if !path.is_file() {
            return Err(SourceError::index(format!(
                "index file {} does not exist",
                path.display()
            )));
        }
        let db = DatabasePool::open_existing(path, index_config).await?;
        let index = Self::from_pool(db, cache_config);
        let meta = index.metadata().await?;
        if !meta.finalized {
            index.close().await;
            return Err(SourceError::index(format!(
                "index {} was never finalized",
                path.display()
            )));
        }
        if meta.schema_version != Some(SCHEMA_VERSION) {
            index.close().await;
            return Err(SourceError::index(format!(
                "index {} has schema {:?}, expected {}",
                path.display(),
                meta.schema_version,
                SCHEMA_VERSION
            )));
        }
        tracing::info!(path = %path.display(), backend = ?meta.backend, "Opened existing index");
        Ok(index)
    }

    pub(super) fn from_pool(db: DatabasePool, cache_config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(cache_config.max_entries)
            .time_to_live(Duration::from_secs(cache_config.ttl_seconds.max(1)))
            .build();
        Self { db, cache }
    }

    pub(super) fn db(&self) -> &DatabasePool {
        &self.db
    }

    pub fn location(&self) -> &IndexLocation {
        self.db.location()
    }

    /// Look up `path` at `version`, or the latest version when `None`.
    pub async fn lookup(&self, path: &str, version: Option<u32>) -> SourceResult<Option<FileInfo>> {
        let path = normalize_path(path);
        match version {
            None => {
                if let Some(hit) = self.cache.get(&path).await {
                    return Ok(hit);
                }
                let found = self.lookup_latest(&path).await?;
                self.cache.insert(path, found.clone()).await;
                Ok(found)
            }
            Some(0) => Ok(None),
            Some(version) => {
                let row = sqlx::query_as::<_, FileRow>(
                    r#"
                    SELECT path, version, mode, size, mtime, linkname, locator
                    FROM files
                    WHERE path = ? AND version = ?
                    "#,
                )
                .bind(&path)
                .bind(version as i64)
                .fetch_optional(self.db.pool())
                .await?;
                row.map(FileInfo::try_from).transpose()
            }
        }
    }

    async fn lookup_latest(&self, path: &str) -> SourceResult<Option<FileInfo>> {
        let row = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT path, version, mode, size, mtime, linkname, locator
            FROM files
            WHERE path = ?
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(path)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(FileInfo::try_from(row)?)),
            None if path == "/" => Ok(Some(FileInfo::implicit_directory("/"))),
            None => Ok(None),
        }
    }

    /// Number of stored versions of `path`.
    pub async fn versions(&self, path: &str) -> SourceResult<u32> {
        let path = normalize_path(path);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE path = ?")
            .bind(&path)
            .fetch_one(self.db.pool())
            .await?;
        if count == 0 && path == "/" {
            return Ok(1);
        }
        Ok(count as u32)
    }

    /// Version numbers stored for `path`, strictly increasing.
    pub async fn list_versions(&self, path: &str) -> SourceResult<Vec<u32>> {
        let path = normalize_path(path);
        let versions: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM files WHERE path = ? ORDER BY version")
                .bind(&path)
                .fetch_all(self.db.pool())
                .await?;
        if versions.is_empty() && path == "/" {
            return Ok(vec![1]);
        }
        Ok(versions.into_iter().map(|v| v as u32).collect())
    }

    /// Latest version of each direct child of `path`, keyed by name.
    pub async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>> {
        let path = self.require_directory(path).await?;
        let rows = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT path, version, mode, size, mtime, linkname, locator
            FROM files f
            WHERE parent = ?
              AND version = (SELECT MAX(version) FROM files g WHERE g.path = f.path)
            ORDER BY name
            "#,
        )
        .bind(&path)
        .fetch_all(self.db.pool())
        .await?;

        let mut children = BTreeMap::new();
        for row in rows {
            let info = FileInfo::try_from(row)?;
            children.insert(info.name().to_string(), info);
        }
        Ok(children)
    }

    /// Like [`list`](Self::list) but only decodes names and modes.
    pub async fn list_modes(&self, path: &str) -> SourceResult<BTreeMap<String, u32>> {
        let path = self.require_directory(path).await?;
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT name, mode
            FROM files f
            WHERE parent = ?
              AND version = (SELECT MAX(version) FROM files g WHERE g.path = f.path)
            ORDER BY name
            "#,
        )
        .bind(&path)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(|(name, mode)| (name, mode as u32)).collect())
    }

    async fn require_directory(&self, path: &str) -> SourceResult<String> {
        let path = normalize_path(path);
        match self.lookup(&path, None).await? {
            Some(info) if info.is_dir() => Ok(path),
            Some(_) => Err(SourceError::not_a_directory(path)),
            None => Err(SourceError::not_found(path)),
        }
    }

    /// Number of stored rows, every version included.
    pub async fn entry_count(&self) -> SourceResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count as u64)
    }

    pub async fn metadata(&self) -> SourceResult<IndexMetadata> {
        let pairs: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM metadata")
            .fetch_all(self.db.pool())
            .await?;
        Ok(IndexMetadata::from_pairs(pairs))
    }

    pub async fn is_finalized(&self) -> SourceResult<bool> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
                .bind(KEY_FINALIZED)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(value.as_deref() == Some("1"))
    }

    pub async fn close(&self) {
        self.cache.invalidate_all();
        self.db.close().await;
    }
}
