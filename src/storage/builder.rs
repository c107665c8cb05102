use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashSet;

use super::index::PathIndex;
use super::models::{KEY_FINALIZED, PendingRow, parent_and_name};
use crate::fs::error::SourceResult;
use crate::fs::path::{ancestors, normalize_path};
use crate::source::FileInfo;
use crate::source::file_info::IMPLICIT_DIR_MODE;
use crate::source::Locator;

// SQLite caps bound parameters per statement at 32766.
const PENDING_COLUMNS: usize = 9;
const MAX_ROWS_PER_STATEMENT: usize = 32766 / PENDING_COLUMNS;

/// Write side of a [`PathIndex`].
///
/// Entries are staged in batches; version numbers and implicit parent
/// directories are only materialized by [`finalize`](Self::finalize).
pub struct IndexBuilder {
    index: PathIndex,
    pending: Vec<PendingRow>,
    parents: Vec<(String, i64)>,
    seen_parents: HashSet<String>,
    batch_size: usize,
    next_order: u64,
    inserted: u64,
}

impl IndexBuilder {
    pub(super) fn new(index: PathIndex, batch_size: usize) -> Self {
        let batch_size = batch_size.clamp(1, MAX_ROWS_PER_STATEMENT);
        Self {
            index,
            pending: Vec::with_capacity(batch_size),
            parents: Vec::new(),
            seen_parents: HashSet::new(),
            batch_size,
            next_order: 0,
            inserted: 0,
        }
    }

    /// Queue an entry; it becomes the newest version of its path so far.
    pub async fn insert(&mut self, info: FileInfo) -> SourceResult<()> {
        let order = self.next_order;
        self.insert_at(order, info).await
    }

    /// Queue an entry with an explicit scan position. Versions of a path
    /// are numbered by ascending scan position, whatever the insert order.
    pub async fn insert_at(&mut self, scan_order: u64, mut info: FileInfo) -> SourceResult<()> {
        info.path = normalize_path(&info.path);
        self.next_order = self.next_order.max(scan_order.saturating_add(1));
        let scan_order = scan_order.min(i64::MAX as u64) as i64;

        let mtime = info.mtime.timestamp();
        for ancestor in ancestors(&info.path) {
            if self.seen_parents.insert(ancestor.clone()) {
                self.parents.push((ancestor, mtime));
            }
        }

        self.pending.push(PendingRow::from_info(scan_order, &info)?);
        self.inserted += 1;
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> SourceResult<()> {
        sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(self.index.db().pool())
            .await?;
        Ok(())
    }

    async fn flush(&mut self) -> SourceResult<()> {
        if self.pending.is_empty() && self.parents.is_empty() {
            return Ok(());
        }
        let mut tx = self.index.db().begin_transaction().await?;

        for chunk in self.pending.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO pending_files \
                 (path, parent, name, scan_order, mode, size, mtime, linkname, locator) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.path.clone())
                    .push_bind(row.parent.clone())
                    .push_bind(row.name.clone())
                    .push_bind(row.scan_order)
                    .push_bind(row.mode)
                    .push_bind(row.size)
                    .push_bind(row.mtime)
                    .push_bind(row.linkname.clone())
                    .push_bind(row.locator.clone());
            });
            builder.build().execute(&mut *tx).await?;
        }

        for chunk in self.parents.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT OR IGNORE INTO parent_dirs (path, parent, name, mtime) ");
            builder.push_values(chunk, |mut b, (path, mtime)| {
                let (parent, name) = parent_and_name(path);
                b.push_bind(path.clone())
                    .push_bind(parent)
                    .push_bind(name)
                    .push_bind(*mtime);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::debug!(
            entries = self.pending.len(),
            parents = self.parents.len(),
            "Flushed index batch"
        );
        self.pending.clear();
        self.parents.clear();
        Ok(())
    }

    /// Assign versions, add implicit directories and make the index
    /// queryable. Consumes the builder; no inserts are possible afterwards.
    pub async fn finalize(mut self) -> SourceResult<PathIndex> {
        if self.seen_parents.insert("/".to_string()) {
            self.parents.push(("/".to_string(), 0));
        }
        self.flush().await?;

        let synthetic = serde_json::to_string(&Locator::Synthetic)?;
        let mut tx = self.index.db().begin_transaction().await?;

        let versioned = sqlx::query(
            r#"
            INSERT INTO files
                (path, parent, name, version, scan_order, mode, size, mtime, linkname, locator, implicit)
            SELECT p.path, p.parent, p.name,
                   ROW_NUMBER() OVER (PARTITION BY p.path ORDER BY p.scan_order)
                     + COALESCE((SELECT MAX(f.version) FROM files f WHERE f.path = p.path), 0),
                   p.scan_order, p.mode, p.size, p.mtime, p.linkname, p.locator, 0
            FROM pending_files p
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let implicit = sqlx::query(
            r#"
            INSERT INTO files
                (path, parent, name, version, scan_order, mode, size, mtime, linkname, locator, implicit)
            SELECT d.path, d.parent, d.name, 1, -1, ?, 0, d.mtime, NULL, ?, 1
            FROM parent_dirs d
            WHERE NOT EXISTS (SELECT 1 FROM files f WHERE f.path = d.path)
            "#,
        )
        .bind(IMPLICIT_DIR_MODE as i64)
        .bind(&synthetic)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM pending_files").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM parent_dirs").execute(&mut *tx).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_parent ON files (parent, name)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES (?, '1')")
            .bind(KEY_FINALIZED)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            location = ?self.index.location(),
            entries = versioned,
            implicit_dirs = implicit,
            "Index finalized"
        );

        Ok(self.index)
    }
}
