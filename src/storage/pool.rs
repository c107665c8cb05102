use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::IndexConfig;
use crate::fs::error::SourceResult;

/// Where an index database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLocation {
    Memory,
    File(PathBuf),
}

impl IndexLocation {
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            IndexLocation::Memory => None,
            IndexLocation::File(path) => Some(path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
    location: IndexLocation,
}

pub type DatabaseTransaction<'a> = Transaction<'a, Sqlite>;

impl DatabasePool {
    /// Create a fresh database, replacing any file already at `location`.
    pub async fn create(location: &IndexLocation, config: &IndexConfig) -> SourceResult<Self> {
        if let IndexLocation::File(path) = location {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed stale index"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let db = Self::connect(location, config, true).await?;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open an existing database file without creating it.
    pub async fn open_existing(path: &Path, config: &IndexConfig) -> SourceResult<Self> {
        let location = IndexLocation::File(path.to_path_buf());
        let db = Self::connect(&location, config, false).await?;
        db.health_check().await?;
        db.run_migrations().await?;
        Ok(db)
    }

    async fn connect(
        location: &IndexLocation,
        config: &IndexConfig,
        create: bool,
    ) -> SourceResult<Self> {
        let pool = match location {
            IndexLocation::Memory => {
                // Every connection to ":memory:" is its own database, so the
                // pool keeps exactly one connection alive for its lifetime.
                let options = SqliteConnectOptions::new().filename(":memory:");
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await?
            }
            IndexLocation::File(path) => {
                let mut options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(create)
                    .synchronous(SqliteSynchronous::Normal);
                // WAL is recorded in the file header, so reopened indexes
                // keep it without issuing the pragma again.
                if create {
                    options = options.journal_mode(SqliteJournalMode::Wal);
                }
                SqlitePoolOptions::new()
                    .max_connections(config.max_connections.max(1))
                    .acquire_timeout(Duration::from_secs(30))
                    .connect_with(options)
                    .await?
            }
        };

        tracing::debug!(
            location = ?location,
            max_connections = config.max_connections,
            "Index database opened"
        );

        Ok(Self { pool, location: location.clone() })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn location(&self) -> &IndexLocation {
        &self.location
    }

    pub async fn health_check(&self) -> SourceResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    pub async fn run_migrations(&self) -> SourceResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                path TEXT NOT NULL,
                parent TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                scan_order INTEGER NOT NULL,
                mode INTEGER NOT NULL,
                size INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                linkname TEXT,
                locator TEXT NOT NULL,
                implicit INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (path, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_files (
                path TEXT NOT NULL,
                parent TEXT NOT NULL,
                name TEXT NOT NULL,
                scan_order INTEGER NOT NULL,
                mode INTEGER NOT NULL,
                size INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                linkname TEXT,
                locator TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS parent_dirs (
                path TEXT PRIMARY KEY,
                parent TEXT NOT NULL,
                name TEXT NOT NULL,
                mtime INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!(location = ?self.location, "Index database closed");
    }

    pub async fn begin_transaction(&self) -> SourceResult<DatabaseTransaction<'_>> {
        let tx = self.pool.begin().await?;
        Ok(tx)
    }
}
