use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::PathBuf;

use crate::fs::error::{SourceError, SourceResult};
use crate::source::{FileInfo, Locator};

/// Bumped whenever the table layout changes; older indexes are rebuilt.
pub const SCHEMA_VERSION: u32 = 1;

pub const KEY_SCHEMA_VERSION: &str = "schema_version";
pub const KEY_FINALIZED: &str = "finalized";
pub const KEY_BACKEND: &str = "backend";
pub const KEY_ARCHIVE_PATH: &str = "archive_path";
pub const KEY_ARCHIVE_SIZE: &str = "archive_size";
pub const KEY_ARCHIVE_FINGERPRINT: &str = "archive_fingerprint";

/// One stored version of an entry.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub path: String,
    pub version: i64,
    pub mode: i64,
    pub size: i64,
    pub mtime: i64,
    pub linkname: Option<String>,
    pub locator: String,
}

impl TryFrom<FileRow> for FileInfo {
    type Error = SourceError;

    fn try_from(row: FileRow) -> SourceResult<Self> {
        let locator: Locator = serde_json::from_str(&row.locator)?;
        Ok(FileInfo {
            path: row.path,
            mode: row.mode as u32,
            size: row.size.max(0) as u64,
            mtime: DateTime::<Utc>::from_timestamp(row.mtime, 0)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            linkname: row.linkname,
            locator,
            version: row.version.max(1) as u32,
        })
    }
}

/// An entry queued by the builder, before version assignment.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub path: String,
    pub parent: String,
    pub name: String,
    pub scan_order: i64,
    pub mode: i64,
    pub size: i64,
    pub mtime: i64,
    pub linkname: Option<String>,
    pub locator: String,
}

impl PendingRow {
    pub fn from_info(scan_order: i64, info: &FileInfo) -> SourceResult<Self> {
        let (parent, name) = parent_and_name(&info.path);
        Ok(Self {
            path: info.path.clone(),
            parent,
            name,
            scan_order,
            mode: info.mode as i64,
            size: info.size.min(i64::MAX as u64) as i64,
            mtime: info.mtime.timestamp(),
            linkname: info.linkname.clone(),
            locator: serde_json::to_string(&info.locator)
                .map_err(|e| SourceError::index(format!("cannot encode locator: {}", e)))?,
        })
    }
}

/// Parent and name columns for a normalized path. The root is stored with
/// an empty parent so it never shows up in a listing.
pub fn parent_and_name(path: &str) -> (String, String) {
    match crate::fs::path::split_path(path) {
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (String::new(), String::new()),
    }
}

/// Descriptive keys stored next to the entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub schema_version: Option<u32>,
    pub finalized: bool,
    pub backend: Option<String>,
    pub archive_path: Option<PathBuf>,
    pub archive_size: Option<u64>,
    pub archive_fingerprint: Option<String>,
}

impl IndexMetadata {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut meta = IndexMetadata::default();
        for (key, value) in pairs {
            match key.as_str() {
                KEY_SCHEMA_VERSION => meta.schema_version = value.parse().ok(),
                KEY_FINALIZED => meta.finalized = value == "1",
                KEY_BACKEND => meta.backend = Some(value),
                KEY_ARCHIVE_PATH => meta.archive_path = Some(PathBuf::from(value)),
                KEY_ARCHIVE_SIZE => meta.archive_size = value.parse().ok(),
                KEY_ARCHIVE_FINGERPRINT => meta.archive_fingerprint = Some(value),
                _ => {}
            }
        }
        meta
    }

    /// Whether this index was built from an archive with the given size and
    /// fingerprint and is complete.
    pub fn matches_archive(&self, size: u64, fingerprint: &str) -> bool {
        self.finalized
            && self.schema_version == Some(SCHEMA_VERSION)
            && self.archive_size == Some(size)
            && self.archive_fingerprint.as_deref() == Some(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_and_name("/"), (String::new(), String::new()));
        assert_eq!(parent_and_name("/a"), ("/".to_string(), "a".to_string()));
        assert_eq!(parent_and_name("/a/b"), ("/a".to_string(), "b".to_string()));
    }

    #[test]
    fn test_file_row_conversion() {
        let row = FileRow {
            path: "/foo/bar".to_string(),
            version: 2,
            mode: 0o100644,
            size: 12,
            mtime: 1_700_000_000,
            linkname: None,
            locator: r#"{"kind":"zip","entry_index":3}"#.to_string(),
        };
        let info = FileInfo::try_from(row).unwrap();
        assert_eq!(info.path, "/foo/bar");
        assert_eq!(info.version, 2);
        assert!(info.is_file());
        assert_eq!(info.mtime.timestamp(), 1_700_000_000);
        assert_eq!(info.locator, Locator::Zip { entry_index: 3 });
    }

    #[test]
    fn test_bad_locator_is_index_error() {
        let row = FileRow {
            path: "/x".to_string(),
            version: 1,
            mode: 0o100644,
            size: 0,
            mtime: 0,
            linkname: None,
            locator: "not json".to_string(),
        };
        assert!(matches!(FileInfo::try_from(row), Err(SourceError::Index(_))));
    }

    #[test]
    fn test_metadata_matching() {
        let meta = IndexMetadata::from_pairs(vec![
            (KEY_SCHEMA_VERSION.to_string(), SCHEMA_VERSION.to_string()),
            (KEY_FINALIZED.to_string(), "1".to_string()),
            (KEY_ARCHIVE_SIZE.to_string(), "1024".to_string()),
            (KEY_ARCHIVE_FINGERPRINT.to_string(), "abc".to_string()),
            ("unknown".to_string(), "ignored".to_string()),
        ]);
        assert!(meta.matches_archive(1024, "abc"));
        assert!(!meta.matches_archive(1025, "abc"));
        assert!(!meta.matches_archive(1024, "abd"));

        let unfinished = IndexMetadata { finalized: false, ..meta };
        assert!(!unfinished.matches_archive(1024, "abc"));
    }
}
