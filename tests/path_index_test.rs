//! PathIndex integration tests - versioning, implicit directories and
//! persistence of finalized indexes

use anyhow::Result;
use arcmount::config::{CacheConfig, IndexConfig};
use arcmount::fs::SourceError;
use arcmount::source::{FileInfo, Locator};
use arcmount::storage::{IndexBuilder, IndexLocation, PathIndex};
use chrono::{DateTime, Utc};

fn tar_file(path: &str, size: u64, header_offset: u64) -> FileInfo {
    let mtime = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
    let locator = Locator::Tar { header_offset, data_offset: header_offset + 512, sparse: false };
    FileInfo::file(path, 0o644, size, mtime, locator)
}

async fn memory_builder() -> Result<IndexBuilder> {
    let config = IndexConfig { batch_size: 2, ..IndexConfig::in_memory() };
    Ok(PathIndex::create(&IndexLocation::Memory, &config, &CacheConfig::default()).await?)
}

#[tokio::test]
async fn test_versions_follow_insertion() -> Result<()> {
    let mut builder = memory_builder().await?;
    for size in 1..=3 {
        builder.insert(tar_file("/data/report.csv", size, size * 1024)).await?;
    }
    builder.insert(tar_file("/data/other", 9, 8192)).await?;
    assert_eq!(builder.inserted(), 4);
    let index = builder.finalize().await?;

    assert_eq!(index.versions("/data/report.csv").await?, 3);
    assert_eq!(index.list_versions("/data/report.csv").await?, vec![1, 2, 3]);

    let latest = index.lookup("/data/report.csv", None).await?.unwrap();
    assert_eq!(latest.version, 3);
    assert_eq!(latest.size, 3);

    let first = index.lookup("/data/report.csv", Some(1)).await?.unwrap();
    assert_eq!(first.size, 1);
    assert!(index.lookup("/data/report.csv", Some(4)).await?.is_none());
    assert!(index.lookup("/data/report.csv", Some(0)).await?.is_none());

    let children = index.list("/data").await?;
    assert_eq!(children.len(), 2);
    assert_eq!(children["report.csv"].version, 3);
    assert_eq!(index.entry_count().await?, 6); // 4 entries + /data + /
    Ok(())
}

#[tokio::test]
async fn test_out_of_order_insertion_uses_scan_order() -> Result<()> {
    let mut builder = memory_builder().await?;
    builder.insert_at(3000, tar_file("/f", 30, 3000)).await?;
    builder.insert_at(1000, tar_file("/f", 10, 1000)).await?;
    builder.insert_at(2000, tar_file("/f", 20, 2000)).await?;
    let index = builder.finalize().await?;

    for (version, size) in [(1, 10), (2, 20), (3, 30)] {
        let info = index.lookup("/f", Some(version)).await?.unwrap();
        assert_eq!(info.size, size, "version {}", version);
    }
    assert_eq!(index.lookup("/f", None).await?.unwrap().size, 30);
    Ok(())
}

#[tokio::test]
async fn test_implicit_parent_directories() -> Result<()> {
    let mut builder = memory_builder().await?;
    builder.insert(tar_file("a/b/c.txt", 5, 0)).await?;
    let index = builder.finalize().await?;

    let a = index.lookup("/a", None).await?.unwrap();
    assert!(a.is_dir());
    assert_eq!(a.locator, Locator::Synthetic);
    assert!(index.lookup("/a/b", None).await?.unwrap().is_dir());

    let root = index.list("/").await?;
    assert_eq!(root.keys().collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(index.list_modes("/a").await?.len(), 1);

    assert!(index.lookup("/", None).await?.unwrap().is_dir());
    assert!(index.lookup("/missing", None).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_explicit_directory_beats_implicit() -> Result<()> {
    let mut builder = memory_builder().await?;
    builder.insert(tar_file("/dir/file", 1, 1024)).await?;
    builder
        .insert(FileInfo::directory(
            "/dir",
            0o700,
            DateTime::<Utc>::from_timestamp(42, 0).unwrap(),
        ))
        .await?;
    let index = builder.finalize().await?;

    let dir = index.lookup("/dir", None).await?.unwrap();
    assert_eq!(dir.permissions(), 0o700);
    assert_eq!(index.versions("/dir").await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_list_errors() -> Result<()> {
    let mut builder = memory_builder().await?;
    builder.insert(tar_file("/file", 1, 0)).await?;
    let index = builder.finalize().await?;

    assert!(matches!(index.list("/file").await, Err(SourceError::NotADirectory(_))));
    assert!(matches!(index.list("/nope").await, Err(SourceError::NotFound(_))));
    assert!(matches!(index.list_modes("/file").await, Err(SourceError::NotADirectory(_))));
    Ok(())
}

#[tokio::test]
async fn test_persisted_index_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("archive.tar.index.sqlite");
    let location = IndexLocation::File(path.clone());
    let config = IndexConfig::default();

    let mut builder = PathIndex::create(&location, &config, &CacheConfig::default()).await?;
    builder.insert(tar_file("/x/one", 1, 0)).await?;
    builder.insert(tar_file("/x/one", 11, 2048)).await?;
    builder.insert(FileInfo::symlink("/x/link", "one", Utc::now(), Locator::Synthetic)).await?;
    builder.set_metadata("backend", "tar").await?;
    let index = builder.finalize().await?;
    assert!(index.is_finalized().await?);
    let before = index.list("/x").await?;
    index.close().await;

    let reopened = PathIndex::open(&path, &config, &CacheConfig::default()).await?;
    assert_eq!(reopened.list("/x").await?, before);
    assert_eq!(reopened.versions("/x/one").await?, 2);
    assert_eq!(reopened.lookup("/x/one", Some(1)).await?.unwrap().size, 1);
    assert_eq!(reopened.lookup("/x/link", None).await?.unwrap().linkname.as_deref(), Some("one"));

    let meta = reopened.metadata().await?;
    assert!(meta.finalized);
    assert_eq!(meta.backend.as_deref(), Some("tar"));
    reopened.close().await;
    Ok(())
}

#[tokio::test]
async fn test_unfinalized_index_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("partial.index.sqlite");

    let mut builder = PathIndex::create(
        &IndexLocation::File(path.clone()),
        &IndexConfig { batch_size: 1, ..IndexConfig::default() },
        &CacheConfig::default(),
    )
    .await?;
    builder.insert(tar_file("/a", 1, 0)).await?;
    drop(builder);

    let err = PathIndex::open(&path, &IndexConfig::default(), &CacheConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Index(_)));
    Ok(())
}

#[tokio::test]
async fn test_missing_index_file() {
    let err = PathIndex::open(
        std::path::Path::new("/nonexistent/x.index.sqlite"),
        &IndexConfig::default(),
        &CacheConfig::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SourceError::Index(_)));
}
