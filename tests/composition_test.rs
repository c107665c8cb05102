//! Composite source integration tests - union precedence, subvolumes,
//! nested archive mounting and the versions view

use anyhow::Result;
use arcmount::backends::{FolderSource, SingleFileSource, TarSource};
use arcmount::config::Config;
use arcmount::fs::{SourceError, SourceResult};
use arcmount::layer::{AutoMountLayer, FileVersionLayer, SubvolumesSource, UnionSource};
use arcmount::source::{FileHandle, FileInfo, MountSource};
use async_trait::async_trait;
use mockall::mock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mock! {
    pub Layer {}

    #[async_trait]
    impl MountSource for Layer {
        async fn lookup(&self, path: &str) -> SourceResult<Option<FileInfo>>;
        async fn lookup_version(&self, path: &str, version: u32) -> SourceResult<Option<FileInfo>>;
        async fn versions(&self, path: &str) -> SourceResult<u32>;
        async fn list(&self, path: &str) -> SourceResult<BTreeMap<String, FileInfo>>;
        async fn open(&self, info: &FileInfo) -> SourceResult<FileHandle>;
    }
}

fn tar_with(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_600_000_000);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn config() -> Config {
    let mut config = Config::default();
    config.index.in_memory = true;
    config.index.reuse_existing = false;
    config
}

async fn tar_source(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> Result<Arc<dyn MountSource>> {
    let path = write(dir, name, &tar_with(files));
    Ok(Arc::new(TarSource::open(&path, &config()).await?))
}

#[tokio::test]
async fn test_union_of_archives() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let top = tar_source(dir.path(), "top.tar", &[("etc/motd", b"hello"), ("etc/top", b"t")]).await?;
    let bottom = tar_source(
        dir.path(),
        "bottom.tar",
        &[("etc/motd", b"old greeting"), ("etc/bottom", b"b")],
    )
    .await?;
    let union = UnionSource::new(vec![top, bottom]);

    let motd = union.lookup("/etc/motd").await?.unwrap();
    assert_eq!(union.read(&motd, 100, 0).await?, b"hello");
    assert_eq!(motd.version, 2);
    assert_eq!(union.versions("/etc/motd").await?, 2);

    let oldest = union.lookup_version("/etc/motd", 1).await?.unwrap();
    assert_eq!(union.read(&oldest, 100, 0).await?, b"old greeting");

    let etc = union.list("/etc").await?;
    assert_eq!(etc.keys().collect::<Vec<_>>(), vec!["bottom", "motd", "top"]);
    assert_eq!(union.read(&etc["bottom"], 10, 0).await?, b"b");
    Ok(())
}

#[tokio::test]
async fn test_union_falls_through_absent_layer() -> Result<()> {
    let mut empty = MockLayer::new();
    empty.expect_lookup().times(1).returning(|_| Ok(None));
    empty.expect_versions().returning(|_| Ok(0));

    let union = UnionSource::new(vec![
        Arc::new(empty),
        Arc::new(SingleFileSource::new("/only/here", b"found".to_vec())),
    ]);
    let info = union.lookup("/only/here").await?.unwrap();
    assert_eq!(info.version, 1);
    assert_eq!(union.read(&info, 10, 0).await?, b"found");
    Ok(())
}

#[tokio::test]
async fn test_union_propagates_layer_errors() {
    let mut broken = MockLayer::new();
    broken
        .expect_lookup()
        .returning(|path| Err(SourceError::corrupt(format!("bad header near {}", path))));
    broken.expect_versions().returning(|_| Ok(0));

    let union = UnionSource::new(vec![
        Arc::new(SingleFileSource::new("/a", b"a".to_vec())),
        Arc::new(broken),
    ]);
    assert_eq!(union.lookup("/a").await.unwrap().unwrap().version, 1);
    assert!(matches!(union.lookup("/b").await, Err(SourceError::CorruptArchive(_))));
}

#[tokio::test]
async fn test_single_file_source_normalizes_path() -> Result<()> {
    let source = SingleFileSource::new("/folder/../foo", b"bar".to_vec());
    assert_eq!(source.path(), "/foo");

    let root = source.list("/").await?;
    assert_eq!(root.keys().collect::<Vec<_>>(), vec!["foo"]);
    let foo = source.lookup("/foo").await?.unwrap();
    assert_eq!(source.read(&foo, 10, 0).await?, b"bar");
    assert!(source.lookup("/folder").await?.is_none());
    assert!(matches!(source.list("/foo").await, Err(SourceError::NotADirectory(_))));
    Ok(())
}

#[tokio::test]
async fn test_folder_overrides_archive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let overlay = dir.path().join("overlay");
    std::fs::create_dir_all(overlay.join("etc"))?;
    std::fs::write(overlay.join("etc/motd"), "patched")?;

    let archive = tar_source(dir.path(), "base.tar", &[("etc/motd", b"original"), ("etc/x", b"x")])
        .await?;
    let union = UnionSource::new(vec![Arc::new(FolderSource::new(&overlay)?), archive]);

    let motd = union.lookup("/etc/motd").await?.unwrap();
    assert_eq!(union.read(&motd, 100, 0).await?, b"patched");
    assert_eq!(union.list("/etc").await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_subvolumes_of_archives() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut subvolumes = SubvolumesSource::new();
    subvolumes.add("a", tar_source(dir.path(), "a.tar", &[("x", b"from a")]).await?)?;
    subvolumes.add("b", tar_source(dir.path(), "b.tar", &[("x", b"from b")]).await?)?;

    assert_eq!(subvolumes.list("/").await?.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    let x = subvolumes.lookup("/b/x").await?.unwrap();
    assert_eq!(x.path, "/b/x");
    assert_eq!(subvolumes.read(&x, 100, 0).await?, b"from b");
    Ok(())
}

#[tokio::test]
async fn test_automount_nested_archive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let inner = tar_with(&[("fighter/bar", b"nested bytes")]);
    let files: &[(&str, &[u8])] = &[("foo/ufo", b"iriya\n"), ("foo/lighter.tar", &inner)];
    let outer = tar_source(dir.path(), "outer.tar", files).await?;
    let layer = AutoMountLayer::new(outer, &config());

    let lighter = layer.lookup("/foo/lighter.tar").await?.unwrap();
    assert!(lighter.is_dir());
    assert_eq!(layer.list("/foo").await?["lighter.tar"].path, "/foo/lighter.tar");

    let listing = layer.list("/foo/lighter.tar").await?;
    assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["fighter"]);
    assert_eq!(listing["fighter"].path, "/foo/lighter.tar/fighter");

    let bar = layer.lookup("/foo/lighter.tar/fighter/bar").await?.unwrap();
    assert_eq!(layer.read(&bar, 100, 0).await?, b"nested bytes");

    let ufo = layer.lookup("/foo/ufo").await?.unwrap();
    assert_eq!(layer.read(&ufo, 100, 0).await?, b"iriya\n");
    layer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_automount_host_archive_in_folder() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let tree = dir.path().join("tree");
    std::fs::create_dir_all(&tree)?;
    write(&tree, "data.tar", &tar_with(&[("inside.txt", b"on the host")]));
    write(&tree, "fake.tar", b"not an archive at all");

    let layer = AutoMountLayer::new(Arc::new(FolderSource::new(&tree)?), &config());
    let inside = layer.lookup("/data.tar/inside.txt").await?.unwrap();
    assert_eq!(layer.read(&inside, 100, 0).await?, b"on the host");

    let fake = layer.lookup("/fake.tar").await?.unwrap();
    assert!(fake.is_file());
    assert_eq!(layer.read(&fake, 100, 0).await?, b"not an archive at all");
    Ok(())
}

#[tokio::test]
async fn test_automount_depth_limit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let inner = tar_with(&[("bar", b"x")]);
    let outer = tar_source(dir.path(), "outer.tar", &[("lighter.tar", inner.as_slice())]).await?;
    let mut config = config();
    config.scan.max_recursion_depth = 0;

    let layer = AutoMountLayer::new(outer, &config);
    assert!(layer.lookup("/lighter.tar").await?.unwrap().is_file());
    assert!(layer.lookup("/lighter.tar/bar").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_versions_view_over_archive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = tar_source(
        dir.path(),
        "notes.tar",
        &[("notes.txt", b"draft"), ("notes.txt", b"final text")],
    )
    .await?;
    let layer = FileVersionLayer::new(source);

    let listing = layer.list("/notes.txt.versions").await?;
    assert_eq!(listing.keys().collect::<Vec<_>>(), vec!["1", "2"]);
    let draft = layer.lookup("/notes.txt.versions/1").await?.unwrap();
    assert_eq!(layer.read(&draft, 100, 0).await?, b"draft");
    assert_eq!(layer.list("/").await?.keys().collect::<Vec<_>>(), vec!["notes.txt"]);
    Ok(())
}
