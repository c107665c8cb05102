use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arcmount::backends::{ArchiveFormat, PersistedIndexSource, TarSource, ZipSource, open_archive};
use arcmount::config::Config;
use arcmount::fuse::{MountOptions, mount};
use arcmount::layer::{AutoMountLayer, FileVersionLayer, UnionSource};
use arcmount::source::{FileInfo, FileKind, MountSource};
use arcmount::storage::{INDEX_SUFFIX, PathIndex};

#[derive(Parser, Debug)]
#[command(name = "arcmount", version, about = "Browse and mount archives read-only")]
struct Cli {
    /// Configuration file stem (without extension)
    #[arg(long, global = true, env = "ARCMOUNT_CONFIG")]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build (or reuse) the index of an archive and print its statistics
    Index { archive: PathBuf },

    /// List a directory inside an archive
    Ls {
        archive: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },

    /// Write a file from an archive to stdout
    Cat {
        archive: PathBuf,
        path: String,
        /// Version to read instead of the latest
        #[arg(long)]
        version: Option<u32>,
    },

    /// Show every stored version of a path
    Versions { archive: PathBuf, path: String },

    /// Mount one or more archives (unioned, first wins) read-only
    ///
    /// The last path is the mountpoint unless `fuse.mount_point` is
    /// configured, in which case every path is an archive.
    Mount {
        #[arg(required = true, num_args = 1.., value_name = "ARCHIVE... [MOUNTPOINT]")]
        paths: Vec<PathBuf>,
        /// Mount archives found inside the archives as directories
        #[arg(long)]
        recursive: bool,
        /// Expose older file versions under `<file>.versions/`
        #[arg(long)]
        versions: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "arcmount=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(stem) => Config::load_from(stem),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    match cli.command {
        Command::Index { archive } => index(&archive, &config).await,
        Command::Ls { archive, path } => ls(&archive, &path, &config).await,
        Command::Cat { archive, path, version } => cat(&archive, &path, version, &config).await,
        Command::Versions { archive, path } => versions(&archive, &path, &config).await,
        Command::Mount { paths, recursive, versions } => {
            let (archives, mountpoint) = split_mount_args(&paths, &config)?;
            mount_archives(archives, &mountpoint, recursive, versions, &config).await
        }
    }
}

/// Separate archives from the mountpoint on the `mount` command line.
fn split_mount_args<'a>(
    paths: &'a [PathBuf],
    config: &Config,
) -> Result<(&'a [PathBuf], PathBuf)> {
    if let Some(mountpoint) = &config.fuse.mount_point {
        return Ok((paths, mountpoint.clone()));
    }
    match paths.split_last() {
        Some((mountpoint, archives)) if !archives.is_empty() => Ok((archives, mountpoint.clone())),
        _ => bail!("No mountpoint given and fuse.mount_point is not configured"),
    }
}

/// Open an archive, or a persisted index file on its own.
async fn open_source(path: &Path, config: &Config) -> Result<Arc<dyn MountSource>> {
    if path.to_string_lossy().ends_with(INDEX_SUFFIX) {
        let source = PersistedIndexSource::open(path, config)
            .await
            .with_context(|| format!("Failed to open index {}", path.display()))?;
        if !source.has_content() {
            tracing::warn!(index = %path.display(), "Archive unavailable, serving metadata only");
        }
        return Ok(Arc::new(source));
    }
    open_archive(path, config)
        .await
        .with_context(|| format!("Failed to open archive {}", path.display()))
}

async fn index(archive: &Path, config: &Config) -> Result<()> {
    let format = ArchiveFormat::detect(archive)
        .with_context(|| format!("Failed to detect format of {}", archive.display()))?;
    let started = std::time::Instant::now();
    let index: PathIndex = match format {
        ArchiveFormat::Tar(_) => TarSource::open(archive, config).await?.index().clone(),
        ArchiveFormat::Zip => ZipSource::open(archive, config).await?.index().clone(),
        ArchiveFormat::Folder => bail!("{} is a directory and needs no index", archive.display()),
    };

    let entries = index.entry_count().await?;
    let metadata = index.metadata().await?;
    println!("archive:     {}", archive.display());
    println!("format:      {:?}", format);
    println!("entries:     {}", entries);
    println!("index:       {:?}", index.location());
    println!("fingerprint: {}", metadata.archive_fingerprint.unwrap_or_default());
    println!("elapsed:     {:.2?}", started.elapsed());
    index.close().await;
    Ok(())
}

async fn ls(archive: &Path, path: &str, config: &Config) -> Result<()> {
    let source = open_source(archive, config).await?;
    let info = source
        .lookup(path)
        .await?
        .with_context(|| format!("{}: no such file or directory", path))?;

    if info.is_dir() {
        for child in source.list(path).await?.values() {
            println!("{}", describe(child));
        }
    } else {
        println!("{}", describe(&info));
    }
    source.close().await?;
    Ok(())
}

async fn cat(archive: &Path, path: &str, version: Option<u32>, config: &Config) -> Result<()> {
    let source = open_source(archive, config).await?;
    let info = match version {
        Some(version) => source.lookup_version(path, version).await?,
        None => source.lookup(path).await?,
    }
    .with_context(|| format!("{}: no such file or version", path))?;

    let mut handle = source.open(&info).await?;
    tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
        let mut stdout = std::io::stdout().lock();
        std::io::copy(&mut handle, &mut stdout)
    })
    .await?
    .with_context(|| format!("Failed to read {}", path))?;

    source.close().await?;
    Ok(())
}

async fn versions(archive: &Path, path: &str, config: &Config) -> Result<()> {
    let source = open_source(archive, config).await?;
    let count = source.versions(path).await?;
    if count == 0 {
        bail!("{}: no such file or directory", path);
    }
    for version in 1..=count {
        if let Some(info) = source.lookup_version(path, version).await? {
            println!("{:>4}  {}", version, describe(&info));
        }
    }
    source.close().await?;
    Ok(())
}

async fn mount_archives(
    archives: &[PathBuf],
    mountpoint: &Path,
    recursive: bool,
    versions: bool,
    config: &Config,
) -> Result<()> {
    let mut union = UnionSource::default();
    for archive in archives {
        union.push(open_source(archive, config).await?);
    }
    let mut source: Arc<dyn MountSource> = match union.sources() {
        [single] => Arc::clone(single),
        _ => Arc::new(union),
    };
    if recursive || config.scan.recursive {
        source = Arc::new(AutoMountLayer::new(source, config));
    }
    if versions {
        source = Arc::new(FileVersionLayer::new(source));
    }

    let session = mount(Arc::clone(&source), mountpoint, MountOptions::from(&config.fuse))?;
    println!("Mounted {} archive(s) at {}", archives.len(), mountpoint.display());

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    tracing::info!(mountpoint = %mountpoint.display(), "Unmounting");
    drop(session);
    source.close().await?;
    Ok(())
}

fn describe(info: &FileInfo) -> String {
    let mut line = format!(
        "{} {:>10} {} {}",
        mode_string(info),
        info.size,
        info.mtime.format("%Y-%m-%d %H:%M"),
        info.name()
    );
    if let Some(target) = &info.linkname {
        line.push_str(" -> ");
        line.push_str(target);
    }
    line
}

fn mode_string(info: &FileInfo) -> String {
    let kind = match info.kind() {
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        FileKind::Fifo => 'p',
        FileKind::CharDevice => 'c',
        FileKind::BlockDevice => 'b',
        FileKind::Socket => 's',
        FileKind::RegularFile => '-',
    };
    let perms = info.permissions();
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (perms >> shift) & 0o7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}
