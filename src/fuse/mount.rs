// FUSE mount management
//
// Mounts a mount source read-only at a host directory.

use super::FuseAdapter;
use crate::config::FuseConfig;
use crate::source::MountSource;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Mount options for the FUSE filesystem. The mount is always read-only.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Allow other users to access the filesystem
    pub allow_other: bool,

    /// Allow root to access the filesystem
    pub allow_root: bool,

    /// Filesystem name (for mtab)
    pub fsname: Option<String>,

    /// Auto-unmount on process exit
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self::from(&FuseConfig::default())
    }
}

impl From<&FuseConfig> for MountOptions {
    fn from(config: &FuseConfig) -> Self {
        Self {
            allow_other: config.allow_other,
            allow_root: false,
            fsname: Some(config.fsname.clone()),
            auto_unmount: config.auto_unmount,
        }
    }
}

impl MountOptions {
    fn to_fuser_options(&self) -> Vec<fuser::MountOption> {
        let mut options = vec![fuser::MountOption::RO, fuser::MountOption::NoExec];

        if self.allow_other {
            options.push(fuser::MountOption::AllowOther);
        }

        if self.allow_root {
            options.push(fuser::MountOption::AllowRoot);
        }

        if let Some(ref fsname) = self.fsname {
            options.push(fuser::MountOption::FSName(fsname.clone()));
            options.push(fuser::MountOption::Subtype("arcmount".to_string()));
        }

        if self.auto_unmount {
            options.push(fuser::MountOption::AutoUnmount);
        }

        options
    }
}

/// Mount `source` at `mountpoint` in a background FUSE session.
///
/// The filesystem stays mounted until the returned session is dropped.
pub fn mount(
    source: Arc<dyn MountSource>,
    mountpoint: impl AsRef<Path>,
    options: MountOptions,
) -> Result<fuser::BackgroundSession> {
    let mountpoint = mountpoint.as_ref();

    if !mountpoint.exists() {
        anyhow::bail!("Mount point does not exist: {}", mountpoint.display());
    }

    if !mountpoint.is_dir() {
        anyhow::bail!("Mount point is not a directory: {}", mountpoint.display());
    }

    let adapter = FuseAdapter::new(source).context("Failed to create FUSE runtime")?;

    tracing::info!(mountpoint = %mountpoint.display(), ?options, "Mounting archive filesystem");

    let session = fuser::spawn_mount2(adapter, mountpoint, &options.to_fuser_options())
        .with_context(|| format!("Failed to mount filesystem at {}", mountpoint.display()))?;

    tracing::info!("Filesystem mounted successfully");

    Ok(session)
}
