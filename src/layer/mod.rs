//! Composite mount sources.
//!
//! Every layer here is itself a [`MountSource`](crate::source::MountSource)
//! wrapping other sources:
//! - [`UnionSource`] overlays sources with first-registered precedence
//! - [`SubvolumesSource`] mounts named sources side by side
//! - [`FileVersionLayer`] exposes older file versions under `f.versions/`
//! - [`AutoMountLayer`] presents nested archives as directories

mod automount;
mod subvolumes;
mod union_view;
mod versions;

pub use automount::{AutoMountLayer, is_archive_name};
pub use subvolumes::SubvolumesSource;
pub use union_view::UnionSource;
pub use versions::{FileVersionLayer, VERSIONS_SUFFIX};
