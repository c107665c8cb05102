//! The polymorphic mount source contract and the value types it exchanges.

pub mod file_info;
pub mod handle;
pub mod interface;

pub use file_info::{FileInfo, FileKind, Locator};
pub use handle::{EntryReader, FileHandle, HostRangeReader, MemoryReader};
pub use interface::{MountSource, ensure_readable, require_directory};

#[cfg(any(test, feature = "mockall"))]
pub use interface::MockMountSource;
