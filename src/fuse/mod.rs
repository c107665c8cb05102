// FUSE interface implementation
//
// Exposes any mount source as a read-only POSIX filesystem.

pub mod adapter;
pub mod mount;

pub use adapter::FuseAdapter;
pub use mount::{MountOptions, mount};
