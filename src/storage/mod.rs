//! SQLite-backed path index.

pub mod builder;
pub mod index;
pub mod models;
pub mod pool;

pub use builder::IndexBuilder;
pub use index::PathIndex;
pub use models::{FileRow, IndexMetadata};
pub use pool::{DatabasePool, DatabaseTransaction, IndexLocation};

use std::path::{Path, PathBuf};

use crate::config::IndexConfig;

/// File name suffix of on-disk indexes.
pub const INDEX_SUFFIX: &str = ".index.sqlite";

/// Where the index for `archive` should live under `config`.
///
/// Next to the archive by default; inside `config.directory` when set, with
/// the archive's full path flattened into the file name so that archives of
/// the same name in different folders do not collide.
pub fn index_location_for(archive: &Path, config: &IndexConfig) -> IndexLocation {
    if config.in_memory {
        return IndexLocation::Memory;
    }
    match &config.directory {
        Some(directory) => {
            let absolute = std::path::absolute(archive).unwrap_or_else(|_| archive.to_path_buf());
            let flattened: String = absolute
                .to_string_lossy()
                .trim_start_matches('/')
                .replace('/', "_");
            IndexLocation::File(directory.join(format!("{}{}", flattened, INDEX_SUFFIX)))
        }
        None => {
            let mut name = archive.as_os_str().to_os_string();
            name.push(INDEX_SUFFIX);
            IndexLocation::File(PathBuf::from(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_next_to_archive() {
        let location = index_location_for(Path::new("/data/foo.tar"), &IndexConfig::default());
        assert_eq!(location, IndexLocation::File(PathBuf::from("/data/foo.tar.index.sqlite")));
    }

    #[test]
    fn test_index_in_directory() {
        let config = IndexConfig {
            directory: Some(PathBuf::from("/var/cache/arcmount")),
            ..IndexConfig::default()
        };
        let location = index_location_for(Path::new("/data/foo.tar"), &config);
        assert_eq!(
            location,
            IndexLocation::File(PathBuf::from("/var/cache/arcmount/data_foo.tar.index.sqlite"))
        );
    }

    #[test]
    fn test_in_memory_index() {
        let location = index_location_for(Path::new("/data/foo.tar"), &IndexConfig::in_memory());
        assert_eq!(location, IndexLocation::Memory);
    }
}
