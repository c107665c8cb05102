use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub scan: ScanConfig,
    pub cache: CacheConfig,
    pub fuse: FuseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Directory for index files. `None` puts the index next to the archive.
    pub directory: Option<PathBuf>,
    /// Keep the index in memory only.
    pub in_memory: bool,
    /// Rows per multi-row INSERT while building.
    pub batch_size: usize,
    /// Reader connections for file-backed indexes.
    pub max_connections: u32,
    /// Reuse a finalized index whose archive fingerprint still matches.
    pub reuse_existing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Keep reading past zero blocks (concatenated tar archives).
    pub ignore_zeros: bool,
    /// Mount archives found inside archives.
    pub recursive: bool,
    pub max_recursion_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseConfig {
    pub mount_point: Option<PathBuf>,
    pub allow_other: bool,
    pub fsname: String,
    pub auto_unmount: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            directory: None,
            in_memory: false,
            batch_size: 1000,
            max_connections: 4,
            reuse_existing: true,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { ignore_zeros: false, recursive: false, max_recursion_depth: 4 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 10000, ttl_seconds: 300 }
    }
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            mount_point: None,
            allow_other: false,
            fsname: "arcmount".to_string(),
            auto_unmount: true,
        }
    }
}

impl IndexConfig {
    /// Configuration for a throwaway in-memory index.
    pub fn in_memory() -> Self {
        Self { in_memory: true, reuse_existing: false, ..Self::default() }
    }
}

impl Config {
    /// Load `arcmount.toml` (optional) and `ARCMOUNT__*` environment
    /// variables on top of the defaults.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from("arcmount")
    }

    pub fn load_from(file_stem: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(file_stem).required(false))
            .add_source(config::Environment::with_prefix("ARCMOUNT").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert!(config.index.directory.is_none());
        assert!(!config.index.in_memory);
        assert_eq!(config.index.batch_size, 1000);
        assert_eq!(config.index.max_connections, 4);
        assert!(config.index.reuse_existing);

        assert!(!config.scan.ignore_zeros);
        assert!(!config.scan.recursive);
        assert_eq!(config.scan.max_recursion_depth, 4);

        assert_eq!(config.cache.max_entries, 10000);
        assert_eq!(config.cache.ttl_seconds, 300);

        assert_eq!(config.fuse.fsname, "arcmount");
        assert!(!config.fuse.allow_other);
        assert!(config.fuse.auto_unmount);
    }

    #[test]
    fn test_in_memory_index_config() {
        let index = IndexConfig::in_memory();
        assert!(index.in_memory);
        assert!(!index.reuse_existing);
        assert_eq!(index.batch_size, 1000);
    }

    #[test]
    fn test_config_deserialization_partial() {
        let json = r#"{
            "index": { "batch_size": 50, "in_memory": true },
            "scan": { "recursive": true }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.index.batch_size, 50);
        assert!(config.index.in_memory);
        assert_eq!(config.index.max_connections, 4);
        assert!(config.scan.recursive);
        assert_eq!(config.scan.max_recursion_depth, 4);
        assert_eq!(config.cache.max_entries, 10000);
    }

    #[test]
    #[serial]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("arcmount");
        std::fs::write(
            stem.with_extension("toml"),
            "[index]\nbatch_size = 10\n\n[cache]\nttl_seconds = 5\n",
        )
        .unwrap();

        let config = Config::load_from(stem.to_str().unwrap()).unwrap();
        assert_eq!(config.index.batch_size, 10);
        assert_eq!(config.cache.ttl_seconds, 5);
        assert_eq!(config.cache.max_entries, 10000);
    }

    #[test]
    #[serial]
    fn test_config_load_from_env() {
        // SAFETY: serialized with the other environment tests.
        unsafe { std::env::set_var("ARCMOUNT__SCAN__IGNORE_ZEROS", "true") };
        let config = Config::load_from("does-not-exist").unwrap();
        unsafe { std::env::remove_var("ARCMOUNT__SCAN__IGNORE_ZEROS") };

        assert!(config.scan.ignore_zeros);
    }
}
