//! Data Directories
//!
//! One storage root: tablet shards under `data/`, snapshots under
//! `snapshot/` and the tablet meta database under `meta/`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::Disks;

use super::fs;
use super::meta_store::MetaStore;
use super::StorageMedium;
use crate::config::{StorageConfig, StorePathConfig};
use crate::error::Result;

const DATA_PREFIX: &str = "data";
const SNAPSHOT_PREFIX: &str = "snapshot";
const META_DB: &str = "meta/meta.db";

/// One storage root
pub struct DataDir {
    path: PathBuf,
    path_hash: i64,
    medium: StorageMedium,
    capacity_override: Option<u64>,
    flood_stage_usage_percent: u32,
    flood_stage_left_capacity_bytes: u64,
    max_shard_num: u64,
    disk_capacity_bytes: AtomicU64,
    available_bytes: AtomicU64,
    next_shard: AtomicU64,
    meta_store: MetaStore,
}

impl DataDir {
    /// Open a storage root, creating its layout
    pub fn open(path_config: &StorePathConfig, storage: &StorageConfig) -> Result<Self> {
        let path = path_config.path.clone();
        fs::create_directory(&path.join(DATA_PREFIX))?;
        fs::create_directory(&path.join(SNAPSHOT_PREFIX))?;
        let meta_store = MetaStore::open(&path.join(META_DB))?;

        let dir = Self {
            path_hash: crc32fast::hash(path.to_string_lossy().as_bytes()) as i64,
            path,
            medium: path_config.medium,
            capacity_override: path_config.capacity_bytes,
            flood_stage_usage_percent: storage.flood_stage_usage_percent,
            flood_stage_left_capacity_bytes: storage.flood_stage_left_capacity_bytes,
            max_shard_num: storage.max_shard_num,
            disk_capacity_bytes: AtomicU64::new(0),
            available_bytes: AtomicU64::new(0),
            next_shard: AtomicU64::new(0),
            meta_store,
        };
        dir.update_capacity()?;
        tracing::info!(
            path = %dir.path.display(),
            path_hash = dir.path_hash,
            medium = ?dir.medium,
            capacity = dir.disk_capacity_bytes.load(Ordering::Relaxed),
            available = dir.available_bytes.load(Ordering::Relaxed),
            "data dir opened"
        );
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_hash(&self) -> i64 {
        self.path_hash
    }

    pub fn storage_medium(&self) -> StorageMedium {
        self.medium
    }

    pub fn meta_store(&self) -> &MetaStore {
        &self.meta_store
    }

    pub fn snapshot_root(&self) -> PathBuf {
        self.path.join(SNAPSHOT_PREFIX)
    }

    pub fn shard_path(&self, shard: u64) -> PathBuf {
        self.path.join(DATA_PREFIX).join(shard.to_string())
    }

    /// `<root>/data/<shard>/<tablet_id>/<schema_hash>`
    pub fn tablet_path(&self, shard: u64, tablet_id: i64, schema_hash: i32) -> PathBuf {
        self.shard_path(shard)
            .join(tablet_id.to_string())
            .join(schema_hash.to_string())
    }

    /// Pick the next shard in rotation and make sure it exists
    pub fn get_shard(&self) -> Result<u64> {
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.max_shard_num;
        fs::create_directory(&self.shard_path(shard))?;
        Ok(shard)
    }

    /// Refresh capacity and free space
    pub fn update_capacity(&self) -> Result<()> {
        let (capacity, available) = match self.capacity_override {
            Some(capacity) => {
                let used = fs::dir_size(&self.path)?;
                (capacity, capacity.saturating_sub(used))
            }
            None => match self.disk_space() {
                Some(space) => space,
                None => {
                    tracing::warn!(
                        path = %self.path.display(),
                        "no disk found for data dir, capacity checks disabled"
                    );
                    (u64::MAX, u64::MAX)
                }
            },
        };
        self.disk_capacity_bytes.store(capacity, Ordering::Relaxed);
        self.available_bytes.store(available, Ordering::Relaxed);
        Ok(())
    }

    /// Total and available bytes of the disk mounted under this root
    fn disk_space(&self) -> Option<(u64, u64)> {
        let path = std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| (d.total_space(), d.available_space()))
    }

    pub fn available_bytes(&self) -> u64 {
        self.available_bytes.load(Ordering::Relaxed)
    }

    /// Whether writing `incoming` more bytes would push the disk past its flood stage
    pub fn reach_capacity_limit(&self, incoming: u64) -> bool {
        let capacity = self.disk_capacity_bytes.load(Ordering::Relaxed);
        if capacity == 0 {
            return true;
        }
        let available = self.available_bytes.load(Ordering::Relaxed);
        let used = capacity.saturating_sub(available) as f64 + incoming as f64;
        let used_pct = used / capacity as f64;
        let left = available as i128 - incoming as i128;

        used_pct >= self.flood_stage_usage_percent as f64 / 100.0
            && left <= self.flood_stage_left_capacity_bytes as i128
    }

    /// Remove the tablet-id directory above `tablet_dir` if it is empty
    pub fn delete_tablet_parent_path_if_empty(tablet_dir: &Path) -> Result<()> {
        fs::delete_parent_if_empty(tablet_dir)
    }

    #[cfg(test)]
    pub(crate) fn open_for_test(path: &Path) -> std::sync::Arc<Self> {
        Self::open_with_capacity(path, 1 << 40)
    }

    #[cfg(test)]
    pub(crate) fn open_with_capacity(path: &Path, capacity: u64) -> std::sync::Arc<Self> {
        let storage = StorageConfig::single(path.to_path_buf());
        let path_config = StorePathConfig {
            path: path.to_path_buf(),
            medium: StorageMedium::Hdd,
            capacity_bytes: Some(capacity),
        };
        std::sync::Arc::new(Self::open(&path_config, &storage).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout() {
        let dir = tempdir().unwrap();
        let data_dir = DataDir::open_for_test(dir.path());
        assert!(dir.path().join("data").is_dir());
        assert!(dir.path().join("snapshot").is_dir());
        assert!(dir.path().join("meta/meta.db").exists());

        let shard = data_dir.get_shard().unwrap();
        assert!(data_dir.shard_path(shard).is_dir());
        assert_eq!(
            data_dir.tablet_path(3, 15001, 368169781),
            dir.path().join("data/3/15001/368169781")
        );
        assert_ne!(data_dir.get_shard().unwrap(), shard);
    }

    #[test]
    fn test_capacity_limit() {
        let dir = tempdir().unwrap();
        let data_dir = DataDir::open_with_capacity(dir.path(), 1_000_000);
        assert!(!data_dir.reach_capacity_limit(1_000));
        assert!(data_dir.reach_capacity_limit(2_000_000));

        std::fs::write(dir.path().join("data/blob"), vec![0u8; 950_000]).unwrap();
        data_dir.update_capacity().unwrap();
        assert!(data_dir.reach_capacity_limit(10_000));
    }
}
