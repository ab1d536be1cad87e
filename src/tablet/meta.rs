//! Tablet metadata
//!
//! `TabletMeta` is what a tablet persists: identity, rowset list, binlog
//! metas, delete bitmap and cooldown identity. It travels between nodes as
//! a bincode-encoded `<tablet_id>.hdr` file inside snapshots.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::rowset::{RowsetId, RowsetMeta};
use crate::error::{Error, Result};
use crate::storage::{fs, StorageMedium};
use crate::version::{self, Version};

/// Header file suffix
pub const HEADER_SUFFIX: &str = ".hdr";
/// File carrying binlog metas inside a snapshot
pub const BINLOG_METAS_FILE: &str = "rowset_binlog_metas.bin";
/// Cumulative layer point meaning "recompute"
pub const INVALID_CUMULATIVE_POINT: i64 = -1;

/// Lifecycle state of a tablet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletState {
    /// Left behind by an unfinished schema change
    NotReady,
    Running,
    Shutdown,
}

/// Binlog settings of a tablet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinlogConfig {
    pub enable: bool,
}

/// Binlog description of one rowset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsetBinlogMeta {
    pub rowset_id: RowsetId,
    pub version: Version,
    pub num_segments: u32,
}

/// Binlog metas shipped with a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowsetBinlogMetas {
    pub metas: Vec<RowsetBinlogMeta>,
}

impl RowsetBinlogMetas {
    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::from_io(path, e))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes).map_err(|e| Error::from_io(path, e))
    }
}

/// Key of one delete bitmap entry: rowset, segment, version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BitmapKey {
    pub rowset_id: RowsetId,
    pub segment_id: u32,
    pub version: i64,
}

/// Merge-on-write delete bitmap: deleted row ids per segment and version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteBitmap {
    entries: BTreeMap<BitmapKey, BTreeSet<u32>>,
}

impl DeleteBitmap {
    /// Mark `row_id` deleted
    pub fn add(&mut self, key: BitmapKey, row_id: u32) {
        self.entries.entry(key).or_default().insert(row_id);
    }

    pub fn contains(&self, key: &BitmapKey, row_id: u32) -> bool {
        self.entries
            .get(key)
            .map(|rows| rows.contains(&row_id))
            .unwrap_or(false)
    }

    /// Union `other` into this bitmap
    pub fn merge(&mut self, other: &DeleteBitmap) {
        for (key, rows) in &other.entries {
            self.entries
                .entry(*key)
                .or_default()
                .extend(rows.iter().copied());
        }
    }

    /// Drop every entry of `rowset_id`
    pub fn remove_rowset(&mut self, rowset_id: &RowsetId) {
        self.entries.retain(|k, _| k.rowset_id != *rowset_id);
    }

    /// Keep only entries of rowsets accepted by `keep`
    pub fn retain_rowsets<F: Fn(&RowsetId) -> bool>(&mut self, keep: F) {
        self.entries.retain(|k, _| keep(&k.rowset_id));
    }

    /// Move every entry of `from` to `to`
    pub fn rename_rowset(&mut self, from: &RowsetId, to: &RowsetId) {
        let moved: Vec<(BitmapKey, BTreeSet<u32>)> = self
            .entries
            .iter()
            .filter(|(k, _)| k.rowset_id == *from)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (key, rows) in moved {
            self.entries.remove(&key);
            let new_key = BitmapKey {
                rowset_id: *to,
                ..key
            };
            self.entries.insert(new_key, rows);
        }
    }

    /// Number of deleted rows across all entries
    pub fn cardinality(&self) -> usize {
        self.entries.values().map(|r| r.len()).sum()
    }
}

/// Persistent tablet metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletMeta {
    pub tablet_id: i64,
    pub schema_hash: i32,
    pub replica_id: i64,
    pub table_id: i64,
    pub partition_id: i64,
    pub shard_id: u64,
    pub tablet_state: TabletState,
    #[serde(default)]
    pub storage_medium: StorageMedium,
    #[serde(default)]
    pub cooldown_meta_id: Option<Uuid>,
    #[serde(default)]
    pub enable_unique_key_merge_on_write: bool,
    #[serde(default)]
    pub binlog_config: BinlogConfig,
    pub rs_metas: Vec<RowsetMeta>,
    #[serde(default)]
    pub binlog_metas: Vec<RowsetBinlogMeta>,
    #[serde(default)]
    pub delete_bitmap: DeleteBitmap,
    pub cumulative_layer_point: i64,
}

impl TabletMeta {
    /// Empty meta for a fresh tablet
    pub fn new(
        tablet_id: i64,
        schema_hash: i32,
        replica_id: i64,
        table_id: i64,
        partition_id: i64,
    ) -> Self {
        Self {
            tablet_id,
            schema_hash,
            replica_id,
            table_id,
            partition_id,
            shard_id: 0,
            tablet_state: TabletState::Running,
            storage_medium: StorageMedium::default(),
            cooldown_meta_id: None,
            enable_unique_key_merge_on_write: false,
            binlog_config: BinlogConfig::default(),
            rs_metas: Vec::new(),
            binlog_metas: Vec::new(),
            delete_bitmap: DeleteBitmap::default(),
            cumulative_layer_point: INVALID_CUMULATIVE_POINT,
        }
    }

    /// `<dir>/<tablet_id>.hdr`
    pub fn header_file_path(dir: &Path, tablet_id: i64) -> PathBuf {
        dir.join(format!("{}{}", tablet_id, HEADER_SUFFIX))
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Load a meta from a header file
    pub fn create_from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::from_io(path, e))?;
        Self::deserialize(&bytes).map_err(|e| {
            Error::Internal(format!("bad tablet header {}: {}", path.display(), e))
        })
    }

    /// Write this meta as a header file
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.serialize()?;
        fs::write_file(path, &bytes)
    }

    /// Version range of the rowset with the highest end version
    pub fn max_version(&self) -> Option<Version> {
        self.rs_metas.iter().map(|m| m.version).max_by_key(|v| v.end)
    }

    pub fn max_continuous_version(&self) -> i64 {
        version::max_continuous_version(self.rs_metas.iter().map(|m| m.version))
    }

    /// Rowset meta with exactly this version range
    pub fn acquire_rs_meta_by_version(&self, version: &Version) -> Option<&RowsetMeta> {
        self.rs_metas.iter().find(|m| m.version == *version)
    }

    /// Rowset meta whose range contains `version`
    pub fn find_covering_rs_meta(&self, version: &Version) -> Option<&RowsetMeta> {
        self.rs_metas.iter().find(|m| m.version.contains(version))
    }

    /// Add binlog metas, replacing any for the same rowset
    pub fn ingest_binlog_metas(&mut self, metas: &RowsetBinlogMetas) {
        for meta in &metas.metas {
            self.binlog_metas.retain(|m| m.rowset_id != meta.rowset_id);
            self.binlog_metas.push(meta.clone());
        }
        self.binlog_metas.sort_by_key(|m| m.version);
    }

    pub fn total_rows(&self) -> u64 {
        self.rs_metas.iter().map(|m| m.num_rows).sum()
    }

    pub fn total_data_size(&self) -> u64 {
        self.rs_metas.iter().map(|m| m.data_disk_size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rs_meta(id: u64, start: i64, end: i64) -> RowsetMeta {
        RowsetMeta {
            rowset_id: RowsetId::new(1, id),
            tablet_id: 10,
            tablet_schema_hash: 1,
            partition_id: 2,
            version: Version::new(start, end),
            num_segments: 1,
            num_rows: 5,
            data_disk_size: 50,
            resource_id: None,
            creation_time: 0,
        }
    }

    #[test]
    fn test_header_file_roundtrip() {
        let dir = tempdir().unwrap();
        let mut meta = TabletMeta::new(10, 1, 100, 3, 2);
        meta.rs_metas.push(rs_meta(1, 0, 5));
        meta.rs_metas.push(rs_meta(2, 6, 8));
        meta.cooldown_meta_id = Some(Uuid::new_v4());

        let path = TabletMeta::header_file_path(dir.path(), 10);
        assert!(path.ends_with("10.hdr"));
        meta.save(&path).unwrap();
        let loaded = TabletMeta::create_from_file(&path).unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(loaded.max_version(), Some(Version::new(6, 8)));
        assert_eq!(loaded.max_continuous_version(), 8);
        assert_eq!(loaded.total_rows(), 10);
    }

    #[test]
    fn test_garbage_header_is_internal_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1.hdr");
        std::fs::write(&path, b"\x01").unwrap();
        assert!(matches!(
            TabletMeta::create_from_file(&path),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_version_lookup() {
        let mut meta = TabletMeta::new(10, 1, 100, 3, 2);
        meta.rs_metas.push(rs_meta(1, 8, 8));
        meta.rs_metas.push(rs_meta(2, 9, 10));
        assert!(meta.acquire_rs_meta_by_version(&Version::singleton(8)).is_some());
        assert!(meta.acquire_rs_meta_by_version(&Version::singleton(9)).is_none());
        assert_eq!(
            meta.find_covering_rs_meta(&Version::singleton(9)).unwrap().version,
            Version::new(9, 10)
        );
        assert!(meta.find_covering_rs_meta(&Version::singleton(11)).is_none());
    }

    #[test]
    fn test_delete_bitmap_merge_and_rename() {
        let a = RowsetId::new(1, 1);
        let b = RowsetId::new(1, 2);
        let key = |id| BitmapKey { rowset_id: id, segment_id: 0, version: 3 };

        let mut local = DeleteBitmap::default();
        local.add(key(a), 1);
        let mut remote = DeleteBitmap::default();
        remote.add(key(a), 2);
        remote.add(key(b), 7);

        local.merge(&remote);
        assert!(local.contains(&key(a), 1));
        assert!(local.contains(&key(a), 2));
        assert!(local.contains(&key(b), 7));
        assert_eq!(local.cardinality(), 3);

        let c = RowsetId::new(2, 9);
        local.rename_rowset(&b, &c);
        assert!(!local.contains(&key(b), 7));
        assert!(local.contains(&key(c), 7));

        local.remove_rowset(&a);
        assert_eq!(local.cardinality(), 1);
    }

    #[test]
    fn test_ingest_binlog_metas_replaces_same_rowset() {
        let mut meta = TabletMeta::new(10, 1, 100, 3, 2);
        let id = RowsetId::new(1, 1);
        let first = RowsetBinlogMetas {
            metas: vec![RowsetBinlogMeta { rowset_id: id, version: Version::singleton(4), num_segments: 1 }],
        };
        meta.ingest_binlog_metas(&first);
        let second = RowsetBinlogMetas {
            metas: vec![RowsetBinlogMeta { rowset_id: id, version: Version::singleton(4), num_segments: 2 }],
        };
        meta.ingest_binlog_metas(&second);
        assert_eq!(meta.binlog_metas.len(), 1);
        assert_eq!(meta.binlog_metas[0].num_segments, 2);
    }
}
