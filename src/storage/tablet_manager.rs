//! Tablet Registry
//!
//! Tracks the tablets loaded on this node, the tablets busy with a
//! structural operation and the visible version of each partition.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::data_dir::DataDir;
use super::fs;
use crate::error::{Error, Result};
use crate::tablet::{Tablet, TabletInfo, TabletMeta, TabletSharedPtr, TabletState};

/// Registry of the tablets on this node
#[derive(Default)]
pub struct TabletManager {
    tablets: RwLock<HashMap<i64, TabletSharedPtr>>,
    /// tablet id -> operation holding it
    transition: Mutex<HashMap<i64, String>>,
    /// partition id -> visible version
    partition_versions: RwLock<HashMap<i64, i64>>,
}

impl TabletManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_tablet(&self, tablet_id: i64) -> Option<TabletSharedPtr> {
        self.tablets.read().get(&tablet_id).cloned()
    }

    pub fn all_tablets(&self) -> Vec<TabletSharedPtr> {
        let mut tablets: Vec<_> = self.tablets.read().values().cloned().collect();
        tablets.sort_by_key(|t| t.tablet_id());
        tablets
    }

    pub fn tablet_count(&self) -> usize {
        self.tablets.read().len()
    }

    /// Register a tablet; fails if the id is taken
    pub fn add_tablet(&self, tablet: TabletSharedPtr) -> Result<()> {
        let mut tablets = self.tablets.write();
        if tablets.contains_key(&tablet.tablet_id()) {
            return Err(Error::AlreadyExists(tablet.tablet_id()));
        }
        tablets.insert(tablet.tablet_id(), tablet);
        Ok(())
    }

    /// Load every tablet recorded in the meta store of `data_dir`.
    ///
    /// Tablets that fail to load are logged and skipped.
    pub fn load_data_dir(&self, data_dir: &Arc<DataDir>) -> Result<usize> {
        let mut loaded = 0;
        for meta in data_dir.meta_store().load_all()? {
            let tablet_id = meta.tablet_id;
            let path = data_dir.tablet_path(meta.shard_id, tablet_id, meta.schema_hash);
            let result = Tablet::create(meta, Arc::clone(data_dir), path)
                .and_then(|tablet| self.add_tablet(tablet));
            match result {
                Ok(()) => loaded += 1,
                Err(e) => {
                    tracing::warn!(tablet_id, error = %e, "failed to load tablet, skipping");
                }
            }
        }
        Ok(loaded)
    }

    /// Load a tablet from the `<tablet_id>.hdr` header in its directory and
    /// register it. With `force` an already registered tablet is replaced.
    pub fn load_tablet_from_dir(
        &self,
        data_dir: &Arc<DataDir>,
        shard: u64,
        tablet_id: i64,
        schema_hash: i32,
        force: bool,
    ) -> Result<TabletSharedPtr> {
        let tablet_path = data_dir.tablet_path(shard, tablet_id, schema_hash);
        let header_path = TabletMeta::header_file_path(&tablet_path, tablet_id);
        if !fs::exists(&header_path)? {
            return Err(Error::NotFound(format!(
                "tablet header {}",
                header_path.display()
            )));
        }

        let mut meta = TabletMeta::create_from_file(&header_path)?;
        if meta.tablet_id != tablet_id || meta.schema_hash != schema_hash {
            return Err(Error::Internal(format!(
                "header {} describes tablet {}.{}, expected {}.{}",
                header_path.display(),
                meta.tablet_id,
                meta.schema_hash,
                tablet_id,
                schema_hash
            )));
        }
        meta.shard_id = shard;
        meta.storage_medium = data_dir.storage_medium();
        if meta.tablet_state == TabletState::Shutdown {
            meta.tablet_state = TabletState::Running;
        }

        let tablet = Tablet::create(meta, Arc::clone(data_dir), tablet_path)?;

        let mut tablets = self.tablets.write();
        if tablets.contains_key(&tablet_id) && !force {
            return Err(Error::AlreadyExists(tablet_id));
        }
        tablet.save_meta()?;
        tablets.insert(tablet_id, Arc::clone(&tablet));
        drop(tablets);

        tracing::info!(
            tablet_id,
            schema_hash,
            shard,
            path = %tablet.tablet_path().display(),
            "loaded tablet from dir"
        );
        Ok(tablet)
    }

    /// Unregister a tablet and drop its meta.
    ///
    /// A non-zero `replica_id` must match the tablet's. Files are removed
    /// unless `keep_files` is set.
    pub fn drop_tablet(&self, tablet_id: i64, replica_id: i64, keep_files: bool) -> Result<()> {
        let tablet = {
            let mut tablets = self.tablets.write();
            let tablet = tablets
                .get(&tablet_id)
                .cloned()
                .ok_or(Error::TabletNotFound(tablet_id))?;
            if replica_id != 0 && tablet.replica_id() != replica_id {
                return Err(Error::InvalidArgument(format!(
                    "replica id mismatch when dropping tablet {}: request {}, local {}",
                    tablet_id,
                    replica_id,
                    tablet.replica_id()
                )));
            }
            tablets.remove(&tablet_id);
            tablet
        };

        tablet.set_tablet_state(TabletState::Shutdown);
        tablet
            .data_dir()
            .meta_store()
            .remove(tablet_id, tablet.schema_hash())?;
        if !keep_files {
            fs::delete_directory(tablet.tablet_path())?;
            fs::delete_parent_if_empty(tablet.tablet_path())?;
        }

        tracing::info!(tablet_id, replica_id, keep_files, "dropped tablet");
        Ok(())
    }

    /// Mark a tablet as busy with `reason`; a second registration fails
    pub fn register_transition_tablet(&self, tablet_id: i64, reason: &str) -> Result<()> {
        let mut transition = self.transition.lock();
        if let Some(holder) = transition.get(&tablet_id) {
            return Err(Error::TransitionConflict {
                tablet_id,
                reason: format!("{} in progress", holder),
            });
        }
        transition.insert(tablet_id, reason.to_string());
        Ok(())
    }

    pub fn unregister_transition_tablet(&self, tablet_id: i64, reason: &str) {
        let mut transition = self.transition.lock();
        if transition.get(&tablet_id).map(String::as_str) == Some(reason) {
            transition.remove(&tablet_id);
        }
    }

    pub fn is_in_transition(&self, tablet_id: i64) -> bool {
        self.transition.lock().contains_key(&tablet_id)
    }

    /// Current report record of a tablet
    pub fn report_tablet_info(&self, tablet_id: i64) -> Result<TabletInfo> {
        self.get_tablet(tablet_id)
            .map(|t| t.tablet_info())
            .ok_or(Error::TabletNotFound(tablet_id))
    }

    /// Raise the visible version of a partition; lower versions are ignored
    pub fn update_partitions_visible_version(&self, partition_id: i64, version: i64) {
        let mut versions = self.partition_versions.write();
        let entry = versions.entry(partition_id).or_insert(version);
        if version > *entry {
            *entry = version;
        }
    }

    pub fn partition_visible_version(&self, partition_id: i64) -> Option<i64> {
        self.partition_versions.read().get(&partition_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablet::testutil::tablet_with_versions;
    use crate::version::Version;
    use tempfile::tempdir;

    #[test]
    fn test_transition_registration() {
        let manager = TabletManager::new();
        manager.register_transition_tablet(1, "clone").unwrap();
        let err = manager.register_transition_tablet(1, "clone").unwrap_err();
        assert!(err.is_retryable());
        assert!(manager.is_in_transition(1));

        manager.unregister_transition_tablet(1, "migration");
        assert!(manager.is_in_transition(1));
        manager.unregister_transition_tablet(1, "clone");
        assert!(!manager.is_in_transition(1));
    }

    #[test]
    fn test_partition_version_only_grows() {
        let manager = TabletManager::new();
        manager.update_partitions_visible_version(5, 10);
        manager.update_partitions_visible_version(5, 8);
        assert_eq!(manager.partition_visible_version(5), Some(10));
        manager.update_partitions_visible_version(5, 12);
        assert_eq!(manager.partition_visible_version(5), Some(12));
        assert_eq!(manager.partition_visible_version(6), None);
    }

    #[test]
    fn test_load_from_dir_and_drop() {
        let dir = tempdir().unwrap();
        let data_dir = DataDir::open_for_test(dir.path());
        let manager = TabletManager::new();

        let source = tablet_with_versions(&data_dir, 42, &[Version::new(0, 3)]);
        let header = TabletMeta::header_file_path(source.tablet_path(), 42);
        source.meta().save(&header).unwrap();

        let tablet = manager.load_tablet_from_dir(&data_dir, 0, 42, 1, false).unwrap();
        assert_eq!(tablet.max_version(), Some(Version::new(0, 3)));
        assert!(matches!(
            manager.load_tablet_from_dir(&data_dir, 0, 42, 1, false),
            Err(Error::AlreadyExists(42))
        ));
        assert_eq!(manager.report_tablet_info(42).unwrap().version, 3);

        assert!(manager.drop_tablet(42, 999, false).is_err());
        manager.drop_tablet(42, 0, false).unwrap();
        assert!(manager.get_tablet(42).is_none());
        assert!(!tablet.tablet_path().exists());
        assert!(data_dir.meta_store().get(42, 1).unwrap().is_none());
    }

    #[test]
    fn test_load_data_dir_restores_tablets() {
        let dir = tempdir().unwrap();
        let data_dir = DataDir::open_for_test(dir.path());
        let tablet = tablet_with_versions(&data_dir, 7, &[Version::new(0, 2)]);
        tablet.save_meta().unwrap();

        let manager = TabletManager::new();
        assert_eq!(manager.load_data_dir(&data_dir).unwrap(), 1);
        assert_eq!(manager.get_tablet(7).unwrap().max_continuous_version(), 2);
    }
}
