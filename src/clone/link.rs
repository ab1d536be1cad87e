//! Linking downloaded files into a tablet
//!
//! Files staged in `<tablet_path>/clone` are hard-linked into the tablet
//! directory. Binlog files go to `_binlog/` under their tablet-side names.
//! Every link made is remembered and undone unless the caller commits.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::storage::fs;
use crate::tablet::{
    binlog_local_name, RowsetBinlogMetas, Tablet, TabletMeta, BINLOG_DIR, BINLOG_METAS_FILE,
};

/// Paths linked into a tablet directory, unlinked on drop unless committed
#[derive(Debug, Default)]
pub struct LinkedFiles {
    paths: Vec<PathBuf>,
    committed: bool,
}

impl LinkedFiles {
    fn push(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Keep the links
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for LinkedFiles {
    fn drop(&mut self) {
        if self.committed || self.paths.is_empty() {
            return;
        }
        tracing::info!(files = self.paths.len(), "removing linked clone files");
        if let Err(e) = fs::batch_delete(&self.paths) {
            tracing::warn!(error = %e, "failed to remove linked clone files");
        }
    }
}

/// Result of linking a clone dir into its tablet
#[derive(Debug)]
pub struct StagedClone {
    /// Header shipped with the snapshot
    pub cloned_meta: TabletMeta,
    /// Binlog metas shipped with the snapshot, if any
    pub binlog_metas: Option<RowsetBinlogMetas>,
    pub linked: LinkedFiles,
}

/// Read and delete the shipped binlog metas file.
///
/// An empty file counts as no binlog.
fn take_binlog_metas(dir: &Path) -> Result<Option<RowsetBinlogMetas>> {
    let path = dir.join(BINLOG_METAS_FILE);
    if !fs::exists(&path)? {
        return Ok(None);
    }
    let metas = if fs::file_size(&path)? > 0 {
        Some(RowsetBinlogMetas::read_from(&path)?)
    } else {
        None
    };
    fs::delete_file(&path)?;
    Ok(metas)
}

/// Where a staged binlog file belongs, or `None` when an identical copy is
/// already there. A differing copy is a consistency error.
fn check_dest_binlog(tablet_dir: &Path, from: &Path, local_name: &str) -> Result<Option<PathBuf>> {
    let to = tablet_dir.join(BINLOG_DIR).join(local_name);
    if !fs::exists(&to)? {
        return Ok(Some(to));
    }

    tracing::warn!(
        from = %from.display(),
        to = %to.display(),
        "binlog file already exists"
    );
    let from_hash = fs::content_hash(from)?;
    let to_hash = fs::content_hash(&to)?;
    if from_hash == to_hash {
        return Ok(None);
    }
    Err(Error::Internal(format!(
        "binlog file {} already exists with different content, clone file {}",
        to.display(),
        from.display()
    )))
}

/// Link the files of `clone_dir` into `tablet`'s directory.
///
/// Loads and deletes the shipped header and binlog metas first. Files
/// already present in the tablet directory are left alone. On error every
/// link made so far is removed.
pub fn link_clone_files(tablet: &Tablet, clone_dir: &Path) -> Result<StagedClone> {
    if !fs::exists(clone_dir)? {
        return Err(Error::Internal(format!(
            "clone dir not existed. clone_dir={}",
            clone_dir.display()
        )));
    }

    let header_path = TabletMeta::header_file_path(clone_dir, tablet.tablet_id());
    let cloned_meta = TabletMeta::create_from_file(&header_path)?;
    fs::delete_file(&header_path)?;

    let tablet_dir = tablet.tablet_path();
    let binlog_metas = take_binlog_metas(clone_dir)?;
    if binlog_metas.is_some() {
        fs::create_directory(&tablet_dir.join(BINLOG_DIR))?;
    }

    let local_files: HashSet<String> = fs::list_files(tablet_dir)?.into_iter().collect();
    let mut linked = LinkedFiles::default();
    for name in fs::list_files(clone_dir)? {
        if local_files.contains(&name) {
            tracing::debug!(tablet_id = tablet.tablet_id(), file = %name, "same file exists, skip it");
            continue;
        }

        let from = clone_dir.join(&name);
        let to = match binlog_local_name(&name) {
            Some(_) if binlog_metas.is_none() => {
                tracing::warn!(
                    tablet_id = tablet.tablet_id(),
                    file = %name,
                    "clone binlog file, but no binlog metas"
                );
                continue;
            }
            Some(local_name) => match check_dest_binlog(tablet_dir, &from, &local_name)? {
                Some(to) => to,
                None => continue,
            },
            None => tablet_dir.join(&name),
        };

        fs::link_file(&from, &to)?;
        linked.push(to);
    }

    tracing::debug!(
        tablet_id = tablet.tablet_id(),
        linked = linked.len(),
        "linked clone files"
    );
    Ok(StagedClone {
        cloned_meta,
        binlog_metas,
        linked,
    })
}

/// Move the binlog files of a freshly downloaded tablet into `_binlog/`
/// and record their metas. Binlog files without metas are dropped.
pub fn adopt_bootstrap_binlogs(tablet: &Tablet) -> Result<()> {
    let tablet_dir = tablet.tablet_path();
    let binlog_metas = take_binlog_metas(tablet_dir)?;

    let binlog_dir = tablet_dir.join(BINLOG_DIR);
    for name in fs::list_files(tablet_dir)? {
        let Some(local_name) = binlog_local_name(&name) else {
            continue;
        };
        let from = tablet_dir.join(&name);
        if binlog_metas.is_none() {
            tracing::warn!(
                tablet_id = tablet.tablet_id(),
                file = %name,
                "cloned binlog file without binlog metas, deleting it"
            );
            fs::delete_file(&from)?;
            continue;
        }
        fs::create_directory(&binlog_dir)?;
        std::fs::rename(&from, binlog_dir.join(local_name)).map_err(|e| Error::from_io(&from, e))?;
    }

    if let Some(metas) = binlog_metas {
        tablet.ingest_binlog_metas(&metas)?;
    }
    Ok(())
}
