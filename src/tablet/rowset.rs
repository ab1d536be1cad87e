//! Rowsets
//!
//! A rowset is an immutable group of segment files covering one version
//! range. The segment format itself is opaque here; a segment is a `.dat`
//! file plus an `.idx` file named after the rowset id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::version::Version;

/// Data file suffix
pub const DATA_SUFFIX: &str = ".dat";
/// Index file suffix
pub const INDEX_SUFFIX: &str = ".idx";
/// Binlog data file suffix inside a snapshot
pub const BINLOG_SUFFIX: &str = ".binlog";
/// Binlog index file suffix inside a snapshot
pub const BINLOG_INDEX_SUFFIX: &str = ".binlog-index";
/// Binlog directory inside a tablet directory
pub const BINLOG_DIR: &str = "_binlog";

/// Locally unique rowset identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowsetId {
    /// Instance prefix of the engine that allocated the id
    pub hi: u64,
    /// Sequence number within that instance
    pub lo: u64,
}

impl RowsetId {
    const PREFIX: &'static str = "02";

    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    /// Extract the rowset id from a segment or binlog file name
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (id, _) = name.split_once('_')?;
        id.parse().ok()
    }
}

impl fmt::Display for RowsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:016x}{:016x}", Self::PREFIX, self.hi, self.lo)
    }
}

impl fmt::Debug for RowsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for RowsetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .filter(|b| b.len() == 32)
            .ok_or_else(|| Error::InvalidArgument(format!("invalid rowset id: {}", s)))?;
        let hi = u64::from_str_radix(&body[..16], 16)
            .map_err(|_| Error::InvalidArgument(format!("invalid rowset id: {}", s)))?;
        let lo = u64::from_str_radix(&body[16..], 16)
            .map_err(|_| Error::InvalidArgument(format!("invalid rowset id: {}", s)))?;
        Ok(Self { hi, lo })
    }
}

/// Allocates rowset ids unique to one storage engine instance
pub struct RowsetIdGenerator {
    prefix: u64,
    next: AtomicU64,
}

impl RowsetIdGenerator {
    /// Generator with a random instance prefix
    pub fn new() -> Self {
        Self::with_prefix(rand::random())
    }

    pub fn with_prefix(prefix: u64) -> Self {
        Self {
            prefix,
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> RowsetId {
        RowsetId::new(self.prefix, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RowsetIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistent description of a rowset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsetMeta {
    pub rowset_id: RowsetId,
    pub tablet_id: i64,
    pub tablet_schema_hash: i32,
    pub partition_id: i64,
    pub version: Version,
    pub num_segments: u32,
    pub num_rows: u64,
    pub data_disk_size: u64,
    /// Remote storage resource once the rowset is cooled down
    #[serde(default)]
    pub resource_id: Option<String>,
    pub creation_time: i64,
}

impl RowsetMeta {
    /// Whether the rowset's data lives on local disk
    pub fn is_local(&self) -> bool {
        self.resource_id.is_none()
    }

    /// Data and index file names of every segment
    pub fn segment_file_names(&self) -> Vec<String> {
        segment_file_names(&self.rowset_id, self.num_segments)
    }
}

/// Data and index file names of `num_segments` segments of `rowset_id`
pub fn segment_file_names(rowset_id: &RowsetId, num_segments: u32) -> Vec<String> {
    let mut names = Vec::with_capacity(num_segments as usize * 2);
    for seg in 0..num_segments {
        names.push(format!("{}_{}{}", rowset_id, seg, DATA_SUFFIX));
        names.push(format!("{}_{}{}", rowset_id, seg, INDEX_SUFFIX));
    }
    names
}

/// Snapshot-side binlog file names of `num_segments` segments of `rowset_id`
pub fn binlog_file_names(rowset_id: &RowsetId, num_segments: u32) -> Vec<(String, String)> {
    let mut names = Vec::with_capacity(num_segments as usize * 2);
    for seg in 0..num_segments {
        names.push((
            format!("{}_{}{}", rowset_id, seg, DATA_SUFFIX),
            format!("{}_{}{}", rowset_id, seg, BINLOG_SUFFIX),
        ));
        names.push((
            format!("{}_{}{}", rowset_id, seg, INDEX_SUFFIX),
            format!("{}_{}{}", rowset_id, seg, BINLOG_INDEX_SUFFIX),
        ));
    }
    names
}

/// Name a snapshot binlog file takes inside the binlog directory.
///
/// `None` when `name` is not a binlog file.
pub fn binlog_local_name(name: &str) -> Option<String> {
    if let Some(stem) = name.strip_suffix(BINLOG_SUFFIX) {
        Some(format!("{}{}", stem, DATA_SUFFIX))
    } else {
        name.strip_suffix(BINLOG_INDEX_SUFFIX)
            .map(|stem| format!("{}{}", stem, INDEX_SUFFIX))
    }
}

/// Loaded rowset bound to a tablet directory
#[derive(Debug)]
pub struct Rowset {
    meta: RowsetMeta,
    tablet_path: PathBuf,
}

/// Shared rowset handle
pub type RowsetSharedPtr = Arc<Rowset>;

impl Rowset {
    /// Build a rowset handle, checking that local segment files are present
    pub fn create(meta: RowsetMeta, tablet_path: &Path) -> Result<RowsetSharedPtr> {
        if meta.is_local() {
            for name in meta.segment_file_names() {
                let path = tablet_path.join(&name);
                if !path.exists() {
                    return Err(Error::NotFound(format!(
                        "segment file {} of rowset {} version {}",
                        path.display(),
                        meta.rowset_id,
                        meta.version
                    )));
                }
            }
        }
        Ok(Arc::new(Self {
            meta,
            tablet_path: tablet_path.to_path_buf(),
        }))
    }

    pub fn meta(&self) -> &RowsetMeta {
        &self.meta
    }

    pub fn rowset_id(&self) -> RowsetId {
        self.meta.rowset_id
    }

    pub fn version(&self) -> Version {
        self.meta.version
    }

    pub fn is_local(&self) -> bool {
        self.meta.is_local()
    }

    pub fn num_rows(&self) -> u64 {
        self.meta.num_rows
    }

    pub fn data_disk_size(&self) -> u64 {
        self.meta.data_disk_size
    }

    /// Absolute paths of the rowset's segment files
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        self.meta
            .segment_file_names()
            .into_iter()
            .map(|n| self.tablet_path.join(n))
            .collect()
    }
}
