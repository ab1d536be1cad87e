//! WolfStore - Tablet Replica Clone Engine
//!
//! A storage node keeps tablet replicas: sets of immutable rowsets with
//! non-overlapping version ranges. When a replica falls behind or is
//! missing, the clone engine copies what it lacks from a healthy replica
//! on another node.
//!
//! # Architecture
//!
//! The destination asks a source node over the snapshot RPC to hard-link
//! the needed rowsets into a snapshot directory, downloads that directory
//! over HTTP, rewrites the rowset ids so they are unique locally and then
//! links the files into the tablet and revises its meta under the tablet's
//! mutation locks.
//!
//! # Features
//!
//! - Incremental repair that only fetches missing versions
//! - Full clone and bootstrap of new replicas
//! - Batched HTTP file transfer with per-file fallback
//! - Binlog files carried along with their rowsets
//! - Merge-on-write delete bitmaps and cooldown metadata kept consistent

pub mod clone;
pub mod config;
pub mod error;
pub mod http;
pub mod network;
pub mod snapshot;
pub mod storage;
pub mod tablet;
pub mod version;

pub use config::WolfStoreConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clone::{CloneContext, CloneRequest, CloneTaskPool, EngineCloneTask, SourceBackend};
    pub use crate::config::WolfStoreConfig;
    pub use crate::error::{Error, Result};
    pub use crate::storage::StorageEngine;
    pub use crate::tablet::{Tablet, TabletInfo, TabletSharedPtr};
    pub use crate::version::Version;
}
