//! Storage Module
//!
//! Data directories, the tablet meta store, the tablet registry and the
//! storage engine that ties them together.

mod data_dir;
mod engine;
pub mod fs;
mod meta_store;
mod tablet_manager;

pub use data_dir::DataDir;
pub use engine::StorageEngine;
pub use meta_store::MetaStore;
pub use tablet_manager::TabletManager;

use serde::{Deserialize, Serialize};

/// Storage medium of a data dir
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMedium {
    #[default]
    Hdd,
    Ssd,
}

impl std::fmt::Display for StorageMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMedium::Hdd => write!(f, "hdd"),
            StorageMedium::Ssd => write!(f, "ssd"),
        }
    }
}
