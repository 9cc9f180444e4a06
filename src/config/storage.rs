use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Location of the embedded chain store.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_root_dir")]
    pub db_root_dir: PathBuf,

    /// Page cache of the embedded store (unit: bytes)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_root_dir: default_db_root_dir(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_db_root_dir() -> PathBuf {
    PathBuf::from("./db/event_chain")
}
fn default_cache_capacity() -> u64 {
    64 * 1024 * 1024
}
