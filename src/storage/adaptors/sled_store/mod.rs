mod sled_chain_store;
pub use sled_chain_store::*;


use crate::Error;

//---
// Sled tree namespaces
const CHAIN_TREE_PREFIX: &str = "chain/";
const CURSOR_TREE_PREFIX: &str = "cursor/";
const TOKEN_TREE: &str = "watch_tokens";
const SEQUENCE_TREE: &str = "sequences";
const TAIL_TREE: &str = "chain_tails";

/// Opens the chain store db under `<root>/event_chain`.
pub fn init_sled_chain_db(
    sled_db_root_path: impl AsRef<std::path::Path> + std::fmt::Debug,
    cache_capacity: u64,
) -> Result<sled::Db, Error> {
    tracing::debug!("init_sled_chain_db from path: {:?}", &sled_db_root_path);

    let path = sled_db_root_path.as_ref().join("event_chain");

    sled::Config::default()
        .path(&path)
        .cache_capacity(cache_capacity)
        .flush_every_ms(Some(10))
        .use_compression(true)
        .compression_factor(1)
        .mode(sled::Mode::HighThroughput)
        .open()
        .map_err(|e| {
            tracing::warn!("Try to open DB at this location: {:?} and failed: {:?}", path, e);
            e.into()
        })
}
