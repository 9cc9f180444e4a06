mod mem_archive_store;
mod mem_chain_store;
mod mem_detail_cache;
mod mem_document_store;

pub use mem_archive_store::*;
pub use mem_chain_store::*;
pub use mem_detail_cache::*;
pub use mem_document_store::*;
