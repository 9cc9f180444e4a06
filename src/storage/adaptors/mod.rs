mod mem;
mod sled_store;

pub use mem::*;
pub use sled_store::*;
