//! Read side of the chains: long-poll watch, cursor search and detail lookup.
//!
//! A request starts from a cursor, a start time or the present moment.
//! Chain nodes are paged with the request's filter applied before paging,
//! then their details are resolved from the cache with a fallback to the
//! source documents.
mod client;
mod details;
mod options;
mod projection;

pub use client::*;
pub use details::*;
pub use options::*;
pub use projection::*;

#[cfg(test)]
mod projection_test;
