//! Storage backends for entity documents.
//!
//! [`EntityStore`] is the contract; [`memory`] and (with the `persistent`
//! feature) [`persistent`] implement it.

mod traits;

pub mod memory;
#[cfg(feature = "persistent")]
pub mod persistent;

pub use traits::{Created, DocumentStream, EntityStore, StorageError};
