//! Storage modules for Driftlog
//!
//! Provides the remote blob store fragments are persisted into and the local
//! spool they are persisted from.

pub mod blob_store;
pub mod spool;

pub use blob_store::{BlobStore, BlobWriter};
pub use spool::{FileSource, LocalSpool};
