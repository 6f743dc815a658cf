//! Backing-store contracts
//!
//! The runtime talks to its key-value and blob collaborators through the
//! traits defined here. The default implementations are in-process; a
//! networked store is just another implementation of the same trait.

pub mod blob;
pub mod kv;

pub use blob::{BlobStore, FsBlobStore};
pub use kv::{InMemoryKvStore, KvStore};
