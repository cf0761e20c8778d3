//! Object storage for generated artifacts and reference images.
//!
//! Responsibilities:
//! - Upload binary results to a bucket and hand back stable public URLs.
//! - Own the path discipline (`workflow-results/...`, `reference-images/...`)
//!   so retried uploads land on deterministic prefixes.
//!
//! Non-responsibilities:
//! - Bucket provisioning and lifecycle (ops concern).
//! - Garbage collection of reference images after finalization.

pub mod artifact;
pub mod object_store;

pub use artifact::{ArtifactStore, StoredArtifact};
pub use object_store::{HttpBucketStore, MemoryObjectStore, ObjectStore, StorageError};
