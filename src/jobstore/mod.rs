//! Job store access used for cross-process signaling.
//!
//! The scheduling core never reads or writes file contents. It only asks
//! whether an id exists and deletes ids, which is enough to use job store
//! objects as binary semaphores shared with out-of-process workers.
//!
//! # Implementations
//!
//! - [`InMemoryJobStore`]: process-local, for tests and single-machine runs
//! - [`LocalJobStore`]: one empty file per id under a root directory

use async_trait::async_trait;

use crate::error::Result;

pub mod local;
pub mod memory;

pub use local::LocalJobStore;
pub use memory::InMemoryJobStore;

/// Opaque handle to an object in the job store.
pub type JobStoreId = String;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new empty object and return its id.
    async fn create_file(&self) -> Result<JobStoreId>;

    /// Whether the object currently exists.
    async fn file_exists(&self, id: &str) -> Result<bool>;

    /// Delete the object. Deleting an id that is already gone is not an error.
    async fn delete_file(&self, id: &str) -> Result<()>;
}
