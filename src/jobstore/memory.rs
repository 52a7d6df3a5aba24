use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::jobstore::{JobStore, JobStoreId};

/// Job store that keeps ids in memory.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    files: RwLock<HashSet<JobStoreId>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_file(&self) -> Result<JobStoreId> {
        let id = Uuid::new_v4().to_string();
        self.files.write().insert(id.clone());
        Ok(id)
    }

    async fn file_exists(&self, id: &str) -> Result<bool> {
        Ok(self.files.read().contains(id))
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        self.files.write().remove(id);
        Ok(())
    }
}
