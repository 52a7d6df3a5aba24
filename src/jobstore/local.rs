use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{GridflowError, Result};
use crate::jobstore::{JobStore, JobStoreId};

/// Job store backed by a directory on a shared filesystem.
///
/// Each id is an empty file directly under `root`, so workers on other
/// machines observe markers as soon as the filesystem does.
#[derive(Debug, Clone)]
pub struct LocalJobStore {
    root: PathBuf,
}

impl LocalJobStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "Opened local job store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains('/') || id.contains('\\') || id == "." || id == ".." {
            return Err(GridflowError::InvalidJobStoreId(id.to_string()));
        }
        Ok(self.root.join(id))
    }
}

#[async_trait]
impl JobStore for LocalJobStore {
    async fn create_file(&self) -> Result<JobStoreId> {
        let id = Uuid::new_v4().to_string();
        let path = self.path_for(&id)?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(id)
    }

    async fn file_exists(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
