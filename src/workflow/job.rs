use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::jobstore::{JobStore, JobStoreId};

/// Resources a job asks the cluster for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    pub cpu: f64,
    /// Bytes
    pub memory: u64,
    pub gpus: Option<u32>,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 2 * 1024 * 1024 * 1024,
            gpus: None,
        }
    }
}

/// A long-running job that offers a capability to its client until told to stop.
///
/// Lifecycle is signaled through three job store objects that only matter
/// by their existence:
/// - `start_marker` is removed by the worker once the service is up
/// - `terminate_marker` is removed by the leader to ask the service to stop
/// - `error_marker` is removed by the worker (or crash cleanup) on failure
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceJob {
    pub id: JobStoreId,
    pub client_id: JobStoreId,
    pub command: String,
    pub requirements: Requirements,
    pub start_marker: JobStoreId,
    pub terminate_marker: JobStoreId,
    pub error_marker: JobStoreId,
}

impl ServiceJob {
    /// Create a service for `client_id`, minting all three markers in `store`.
    pub async fn create(
        store: &dyn JobStore,
        id: impl Into<JobStoreId>,
        client_id: impl Into<JobStoreId>,
        command: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            client_id: client_id.into(),
            command: command.into(),
            requirements: Requirements::default(),
            start_marker: store.create_file().await?,
            terminate_marker: store.create_file().await?,
            error_marker: store.create_file().await?,
        })
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }
}

/// A job that may only run once all of its services are up.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientJob {
    pub id: JobStoreId,
    pub command: String,
    pub requirements: Requirements,
    /// Service ids grouped into batches. Batches are started strictly in
    /// order; services within a batch start concurrently.
    pub service_batches: Vec<Vec<JobStoreId>>,
}

impl ClientJob {
    pub fn new(id: impl Into<JobStoreId>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            requirements: Requirements::default(),
            service_batches: Vec::new(),
        }
    }

    /// Append a batch that starts after every previously added batch is up.
    pub fn with_batch<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<JobStoreId>,
    {
        self.service_batches
            .push(services.into_iter().map(Into::into).collect());
        self
    }

    /// Total number of services across all batches
    pub fn service_count(&self) -> usize {
        self.service_batches.iter().map(Vec::len).sum()
    }

    pub fn service_ids(&self) -> impl Iterator<Item = &JobStoreId> {
        self.service_batches.iter().flatten()
    }
}
