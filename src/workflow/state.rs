use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{GridflowError, Result};
use crate::jobstore::JobStoreId;
use crate::workflow::job::{ClientJob, ServiceJob};

/// Job descriptions known to the leader, plus the services it has issued.
#[derive(Debug, Default)]
pub struct WorkflowState {
    clients: RwLock<HashMap<JobStoreId, ClientJob>>,
    services: RwLock<HashMap<JobStoreId, ServiceJob>>,
    /// Client id -> services issued on its behalf and not yet released
    services_issued: RwLock<HashMap<JobStoreId, HashMap<JobStoreId, ServiceJob>>>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&self, client: ClientJob) {
        self.clients.write().insert(client.id.clone(), client);
    }

    pub fn add_service(&self, service: ServiceJob) {
        self.services.write().insert(service.id.clone(), service);
    }

    pub fn client(&self, id: &str) -> Result<ClientJob> {
        self.clients
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| GridflowError::JobNotFound(id.to_string()))
    }

    pub fn service(&self, id: &str) -> Result<ServiceJob> {
        self.services
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| GridflowError::JobNotFound(id.to_string()))
    }

    /// Resolve a client's service batches into full service descriptions.
    pub fn service_batches(&self, client_id: &str) -> Result<Vec<Vec<ServiceJob>>> {
        let client = self.client(client_id)?;
        let services = self.services.read();
        client
            .service_batches
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .map(|id| {
                        services
                            .get(id)
                            .cloned()
                            .ok_or_else(|| GridflowError::JobNotFound(id.clone()))
                    })
                    .collect()
            })
            .collect()
    }

    /// Record every service of `client_id` as issued.
    pub fn issue_services(&self, client_id: &str) -> Result<()> {
        let issued: HashMap<JobStoreId, ServiceJob> = self
            .service_batches(client_id)?
            .into_iter()
            .flatten()
            .map(|s| (s.id.clone(), s))
            .collect();
        self.services_issued
            .write()
            .insert(client_id.to_string(), issued);
        Ok(())
    }

    /// Forget the services issued for a client, returning them.
    pub fn release_services(&self, client_id: &str) -> Option<HashMap<JobStoreId, ServiceJob>> {
        self.services_issued.write().remove(client_id)
    }

    /// Services issued and not yet released, grouped by client.
    pub fn issued_services(&self) -> Vec<HashMap<JobStoreId, ServiceJob>> {
        self.services_issued.read().values().cloned().collect()
    }
}
