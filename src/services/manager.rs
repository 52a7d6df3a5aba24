use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::Receiver;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceManagerConfig;
use crate::error::{GridflowError, Result};
use crate::jobstore::{JobStore, JobStoreId};
use crate::services::starter::{ServiceStarter, StarterOutputs};
use crate::workflow::{ClientJob, ServiceJob, WorkflowState};

/// Schedules the services that client jobs depend on.
///
/// All bookkeeping lives in a background coordination loop; callers only
/// enqueue clients and poll the output queues:
/// - [`poll_service_to_launch`](Self::poll_service_to_launch): services the leader must dispatch
/// - [`poll_ready_client`](Self::poll_ready_client): clients whose services are all up
/// - [`poll_failed_client`](Self::poll_failed_client): clients with a service that failed to start
pub struct ServiceManager {
    job_store: Arc<dyn JobStore>,
    state: Arc<WorkflowState>,
    /// Clients scheduled and not yet handed back to the caller
    waiting_clients: Mutex<HashSet<JobStoreId>>,
    /// Clients plus services the manager is accounting for
    job_count: AtomicUsize,
    terminate: CancellationToken,
    clients_in: UnboundedSender<JobStoreId>,
    clients_out: Receiver<ClientJob>,
    failed_clients_out: Receiver<ClientJob>,
    services_out: Receiver<ServiceJob>,
    starter: Mutex<Option<ServiceStarter>>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ServiceManager {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        state: Arc<WorkflowState>,
        config: ServiceManagerConfig,
    ) -> Self {
        tracing::debug!("Initializing service manager");
        let terminate = CancellationToken::new();
        let (clients_in, clients_in_rx) = mpsc::unbounded_channel();
        let (clients_out_tx, clients_out) = async_channel::unbounded();
        let (failed_out_tx, failed_clients_out) = async_channel::unbounded();
        let (services_out_tx, services_out) = async_channel::unbounded();

        let starter = ServiceStarter::new(
            job_store.clone(),
            state.clone(),
            config,
            terminate.clone(),
            clients_in_rx,
            StarterOutputs {
                clients_out: clients_out_tx,
                failed_clients_out: failed_out_tx,
                services_out: services_out_tx,
            },
        );

        Self {
            job_store,
            state,
            waiting_clients: Mutex::new(HashSet::new()),
            job_count: AtomicUsize::new(0),
            terminate,
            clients_in,
            clients_out,
            failed_clients_out,
            services_out,
            starter: Mutex::new(Some(starter)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the coordination loop. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let starter = self
            .starter
            .lock()
            .take()
            .ok_or_else(|| GridflowError::Internal("service manager already started".into()))?;
        *self.handle.lock() = Some(tokio::spawn(starter.run()));
        tracing::debug!("Service manager started");
        Ok(())
    }

    /// Schedule the services of a client job asynchronously.
    ///
    /// The client and its services must already be known to the workflow
    /// state. Safe to call from any thread.
    pub fn schedule_services(&self, client: &ClientJob) -> Result<()> {
        tracing::debug!(client_id = %client.id, "Service manager queueing client");
        self.state.issue_services(&client.id)?;
        self.waiting_clients.lock().insert(client.id.clone());
        self.job_count
            .fetch_add(client.service_count() + 1, Ordering::SeqCst);
        self.clients_in
            .send(client.id.clone())
            .map_err(|_| GridflowError::ServiceManagerDied)
    }

    /// True while the client's services are being started and the client has
    /// not yet been handed back through a poll call.
    pub fn service_startup_in_progress(&self, client_id: &str) -> bool {
        self.waiting_clients.lock().contains(client_id)
    }

    /// Number of clients and services the manager is currently responsible for.
    pub fn job_count(&self) -> usize {
        self.job_count.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for a client whose services have all started.
    pub async fn poll_ready_client(&self, timeout: Duration) -> Option<ClientJob> {
        let client = tokio::time::timeout(timeout, self.clients_out.recv())
            .await
            .ok()?
            .ok()?;
        self.client_handed_back(&client);
        Some(client)
    }

    /// Wait up to `timeout` for a client with at least one service that failed to start.
    pub async fn poll_failed_client(&self, timeout: Duration) -> Option<ClientJob> {
        let client = tokio::time::timeout(timeout, self.failed_clients_out.recv())
            .await
            .ok()?
            .ok()?;
        self.client_handed_back(&client);
        Some(client)
    }

    /// Wait up to `timeout` for a service the caller must now dispatch.
    pub async fn poll_service_to_launch(&self, timeout: Duration) -> Option<ServiceJob> {
        let service = tokio::time::timeout(timeout, self.services_out.recv())
            .await
            .ok()?
            .ok()?;
        self.decrement_job_count();
        Some(service)
    }

    /// Tell services to stop by deleting their terminate markers.
    ///
    /// With `error` set the error markers are deleted first, so a service that
    /// has not started yet reports itself as failed.
    pub async fn kill_services(
        &self,
        services: &HashMap<JobStoreId, ServiceJob>,
        error: bool,
    ) -> Result<()> {
        for service in services.values() {
            if error {
                self.job_store.delete_file(&service.error_marker).await?;
            }
            self.job_store.delete_file(&service.terminate_marker).await?;
        }
        Ok(())
    }

    /// True if the service has not been told to terminate.
    pub async fn is_active(&self, service: &ServiceJob) -> Result<bool> {
        self.job_store.file_exists(&service.terminate_marker).await
    }

    /// True if the service has started and is still active.
    pub async fn is_running(&self, service: &ServiceJob) -> Result<bool> {
        let started = !self.job_store.file_exists(&service.start_marker).await?;
        Ok(started && self.is_active(service).await?)
    }

    /// Fail if the coordination loop is not running.
    pub fn health_check(&self) -> Result<()> {
        match self.handle.lock().as_ref() {
            Some(handle) if !handle.is_finished() => Ok(()),
            _ => Err(GridflowError::ServiceManagerDied),
        }
    }

    /// Stop the coordination loop, then kill every issued service with the
    /// error flag so no client waits on a service that will never resolve.
    pub async fn shutdown(&self) {
        tracing::debug!("Waiting for service manager to finish");
        let started = Instant::now();
        self.terminate.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Service manager loop failed"),
                Err(e) => tracing::error!(error = %e, "Service manager loop panicked"),
            }
        }

        for services in self.state.issued_services() {
            if let Err(e) = self.kill_services(&services, true).await {
                tracing::error!(error = %e, "Failed to kill services during shutdown");
            }
        }
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished shutting down the service manager"
        );
    }

    fn client_handed_back(&self, client: &ClientJob) {
        self.waiting_clients.lock().remove(&client.id);
        self.decrement_job_count();
    }

    fn decrement_job_count(&self) {
        let _ = self
            .job_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}
