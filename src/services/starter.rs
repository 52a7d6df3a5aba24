use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_channel::Sender;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceManagerConfig;
use crate::error::Result;
use crate::jobstore::{JobStore, JobStoreId};
use crate::services::throttle::LogThrottle;
use crate::workflow::{ClientJob, ServiceJob, WorkflowState};

/// Channels the coordination loop publishes on.
pub(crate) struct StarterOutputs {
    pub clients_out: Sender<ClientJob>,
    pub failed_clients_out: Sender<ClientJob>,
    pub services_out: Sender<ServiceJob>,
}

/// Coordination loop that starts services and watches their start markers.
///
/// This task is the only owner of the pending-client bookkeeping. Everything
/// else talks to it through the channels it was built with.
pub(crate) struct ServiceStarter {
    job_store: Arc<dyn JobStore>,
    state: Arc<WorkflowState>,
    config: ServiceManagerConfig,
    terminate: CancellationToken,
    clients_in: UnboundedReceiver<JobStoreId>,
    outputs: StarterOutputs,
    /// Services launched whose start marker is still present
    starting_services: HashMap<JobStoreId, ServiceJob>,
    /// Client id -> services in its batch not yet started or failed
    remaining_services_by_client: HashMap<JobStoreId, usize>,
    service_to_client: HashMap<JobStoreId, JobStoreId>,
    clients_with_failed_services: HashSet<JobStoreId>,
    log_limiter: LogThrottle,
}

impl ServiceStarter {
    pub(crate) fn new(
        job_store: Arc<dyn JobStore>,
        state: Arc<WorkflowState>,
        config: ServiceManagerConfig,
        terminate: CancellationToken,
        clients_in: UnboundedReceiver<JobStoreId>,
        outputs: StarterOutputs,
    ) -> Self {
        let log_limiter = LogThrottle::new(config.log_interval);
        Self {
            job_store,
            state,
            config,
            terminate,
            clients_in,
            outputs,
            starting_services: HashMap::new(),
            remaining_services_by_client: HashMap::new(),
            service_to_client: HashMap::new(),
            clients_with_failed_services: HashSet::new(),
            log_limiter,
        }
    }

    /// Run until the termination token is cancelled.
    ///
    /// Returns an error only if the loop hits a condition it cannot continue
    /// from, such as a client or service missing from the workflow state.
    pub(crate) async fn run(mut self) -> Result<()> {
        loop {
            if self.terminate.is_cancelled() {
                tracing::debug!("Received signal to quit starting services");
                break;
            }
            let deadline = Instant::now() + self.config.poll_interval;

            self.accept_client().await?;
            self.check_starting_services().await;
            self.emit_resolved_clients()?;

            tokio::select! {
                _ = self.terminate.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
        Ok(())
    }

    /// Take at most one newly scheduled client and launch its services.
    async fn accept_client(&mut self) -> Result<()> {
        let client_id = match self.clients_in.try_recv() {
            Ok(id) => id,
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => {
                tracing::debug!("Service manager dropped, stopping coordination loop");
                self.terminate.cancel();
                return Ok(());
            }
        };

        let client = self.state.client(&client_id)?;
        let batches = self.state.service_batches(&client_id)?;
        tracing::debug!(
            client_id = %client_id,
            batches = batches.len(),
            "Service manager processing client"
        );

        if batches.len() > 1 {
            // Ordered batches cannot be expressed by the single-pass
            // bookkeeping below, so this client is driven to completion here.
            return self.start_batches_blocking(client, batches).await;
        }

        let batch = batches.into_iter().next().unwrap_or_default();
        self.remaining_services_by_client
            .insert(client_id.clone(), batch.len());
        for service in batch {
            tracing::debug!(
                service_id = %service.id,
                start_marker = %service.start_marker,
                "Service manager is starting service job"
            );
            self.service_to_client
                .insert(service.id.clone(), client_id.clone());
            self.starting_services
                .insert(service.id.clone(), service.clone());
            publish(&self.outputs.services_out, service);
        }
        Ok(())
    }

    /// Resolve every starting service whose start marker has disappeared.
    async fn check_starting_services(&mut self) {
        let pending = self.starting_services.len();
        if pending > 0 && self.log_limiter.ready() {
            tracing::debug!(pending, "Services are starting");
        }

        let ids: Vec<JobStoreId> = self.starting_services.keys().cloned().collect();
        for service_id in ids {
            let Some(service) = self.starting_services.get(&service_id) else {
                continue;
            };

            match self.job_store.file_exists(&service.start_marker).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(service_id = %service_id, error = %e, "Could not check start marker");
                    continue;
                }
            }

            // Started, unless the error marker went away with it.
            let failed = match self.job_store.file_exists(&service.error_marker).await {
                Ok(exists) => !exists,
                Err(e) => {
                    tracing::warn!(service_id = %service_id, error = %e, "Could not check error marker");
                    continue;
                }
            };

            tracing::debug!(
                service_id = %service_id,
                start_marker = %service.start_marker,
                "Service has removed its start marker and is therefore started"
            );
            self.starting_services.remove(&service_id);

            let Some(client_id) = self.service_to_client.remove(&service_id) else {
                tracing::warn!(service_id = %service_id, "Started service has no client");
                continue;
            };
            if let Some(remaining) = self.remaining_services_by_client.get_mut(&client_id) {
                *remaining = remaining.saturating_sub(1);
            }
            if failed {
                tracing::error!(
                    service_id = %service_id,
                    client_id = %client_id,
                    "Service has immediately failed before it could be used"
                );
                self.clients_with_failed_services.insert(client_id);
            }
        }
    }

    /// Publish clients whose services have all started or failed.
    fn emit_resolved_clients(&mut self) -> Result<()> {
        let resolved: Vec<JobStoreId> = self
            .remaining_services_by_client
            .iter()
            .filter(|(_, remaining)| **remaining == 0)
            .map(|(client_id, _)| client_id.clone())
            .collect();

        for client_id in resolved {
            self.remaining_services_by_client.remove(&client_id);
            let failed = self.clients_with_failed_services.remove(&client_id);
            let client = self.state.client(&client_id)?;
            if failed {
                tracing::error!(
                    client_id = %client_id,
                    "Job has had all its services try to start, but at least one failed"
                );
                publish(&self.outputs.failed_clients_out, client);
            } else {
                tracing::debug!(client_id = %client_id, "Job has all its services started");
                publish(&self.outputs.clients_out, client);
            }
        }
        Ok(())
    }

    /// Start a client's batches one after another, waiting for each batch to
    /// come up before launching the next.
    ///
    /// Every service of a batch is waited on even if a sibling failed, so that
    /// dependents of the failed service are also run, torn down and reported.
    /// Failures are not reported here: the client always comes out as ready.
    async fn start_batches_blocking(
        &mut self,
        client: ClientJob,
        batches: Vec<Vec<ServiceJob>>,
    ) -> Result<()> {
        let mut log_limiter = LogThrottle::new(self.config.log_interval);

        for (index, batch) in batches.iter().enumerate() {
            tracing::debug!(
                client_id = %client.id,
                batch = index,
                services = batch.len(),
                "Starting service batch"
            );
            for service in batch {
                if let Ok(false) = self.job_store.file_exists(&service.start_marker).await {
                    tracing::warn!(
                        service_id = %service.id,
                        "Start marker already gone before the service was launched"
                    );
                }
                publish(&self.outputs.services_out, service.clone());
            }

            for service in batch {
                loop {
                    match self.job_store.file_exists(&service.start_marker).await {
                        Ok(false) => break,
                        Ok(true) => {}
                        Err(e) => {
                            tracing::warn!(service_id = %service.id, error = %e, "Could not check start marker");
                        }
                    }

                    tokio::select! {
                        _ = self.terminate.cancelled() => {
                            tracing::debug!(client_id = %client.id, "Stopped waiting on service batch");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }

                    if log_limiter.ready() {
                        tracing::info!(service_id = %service.id, "Service is starting");
                    }
                }
            }
        }

        tracing::debug!(client_id = %client.id, "All service batches started");
        publish(&self.outputs.clients_out, client);
        Ok(())
    }
}

fn publish<T>(tx: &Sender<T>, item: T) {
    if tx.try_send(item).is_err() {
        tracing::debug!("Output receiver dropped, discarding");
    }
}
