//! VMware Cloud orchestrator.
//!
//! Every operation runs as its own task:
//!
//! 1. wait for the first subscriber of the returned publisher
//! 2. run the operation under the site's operation timeout, racing the
//!    orchestrator's shutdown signal
//! 3. publish progress events as the operation advances
//! 4. close the publisher, with the request's `*Failed` error unless the
//!    operation completed
//!
//! The cause of a failure (timeout, cancellation, provider error) is logged
//! here; subscribers only see which request failed.

mod compute;
mod network;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use persephone_orchestration::{
    ComputeResourceEvent, CreateComputeRequest, CreateNetworkAddressRequest,
    CreateNetworkAllocationRequest, DeleteComputeRequest, DeleteNetworkAddressRequest,
    DeleteNetworkAllocationRequest, NetworkAllocationEvent, NetworkResourceEvent,
    OrchestrationEvent, OrchestrationPublisher, Orchestrator, OrchestratorError, ResourceUri,
};
use persephone_reactive::Publisher;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::clients::{
    AddressAllocationClient, AllocationStatus, ClientError, NsxClient, PowerState, VSphereClient,
};
use crate::cloudinit::{BootConfigBuilder, BootConfigError, CloudInitConfiguration};
use crate::config::{ConfigError, SiteConfig};
use crate::net::SubnetError;

/// Why an operation did not complete. Logged, then folded into the request's
/// [`OrchestratorError`].
#[derive(Debug, Error)]
pub(crate) enum DriverError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{operation} rejected with status {status}")]
    Rejected { operation: &'static str, status: u16 },

    #[error("virtual machine {vm} reported power state {state:?}")]
    PowerState {
        vm: String,
        state: Option<PowerState>,
    },

    #[error("address allocation from {parent} failed: {status:?}")]
    Allocation {
        parent: String,
        status: AllocationStatus,
    },

    #[error("release of {name} failed: {status:?}")]
    Release {
        name: String,
        status: AllocationStatus,
    },

    #[error("invalid resource identifier {0}")]
    InvalidResource(ResourceUri),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled by orchestrator shutdown")]
    Cancelled,

    #[error("publisher closed before anyone subscribed")]
    Abandoned,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    BootConfig(#[from] BootConfigError),

    #[error(transparent)]
    Subnet(#[from] SubnetError),
}

/// Control-plane clients of one site.
#[derive(Clone)]
pub struct SiteClients {
    pub vsphere: Arc<dyn VSphereClient>,
    pub nsx: Arc<dyn NsxClient>,
    pub ipam: Arc<dyn AddressAllocationClient>,
}

/// State shared by all operation tasks of one orchestrator.
pub(crate) struct Driver {
    site: SiteConfig,
    vsphere: Arc<dyn VSphereClient>,
    nsx: Arc<dyn NsxClient>,
    ipam: Arc<dyn AddressAllocationClient>,
    boot: Arc<dyn BootConfigBuilder>,
    vsphere_base: ResourceUri,
    nsx_base: ResourceUri,
}

impl Driver {
    /// Identifier of virtual machine `vm`.
    fn vm_resource(&self, vm: &str) -> ResourceUri {
        self.vsphere_base.join(&format!("rest/vcenter/vm/{vm}"))
    }

    /// Identifier of public IP `id`.
    fn public_ip_resource(&self, id: &str) -> ResourceUri {
        self.nsx_base
            .join(&format!("cloud-service/api/v1/infra/public-ips/{id}"))
    }

    /// Identifier of the NSX policy object at `path`.
    fn policy_resource(&self, path: &str) -> ResourceUri {
        self.nsx_base.join(&format!("policy/api/v1{path}"))
    }

    /// Identifier of the lease named `name` at the allocation service.
    fn lease_resource(&self, name: &str) -> ResourceUri {
        let server = self.site.vsphere.network.allocation_server.as_str();
        ResourceUri::new(None, Some(server), name)
    }
}

/// Orchestrator for one VMware Cloud SDDC.
pub struct VmcOrchestrator {
    driver: Arc<Driver>,
    shutdown: watch::Sender<bool>,
}

impl VmcOrchestrator {
    /// Create an orchestrator rendering boot configurations with
    /// [`CloudInitConfiguration`].
    pub fn new(site: SiteConfig, clients: SiteClients) -> Result<Self, ConfigError> {
        Self::with_boot_config(site, clients, Arc::new(CloudInitConfiguration))
    }

    pub fn with_boot_config(
        site: SiteConfig,
        clients: SiteClients,
        boot: Arc<dyn BootConfigBuilder>,
    ) -> Result<Self, ConfigError> {
        site.validate()?;
        let parse = |endpoint: &str| {
            endpoint
                .parse::<ResourceUri>()
                .map_err(|e| ConfigError::Invalid(format!("{endpoint}: {e}")))
        };
        let vsphere_base = parse(&site.vsphere.endpoint)?;
        let nsx_base = parse(&site.nsx.endpoint)?;

        info!(
            organization = %site.organization,
            datacenter = %site.datacenter,
            "VMC orchestrator ready"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            driver: Arc::new(Driver {
                site,
                vsphere: clients.vsphere,
                nsx: clients.nsx,
                ipam: clients.ipam,
                boot,
                vsphere_base,
                nsx_base,
            }),
            shutdown,
        })
    }

    pub fn site(&self) -> &SiteConfig {
        &self.driver.site
    }

    /// Start `work` as an operation task and hand out its publisher.
    fn launch<E, F, Fut>(
        &self,
        operation: &'static str,
        failure: OrchestratorError,
        work: F,
    ) -> OrchestrationPublisher<E>
    where
        E: OrchestrationEvent,
        F: FnOnce(Arc<Driver>, OrchestrationPublisher<E>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), DriverError>> + Send + 'static,
    {
        let settings = &self.driver.site.settings;
        let publisher = Arc::new(Publisher::new(settings.publisher_capacity));
        let timeout = settings.operation_timeout();
        let driver = Arc::clone(&self.driver);
        let shutdown = self.shutdown.subscribe();
        let events = Arc::clone(&publisher);

        let span = info_span!("operation", operation);
        tokio::spawn(
            async move {
                let run = async {
                    events
                        .wait_for_subscription(1)
                        .await
                        .map_err(|_| DriverError::Abandoned)?;
                    debug!("subscriber attached, starting");
                    tokio::time::timeout(timeout, work(driver, Arc::clone(&events)))
                        .await
                        .map_err(|_| DriverError::Timeout(timeout))?
                };

                let outcome = tokio::select! {
                    outcome = run => outcome,
                    _ = cancelled(shutdown) => Err(DriverError::Cancelled),
                };

                match outcome {
                    Ok(()) => {
                        debug!("completed");
                        events.close(None);
                    }
                    Err(error) => {
                        warn!(%error, request = %failure.request(), "operation failed");
                        events.close(Some(failure));
                    }
                }
            }
            .instrument(span),
        );

        publisher
    }
}

/// Resolves once the orchestrator is closed. Dropping the orchestrator
/// without closing it leaves running operations alone.
async fn cancelled(mut shutdown: watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|closed| *closed).await.is_ok();
    if !closed {
        std::future::pending::<()>().await;
    }
}

/// Broadcast `event`, noting when no subscriber could take it.
fn emit<E: OrchestrationEvent>(publisher: &Publisher<E, OrchestratorError>, event: E) {
    let resource = event.resource().clone();
    if publisher.broadcast(event) {
        info!(%resource, "event published");
    } else {
        warn!(%resource, "event dropped, no subscriber could take it");
    }
}

impl Orchestrator for VmcOrchestrator {
    fn create_deployment(
        &self,
        request: CreateComputeRequest,
    ) -> OrchestrationPublisher<ComputeResourceEvent> {
        let failure = OrchestratorError::creation_failed(request.clone());
        self.launch("create_deployment", failure, move |driver, events| async move {
            driver.create_compute(&request, &events).await
        })
    }

    fn delete_deployment(
        &self,
        request: DeleteComputeRequest,
    ) -> OrchestrationPublisher<ComputeResourceEvent> {
        let failure = OrchestratorError::deletion_failed(request.clone());
        self.launch("delete_deployment", failure, move |driver, events| async move {
            driver.delete_compute(&request, &events).await
        })
    }

    fn create_network_address(
        &self,
        request: CreateNetworkAddressRequest,
    ) -> OrchestrationPublisher<NetworkResourceEvent> {
        let failure = OrchestratorError::creation_failed(request.clone());
        self.launch("create_network_address", failure, move |driver, events| async move {
            driver.create_network_address(&request, &events).await
        })
    }

    fn delete_network_address(
        &self,
        request: DeleteNetworkAddressRequest,
    ) -> OrchestrationPublisher<NetworkResourceEvent> {
        let failure = OrchestratorError::deletion_failed(request.clone());
        self.launch("delete_network_address", failure, move |driver, events| async move {
            driver.delete_network_address(&request, &events).await
        })
    }

    fn create_network_allocation(
        &self,
        request: CreateNetworkAllocationRequest,
    ) -> OrchestrationPublisher<NetworkAllocationEvent> {
        let failure = OrchestratorError::creation_failed(request.clone());
        self.launch("create_network_allocation", failure, move |driver, events| async move {
            driver.create_network_allocation(&request, &events).await
        })
    }

    fn delete_network_allocation(
        &self,
        request: DeleteNetworkAllocationRequest,
    ) -> OrchestrationPublisher<NetworkAllocationEvent> {
        let failure = OrchestratorError::deletion_failed(request.clone());
        self.launch("delete_network_allocation", failure, move |driver, events| async move {
            driver.delete_network_allocation(&request, &events).await
        })
    }

    fn close(&self) {
        if !self.shutdown.send_replace(true) {
            info!("VMC orchestrator closed, cancelling in-flight operations");
        }
    }
}
