//! Network addresses and allocations.
//!
//! A network address has a private half, leased from the control network's
//! address block, and optionally a public half, an NSX public IP. A network
//! allocation routes a public IP to the private address of a running guest
//! with a reflexive NAT rule.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use persephone_orchestration::{
    CreateNetworkAddressRequest, CreateNetworkAllocationRequest, DeleteNetworkAddressRequest,
    DeleteNetworkAllocationRequest, NetworkAllocationEvent, NetworkResourceEvent,
    OrchestrationPublisher, ResourceUri,
};
use tracing::{debug, info, warn};

use super::{Driver, DriverError, emit};
use crate::clients::{
    Address, AddressAllocationClient, AllocationStatus, NatAction, NatRule, NsxClient, PublicIp,
};
use crate::ipam::block_name;

/// Id and assigned address of an NSX public IP.
struct AssignedPublicIp {
    id: String,
    ip: String,
}

/// Addresses acquired by a request that has not reported them yet.
///
/// Whatever is still held when the guard drops is released in the
/// background. That covers requests dropped by the operation timeout or by
/// `close()` while the other phase is still pending.
struct HeldAddresses {
    ipam: Arc<dyn AddressAllocationClient>,
    nsx: Arc<dyn NsxClient>,
    lease: Mutex<Option<String>>,
    public_ip: Mutex<Option<ResourceUri>>,
}

impl HeldAddresses {
    fn new(driver: &Driver) -> Self {
        Self {
            ipam: Arc::clone(&driver.ipam),
            nsx: Arc::clone(&driver.nsx),
            lease: Mutex::new(None),
            public_ip: Mutex::new(None),
        }
    }

    fn hold_lease(&self, name: &str) {
        *lock(&self.lease) = Some(name.to_string());
    }

    fn hold_public_ip(&self, resource: ResourceUri) {
        *lock(&self.public_ip) = Some(resource);
    }

    /// Keep the addresses; the caller reports them.
    fn disarm(&self) {
        lock(&self.lease).take();
        lock(&self.public_ip).take();
    }

    async fn release(&self) {
        let lease = lock(&self.lease).take();
        let public_ip = lock(&self.public_ip).take();
        release_held(self.ipam.as_ref(), self.nsx.as_ref(), lease, public_ip).await;
    }
}

impl Drop for HeldAddresses {
    fn drop(&mut self) {
        let lease = lock(&self.lease).take();
        let public_ip = lock(&self.public_ip).take();
        if lease.is_none() && public_ip.is_none() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(?lease, ?public_ip, "no runtime left to release abandoned addresses");
            return;
        };
        let ipam = Arc::clone(&self.ipam);
        let nsx = Arc::clone(&self.nsx);
        runtime.spawn(async move {
            release_held(ipam.as_ref(), nsx.as_ref(), lease, public_ip).await;
        });
    }
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Best-effort release of addresses taken by a failed request.
async fn release_held(
    ipam: &dyn AddressAllocationClient,
    nsx: &dyn NsxClient,
    lease: Option<String>,
    public_ip: Option<ResourceUri>,
) {
    if let Some(lease) = lease {
        match ipam.release_address(&lease).await {
            Ok(response) if response.status == AllocationStatus::Ok => {
                debug!(%lease, "released lease of failed request");
            }
            Ok(response) => {
                warn!(%lease, status = ?response.status, "failed to release lease");
            }
            Err(error) => warn!(%lease, %error, "failed to release lease"),
        }
    }
    if let Some(resource) = public_ip {
        match nsx.delete_resource(&resource).await {
            Ok(response) if response.is_success() => {
                debug!(%resource, "deleted public IP of failed request");
            }
            Ok(response) => {
                warn!(%resource, status = response.status, "failed to delete public IP");
            }
            Err(error) => warn!(%resource, %error, "failed to delete public IP"),
        }
    }
}

impl Driver {
    pub(super) async fn create_network_address(
        &self,
        request: &CreateNetworkAddressRequest,
        events: &OrchestrationPublisher<NetworkResourceEvent>,
    ) -> Result<(), DriverError> {
        let parent = block_name(&self.site.datacenter, &self.site.vsphere.network.name);
        let held = HeldAddresses::new(self);

        let private = async {
            let address = self.allocate_private(&parent).await?;
            held.hold_lease(&address.name);
            Ok::<_, DriverError>(address)
        };
        let public = async {
            if !request.public {
                return Ok(None);
            }
            let ip = self.allocate_public(&request.name).await?;
            held.hold_public_ip(self.public_ip_resource(&ip.id));
            Ok::<_, DriverError>(Some(ip))
        };

        let (private, public) = match tokio::try_join!(private, public) {
            Ok(acquired) => {
                held.disarm();
                acquired
            }
            Err(error) => {
                held.release().await;
                return Err(error);
            }
        };

        emit(
            events,
            NetworkResourceEvent::Created {
                resource: self.lease_resource(&private.name),
                name: request.name.clone(),
                address: private.value.to_string(),
                public: false,
            },
        );
        if let Some(public) = public {
            emit(
                events,
                NetworkResourceEvent::Created {
                    resource: self.public_ip_resource(&public.id),
                    name: request.name.clone(),
                    address: public.ip,
                    public: true,
                },
            );
        }
        Ok(())
    }

    /// Private addresses are scheme-less lease names; anything else is an NSX
    /// public IP.
    pub(super) async fn delete_network_address(
        &self,
        request: &DeleteNetworkAddressRequest,
        events: &OrchestrationPublisher<NetworkResourceEvent>,
    ) -> Result<(), DriverError> {
        let resource = &request.resource;
        if resource.scheme().is_none() {
            let name = resource.path().trim_start_matches('/');
            let response = self.ipam.release_address(name).await?;
            if response.status != AllocationStatus::Ok {
                return Err(DriverError::Release {
                    name: name.to_string(),
                    status: response.status,
                });
            }
            info!(lease = name, "private address released");
        } else {
            self.delete_nsx_resource("delete public IP", resource).await?;
            info!(%resource, "public IP deleted");
        }

        emit(
            events,
            NetworkResourceEvent::Deleted {
                resource: resource.clone(),
            },
        );
        Ok(())
    }

    pub(super) async fn create_network_allocation(
        &self,
        request: &CreateNetworkAllocationRequest,
        events: &OrchestrationPublisher<NetworkAllocationEvent>,
    ) -> Result<(), DriverError> {
        let vm = request
            .compute
            .last_segment()
            .ok_or_else(|| DriverError::InvalidResource(request.compute.clone()))?;
        let public_ip = request
            .network
            .last_segment()
            .ok_or_else(|| DriverError::InvalidResource(request.network.clone()))?;

        let private_address = self.wait_for_guest_address(vm).await?;

        let response = self.nsx.get_public_ip(public_ip).await?;
        let status = response.status;
        let public_address = response
            .into_success()
            .and_then(|ip| ip.ip)
            .ok_or(DriverError::Rejected {
                operation: "get public IP",
                status,
            })?;

        let nsx = &self.site.nsx;
        let rule = NatRule {
            id: request.name.clone(),
            display_name: request.name.clone(),
            action: NatAction::Reflexive,
            source_network: private_address,
            translated_network: public_address,
            path: None,
        };
        let response = self
            .nsx
            .create_nat_rule(&nsx.tier1, &nsx.nat_section, &rule)
            .await?;
        let status = response.status;
        let created = response.into_success().ok_or(DriverError::Rejected {
            operation: "create NAT rule",
            status,
        })?;
        let path = created.path.unwrap_or_else(|| {
            format!(
                "/infra/tier-1s/{}/nat/{}/nat-rules/{}",
                nsx.tier1, nsx.nat_section, created.id
            )
        });
        info!(
            rule = %created.id,
            private = %created.source_network,
            public = %created.translated_network,
            "NAT rule created"
        );

        emit(
            events,
            NetworkAllocationEvent::Created {
                resource: self.policy_resource(&path),
                name: request.name.clone(),
                compute: request.compute.clone(),
                network: request.network.clone(),
            },
        );
        Ok(())
    }

    pub(super) async fn delete_network_allocation(
        &self,
        request: &DeleteNetworkAllocationRequest,
        events: &OrchestrationPublisher<NetworkAllocationEvent>,
    ) -> Result<(), DriverError> {
        self.delete_nsx_resource("delete NAT rule", &request.resource)
            .await?;
        info!(resource = %request.resource, "NAT rule deleted");

        emit(
            events,
            NetworkAllocationEvent::Deleted {
                resource: request.resource.clone(),
            },
        );
        Ok(())
    }

    async fn allocate_private(&self, parent: &str) -> Result<Address, DriverError> {
        let response = self.ipam.allocate_address(parent).await?;
        match (response.status, response.address) {
            (AllocationStatus::Ok, Some(address)) => {
                debug!(lease = %address.name, address = %address.value, "private address leased");
                Ok(address)
            }
            (status, _) => Err(DriverError::Allocation {
                parent: parent.to_string(),
                status,
            }),
        }
    }

    async fn allocate_public(&self, name: &str) -> Result<AssignedPublicIp, DriverError> {
        let response = self.nsx.create_public_ip(name).await?;
        let status = response.status;
        match response.into_success() {
            Some(PublicIp { id, ip: Some(ip), .. }) => {
                debug!(%id, %ip, "public IP assigned");
                Ok(AssignedPublicIp { id, ip })
            }
            _ => Err(DriverError::Rejected {
                operation: "create public IP",
                status,
            }),
        }
    }

    async fn delete_nsx_resource(
        &self,
        operation: &'static str,
        resource: &ResourceUri,
    ) -> Result<(), DriverError> {
        let response = self.nsx.delete_resource(resource).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(DriverError::Rejected {
                operation,
                status: response.status,
            })
        }
    }

    /// Poll the guest tools until the guest reports an address.
    ///
    /// Runs until then; the operation timeout bounds it.
    async fn wait_for_guest_address(&self, vm: &str) -> Result<String, DriverError> {
        let interval = self.site.settings.guest_poll_interval();
        loop {
            tokio::time::sleep(interval).await;
            let identity = self.vsphere.get_guest_identity(vm).await?.into_success();
            if let Some(address) = identity.and_then(|guest| guest.ip_address) {
                debug!(vm, %address, "guest reported address");
                return Ok(address);
            }
            debug!(vm, "guest has not reported an address yet");
        }
    }
}
