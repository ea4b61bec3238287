//! Compute deployment and teardown.

use std::future::Future;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use persephone_orchestration::{
    ComputeResourceEvent, CreateComputeRequest, DeleteComputeRequest, OrchestrationPublisher,
};
use tracing::{debug, info};

use super::{Driver, DriverError, emit};
use crate::clients::{
    self, ApiResponse, LibraryItemDeployRequest, LibraryItemDeployResult, NetworkMapping,
    OvfProperty, PowerAction, PowerState, ResourceSummary,
};
use crate::cloudinit::BootParameters;
use crate::net::SegmentPlan;

/// OVF network of the template attached to the site's control network.
const CONTROL_NETWORK_KEY: &str = "control-network";
/// OVF network of the template attached to the cluster's data network.
const DATA_NETWORK_KEY: &str = "data-network";
const GUEST_HOSTNAME: &str = "replica";

/// Id of the first listed match, or `NotFound`.
async fn find<F>(kind: &'static str, name: &str, lookup: F) -> Result<String, DriverError>
where
    F: Future<Output = clients::Result<ApiResponse<Vec<ResourceSummary>>>>,
{
    lookup
        .await?
        .into_success()
        .and_then(|found| found.into_iter().next())
        .map(|summary| summary.id)
        .ok_or_else(|| DriverError::NotFound {
            kind,
            name: name.to_string(),
        })
}

impl Driver {
    pub(super) async fn create_compute(
        &self,
        request: &CreateComputeRequest,
        events: &OrchestrationPublisher<ComputeResourceEvent>,
    ) -> Result<(), DriverError> {
        let placement = &self.site.vsphere;
        let network = &placement.network;
        let settings = &self.site.settings;

        let address: Ipv4Addr = request
            .private_network_address
            .parse()
            .map_err(|_| DriverError::InvalidAddress(request.private_network_address.clone()))?;
        let boot = self.boot.build(&BootParameters {
            cluster: request.cluster,
            node: request.node,
            model: &request.model,
            genesis: &request.genesis,
            registry: &self.site.container_registry,
            address,
            gateway: network.gateway,
            prefix_len: network.subnet.prefix_len(),
            name_servers: &network.name_servers,
        })?;

        let data_network_name = format!("blockchain-data-{}", request.cluster);
        let template = &request.model.template;
        let (folder, datastore, resource_pool, control_network, data_network, library_item) = tokio::try_join!(
            find("folder", &placement.folder, self.vsphere.get_folder(&placement.folder)),
            find(
                "datastore",
                &placement.datastore,
                self.vsphere.get_datastore(&placement.datastore)
            ),
            find(
                "resource pool",
                &placement.resource_pool,
                self.vsphere.get_resource_pool(&placement.resource_pool)
            ),
            self.ensure_logical_network(&network.name, network.subnet, network.subnet.prefix_len()),
            self.ensure_logical_network(
                &data_network_name,
                settings.data_network_prefix,
                settings.segment_subnet_size
            ),
            find("library item", template, self.vsphere.get_library_item(template)),
        )?;
        debug!(
            %folder,
            %datastore,
            %resource_pool,
            %control_network,
            %data_network,
            %library_item,
            "placement resolved"
        );

        let instance = format!("{}-{}", request.cluster, request.node);
        let deploy = LibraryItemDeployRequest {
            name: instance.clone(),
            accept_all_eula: true,
            default_datastore_id: datastore,
            network_mappings: vec![
                NetworkMapping {
                    key: CONTROL_NETWORK_KEY.to_string(),
                    value: control_network,
                },
                NetworkMapping {
                    key: DATA_NETWORK_KEY.to_string(),
                    value: data_network,
                },
            ],
            properties: vec![
                OvfProperty {
                    id: "instance-id".to_string(),
                    value: request.node.to_string(),
                },
                OvfProperty {
                    id: "hostname".to_string(),
                    value: GUEST_HOSTNAME.to_string(),
                },
                OvfProperty {
                    id: "user-data".to_string(),
                    value: boot.to_base64(),
                },
            ],
            resource_pool_id: resource_pool,
            folder_id: folder,
        };

        let response = self
            .vsphere
            .deploy_library_item(&library_item, &deploy)
            .await?;
        let status = response.status;
        let vm = match response.into_success() {
            Some(LibraryItemDeployResult {
                succeeded: true,
                resource_id: Some(vm),
            }) => vm,
            _ => {
                return Err(DriverError::Rejected {
                    operation: "deploy library item",
                    status,
                });
            }
        };
        info!(%instance, %vm, "virtual machine deployed");

        let resource = self.vm_resource(&vm);
        emit(
            events,
            ComputeResourceEvent::Created {
                resource: resource.clone(),
                node: request.node,
            },
        );

        self.ensure_power_on(&vm).await?;
        emit(events, ComputeResourceEvent::Started { resource });
        Ok(())
    }

    pub(super) async fn delete_compute(
        &self,
        request: &DeleteComputeRequest,
        events: &OrchestrationPublisher<ComputeResourceEvent>,
    ) -> Result<(), DriverError> {
        let vm = request
            .resource
            .last_segment()
            .ok_or_else(|| DriverError::InvalidResource(request.resource.clone()))?;

        self.ensure_power_off(vm).await?;

        let response = self.vsphere.delete_vm(vm).await?;
        if !response.is_success() {
            return Err(DriverError::Rejected {
                operation: "delete virtual machine",
                status: response.status,
            });
        }
        info!(%vm, "virtual machine deleted");

        emit(
            events,
            ComputeResourceEvent::Deleted {
                resource: request.resource.clone(),
            },
        );
        Ok(())
    }

    /// Id of the vSphere network `name`, if realized.
    async fn lookup_network(&self, name: &str) -> Result<Option<String>, DriverError> {
        let found = self.vsphere.get_network(name).await?.into_success();
        Ok(found
            .and_then(|networks| networks.into_iter().next())
            .map(|summary| summary.id))
    }

    /// Wait until network `name` is visible to vSphere, requesting an NSX
    /// segment with a random `/size` subnet of `prefix` if none exists yet.
    ///
    /// Runs until the network shows up; the operation timeout bounds it.
    async fn ensure_logical_network(
        &self,
        name: &str,
        prefix: Ipv4Net,
        size: u8,
    ) -> Result<String, DriverError> {
        let tier1 = &self.site.nsx.tier1;
        loop {
            if let Some(id) = self.lookup_network(name).await? {
                return Ok(id);
            }

            if !self.nsx.get_segment(tier1, name).await?.is_success() {
                let plan = SegmentPlan::random(&mut rand::thread_rng(), prefix, size)?;
                let response = self
                    .nsx
                    .create_or_update_segment(tier1, &plan.to_segment(name))
                    .await?;
                if !response.is_success() {
                    return Err(DriverError::Rejected {
                        operation: "create network segment",
                        status: response.status,
                    });
                }
                info!(network = name, subnet = %plan.subnet, "network segment requested");

                if let Some(id) = self.lookup_network(name).await? {
                    return Ok(id);
                }
            }

            debug!(network = name, "waiting for network realization");
            tokio::time::sleep(self.site.settings.retry_interval()).await;
        }
    }

    async fn power_state(&self, vm: &str) -> Result<Option<PowerState>, DriverError> {
        Ok(self.vsphere.get_power_state(vm).await?.into_success())
    }

    async fn ensure_power_on(&self, vm: &str) -> Result<(), DriverError> {
        loop {
            match self.power_state(vm).await? {
                Some(PowerState::PoweredOn) => return Ok(()),
                Some(PowerState::PoweredOff | PowerState::Suspended) => {
                    let response = self.vsphere.set_power_state(vm, PowerAction::Start).await?;
                    debug!(vm, status = response.status, "power on requested");
                }
                None => {
                    return Err(DriverError::PowerState {
                        vm: vm.to_string(),
                        state: None,
                    });
                }
            }
            tokio::time::sleep(self.site.settings.retry_interval()).await;
        }
    }

    async fn ensure_power_off(&self, vm: &str) -> Result<(), DriverError> {
        loop {
            match self.power_state(vm).await? {
                Some(PowerState::PoweredOff) => return Ok(()),
                Some(PowerState::PoweredOn | PowerState::Suspended) => {
                    let response = self.vsphere.set_power_state(vm, PowerAction::Stop).await?;
                    debug!(vm, status = response.status, "power off requested");
                }
                None => {
                    return Err(DriverError::PowerState {
                        vm: vm.to_string(),
                        state: None,
                    });
                }
            }
            tokio::time::sleep(self.site.settings.retry_interval()).await;
        }
    }
}
