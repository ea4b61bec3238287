//! In-memory VMware Cloud SDDC.
//!
//! [`SimulatedSite`] answers the vSphere and NSX calls the driver makes and
//! models the parts of a real site that make orchestration asynchronous:
//! NSX segments become visible to vSphere only after a realization delay, and
//! guests report their address only some time after power-on. Faults can be
//! injected per call family. It backs the integration tests and the CLI's
//! dry runs.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use ipnet::Ipv4Net;
use persephone_kv::InMemoryKeyValueStore;
use persephone_orchestration::ResourceUri;
use tokio::time::Instant;
use tracing::debug;

use crate::clients::{
    self, AddressAllocationClient, ApiResponse, GuestIdentity, LibraryItemDeployRequest,
    LibraryItemDeployResult, NatRule, NsxClient, PowerAction, PowerState, PublicIp,
    ResourceSummary, Segment, VSphereClient,
};
use crate::cloudinit::configured_address;
use crate::config::SiteConfig;
use crate::ipam::{AddressBlock, AllocatorError, StoreBackedAllocator, block_name};
use crate::orchestrator::SiteClients;

/// Allocator over an in-memory store, as used with the simulated site.
pub type SimulatedAllocator = StoreBackedAllocator<InMemoryKeyValueStore<String, AddressBlock>>;

/// Call families that can be made to fail with a server error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    DeployLibraryItem,
    PowerOn,
    PublicIp,
    NatRule,
    DeleteVm,
}

const SERVER_ERROR: u16 = 500;
const BAD_REQUEST: u16 = 400;
const NO_CONTENT: u16 = 204;
const NOT_READY: u16 = 503;

#[derive(Debug)]
struct SimulatedSegment {
    segment: Segment,
    network_id: String,
    realized_at: Instant,
}

#[derive(Debug)]
struct SimulatedVm {
    deployed: LibraryItemDeployRequest,
    power: PowerState,
    powered_on_at: Option<Instant>,
    guest_address: Option<Ipv4Addr>,
}

#[derive(Debug, Default)]
struct SiteState {
    folders: BTreeMap<String, String>,
    datastores: BTreeMap<String, String>,
    resource_pools: BTreeMap<String, String>,
    library_items: BTreeMap<String, String>,
    segments: BTreeMap<String, SimulatedSegment>,
    vms: BTreeMap<String, SimulatedVm>,
    public_ips: BTreeMap<String, PublicIp>,
    nat_rules: BTreeMap<String, NatRule>,
    next_id: u64,
    next_public_host: u32,
}

impl SiteState {
    fn next_id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{kind}-{}", self.next_id)
    }

    fn is_known_network(&self, id: &str) -> bool {
        let now = Instant::now();
        self.segments
            .values()
            .any(|s| s.network_id == id && s.realized_at <= now)
    }
}

/// A simulated SDDC implementing [`VSphereClient`] and [`NsxClient`].
#[derive(Debug)]
pub struct SimulatedSite {
    state: Mutex<SiteState>,
    network_realization_delay: Duration,
    guest_boot_delay: Option<Duration>,
    public_ip_delay: Duration,
    public_pool: Ipv4Net,
    faults: HashSet<Fault>,
}

impl SimulatedSite {
    /// A site holding the folder, datastore and resource pool `site` places
    /// instances in. Networks realize immediately and guests report their
    /// address one second after power-on.
    pub fn new(site: &SiteConfig) -> Self {
        let mut state = SiteState::default();
        let placement = &site.vsphere;
        let id = state.next_id("group");
        state.folders.insert(placement.folder.clone(), id);
        let id = state.next_id("datastore");
        state.datastores.insert(placement.datastore.clone(), id);
        let id = state.next_id("resgroup");
        state.resource_pools.insert(placement.resource_pool.clone(), id);

        Self {
            state: Mutex::new(state),
            network_realization_delay: Duration::ZERO,
            guest_boot_delay: Some(Duration::from_secs(1)),
            public_ip_delay: Duration::ZERO,
            public_pool: Ipv4Net::new(Ipv4Addr::new(203, 0, 113, 0), 24).unwrap_or_default(),
            faults: HashSet::new(),
        }
    }

    /// Add a deployable content library item.
    pub fn with_library_item(self, name: &str) -> Self {
        {
            let mut state = self.state();
            let id = state.next_id("library-item");
            state.library_items.insert(name.to_string(), id);
        }
        self
    }

    /// Delay between a segment request and its network showing up in vSphere.
    pub fn with_network_realization_delay(mut self, delay: Duration) -> Self {
        self.network_realization_delay = delay;
        self
    }

    /// Delay between power-on and the guest reporting its address. `None`
    /// means the guest never does.
    pub fn with_guest_boot_delay(mut self, delay: Option<Duration>) -> Self {
        self.guest_boot_delay = delay;
        self
    }

    /// Delay before a public IP request is answered.
    pub fn with_public_ip_delay(mut self, delay: Duration) -> Self {
        self.public_ip_delay = delay;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.insert(fault);
        self
    }

    /// Driver clients backed by this site and `ipam`.
    pub fn clients(self: &Arc<Self>, ipam: Arc<dyn AddressAllocationClient>) -> SiteClients {
        SiteClients {
            vsphere: Arc::clone(self) as Arc<dyn VSphereClient>,
            nsx: Arc::clone(self) as Arc<dyn NsxClient>,
            ipam,
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Ids of all virtual machines.
    pub fn virtual_machines(&self) -> Vec<String> {
        self.state().vms.keys().cloned().collect()
    }

    pub fn power_state_of(&self, vm: &str) -> Option<PowerState> {
        self.state().vms.get(vm).map(|vm| vm.power)
    }

    /// The deploy request virtual machine `vm` was created from.
    pub fn deploy_request_of(&self, vm: &str) -> Option<LibraryItemDeployRequest> {
        self.state().vms.get(vm).map(|vm| vm.deployed.clone())
    }

    pub fn segment(&self, name: &str) -> Option<Segment> {
        self.state().segments.get(name).map(|s| s.segment.clone())
    }

    pub fn public_ips(&self) -> Vec<PublicIp> {
        self.state().public_ips.values().cloned().collect()
    }

    pub fn nat_rules(&self) -> Vec<NatRule> {
        self.state().nat_rules.values().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, SiteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faulty<T>(&self, fault: Fault) -> Option<ApiResponse<T>> {
        if self.faults.contains(&fault) {
            debug!(?fault, "injecting fault");
            Some(ApiResponse::empty(SERVER_ERROR))
        } else {
            None
        }
    }
}

fn lookup(
    entries: &BTreeMap<String, String>,
    name: &str,
) -> clients::Result<ApiResponse<Vec<ResourceSummary>>> {
    let found = entries
        .get(name)
        .map(|id| ResourceSummary {
            id: id.clone(),
            name: name.to_string(),
        })
        .into_iter()
        .collect();
    Ok(ApiResponse::ok(found))
}

#[async_trait]
impl VSphereClient for SimulatedSite {
    async fn get_folder(&self, name: &str) -> clients::Result<ApiResponse<Vec<ResourceSummary>>> {
        lookup(&self.state().folders, name)
    }

    async fn get_datastore(
        &self,
        name: &str,
    ) -> clients::Result<ApiResponse<Vec<ResourceSummary>>> {
        lookup(&self.state().datastores, name)
    }

    async fn get_resource_pool(
        &self,
        name: &str,
    ) -> clients::Result<ApiResponse<Vec<ResourceSummary>>> {
        lookup(&self.state().resource_pools, name)
    }

    async fn get_network(&self, name: &str) -> clients::Result<ApiResponse<Vec<ResourceSummary>>> {
        let state = self.state();
        let now = Instant::now();
        let found = state
            .segments
            .get(name)
            .filter(|s| s.realized_at <= now)
            .map(|s| ResourceSummary {
                id: s.network_id.clone(),
                name: name.to_string(),
            })
            .into_iter()
            .collect();
        Ok(ApiResponse::ok(found))
    }

    async fn get_library_item(
        &self,
        name: &str,
    ) -> clients::Result<ApiResponse<Vec<ResourceSummary>>> {
        lookup(&self.state().library_items, name)
    }

    async fn deploy_library_item(
        &self,
        library_item: &str,
        request: &LibraryItemDeployRequest,
    ) -> clients::Result<ApiResponse<LibraryItemDeployResult>> {
        if let Some(response) = self.faulty(Fault::DeployLibraryItem) {
            return Ok(response);
        }

        let mut state = self.state();
        if !state.library_items.values().any(|id| id == library_item) {
            return Ok(ApiResponse::not_found());
        }
        let networks_known = request
            .network_mappings
            .iter()
            .all(|mapping| state.is_known_network(&mapping.value));
        if !networks_known {
            return Ok(ApiResponse::empty(BAD_REQUEST));
        }

        let guest_address = request
            .property("user-data")
            .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|user_data| configured_address(&user_data));

        let vm = state.next_id("vm");
        debug!(%vm, name = %request.name, ?guest_address, "deployed virtual machine");
        state.vms.insert(
            vm.clone(),
            SimulatedVm {
                deployed: request.clone(),
                power: PowerState::PoweredOff,
                powered_on_at: None,
                guest_address,
            },
        );

        Ok(ApiResponse::ok(LibraryItemDeployResult {
            succeeded: true,
            resource_id: Some(vm),
        }))
    }

    async fn get_power_state(&self, vm: &str) -> clients::Result<ApiResponse<PowerState>> {
        Ok(match self.state().vms.get(vm) {
            Some(vm) => ApiResponse::ok(vm.power),
            None => ApiResponse::not_found(),
        })
    }

    async fn set_power_state(&self, vm: &str, action: PowerAction) -> clients::Result<ApiResponse<()>> {
        if action == PowerAction::Start {
            if let Some(response) = self.faulty(Fault::PowerOn) {
                return Ok(response);
            }
        }

        let mut state = self.state();
        let Some(vm) = state.vms.get_mut(vm) else {
            return Ok(ApiResponse::not_found());
        };
        match action {
            PowerAction::Start if vm.power != PowerState::PoweredOn => {
                vm.power = PowerState::PoweredOn;
                vm.powered_on_at = Some(Instant::now());
            }
            PowerAction::Stop => {
                vm.power = PowerState::PoweredOff;
                vm.powered_on_at = None;
            }
            PowerAction::Start => {}
        }
        Ok(ApiResponse::empty(NO_CONTENT))
    }

    async fn delete_vm(&self, vm: &str) -> clients::Result<ApiResponse<()>> {
        if let Some(response) = self.faulty(Fault::DeleteVm) {
            return Ok(response);
        }

        let mut state = self.state();
        match state.vms.get(vm).map(|vm| vm.power) {
            None => Ok(ApiResponse::not_found()),
            // vCenter refuses to delete a running machine.
            Some(PowerState::PoweredOn) => Ok(ApiResponse::empty(BAD_REQUEST)),
            Some(_) => {
                state.vms.remove(vm);
                Ok(ApiResponse::empty(NO_CONTENT))
            }
        }
    }

    async fn get_guest_identity(&self, vm: &str) -> clients::Result<ApiResponse<GuestIdentity>> {
        let state = self.state();
        let Some(vm) = state.vms.get(vm) else {
            return Ok(ApiResponse::not_found());
        };

        let booted = match (vm.powered_on_at, self.guest_boot_delay) {
            (Some(at), Some(delay)) => at + delay <= Instant::now(),
            _ => false,
        };
        Ok(match vm.guest_address {
            Some(address) if booted => ApiResponse::ok(GuestIdentity {
                host_name: vm.deployed.property("hostname").map(str::to_string),
                ip_address: Some(address.to_string()),
            }),
            _ => ApiResponse::empty(NOT_READY),
        })
    }
}

#[async_trait]
impl NsxClient for SimulatedSite {
    async fn get_segment(&self, _tier1: &str, name: &str) -> clients::Result<ApiResponse<Segment>> {
        Ok(match self.state().segments.get(name) {
            Some(s) => ApiResponse::ok(s.segment.clone()),
            None => ApiResponse::not_found(),
        })
    }

    async fn create_or_update_segment(
        &self,
        _tier1: &str,
        segment: &Segment,
    ) -> clients::Result<ApiResponse<Segment>> {
        let mut state = self.state();
        if let Some(existing) = state.segments.get_mut(&segment.id) {
            existing.segment = segment.clone();
        } else {
            let network_id = state.next_id("network");
            debug!(segment = %segment.id, %network_id, "segment created");
            state.segments.insert(
                segment.id.clone(),
                SimulatedSegment {
                    segment: segment.clone(),
                    network_id,
                    realized_at: Instant::now() + self.network_realization_delay,
                },
            );
        }
        Ok(ApiResponse::ok(segment.clone()))
    }

    async fn create_public_ip(&self, name: &str) -> clients::Result<ApiResponse<PublicIp>> {
        if !self.public_ip_delay.is_zero() {
            tokio::time::sleep(self.public_ip_delay).await;
        }
        if let Some(response) = self.faulty(Fault::PublicIp) {
            return Ok(response);
        }

        let mut state = self.state();
        state.next_public_host += 1;
        let Some(address) = self
            .public_pool
            .hosts()
            .nth(state.next_public_host as usize - 1)
        else {
            return Ok(ApiResponse::empty(SERVER_ERROR));
        };

        let ip = PublicIp {
            id: state.next_id("public-ip"),
            display_name: name.to_string(),
            ip: Some(address.to_string()),
        };
        state.public_ips.insert(ip.id.clone(), ip.clone());
        Ok(ApiResponse::ok(ip))
    }

    async fn get_public_ip(&self, id: &str) -> clients::Result<ApiResponse<PublicIp>> {
        Ok(match self.state().public_ips.get(id) {
            Some(ip) => ApiResponse::ok(ip.clone()),
            None => ApiResponse::not_found(),
        })
    }

    async fn create_nat_rule(
        &self,
        tier1: &str,
        section: &str,
        rule: &NatRule,
    ) -> clients::Result<ApiResponse<NatRule>> {
        if let Some(response) = self.faulty(Fault::NatRule) {
            return Ok(response);
        }

        let mut state = self.state();
        let translated = Some(rule.translated_network.as_str());
        if !state
            .public_ips
            .values()
            .any(|ip| ip.ip.as_deref() == translated)
        {
            return Ok(ApiResponse::empty(BAD_REQUEST));
        }

        let mut created = rule.clone();
        created.path = Some(format!(
            "/infra/tier-1s/{tier1}/nat/{section}/nat-rules/{}",
            rule.id
        ));
        state.nat_rules.insert(rule.id.clone(), created.clone());
        Ok(ApiResponse::ok(created))
    }

    async fn delete_resource(&self, resource: &ResourceUri) -> clients::Result<ApiResponse<()>> {
        let Some(id) = resource.last_segment() else {
            return Ok(ApiResponse::empty(BAD_REQUEST));
        };

        let mut state = self.state();
        let path = resource.path();
        let removed = if path.contains("/public-ips/") {
            state.public_ips.remove(id).is_some()
        } else if path.contains("/nat-rules/") {
            state.nat_rules.remove(id).is_some()
        } else if path.contains("/segments/") {
            state.segments.remove(id).is_some()
        } else {
            false
        };

        Ok(if removed {
            ApiResponse::empty(NO_CONTENT)
        } else {
            ApiResponse::not_found()
        })
    }
}

/// An allocator holding the address block of `site`'s control network. The
/// gateway and the name servers are never leased.
pub async fn simulated_allocator(site: &SiteConfig) -> Result<SimulatedAllocator, AllocatorError> {
    let network = &site.vsphere.network;
    let allocator = StoreBackedAllocator::new(InMemoryKeyValueStore::new());
    let reserved = std::iter::once(network.gateway).chain(network.name_servers.iter().copied());
    allocator
        .create_block(
            &block_name(&site.datacenter, &network.name),
            AddressBlock::new(network.subnet, reserved),
        )
        .await?;
    Ok(allocator)
}
