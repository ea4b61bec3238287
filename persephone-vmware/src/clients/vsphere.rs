//! vSphere automation API surface used by the driver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ApiResponse, Result};

/// Entry of a filtered vSphere listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub id: String,
    pub name: String,
}

/// Binds an OVF network of the template to a site network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMapping {
    pub key: String,
    pub value: String,
}

/// OVF property passed to the guest (via vApp options).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OvfProperty {
    pub id: String,
    pub value: String,
}

/// Deploy request for an OVF content library item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryItemDeployRequest {
    pub name: String,
    pub accept_all_eula: bool,
    pub default_datastore_id: String,
    pub network_mappings: Vec<NetworkMapping>,
    pub properties: Vec<OvfProperty>,
    pub resource_pool_id: String,
    pub folder_id: String,
}

impl LibraryItemDeployRequest {
    pub fn property(&self, id: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryItemDeployResult {
    pub succeeded: bool,
    /// Id of the created virtual machine.
    pub resource_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
}

/// What the guest tools report about the running guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestIdentity {
    pub host_name: Option<String>,
    pub ip_address: Option<String>,
}

/// vCenter client.
///
/// Lookups by name answer with every match; an empty list means absent.
#[async_trait]
pub trait VSphereClient: Send + Sync {
    async fn get_folder(&self, name: &str) -> Result<ApiResponse<Vec<ResourceSummary>>>;

    async fn get_datastore(&self, name: &str) -> Result<ApiResponse<Vec<ResourceSummary>>>;

    async fn get_resource_pool(&self, name: &str) -> Result<ApiResponse<Vec<ResourceSummary>>>;

    /// Networks as seen by vSphere. NSX segments appear here only once realized.
    async fn get_network(&self, name: &str) -> Result<ApiResponse<Vec<ResourceSummary>>>;

    async fn get_library_item(&self, name: &str) -> Result<ApiResponse<Vec<ResourceSummary>>>;

    async fn deploy_library_item(
        &self,
        library_item: &str,
        request: &LibraryItemDeployRequest,
    ) -> Result<ApiResponse<LibraryItemDeployResult>>;

    async fn get_power_state(&self, vm: &str) -> Result<ApiResponse<PowerState>>;

    async fn set_power_state(&self, vm: &str, action: PowerAction) -> Result<ApiResponse<()>>;

    async fn delete_vm(&self, vm: &str) -> Result<ApiResponse<()>>;

    /// Guest identity; unavailable (non-2xx) until the guest tools report in.
    async fn get_guest_identity(&self, vm: &str) -> Result<ApiResponse<GuestIdentity>>;
}
