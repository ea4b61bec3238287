//! Orchestration request types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{ClusterId, Genesis, ModelSpecification, NodeId};
use crate::uri::ResourceUri;

// =============================================================================
// Compute
// =============================================================================

/// Request to deploy one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateComputeRequest {
    pub cluster: ClusterId,
    pub node: NodeId,
    pub model: ModelSpecification,
    pub genesis: Genesis,
    /// Static address the node configures on its control interface.
    pub private_network_address: String,
}

/// Request to tear down a deployed compute resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteComputeRequest {
    pub resource: ResourceUri,
}

// =============================================================================
// Network Addresses
// =============================================================================

/// Request to acquire a network address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNetworkAddressRequest {
    pub name: String,
    /// Also acquire an address reachable from outside the site.
    pub public: bool,
}

/// Request to release a network address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteNetworkAddressRequest {
    pub resource: ResourceUri,
}

// =============================================================================
// Network Allocations
// =============================================================================

/// Request to route a network address to a compute resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNetworkAllocationRequest {
    /// Provider-side name of the allocation (the NAT rule id).
    pub name: String,
    pub compute: ResourceUri,
    pub network: ResourceUri,
}

/// Request to remove a network allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteNetworkAllocationRequest {
    pub resource: ResourceUri,
}

// =============================================================================
// Tagged Union
// =============================================================================

/// Any orchestration request. Carried by
/// [`OrchestratorError`](crate::OrchestratorError) so callers can tell which
/// request failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationRequest {
    CreateCompute(CreateComputeRequest),
    DeleteCompute(DeleteComputeRequest),
    CreateNetworkAddress(CreateNetworkAddressRequest),
    DeleteNetworkAddress(DeleteNetworkAddressRequest),
    CreateNetworkAllocation(CreateNetworkAllocationRequest),
    DeleteNetworkAllocation(DeleteNetworkAllocationRequest),
}

macro_rules! impl_from_request {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for OrchestrationRequest {
                fn from(request: $ty) -> Self {
                    OrchestrationRequest::$variant(request)
                }
            }
        )*
    };
}

impl_from_request! {
    CreateCompute(CreateComputeRequest),
    DeleteCompute(DeleteComputeRequest),
    CreateNetworkAddress(CreateNetworkAddressRequest),
    DeleteNetworkAddress(DeleteNetworkAddressRequest),
    CreateNetworkAllocation(CreateNetworkAllocationRequest),
    DeleteNetworkAllocation(DeleteNetworkAllocationRequest),
}

impl fmt::Display for OrchestrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationRequest::CreateCompute(r) => {
                write!(f, "create compute {}/{}", r.cluster, r.node)
            }
            OrchestrationRequest::DeleteCompute(r) => write!(f, "delete compute {}", r.resource),
            OrchestrationRequest::CreateNetworkAddress(r) => {
                write!(f, "create network address {} (public: {})", r.name, r.public)
            }
            OrchestrationRequest::DeleteNetworkAddress(r) => {
                write!(f, "delete network address {}", r.resource)
            }
            OrchestrationRequest::CreateNetworkAllocation(r) => write!(
                f,
                "create network allocation {} ({} -> {})",
                r.name, r.network, r.compute
            ),
            OrchestrationRequest::DeleteNetworkAllocation(r) => {
                write!(f, "delete network allocation {}", r.resource)
            }
        }
    }
}
