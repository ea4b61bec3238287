//! Orchestration events.
//!
//! Each operation family reports progress as its own event enum. Every event
//! names the resource it concerns.

use serde::{Deserialize, Serialize};

use crate::model::NodeId;
use crate::uri::ResourceUri;

/// Common view over the event families.
pub trait OrchestrationEvent: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn resource(&self) -> &ResourceUri;
}

/// Progress of a compute deployment or teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ComputeResourceEvent {
    /// The instance exists; `node` is the member it was deployed for.
    Created { resource: ResourceUri, node: NodeId },
    /// The instance is powered on.
    Started { resource: ResourceUri },
    Deleted { resource: ResourceUri },
}

impl OrchestrationEvent for ComputeResourceEvent {
    fn resource(&self) -> &ResourceUri {
        match self {
            ComputeResourceEvent::Created { resource, .. }
            | ComputeResourceEvent::Started { resource }
            | ComputeResourceEvent::Deleted { resource } => resource,
        }
    }
}

/// Progress of a network address acquisition or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetworkResourceEvent {
    Created {
        resource: ResourceUri,
        name: String,
        address: String,
        public: bool,
    },
    Deleted {
        resource: ResourceUri,
    },
}

impl OrchestrationEvent for NetworkResourceEvent {
    fn resource(&self) -> &ResourceUri {
        match self {
            NetworkResourceEvent::Created { resource, .. }
            | NetworkResourceEvent::Deleted { resource } => resource,
        }
    }
}

/// Progress of a network allocation (address routed to a compute resource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetworkAllocationEvent {
    Created {
        resource: ResourceUri,
        name: String,
        compute: ResourceUri,
        network: ResourceUri,
    },
    Deleted {
        resource: ResourceUri,
    },
}

impl OrchestrationEvent for NetworkAllocationEvent {
    fn resource(&self) -> &ResourceUri {
        match self {
            NetworkAllocationEvent::Created { resource, .. }
            | NetworkAllocationEvent::Deleted { resource } => resource,
        }
    }
}
