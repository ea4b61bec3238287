//! Provider-neutral deployment orchestration.
//!
//! Requests, events and errors shared by every infrastructure driver, the
//! [`Orchestrator`] trait they implement, and [`ResourceUri`], the locator of
//! every resource an orchestrator hands out.

pub mod error;
pub mod event;
pub mod model;
pub mod orchestrator;
pub mod request;
pub mod uri;

pub use error::{OrchestratorError, Result};
pub use event::{
    ComputeResourceEvent, NetworkAllocationEvent, NetworkResourceEvent, OrchestrationEvent,
};
pub use model::{
    ClusterId, ComponentKind, Genesis, GenesisConfig, ModelComponent, ModelSpecification, NodeId,
    ServiceType, Wallet,
};
pub use orchestrator::{OrchestrationPublisher, Orchestrator, collect_events, first_event};
pub use request::{
    CreateComputeRequest, CreateNetworkAddressRequest, CreateNetworkAllocationRequest,
    DeleteComputeRequest, DeleteNetworkAddressRequest, DeleteNetworkAllocationRequest,
    OrchestrationRequest,
};
pub use uri::{ResourceUri, UriError};
