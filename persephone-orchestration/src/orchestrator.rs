//! The Orchestrator trait and helpers for consuming its event streams.

use std::sync::Arc;

use futures::StreamExt;
use persephone_reactive::Publisher;

use crate::error::{OrchestratorError, Result};
use crate::event::{ComputeResourceEvent, NetworkAllocationEvent, NetworkResourceEvent};
use crate::request::{
    CreateComputeRequest, CreateNetworkAddressRequest, CreateNetworkAllocationRequest,
    DeleteComputeRequest, DeleteNetworkAddressRequest, DeleteNetworkAllocationRequest,
};

/// Event stream of one orchestration request.
///
/// The stream is closed after the terminal event, or with an
/// [`OrchestratorError`] if the request could not be satisfied.
pub type OrchestrationPublisher<E> = Arc<Publisher<E, OrchestratorError>>;

/// Asynchronous deployment orchestration against one infrastructure site.
///
/// Every operation returns immediately. The work starts once the returned
/// publisher has its first subscriber, so callers never miss events.
pub trait Orchestrator: Send + Sync {
    /// Deploy and power on a cluster member.
    ///
    /// Emits `Created` then `Started`.
    fn create_deployment(
        &self,
        request: CreateComputeRequest,
    ) -> OrchestrationPublisher<ComputeResourceEvent>;

    /// Power off and remove a deployed compute resource. Emits `Deleted`.
    fn delete_deployment(
        &self,
        request: DeleteComputeRequest,
    ) -> OrchestrationPublisher<ComputeResourceEvent>;

    /// Acquire a private address and, if requested, a public one.
    ///
    /// Emits one `Created` per acquired address, private first.
    fn create_network_address(
        &self,
        request: CreateNetworkAddressRequest,
    ) -> OrchestrationPublisher<NetworkResourceEvent>;

    fn delete_network_address(
        &self,
        request: DeleteNetworkAddressRequest,
    ) -> OrchestrationPublisher<NetworkResourceEvent>;

    /// Route a network address to a compute resource. Emits `Created`.
    fn create_network_allocation(
        &self,
        request: CreateNetworkAllocationRequest,
    ) -> OrchestrationPublisher<NetworkAllocationEvent>;

    fn delete_network_allocation(
        &self,
        request: DeleteNetworkAllocationRequest,
    ) -> OrchestrationPublisher<NetworkAllocationEvent>;

    /// Cancel every in-flight operation of this instance. Their streams are
    /// closed with the respective failure.
    fn close(&self);
}

/// Subscribe to `publisher` and collect every event until it closes.
pub async fn collect_events<E>(publisher: &Publisher<E, OrchestratorError>) -> Result<Vec<E>>
where
    E: Clone + Send + 'static,
{
    let mut subscription = publisher.subscribe();
    let mut events = Vec::new();
    while let Some(item) = subscription.next().await {
        events.push(item?);
    }
    Ok(events)
}

/// Subscribe to `publisher` and return its first event, if any.
pub async fn first_event<E>(publisher: &Publisher<E, OrchestratorError>) -> Result<Option<E>>
where
    E: Clone + Send + 'static,
{
    let mut subscription = publisher.subscribe();
    subscription.next().await.transpose()
}
