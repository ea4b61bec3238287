//! Shared test utilities for persephone-vmware integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use persephone_orchestration::{
    ClusterId, ComponentKind, CreateComputeRequest, Genesis, ModelComponent, ModelSpecification,
    NodeId, ServiceType,
};
use persephone_vmware::{
    SimulatedAllocator, SimulatedSite, SiteConfig, VmcOrchestrator, simulated_allocator,
};

pub const TEMPLATE: &str = "blockchain-template";

/// Orchestrator wired to a simulated site.
pub struct TestSite {
    pub config: SiteConfig,
    pub site: Arc<SimulatedSite>,
    pub allocator: Arc<SimulatedAllocator>,
    pub orchestrator: VmcOrchestrator,
}

impl TestSite {
    /// A development site with the template library item, customized by
    /// `configure`.
    pub async fn spawn(configure: impl FnOnce(SimulatedSite) -> SimulatedSite) -> Self {
        let config = SiteConfig::development();
        let site = Arc::new(configure(
            SimulatedSite::new(&config).with_library_item(TEMPLATE),
        ));
        let allocator = Arc::new(
            simulated_allocator(&config)
                .await
                .expect("Failed to create address block"),
        );
        let orchestrator = VmcOrchestrator::new(config.clone(), site.clients(allocator.clone()))
            .expect("Failed to create orchestrator");

        Self {
            config,
            site,
            allocator,
            orchestrator,
        }
    }

    pub async fn start() -> Self {
        Self::spawn(|site| site).await
    }
}

pub fn model() -> ModelSpecification {
    ModelSpecification {
        version: "1.0".to_string(),
        template: TEMPLATE.to_string(),
        components: vec![ModelComponent {
            kind: ComponentKind::ContainerImage,
            service_type: ServiceType::Generic,
            name: "vmwblockchain/agent:1.0".to_string(),
        }],
    }
}

pub fn compute_request(cluster: ClusterId, address: &str) -> CreateComputeRequest {
    CreateComputeRequest {
        cluster,
        node: NodeId::random(),
        model: model(),
        genesis: Genesis::default(),
        private_network_address: address.to_string(),
    }
}
