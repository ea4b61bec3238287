//! End-to-end driver tests against the simulated site.
//!
//! All timing tests run on paused time, so the driver's poll intervals and
//! the ten minute operation timeout elapse instantly.

mod common;

use std::time::Duration;

use futures::StreamExt;
use ipnet::Ipv4Net;
use persephone_orchestration::{
    ClusterId, ComputeResourceEvent, CreateNetworkAddressRequest, CreateNetworkAllocationRequest,
    DeleteComputeRequest, DeleteNetworkAddressRequest, DeleteNetworkAllocationRequest,
    NetworkAllocationEvent, NetworkResourceEvent, OrchestrationRequest, Orchestrator,
    OrchestratorError, ResourceUri, collect_events,
};
use persephone_vmware::clients::{AddressAllocationClient, NatAction, PowerState};
use persephone_vmware::ipam::block_name;
use persephone_vmware::Fault;
use tokio::time::Instant;

use common::{TestSite, compute_request};

/// Resource of the first `Created` event.
fn created_compute(events: &[ComputeResourceEvent]) -> ResourceUri {
    events
        .iter()
        .find_map(|event| match event {
            ComputeResourceEvent::Created { resource, .. } => Some(resource.clone()),
            _ => None,
        })
        .expect("no Created event")
}

/// Resources of the private and public `Created` events.
async fn acquire_address(test: &TestSite, name: &str) -> (ResourceUri, String, ResourceUri) {
    let events = collect_events(&test.orchestrator.create_network_address(
        CreateNetworkAddressRequest {
            name: name.to_string(),
            public: true,
        },
    ))
    .await
    .unwrap();

    match events.as_slice() {
        [
            NetworkResourceEvent::Created {
                resource: private,
                address,
                public: false,
                ..
            },
            NetworkResourceEvent::Created {
                resource: public,
                public: true,
                ..
            },
        ] => (private.clone(), address.clone(), public.clone()),
        other => panic!("unexpected events {other:?}"),
    }
}

// =============================================================================
// Compute
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_compute_waits_for_network_realization() {
    let test = TestSite::spawn(|site| {
        site.with_network_realization_delay(Duration::from_millis(1000))
    })
    .await;
    let cluster = ClusterId::random();
    let request = compute_request(cluster, "10.1.0.3");
    let node = request.node;

    let start = Instant::now();
    let events = collect_events(&test.orchestrator.create_deployment(request))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(events.len(), 2);
    let resource = match &events[0] {
        ComputeResourceEvent::Created { resource, node: n } => {
            assert_eq!(*n, node);
            resource.clone()
        }
        other => panic!("expected Created, got {other:?}"),
    };
    assert_eq!(
        events[1],
        ComputeResourceEvent::Started {
            resource: resource.clone()
        }
    );
    assert!(elapsed >= Duration::from_millis(1000), "took {elapsed:?}");
    assert!(elapsed < test.config.settings.operation_timeout());

    assert_eq!(resource.scheme(), Some("https"));
    assert_eq!(resource.authority(), Some("vcenter.sddc-dev.local"));
    let vm = resource.last_segment().unwrap();
    assert_eq!(test.site.power_state_of(vm), Some(PowerState::PoweredOn));

    let deployed = test.site.deploy_request_of(vm).unwrap();
    assert_eq!(deployed.name, format!("{cluster}-{node}"));
    assert_eq!(deployed.property("hostname"), Some("replica"));
    assert_eq!(deployed.property("instance-id"), Some(node.to_string().as_str()));
    assert!(deployed.property("user-data").is_some());
    let keys: Vec<_> = deployed.network_mappings.iter().map(|m| m.key.as_str()).collect();
    assert_eq!(keys, ["control-network", "data-network"]);

    let segment = test
        .site
        .segment(&format!("blockchain-data-{cluster}"))
        .expect("data network segment");
    let gateway: Ipv4Net = segment.subnets[0].gateway_address.parse().unwrap();
    assert_eq!(gateway.prefix_len(), 28);
    assert!(test.config.settings.data_network_prefix.contains(&gateway.network()));
}

#[tokio::test(start_paused = true)]
async fn test_operation_waits_for_first_subscriber() {
    let test = TestSite::start().await;
    let publisher = test
        .orchestrator
        .create_deployment(compute_request(ClusterId::random(), "10.1.0.3"));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(test.site.virtual_machines().is_empty());

    let events = collect_events(&publisher).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(test.site.virtual_machines().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_compute_times_out_on_unrealized_network() {
    let test = TestSite::spawn(|site| {
        site.with_network_realization_delay(Duration::from_secs(3600))
    })
    .await;

    let start = Instant::now();
    let err = collect_events(
        &test
            .orchestrator
            .create_deployment(compute_request(ClusterId::random(), "10.1.0.3")),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, OrchestratorError::ResourceCreationFailed { .. }));
    assert!(start.elapsed() >= test.config.settings.operation_timeout());
    assert!(test.site.virtual_machines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deploy_fault_fails_with_request() {
    let test = TestSite::spawn(|site| site.with_fault(Fault::DeployLibraryItem)).await;
    let request = compute_request(ClusterId::random(), "10.1.0.3");

    let publisher = test.orchestrator.create_deployment(request.clone());
    let mut subscription = publisher.subscribe();

    match subscription.next().await {
        Some(Err(err)) => {
            assert_eq!(err, OrchestratorError::creation_failed(request.clone()));
            assert_eq!(err.request(), &OrchestrationRequest::CreateCompute(request));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(subscription.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_template_fails() {
    let test = TestSite::start().await;
    let mut request = compute_request(ClusterId::random(), "10.1.0.3");
    request.model.template = "no-such-template".to_string();

    let err = collect_events(&test.orchestrator.create_deployment(request))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceCreationFailed { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_private_address_fails() {
    let test = TestSite::start().await;
    let err = collect_events(
        &test
            .orchestrator
            .create_deployment(compute_request(ClusterId::random(), "not-an-address")),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceCreationFailed { .. }));
    assert!(test.site.virtual_machines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delete_compute() {
    let test = TestSite::start().await;
    let events = collect_events(
        &test
            .orchestrator
            .create_deployment(compute_request(ClusterId::random(), "10.1.0.3")),
    )
    .await
    .unwrap();
    let resource = created_compute(&events);

    let events = collect_events(&test.orchestrator.delete_deployment(DeleteComputeRequest {
        resource: resource.clone(),
    }))
    .await
    .unwrap();

    assert_eq!(events, vec![ComputeResourceEvent::Deleted { resource }]);
    assert!(test.site.virtual_machines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_power_on_failure_after_created() {
    let test = TestSite::spawn(|site| site.with_fault(Fault::PowerOn)).await;

    let start = Instant::now();
    let publisher = test
        .orchestrator
        .create_deployment(compute_request(ClusterId::random(), "10.1.0.3"));
    let mut subscription = publisher.subscribe();

    assert!(matches!(
        subscription.next().await,
        Some(Ok(ComputeResourceEvent::Created { .. }))
    ));
    assert!(matches!(
        subscription.next().await,
        Some(Err(OrchestratorError::ResourceCreationFailed { .. }))
    ));
    assert!(subscription.next().await.is_none());
    assert!(start.elapsed() >= test.config.settings.operation_timeout());

    let vms = test.site.virtual_machines();
    assert_eq!(vms.len(), 1);
    assert_eq!(test.site.power_state_of(&vms[0]), Some(PowerState::PoweredOff));
}

#[tokio::test(start_paused = true)]
async fn test_delete_fault_keeps_machine() {
    let test = TestSite::spawn(|site| site.with_fault(Fault::DeleteVm)).await;
    let events = collect_events(
        &test
            .orchestrator
            .create_deployment(compute_request(ClusterId::random(), "10.1.0.3")),
    )
    .await
    .unwrap();
    let resource = created_compute(&events);

    let publisher = test
        .orchestrator
        .delete_deployment(DeleteComputeRequest { resource });
    let mut subscription = publisher.subscribe();

    assert!(matches!(
        subscription.next().await,
        Some(Err(OrchestratorError::ResourceDeletionFailed { .. }))
    ));
    assert!(subscription.next().await.is_none());

    let vms = test.site.virtual_machines();
    assert_eq!(vms.len(), 1);
    assert_eq!(test.site.power_state_of(&vms[0]), Some(PowerState::PoweredOff));
}

#[tokio::test(start_paused = true)]
async fn test_delete_unknown_compute_fails() {
    let test = TestSite::start().await;
    let resource: ResourceUri = "https://vcenter.sddc-dev.local/rest/vcenter/vm/vm-404"
        .parse()
        .unwrap();

    let err = collect_events(&test.orchestrator.delete_deployment(DeleteComputeRequest {
        resource,
    }))
    .await
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceDeletionFailed { .. }));
}

// =============================================================================
// Network Addresses
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_private_and_public_address() {
    let test = TestSite::start().await;
    let (private, address, public) = acquire_address(&test, "node-1").await;

    assert_eq!(address, "10.1.0.3");
    assert_eq!(private.scheme(), None);
    assert_eq!(private.authority(), Some("ipam.sddc-dev.local"));
    assert!(private.path().contains("/addresses/"));
    assert_eq!(public.scheme(), Some("https"));
    assert_eq!(test.site.public_ips().len(), 1);

    for resource in [private, public] {
        let events = collect_events(&test.orchestrator.delete_network_address(
            DeleteNetworkAddressRequest {
                resource: resource.clone(),
            },
        ))
        .await
        .unwrap();
        assert_eq!(events, vec![NetworkResourceEvent::Deleted { resource }]);
    }
    assert!(test.site.public_ips().is_empty());

    // The released lease is handed out again.
    let parent = block_name(&test.config.datacenter, &test.config.vsphere.network.name);
    let response = test.allocator.allocate_address(&parent).await.unwrap();
    assert_eq!(response.address.unwrap().value.to_string(), "10.1.0.3");
}

#[tokio::test(start_paused = true)]
async fn test_private_address_only() {
    let test = TestSite::start().await;
    let events = collect_events(&test.orchestrator.create_network_address(
        CreateNetworkAddressRequest {
            name: "node-1".to_string(),
            public: false,
        },
    ))
    .await
    .unwrap();

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        NetworkResourceEvent::Created { public: false, .. }
    ));
    assert!(test.site.public_ips().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_public_ip_fault_releases_private_lease() {
    let test = TestSite::spawn(|site| site.with_fault(Fault::PublicIp)).await;

    let err = collect_events(&test.orchestrator.create_network_address(
        CreateNetworkAddressRequest {
            name: "node-1".to_string(),
            public: true,
        },
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceCreationFailed { .. }));

    let parent = block_name(&test.config.datacenter, &test.config.vsphere.network.name);
    let response = test.allocator.allocate_address(&parent).await.unwrap();
    assert_eq!(response.address.unwrap().value.to_string(), "10.1.0.3");
}

#[tokio::test(start_paused = true)]
async fn test_close_during_public_phase_releases_private_lease() {
    let test = TestSite::spawn(|site| site.with_public_ip_delay(Duration::from_secs(3600))).await;

    let publisher = test
        .orchestrator
        .create_network_address(CreateNetworkAddressRequest {
            name: "node-1".to_string(),
            public: true,
        });
    let mut subscription = publisher.subscribe();

    tokio::time::sleep(Duration::from_secs(5)).await;
    test.orchestrator.close();
    assert!(matches!(
        subscription.next().await,
        Some(Err(OrchestratorError::ResourceCreationFailed { .. }))
    ));

    // The lease is returned in the background.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let parent = block_name(&test.config.datacenter, &test.config.vsphere.network.name);
    let response = test.allocator.allocate_address(&parent).await.unwrap();
    assert_eq!(response.address.unwrap().value.to_string(), "10.1.0.3");
    assert!(test.site.public_ips().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_release_unknown_lease_fails() {
    let test = TestSite::start().await;
    let resource = ResourceUri::new(
        None,
        Some("ipam.sddc-dev.local"),
        "blocks/sddc-dev-blockchain-control/addresses/0a0100fe",
    );

    let err = collect_events(&test.orchestrator.delete_network_address(
        DeleteNetworkAddressRequest { resource },
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceDeletionFailed { .. }));
}

// =============================================================================
// Network Allocations
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_node_lifecycle() {
    let test = TestSite::start().await;
    let (_, address, public) = acquire_address(&test, "node-1").await;

    let events = collect_events(
        &test
            .orchestrator
            .create_deployment(compute_request(ClusterId::random(), &address)),
    )
    .await
    .unwrap();
    let compute = created_compute(&events);

    let events = collect_events(&test.orchestrator.create_network_allocation(
        CreateNetworkAllocationRequest {
            name: "nat-1".to_string(),
            compute: compute.clone(),
            network: public.clone(),
        },
    ))
    .await
    .unwrap();

    let allocation = match events.as_slice() {
        [
            NetworkAllocationEvent::Created {
                resource,
                name,
                compute: c,
                network: n,
            },
        ] => {
            assert_eq!(name, "nat-1");
            assert_eq!(c, &compute);
            assert_eq!(n, &public);
            resource.clone()
        }
        other => panic!("unexpected events {other:?}"),
    };
    assert_eq!(allocation.authority(), Some("nsx.sddc-dev.local"));
    assert!(
        allocation
            .path()
            .ends_with("/infra/tier-1s/cgw/nat/USER/nat-rules/nat-1")
    );

    let rules = test.site.nat_rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].action, NatAction::Reflexive);
    assert_eq!(rules[0].source_network, address);
    assert_eq!(rules[0].translated_network, "203.0.113.1");

    collect_events(&test.orchestrator.delete_network_allocation(
        DeleteNetworkAllocationRequest {
            resource: allocation,
        },
    ))
    .await
    .unwrap();
    assert!(test.site.nat_rules().is_empty());

    collect_events(&test.orchestrator.delete_deployment(DeleteComputeRequest {
        resource: compute,
    }))
    .await
    .unwrap();
    assert!(test.site.virtual_machines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_nat_rule_fault_fails_allocation() {
    let test = TestSite::spawn(|site| site.with_fault(Fault::NatRule)).await;
    let (_, address, public) = acquire_address(&test, "node-1").await;
    let events = collect_events(
        &test
            .orchestrator
            .create_deployment(compute_request(ClusterId::random(), &address)),
    )
    .await
    .unwrap();
    let compute = created_compute(&events);

    let publisher = test
        .orchestrator
        .create_network_allocation(CreateNetworkAllocationRequest {
            name: "nat-1".to_string(),
            compute,
            network: public,
        });
    let mut subscription = publisher.subscribe();

    assert!(matches!(
        subscription.next().await,
        Some(Err(OrchestratorError::ResourceCreationFailed { .. }))
    ));
    assert!(subscription.next().await.is_none());
    assert!(test.site.nat_rules().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_guest_without_address_fails_allocation() {
    let test = TestSite::spawn(|site| site.with_guest_boot_delay(None)).await;
    let (_, address, public) = acquire_address(&test, "node-1").await;
    let events = collect_events(
        &test
            .orchestrator
            .create_deployment(compute_request(ClusterId::random(), &address)),
    )
    .await
    .unwrap();
    let compute = created_compute(&events);

    let start = Instant::now();
    let publisher = test
        .orchestrator
        .create_network_allocation(CreateNetworkAllocationRequest {
            name: "nat-1".to_string(),
            compute,
            network: public,
        });
    let mut subscription = publisher.subscribe();

    // No Created before the failure.
    match subscription.next().await {
        Some(Err(OrchestratorError::ResourceCreationFailed { request })) => {
            assert!(matches!(*request, OrchestrationRequest::CreateNetworkAllocation(_)));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(subscription.next().await.is_none());
    assert!(start.elapsed() >= test.config.settings.operation_timeout());
    assert!(test.site.nat_rules().is_empty());
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_cancels_in_flight_operations() {
    let test = TestSite::spawn(|site| {
        site.with_network_realization_delay(Duration::from_secs(3600))
    })
    .await;

    let publisher = test
        .orchestrator
        .create_deployment(compute_request(ClusterId::random(), "10.1.0.3"));
    let mut subscription = publisher.subscribe();

    tokio::time::sleep(Duration::from_secs(5)).await;
    let start = Instant::now();
    test.orchestrator.close();

    assert!(matches!(
        subscription.next().await,
        Some(Err(OrchestratorError::ResourceCreationFailed { .. }))
    ));
    assert!(start.elapsed() < test.config.settings.retry_interval());

    // Operations started after close fail right away.
    let err = collect_events(&test.orchestrator.create_network_address(
        CreateNetworkAddressRequest {
            name: "late".to_string(),
            public: false,
        },
    ))
    .await
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceCreationFailed { .. }));
}
