//! persephone: deployment orchestration CLI.
//!
//! Brings up blockchain clusters through the VMware Cloud driver. Without a
//! reachable SDDC the driver runs against the simulated site, which makes
//! `deploy` a dry run of the full flow:
//! - lease a private (and optionally public) address per node
//! - deploy and power on one instance per node
//! - publish each node through a NAT rule
//! - optionally tear everything down again

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use persephone_kv::{Event, KeyValueStore};
use persephone_orchestration::{
    ClusterId, ComponentKind, ComputeResourceEvent, CreateComputeRequest,
    CreateNetworkAddressRequest, CreateNetworkAllocationRequest, DeleteComputeRequest,
    DeleteNetworkAddressRequest, DeleteNetworkAllocationRequest, Genesis, ModelComponent,
    ModelSpecification, NetworkAllocationEvent, NetworkResourceEvent, NodeId, Orchestrator,
    ResourceUri, ServiceType, collect_events,
};
use persephone_vmware::{SimulatedSite, SiteConfig, VmcOrchestrator, simulated_allocator};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// persephone deployment orchestrator
#[derive(Parser, Debug)]
#[command(name = "persephone", version, about)]
struct Cli {
    /// Site configuration (JSON). Defaults to the built-in development site.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy a cluster against the simulated site
    Deploy {
        /// Number of cluster members
        #[arg(short, long, default_value = "4")]
        nodes: usize,

        /// Content library template to instantiate
        #[arg(long, default_value = "blockchain-template")]
        template: String,

        /// Node agent image, relative to the container registry
        #[arg(long, default_value = "vmwblockchain/agent:latest")]
        agent_image: String,

        /// Also publish every node on a public address
        #[arg(long)]
        public: bool,

        /// Tear the cluster down again once it is up
        #[arg(long)]
        teardown: bool,

        /// Simulated delay until new network segments are realized
        #[arg(long, default_value = "1000")]
        network_delay_ms: u64,

        /// Simulated delay until a powered-on guest reports its address
        #[arg(long, default_value = "3000")]
        guest_boot_ms: u64,
    },

    /// Print the effective site configuration
    Config,
}

/// Resources held by one deployed node, in creation order.
#[derive(Debug)]
struct DeployedNode {
    node: NodeId,
    addresses: Vec<ResourceUri>,
    compute: ResourceUri,
    allocation: Option<ResourceUri>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "persephone=info,persephone_vmware=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let site = match &cli.config {
        Some(path) => SiteConfig::load(path)
            .with_context(|| format!("failed to load site configuration {}", path.display()))?,
        None => SiteConfig::development(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&site)?);
        }
        Commands::Deploy {
            nodes,
            template,
            agent_image,
            public,
            teardown,
            network_delay_ms,
            guest_boot_ms,
        } => {
            let simulated = Arc::new(
                SimulatedSite::new(&site)
                    .with_library_item(&template)
                    .with_network_realization_delay(Duration::from_millis(network_delay_ms))
                    .with_guest_boot_delay(Some(Duration::from_millis(guest_boot_ms))),
            );
            let allocator = Arc::new(
                simulated_allocator(&site)
                    .await
                    .context("failed to create control network address block")?,
            );

            let mut leases = allocator
                .store()
                .subscribe(64, true)
                .await
                .context("failed to subscribe to address leases")?;
            tokio::spawn(async move {
                while let Some(event) = leases.next().await {
                    match event {
                        Ok(Event::Change {
                            key,
                            value,
                            version,
                        }) => info!(
                            block = %key,
                            %version,
                            leased = value.allocated.len(),
                            "address block updated"
                        ),
                        Ok(Event::Delete { key, .. }) => info!(block = %key, "address block removed"),
                        Err(error) => {
                            warn!(%error, "address lease feed ended");
                            break;
                        }
                    }
                }
            });

            let orchestrator = VmcOrchestrator::new(site, simulated.clients(allocator.clone()))
                .context("failed to create orchestrator")?;

            let model = ModelSpecification {
                version: env!("CARGO_PKG_VERSION").to_string(),
                template,
                components: vec![ModelComponent {
                    kind: ComponentKind::ContainerImage,
                    service_type: ServiceType::Generic,
                    name: agent_image,
                }],
            };
            let cluster = ClusterId::random();
            info!(%cluster, nodes, public, "deploying cluster");

            let mut deployed = Vec::with_capacity(nodes);
            for _ in 0..nodes {
                let node = deploy_node(&orchestrator, cluster, &model, public).await?;
                info!(node = %node.node, compute = %node.compute, "node ready");
                deployed.push(node);
            }
            info!(%cluster, vms = simulated.virtual_machines().len(), "cluster deployed");

            if teardown {
                for node in deployed.iter().rev() {
                    teardown_node(&orchestrator, node).await?;
                    info!(node = %node.node, "node removed");
                }
                info!(%cluster, "cluster torn down");
            }

            orchestrator.close();
        }
    }

    Ok(())
}

async fn deploy_node(
    orchestrator: &VmcOrchestrator,
    cluster: ClusterId,
    model: &ModelSpecification,
    public: bool,
) -> Result<DeployedNode> {
    let node = NodeId::random();

    let events = collect_events(&orchestrator.create_network_address(
        CreateNetworkAddressRequest {
            name: format!("{cluster}-{node}"),
            public,
        },
    ))
    .await
    .context("failed to acquire network address")?;

    let mut private_address = None;
    let mut public_resource = None;
    let mut addresses = Vec::new();
    for event in events {
        if let NetworkResourceEvent::Created {
            resource,
            address,
            public,
            ..
        } = event
        {
            addresses.push(resource.clone());
            if public {
                public_resource = Some(resource);
            } else {
                private_address = Some(address);
            }
        }
    }
    let Some(private_address) = private_address else {
        bail!("no private address acquired for node {node}");
    };

    let events = collect_events(&orchestrator.create_deployment(CreateComputeRequest {
        cluster,
        node,
        model: model.clone(),
        genesis: Genesis::default(),
        private_network_address: private_address,
    }))
    .await
    .context("failed to deploy node")?;
    let Some(compute) = events.into_iter().find_map(|event| match event {
        ComputeResourceEvent::Created { resource, .. } => Some(resource),
        _ => None,
    }) else {
        bail!("deployment of node {node} reported no resource");
    };

    let mut allocation = None;
    if let Some(network) = public_resource {
        let events = collect_events(&orchestrator.create_network_allocation(
            CreateNetworkAllocationRequest {
                name: format!("nat-{node}"),
                compute: compute.clone(),
                network,
            },
        ))
        .await
        .context("failed to publish node")?;
        allocation = events.into_iter().find_map(|event| match event {
            NetworkAllocationEvent::Created { resource, .. } => Some(resource),
            _ => None,
        });
    }

    Ok(DeployedNode {
        node,
        addresses,
        compute,
        allocation,
    })
}

async fn teardown_node(orchestrator: &VmcOrchestrator, node: &DeployedNode) -> Result<()> {
    if let Some(resource) = &node.allocation {
        collect_events(&orchestrator.delete_network_allocation(DeleteNetworkAllocationRequest {
            resource: resource.clone(),
        }))
        .await
        .context("failed to remove NAT rule")?;
    }

    collect_events(&orchestrator.delete_deployment(DeleteComputeRequest {
        resource: node.compute.clone(),
    }))
    .await
    .context("failed to delete node")?;

    for resource in node.addresses.iter().rev() {
        collect_events(&orchestrator.delete_network_address(DeleteNetworkAddressRequest {
            resource: resource.clone(),
        }))
        .await
        .with_context(|| format!("failed to release {resource}"))?;
    }
    Ok(())
}
