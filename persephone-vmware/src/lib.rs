//! VMware Cloud driver for persephone.
//!
//! [`VmcOrchestrator`] implements [`Orchestrator`](persephone_orchestration::Orchestrator)
//! on top of a vSphere/NSX SDDC: it places instances from a content library
//! template, realizes per-cluster data networks as NSX segments, leases
//! control-network addresses and publishes guests through reflexive NAT rules.

pub mod clients;
pub mod cloudinit;
pub mod config;
pub mod ipam;
pub mod net;
pub mod orchestrator;
pub mod sim;

pub use cloudinit::{BootConfigBuilder, BootConfiguration, BootParameters, CloudInitConfiguration};
pub use config::{ConfigError, OrchestratorSettings, SiteConfig};
pub use ipam::{AddressBlock, AllocatorError, StoreBackedAllocator};
pub use orchestrator::{SiteClients, VmcOrchestrator};
pub use sim::{Fault, SimulatedAllocator, SimulatedSite, simulated_allocator};
