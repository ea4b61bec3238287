//! Orchestration site configuration.
//!
//! A [`SiteConfig`] describes one VMware Cloud SDDC: where instances are
//! placed, which network they attach to, how NSX is reached, and the timing
//! policy the driver applies to every operation.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use persephone_orchestration::ResourceUri;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or validating a site configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse site configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid site configuration: {0}")]
    Invalid(String),
}

/// One orchestration site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub organization: String,
    pub datacenter: String,
    pub vsphere: VSphereConfig,
    pub nsx: NsxConfig,
    pub container_registry: RegistryConfig,
    #[serde(default)]
    pub settings: OrchestratorSettings,
}

/// Placement of deployed instances within vCenter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VSphereConfig {
    /// vCenter API endpoint; compute resource identifiers live under it.
    pub endpoint: String,
    pub folder: String,
    pub datastore: String,
    pub resource_pool: String,
    pub network: NetworkConfig,
}

/// The control network every instance attaches to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub gateway: Ipv4Addr,
    /// Address range of the network; private addresses are leased from it.
    pub subnet: Ipv4Net,
    #[serde(default)]
    pub name_servers: Vec<Ipv4Addr>,
    /// Authority of the address allocation service leasing private addresses.
    pub allocation_server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NsxConfig {
    /// NSX policy API endpoint.
    pub endpoint: String,
    #[serde(default = "default_tier1")]
    pub tier1: String,
    #[serde(default = "default_nat_section")]
    pub nat_section: String,
}

/// Container registry the node agent pulls its images from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Timing and sizing policy applied by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Upper bound on one operation, measured from its first subscriber.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Pause between convergence checks (network realization, power state).
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Pause between guest identity polls while waiting for a guest address.
    #[serde(default = "default_guest_poll_interval_ms")]
    pub guest_poll_interval_ms: u64,
    /// Prefix length of per-cluster data network segments.
    #[serde(default = "default_segment_subnet_size")]
    pub segment_subnet_size: u8,
    /// Range data network segments are carved from.
    #[serde(default = "default_data_network_prefix")]
    pub data_network_prefix: Ipv4Net,
    /// Per-subscriber event buffer of operation publishers.
    #[serde(default = "default_publisher_capacity")]
    pub publisher_capacity: usize,
}

fn default_tier1() -> String {
    "cgw".to_string()
}

fn default_nat_section() -> String {
    "USER".to_string()
}

fn default_operation_timeout_secs() -> u64 {
    600
}

fn default_retry_interval_ms() -> u64 {
    500
}

fn default_guest_poll_interval_ms() -> u64 {
    5000
}

fn default_segment_subnet_size() -> u8 {
    28
}

fn default_data_network_prefix() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(10, 255, 0, 0), 16).unwrap_or_default()
}

fn default_publisher_capacity() -> usize {
    16
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_operation_timeout_secs(),
            retry_interval_ms: default_retry_interval_ms(),
            guest_poll_interval_ms: default_guest_poll_interval_ms(),
            segment_subnet_size: default_segment_subnet_size(),
            data_network_prefix: default_data_network_prefix(),
            publisher_capacity: default_publisher_capacity(),
        }
    }
}

impl OrchestratorSettings {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn guest_poll_interval(&self) -> Duration {
        Duration::from_millis(self.guest_poll_interval_ms)
    }
}

impl SiteConfig {
    /// Load a JSON site configuration from `path` and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: SiteConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in site used for local dry runs against the simulated SDDC.
    pub fn development() -> Self {
        Self {
            organization: "persephone-dev".to_string(),
            datacenter: "sddc-dev".to_string(),
            vsphere: VSphereConfig {
                endpoint: "https://vcenter.sddc-dev.local".to_string(),
                folder: "Workloads".to_string(),
                datastore: "WorkloadDatastore".to_string(),
                resource_pool: "Compute-ResourcePool".to_string(),
                network: NetworkConfig {
                    name: "blockchain-control".to_string(),
                    gateway: Ipv4Addr::new(10, 1, 0, 1),
                    subnet: Ipv4Net::new(Ipv4Addr::new(10, 1, 0, 0), 16).unwrap_or_default(),
                    name_servers: vec![Ipv4Addr::new(10, 1, 0, 2)],
                    allocation_server: "ipam.sddc-dev.local".to_string(),
                },
            },
            nsx: NsxConfig {
                endpoint: "https://nsx.sddc-dev.local".to_string(),
                tier1: default_tier1(),
                nat_section: default_nat_section(),
            },
            container_registry: RegistryConfig {
                address: "https://registry.sddc-dev.local".to_string(),
                username: None,
                password: None,
            },
            settings: OrchestratorSettings::default(),
        }
    }

    /// Reject configurations the driver cannot operate on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        for (field, value) in [
            ("datacenter", &self.datacenter),
            ("vsphere.folder", &self.vsphere.folder),
            ("vsphere.datastore", &self.vsphere.datastore),
            ("vsphere.resource_pool", &self.vsphere.resource_pool),
            ("vsphere.network.name", &self.vsphere.network.name),
            ("vsphere.network.allocation_server", &self.vsphere.network.allocation_server),
            ("nsx.tier1", &self.nsx.tier1),
            ("nsx.nat_section", &self.nsx.nat_section),
        ] {
            if value.trim().is_empty() {
                return invalid(format!("{field} must not be empty"));
            }
        }

        for (field, endpoint) in [
            ("vsphere.endpoint", &self.vsphere.endpoint),
            ("nsx.endpoint", &self.nsx.endpoint),
            ("container_registry.address", &self.container_registry.address),
        ] {
            let uri: ResourceUri = endpoint
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("{field}: {e}")))?;
            if uri.scheme().is_none() || uri.authority().is_none() {
                return invalid(format!("{field} must be an absolute URL, got {endpoint:?}"));
            }
        }

        let network = &self.vsphere.network;
        if !network.subnet.contains(&network.gateway) {
            return invalid(format!(
                "gateway {} is outside of network {}",
                network.gateway, network.subnet
            ));
        }
        if network.subnet.prefix_len() > 30 {
            return invalid(format!("network {} is too small", network.subnet));
        }
        // Control segments are realized with the gateway on the first host.
        let first_host = Ipv4Addr::from(u32::from(network.subnet.network()) + 1);
        if network.gateway != first_host {
            return invalid(format!(
                "gateway {} must be the first host {} of network {}",
                network.gateway, first_host, network.subnet
            ));
        }

        let settings = &self.settings;
        if settings.operation_timeout_secs == 0 {
            return invalid("operation_timeout_secs must be positive".to_string());
        }
        if settings.retry_interval_ms == 0 || settings.guest_poll_interval_ms == 0 {
            return invalid("retry intervals must be positive".to_string());
        }
        if settings.publisher_capacity == 0 {
            return invalid("publisher_capacity must be positive".to_string());
        }
        let size = settings.segment_subnet_size;
        if size > 30 || size < settings.data_network_prefix.prefix_len() {
            return invalid(format!(
                "segment_subnet_size /{size} does not fit in {}",
                settings.data_network_prefix
            ));
        }

        Ok(())
    }
}
