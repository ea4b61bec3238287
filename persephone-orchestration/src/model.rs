//! Deployment model types carried by orchestration requests.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! split_uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            pub high: u64,
            pub low: u64,
        }

        impl $name {
            pub fn new(high: u64, low: u64) -> Self {
                Self { high, low }
            }

            /// A fresh random (v4) identifier.
            pub fn random() -> Self {
                Uuid::new_v4().into()
            }

            pub fn to_uuid(self) -> Uuid {
                Uuid::from_u64_pair(self.high, self.low)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                let (high, low) = uuid.as_u64_pair();
                Self { high, low }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.to_uuid(), f)
            }
        }
    };
}

split_uuid_id! {
    /// Identifies a blockchain cluster.
    ClusterId
}

split_uuid_id! {
    /// Identifies one member node of a cluster.
    NodeId
}

// =============================================================================
// Model Specification
// =============================================================================

/// Kind of artifact a model component ships as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentKind {
    ContainerImage,
    Other,
}

/// Role of a model component on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    /// The node agent that bootstraps every other component.
    Generic,
    Concord,
    EthereumApi,
    DamlLedgerApi,
    DamlExecutionEngine,
    DamlIndexDb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelComponent {
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    pub service_type: ServiceType,
    /// Image reference relative to the container registry.
    pub name: String,
}

/// Versioned deployable model: the image template to instantiate plus the
/// components the node agent starts on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpecification {
    pub version: String,
    pub template: String,
    #[serde(default)]
    pub components: Vec<ModelComponent>,
}

impl ModelSpecification {
    /// The container image of the node agent, if the model ships one.
    pub fn agent_image(&self) -> Option<&str> {
        self.components
            .iter()
            .find(|c| c.kind == ComponentKind::ContainerImage && c.service_type == ServiceType::Generic)
            .map(|c| c.name.as_str())
    }
}

// =============================================================================
// Genesis
// =============================================================================

/// Ethereum chain parameters embedded in the genesis block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub homestead_block: u64,
    #[serde(default)]
    pub eip155_block: u64,
    #[serde(default)]
    pub eip158_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub balance: String,
}

/// Genesis block the cluster's ledger starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Genesis {
    pub config: GenesisConfig,
    pub nonce: String,
    pub difficulty: String,
    pub mixhash: String,
    pub parent_hash: String,
    pub gas_limit: String,
    #[serde(default)]
    pub alloc: BTreeMap<String, Wallet>,
}

impl Default for Genesis {
    fn default() -> Self {
        Self {
            config: GenesisConfig {
                chain_id: 1,
                homestead_block: 0,
                eip155_block: 0,
                eip158_block: 0,
            },
            nonce: "0x0000000000000000".to_string(),
            difficulty: "0x400".to_string(),
            mixhash: format!("0x{}", "0".repeat(64)),
            parent_hash: format!("0x{}", "0".repeat(64)),
            gas_limit: "0xf4240".to_string(),
            alloc: BTreeMap::new(),
        }
    }
}
