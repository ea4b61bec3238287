//! Address allocation service surface.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStatus {
    Ok,
    /// The parent block or the address does not exist.
    NotFound,
    /// The parent block has no free address left.
    Exhausted,
}

/// A leased address and its resource name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// `<parent>/addresses/<hex>`; releasing takes this name.
    pub name: String,
    pub value: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocateAddressResponse {
    pub status: AllocationStatus,
    pub address: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAddressResponse {
    pub status: AllocationStatus,
}

#[async_trait]
pub trait AddressAllocationClient: Send + Sync {
    /// Lease a free address from the block named `parent`.
    async fn allocate_address(&self, parent: &str) -> Result<AllocateAddressResponse>;

    /// Return the address named `name` to its block.
    async fn release_address(&self, name: &str) -> Result<ReleaseAddressResponse>;
}
