//! Clients for the site's control planes.
//!
//! The driver talks to three services:
//! - vSphere: placement lookups, library item deployment, power and guest state
//! - NSX: network segments, public IPs, NAT rules
//! - address allocation: private address leases on the control network
//!
//! Each is a capability trait so the driver can run against real endpoints or
//! the [`SimulatedSite`](crate::sim::SimulatedSite).

pub mod ipam;
pub mod nsx;
pub mod vsphere;

pub use ipam::{
    Address, AddressAllocationClient, AllocateAddressResponse, AllocationStatus,
    ReleaseAddressResponse,
};
pub use nsx::{NatAction, NatRule, NsxClient, PublicIp, Segment, SegmentSubnet};
pub use vsphere::{
    GuestIdentity, LibraryItemDeployRequest, LibraryItemDeployResult, NetworkMapping, OvfProperty,
    PowerAction, PowerState, ResourceSummary, VSphereClient,
};

use thiserror::Error;

/// A control-plane call that did not produce an HTTP-level answer.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Result type for client calls.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Status and (if any) decoded body of a control-plane response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub body: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(body: T) -> Self {
        Self {
            status: 200,
            body: Some(body),
        }
    }

    /// A response without a body.
    pub fn empty(status: u16) -> Self {
        Self { status, body: None }
    }

    pub fn not_found() -> Self {
        Self::empty(404)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body of a successful response.
    pub fn into_success(self) -> Option<T> {
        if self.is_success() { self.body } else { None }
    }
}
