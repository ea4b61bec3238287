//! Subnet planning for network segments.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::Rng;
use thiserror::Error;

use crate::clients::{Segment, SegmentSubnet};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubnetError {
    #[error("/{size} subnet does not fit in {prefix}")]
    DoesNotFit { prefix: Ipv4Net, size: u8 },

    #[error("/{0} subnet leaves no room for a DHCP range")]
    TooSmall(u8),
}

/// Pick a random `/size` subnet inside `prefix`.
pub fn random_subnet<R: Rng + ?Sized>(
    rng: &mut R,
    prefix: Ipv4Net,
    size: u8,
) -> Result<Ipv4Net, SubnetError> {
    if size > 30 {
        return Err(SubnetError::TooSmall(size));
    }
    if size < prefix.prefix_len() {
        return Err(SubnetError::DoesNotFit { prefix, size });
    }

    let free_bits = u32::from(size - prefix.prefix_len());
    let index: u64 = rng.gen_range(0..(1u64 << free_bits));
    // size <= 30, so the shift is in range and index fits the free bits.
    let offset = (index as u32) << (32 - u32::from(size));
    let network = Ipv4Addr::from(u32::from(prefix.network()) + offset);

    Ipv4Net::new(network, size).map_err(|_| SubnetError::DoesNotFit { prefix, size })
}

/// Addressing of one segment: gateway first, DHCP over the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
}

impl SegmentPlan {
    /// Gateway at network+1, DHCP from network+2 to broadcast-1.
    pub fn new(subnet: Ipv4Net) -> Result<Self, SubnetError> {
        let size = subnet.prefix_len();
        if size > 30 {
            return Err(SubnetError::TooSmall(size));
        }
        let subnet = subnet.trunc();
        let network = u32::from(subnet.network());
        let broadcast = u32::from(subnet.broadcast());

        Ok(Self {
            subnet,
            gateway: Ipv4Addr::from(network + 1),
            dhcp_start: Ipv4Addr::from(network + 2),
            dhcp_end: Ipv4Addr::from(broadcast - 1),
        })
    }

    /// Plan a random `/size` segment inside `prefix`.
    pub fn random<R: Rng + ?Sized>(
        rng: &mut R,
        prefix: Ipv4Net,
        size: u8,
    ) -> Result<Self, SubnetError> {
        Self::new(random_subnet(rng, prefix, size)?)
    }

    /// NSX segment intent named `name` with this addressing.
    pub fn to_segment(&self, name: &str) -> Segment {
        Segment {
            id: name.to_string(),
            display_name: name.to_string(),
            subnets: vec![SegmentSubnet {
                gateway_address: format!("{}/{}", self.gateway, self.subnet.prefix_len()),
                dhcp_ranges: vec![format!("{}-{}", self.dhcp_start, self.dhcp_end)],
            }],
        }
    }
}
