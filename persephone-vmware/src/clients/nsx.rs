//! NSX policy API surface used by the driver.

use async_trait::async_trait;
use persephone_orchestration::ResourceUri;
use serde::{Deserialize, Serialize};

use super::{ApiResponse, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSubnet {
    /// Gateway in CIDR notation, e.g. `10.255.3.17/28`.
    pub gateway_address: String,
    /// `first-last` address ranges served by DHCP.
    pub dhcp_ranges: Vec<String>,
}

/// Logical network segment intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub display_name: String,
    pub subnets: Vec<SegmentSubnet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIp {
    pub id: String,
    pub display_name: String,
    /// Assigned address; absent until NSX hands one out.
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NatAction {
    Snat,
    Dnat,
    /// Stateless 1:1 translation in both directions.
    Reflexive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    pub id: String,
    pub display_name: String,
    pub action: NatAction,
    pub source_network: String,
    pub translated_network: String,
    /// Policy path assigned by NSX, e.g. `/infra/tier-1s/cgw/nat/USER/nat-rules/<id>`.
    pub path: Option<String>,
}

/// NSX client.
#[async_trait]
pub trait NsxClient: Send + Sync {
    async fn get_segment(&self, tier1: &str, name: &str) -> Result<ApiResponse<Segment>>;

    /// PATCH a segment intent. Realization in vSphere happens asynchronously.
    async fn create_or_update_segment(
        &self,
        tier1: &str,
        segment: &Segment,
    ) -> Result<ApiResponse<Segment>>;

    async fn create_public_ip(&self, name: &str) -> Result<ApiResponse<PublicIp>>;

    async fn get_public_ip(&self, id: &str) -> Result<ApiResponse<PublicIp>>;

    async fn create_nat_rule(
        &self,
        tier1: &str,
        section: &str,
        rule: &NatRule,
    ) -> Result<ApiResponse<NatRule>>;

    /// DELETE whatever NSX resource `resource` names.
    async fn delete_resource(&self, resource: &ResourceUri) -> Result<ApiResponse<()>>;
}
