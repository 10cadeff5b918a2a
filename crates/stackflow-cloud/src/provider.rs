//! CloudStack API trait definition
//!
//! Every operation the reconciliation engine issues against the provider goes
//! through [`CloudStackApi`]. List operations return all matches so callers
//! can tell zero, one and many apart.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// CloudStack API abstraction trait
#[async_trait]
pub trait CloudStackApi: Send + Sync {
    /// Returns the provider name (e.g., "cloudstack")
    fn name(&self) -> &str;

    /// Check if the provider is reachable and the credentials are accepted
    async fn check_auth(&self) -> Result<AuthStatus>;

    // --- zones / domains / accounts ---

    async fn list_zones(&self, lookup: Lookup<'_>) -> Result<Vec<ZoneRecord>>;

    /// `lookup` is matched against the domain path (e.g. `ROOT/team`) or ID
    async fn list_domains(&self, lookup: Lookup<'_>) -> Result<Vec<DomainRecord>>;

    async fn list_accounts(&self, name: &str, domain_id: &str) -> Result<Vec<AccountRecord>>;

    // --- networks ---

    async fn list_networks(&self, lookup: Lookup<'_>, scope: &Scope)
    -> Result<Vec<NetworkRecord>>;

    async fn list_network_offerings(&self, name: &str) -> Result<Vec<NetworkOfferingRecord>>;

    async fn create_network(&self, request: &CreateNetworkRequest) -> Result<NetworkRecord>;

    async fn delete_network(&self, id: &str) -> Result<()>;

    // --- tags ---

    async fn list_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<BTreeMap<String, String>>;

    async fn create_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    async fn delete_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    // --- public IP addresses / firewall ---

    /// Lists allocated and free addresses alike
    async fn list_public_ip_addresses(
        &self,
        ip_address: Option<&str>,
        scope: &Scope,
    ) -> Result<Vec<PublicIpAddress>>;

    async fn associate_ip_address(
        &self,
        network_id: &str,
        ip_address: &str,
        scope: &Scope,
    ) -> Result<PublicIpAddress>;

    async fn disassociate_ip_address(&self, id: &str) -> Result<()>;

    async fn create_egress_firewall_rule(&self, network_id: &str, protocol: &str) -> Result<()>;

    // --- load balancer ---

    async fn list_load_balancer_rules(
        &self,
        public_ip_id: &str,
        scope: &Scope,
    ) -> Result<Vec<LoadBalancerRule>>;

    async fn create_load_balancer_rule(
        &self,
        request: &CreateLoadBalancerRuleRequest,
    ) -> Result<LoadBalancerRule>;

    async fn list_load_balancer_rule_instances(
        &self,
        rule_id: &str,
    ) -> Result<Vec<VirtualMachineRecord>>;

    async fn assign_to_load_balancer_rule(&self, rule_id: &str, vm_ids: &[String])
    -> Result<()>;

    // --- affinity groups ---

    async fn list_affinity_groups(&self, lookup: Lookup<'_>) -> Result<Vec<AffinityGroupRecord>>;

    async fn create_affinity_group(
        &self,
        name: &str,
        group_type: &str,
        scope: &Scope,
    ) -> Result<AffinityGroupRecord>;

    async fn delete_affinity_group(&self, lookup: Lookup<'_>) -> Result<()>;

    // --- virtual machines ---

    async fn list_virtual_machines(&self, id: &str) -> Result<Vec<VirtualMachineRecord>>;

    async fn stop_virtual_machine(&self, id: &str) -> Result<()>;

    async fn start_virtual_machine(&self, id: &str) -> Result<()>;

    /// Replaces the full affinity group list of a stopped instance
    async fn update_vm_affinity_groups(&self, vm_id: &str, group_ids: &[String]) -> Result<()>;
}

/// Lookup key for list operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Id(&'a str),
    Name(&'a str),
}

impl fmt::Display for Lookup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Id(id) => write!(f, "id={}", id),
            Lookup::Name(name) => write!(f, "name={}", name),
        }
    }
}

/// Account/domain scoping applied to list and create calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub account: Option<String>,
    pub domain_id: Option<String>,
}

impl Scope {
    pub fn new(account: Option<&str>, domain_id: Option<&str>) -> Self {
        let non_empty = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            account: non_empty(account),
            domain_id: non_empty(domain_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.account.is_none() && self.domain_id.is_none()
    }
}

/// Resource types that accept tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Network,
    PublicIpAddress,
    UserVm,
    LoadBalancer,
}

impl ResourceType {
    /// Name used by the CloudStack tag API
    pub fn as_api_str(&self) -> &'static str {
        match self {
            ResourceType::Network => "Network",
            ResourceType::PublicIpAddress => "PublicIpAddress",
            ResourceType::UserVm => "UserVm",
            ResourceType::LoadBalancer => "LoadBalancer",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_api_str())
    }
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Endpoint or account information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}

// Records below mirror the JSON returned by the CloudStack API.

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub domainid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: String,
    pub name: String,
    /// "Isolated" or "Shared"
    #[serde(rename = "type", default)]
    pub network_type: String,
    #[serde(default)]
    pub zoneid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOfferingRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIpAddress {
    pub id: String,
    pub ipaddress: String,
    /// Allocation timestamp. Empty while the address is free.
    #[serde(default)]
    pub allocated: String,
    #[serde(default)]
    pub associatednetworkid: String,
    #[serde(default)]
    pub zoneid: String,
}

impl PublicIpAddress {
    pub fn is_allocated(&self) -> bool {
        !self.allocated.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub algorithm: String,
    #[serde(default)]
    pub publicport: String,
    #[serde(default)]
    pub privateport: String,
    #[serde(default)]
    pub publicipid: String,
    #[serde(default)]
    pub networkid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityGroupRecord {
    pub id: String,
    pub name: String,
    /// "host affinity" or "host anti-affinity"
    #[serde(rename = "type", default)]
    pub group_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub affinitygroup: Vec<AffinityGroupRecord>,
}

/// Parameters for `createNetwork`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub display_text: String,
    pub offering_id: String,
    pub zone_id: String,
    pub scope: Scope,
}

/// Parameters for `createLoadBalancerRule`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLoadBalancerRuleRequest {
    pub name: String,
    pub algorithm: String,
    pub private_port: u16,
    pub public_port: u16,
    pub public_ip_id: String,
    pub network_id: String,
    pub protocol: String,
    pub scope: Scope,
}
