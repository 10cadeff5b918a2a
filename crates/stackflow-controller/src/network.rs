//! Network provisioner
//!
//! Resolves or creates the network of each zone, tracks ownership of
//! shared networks through tags, and sets up the control-plane entry point
//! on isolated networks: public address, egress firewall rule and load
//! balancer rule.
//!
//! Ownership protocol:
//!
//! ```text
//! stackflow_cluster_<uid> = "1"   one per cluster using the network
//! created_by_stackflow    = "1"   only when this engine created it
//! ```
//!
//! On teardown a cluster removes its own tag; the network is deleted once no
//! cluster tag is left and the created-by tag is present.

use crate::domain::scope_of;
use crate::error::{ReconcileError, Result};
use crate::tags::{CLUSTER_TAG_PREFIX, CREATED_BY_TAG, TAG_VALUE, TagAccessor, cluster_tag_name};
use stackflow_cloud::{
    CloudStackApi, CreateLoadBalancerRuleRequest, CreateNetworkRequest, Lookup, PublicIpAddress,
    ResourceType,
};
use stackflow_core::{ClusterTopology, DEFAULT_API_PORT, Network, NetworkType};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_NETWORK_OFFERING: &str = "DefaultIsolatedNetworkOfferingWithSourceNatService";

const NETWORK_PROTOCOL_TCP: &str = "tcp";
const LB_ALGORITHM: &str = "roundrobin";
const LB_RULE_NAME: &str = "Kubernetes_API_Server";

/// Zone whose network carries the control plane (the first declared zone)
pub fn primary_zone_id(topology: &ClusterTopology) -> Option<String> {
    let first = topology.spec.zones.first()?;
    topology
        .status
        .zones
        .values()
        .find(|z| (!first.id.is_empty() && z.id == first.id) || (first.id.is_empty() && z.name == first.name))
        .map(|z| z.id.clone())
}

fn require<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ReconcileError::Transient(format!("{} not resolved yet", what)))
}

pub struct NetworkProvisioner {
    api: Arc<dyn CloudStackApi>,
    tags: TagAccessor,
    offering: String,
}

impl NetworkProvisioner {
    pub fn new(api: Arc<dyn CloudStackApi>, offering: impl Into<String>) -> Self {
        Self {
            tags: TagAccessor::new(api.clone()),
            api,
            offering: offering.into(),
        }
    }

    fn zone_network(topology: &ClusterTopology, zone_id: &str) -> Result<Network> {
        topology
            .status
            .zones
            .get(zone_id)
            .map(|z| z.network.clone())
            .ok_or_else(|| ReconcileError::Transient(format!("zone {} not discovered yet", zone_id)))
    }

    fn record_network(topology: &mut ClusterTopology, zone_id: &str, network: Network) {
        if primary_zone_id(topology).as_deref() == Some(zone_id) {
            topology.status.network_id = Some(network.id.clone());
            topology.status.network_type = network.network_type;
        }
        if let Some(zone) = topology.status.zones.get_mut(zone_id) {
            zone.network = network;
        }
    }

    /// Look the zone's network up by name, or by ID when no name is declared
    ///
    /// Exactly one match is recorded in status. Zero matches is `NotFound`,
    /// more than one is `AmbiguousMatch`.
    pub async fn resolve_network(&self, topology: &mut ClusterTopology, zone_id: &str) -> Result<()> {
        let declared = Self::zone_network(topology, zone_id)?;
        let (lookup, key) = if declared.name.is_empty() {
            (Lookup::Id(&declared.id), declared.id.as_str())
        } else {
            (Lookup::Name(&declared.name), declared.name.as_str())
        };

        let matches = self
            .api
            .list_networks(lookup, &scope_of(topology))
            .await
            .map_err(ReconcileError::cloud("listNetworks"))?;
        let record = ReconcileError::expect_one("network", key, matches)?;

        let network = Network {
            id: record.id,
            name: record.name,
            network_type: record.network_type.parse::<NetworkType>().ok(),
        };
        Self::record_network(topology, zone_id, network);
        Ok(())
    }

    /// Resolve the zone's network, creating it from the default offering when absent
    ///
    /// Returns true when the network was created by this call.
    pub async fn get_or_create_network(
        &self,
        topology: &mut ClusterTopology,
        zone_id: &str,
    ) -> Result<bool> {
        let created = match self.resolve_network(topology, zone_id).await {
            Ok(()) => false,
            Err(ReconcileError::NotFound { .. }) => {
                let declared = Self::zone_network(topology, zone_id)?;
                if declared.name.is_empty() {
                    return Err(ReconcileError::Fatal(format!(
                        "network {} not found and cannot be created without a name",
                        declared.id
                    )));
                }
                self.create_network(topology, zone_id, &declared.name).await?;
                true
            }
            Err(err) => return Err(err),
        };

        let network_id = Self::zone_network(topology, zone_id)?.id;
        self.add_cluster_tags(&topology.metadata.uid, &network_id, created)
            .await?;
        Ok(created)
    }

    async fn create_network(
        &self,
        topology: &mut ClusterTopology,
        zone_id: &str,
        name: &str,
    ) -> Result<()> {
        let offerings = self
            .api
            .list_network_offerings(&self.offering)
            .await
            .map_err(ReconcileError::cloud("listNetworkOfferings"))?;
        if offerings.len() != 1 {
            return Err(ReconcileError::Fatal(format!(
                "expected 1 network offering named {}, but got {}",
                self.offering,
                offerings.len()
            )));
        }

        let request = CreateNetworkRequest {
            name: name.to_string(),
            display_text: name.to_string(),
            offering_id: offerings[0].id.clone(),
            zone_id: zone_id.to_string(),
            scope: scope_of(topology),
        };
        let record = self
            .api
            .create_network(&request)
            .await
            .map_err(ReconcileError::cloud("createNetwork"))?;

        tracing::info!("Created network {} ({}) in zone {}", record.name, record.id, zone_id);
        let network = Network {
            id: record.id,
            name: record.name,
            network_type: record.network_type.parse::<NetworkType>().ok(),
        };
        Self::record_network(topology, zone_id, network);
        Ok(())
    }

    async fn add_cluster_tags(&self, uid: &str, network_id: &str, created: bool) -> Result<()> {
        let mut wanted = BTreeMap::from([(cluster_tag_name(uid), TAG_VALUE.to_string())]);
        if created {
            wanted.insert(CREATED_BY_TAG.to_string(), TAG_VALUE.to_string());
        }
        self.tags
            .add_tags(ResourceType::Network, network_id, &wanted)
            .await?;
        Ok(())
    }

    /// Drop this cluster's ownership of a network
    ///
    /// Returns true when the network was deleted.
    pub async fn release_network(&self, uid: &str, network_id: &str) -> Result<bool> {
        let own_tag = cluster_tag_name(uid);
        self.tags
            .delete_tags(ResourceType::Network, network_id, &[own_tag.as_str()])
            .await?;

        let remaining = self.tags.get_tags(ResourceType::Network, network_id).await?;
        let owners = remaining
            .keys()
            .filter(|k| k.starts_with(CLUSTER_TAG_PREFIX))
            .count();
        let created_here = remaining.get(CREATED_BY_TAG).is_some_and(|v| !v.is_empty());

        if owners > 0 || !created_here {
            tracing::debug!(
                "Keeping network {} ({} owner(s), created here: {})",
                network_id,
                owners,
                created_here
            );
            return Ok(false);
        }

        match self.api.delete_network(network_id).await {
            Ok(()) => {
                tracing::info!("Deleted network {}", network_id);
                Ok(true)
            }
            Err(err) if err.is_not_found() => Ok(true),
            Err(err) => Err(ReconcileError::cloud("deleteNetwork")(err)),
        }
    }

    /// Pick the public address for the control-plane endpoint
    ///
    /// A known endpoint host is matched exactly whatever its allocation
    /// state. Otherwise the first unallocated address is taken.
    pub async fn resolve_public_ip_details(&self, topology: &ClusterTopology) -> Result<PublicIpAddress> {
        let host = topology.effective_endpoint_host();
        let candidates = self
            .api
            .list_public_ip_addresses(Some(host).filter(|h| !h.is_empty()), &scope_of(topology))
            .await
            .map_err(ReconcileError::cloud("listPublicIpAddresses"))?;

        if !host.is_empty() {
            if let Some(address) = candidates.into_iter().find(|a| a.ipaddress == host) {
                return Ok(address);
            }
        } else if !candidates.is_empty() {
            return candidates
                .into_iter()
                .find(|a| !a.is_allocated())
                .ok_or(ReconcileError::AllAllocated);
        }

        let network = primary_zone_id(topology)
            .and_then(|id| topology.status.zones.get(&id).map(|z| z.network.name.clone()))
            .unwrap_or_default();
        Err(ReconcileError::NoAddressesFound { network })
    }

    /// Resolve the public address and allocate it to the cluster network
    pub async fn associate_public_ip_address(&self, topology: &mut ClusterTopology) -> Result<()> {
        let network_id = require(topology.status.network_id.as_deref(), "network")?.to_string();
        let address = self.resolve_public_ip_details(topology).await?;

        topology.status.public_ip_id = Some(address.id.clone());
        if !topology.spec.control_plane_endpoint.is_host_set()
            && topology.status.control_plane_host.is_none()
        {
            topology.status.control_plane_host = Some(address.ipaddress.clone());
        }

        if address.is_allocated() && address.associatednetworkid == network_id {
            return Ok(());
        }

        self.api
            .associate_ip_address(&network_id, &address.ipaddress, &scope_of(topology))
            .await
            .map_err(ReconcileError::cloud("associateIpAddress"))?;
        topology.status.public_ip_associated = true;
        tracing::info!(
            "Associated public address {} with network {}",
            address.ipaddress,
            network_id
        );
        Ok(())
    }

    /// Release the public address, only when this engine allocated it
    pub async fn disassociate_public_ip_address(&self, topology: &mut ClusterTopology) -> Result<()> {
        if let Some(id) = topology.status.public_ip_id.clone()
            && topology.status.public_ip_associated
        {
            match self.api.disassociate_ip_address(&id).await {
                Ok(()) => tracing::info!("Released public address {}", id),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(ReconcileError::cloud("disassociateIpAddress")(err)),
            }
        }

        // the provider drops the address's rules along with it
        topology.status.public_ip_id = None;
        topology.status.public_ip_associated = false;
        topology.status.lb_rule_id = None;
        Ok(())
    }

    /// Open egress TCP on the cluster network; an existing rule counts as success
    pub async fn open_firewall_rules(&self, topology: &ClusterTopology) -> Result<()> {
        let network_id = require(topology.status.network_id.as_deref(), "network")?;
        match self
            .api
            .create_egress_firewall_rule(network_id, NETWORK_PROTOCOL_TCP)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(ReconcileError::cloud("createEgressFirewallRule")(err)),
        }
    }

    /// Find the rule on the public address listening on the endpoint port
    pub async fn resolve_load_balancer_rule_details(&self, topology: &mut ClusterTopology) -> Result<()> {
        let public_ip_id =
            require(topology.status.public_ip_id.as_deref(), "public address")?.to_string();
        let port = topology.spec.control_plane_endpoint.effective_port().to_string();

        let rules = self
            .api
            .list_load_balancer_rules(&public_ip_id, &scope_of(topology))
            .await
            .map_err(ReconcileError::cloud("listLoadBalancerRules"))?;

        match rules.into_iter().find(|r| r.publicport == port) {
            Some(rule) => {
                topology.status.lb_rule_id = Some(rule.id);
                Ok(())
            }
            None => Err(ReconcileError::not_found(
                "load balancer rule",
                format!("{}:{}", public_ip_id, port),
            )),
        }
    }

    pub async fn get_or_create_load_balancer_rule(&self, topology: &mut ClusterTopology) -> Result<()> {
        match self.resolve_load_balancer_rule_details(topology).await {
            Err(ReconcileError::NotFound { .. }) => {}
            other => return other,
        }

        let request = CreateLoadBalancerRuleRequest {
            name: LB_RULE_NAME.to_string(),
            algorithm: LB_ALGORITHM.to_string(),
            private_port: DEFAULT_API_PORT,
            public_port: topology.spec.control_plane_endpoint.effective_port(),
            public_ip_id: require(topology.status.public_ip_id.as_deref(), "public address")?
                .to_string(),
            network_id: require(topology.status.network_id.as_deref(), "network")?.to_string(),
            protocol: NETWORK_PROTOCOL_TCP.to_string(),
            scope: scope_of(topology),
        };

        let rule = self
            .api
            .create_load_balancer_rule(&request)
            .await
            .map_err(ReconcileError::cloud("createLoadBalancerRule"))?;
        tracing::info!(
            "Created load balancer rule {} on port {}",
            rule.id,
            request.public_port
        );
        topology.status.lb_rule_id = Some(rule.id);
        Ok(())
    }

    /// Register an instance under the cluster's rule
    ///
    /// Returns false when it was already registered.
    pub async fn assign_vm_to_load_balancer_rule(
        &self,
        topology: &ClusterTopology,
        instance_id: &str,
    ) -> Result<bool> {
        let rule_id = require(topology.status.lb_rule_id.as_deref(), "load balancer rule")?;

        let members = self
            .api
            .list_load_balancer_rule_instances(rule_id)
            .await
            .map_err(ReconcileError::cloud("listLoadBalancerRuleInstances"))?;
        if members.iter().any(|vm| vm.id == instance_id) {
            return Ok(false);
        }

        self.api
            .assign_to_load_balancer_rule(rule_id, &[instance_id.to_string()])
            .await
            .map_err(ReconcileError::cloud("assignToLoadBalancerRule"))?;
        tracing::info!("Assigned {} to load balancer rule {}", instance_id, rule_id);
        Ok(true)
    }
}
