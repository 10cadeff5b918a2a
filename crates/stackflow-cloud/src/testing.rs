//! In-memory CloudStack for tests
//!
//! [`FakeCloudStack`] keeps zones, networks, addresses, rules, affinity
//! groups and instances in memory. Every call is recorded under its
//! CloudStack API command name, and failures can be queued per command.

use crate::error::{CloudError, Result};
use crate::provider::*;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

const DUPLICATE_FIREWALL_RULE: &str =
    "There is already a firewall rule specified for the network and protocol";

#[derive(Default)]
struct Inner {
    zones: Vec<ZoneRecord>,
    domains: Vec<DomainRecord>,
    accounts: Vec<AccountRecord>,
    networks: Vec<NetworkRecord>,
    offerings: Vec<NetworkOfferingRecord>,
    tags: HashMap<(ResourceType, String), BTreeMap<String, String>>,
    addresses: Vec<PublicIpAddress>,
    firewall_rules: Vec<(String, String)>,
    lb_rules: Vec<LoadBalancerRule>,
    lb_members: HashMap<String, Vec<String>>,
    affinity_groups: Vec<AffinityGroupRecord>,
    vms: Vec<VirtualMachineRecord>,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<String>>,
    next_id: u32,
}

impl Inner {
    fn record(&mut self, call: String) {
        self.calls.push(call);
    }

    /// Pop a queued failure for `command`, if any
    fn check(&mut self, command: &str) -> Result<()> {
        if let Some(queue) = self.failures.get_mut(command)
            && let Some(message) = queue.pop_front()
        {
            return Err(CloudError::ApiError(message));
        }
        Ok(())
    }

    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// In-memory [`CloudStackApi`] implementation
#[derive(Default)]
pub struct FakeCloudStack {
    inner: Mutex<Inner>,
}

impl FakeCloudStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- seeding ---

    pub fn add_zone(&self, id: &str, name: &str) {
        self.lock().zones.push(ZoneRecord {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn add_domain(&self, id: &str, path: &str) {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        self.lock().domains.push(DomainRecord {
            id: id.to_string(),
            name,
            path: path.to_string(),
        });
    }

    pub fn add_account(&self, id: &str, name: &str, domain_id: &str) {
        self.lock().accounts.push(AccountRecord {
            id: id.to_string(),
            name: name.to_string(),
            domainid: domain_id.to_string(),
        });
    }

    pub fn add_network(&self, id: &str, name: &str, network_type: &str) {
        self.lock().networks.push(NetworkRecord {
            id: id.to_string(),
            name: name.to_string(),
            network_type: network_type.to_string(),
            zoneid: String::new(),
        });
    }

    pub fn add_offering(&self, id: &str, name: &str) {
        self.lock().offerings.push(NetworkOfferingRecord {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    /// `allocated_to`: network the address is already associated with
    pub fn add_public_ip(&self, id: &str, ip: &str, allocated_to: Option<&str>) {
        self.lock().addresses.push(PublicIpAddress {
            id: id.to_string(),
            ipaddress: ip.to_string(),
            allocated: allocated_to
                .map(|_| "2024-01-01T00:00:00+0000".to_string())
                .unwrap_or_default(),
            associatednetworkid: allocated_to.unwrap_or_default().to_string(),
            zoneid: String::new(),
        });
    }

    pub fn add_load_balancer_rule(&self, id: &str, public_ip_id: &str, public_port: u16) {
        self.lock().lb_rules.push(LoadBalancerRule {
            id: id.to_string(),
            publicport: public_port.to_string(),
            publicipid: public_ip_id.to_string(),
            ..Default::default()
        });
    }

    pub fn add_affinity_group(&self, id: &str, name: &str, group_type: &str) {
        self.lock().affinity_groups.push(AffinityGroupRecord {
            id: id.to_string(),
            name: name.to_string(),
            group_type: group_type.to_string(),
        });
    }

    /// Add a running instance attached to the given affinity group IDs
    pub fn add_vm(&self, id: &str, group_ids: &[&str]) {
        let mut inner = self.lock();
        let groups = group_ids
            .iter()
            .map(|gid| {
                inner
                    .affinity_groups
                    .iter()
                    .find(|g| g.id == *gid)
                    .cloned()
                    .unwrap_or_else(|| AffinityGroupRecord {
                        id: gid.to_string(),
                        ..Default::default()
                    })
            })
            .collect();
        inner.vms.push(VirtualMachineRecord {
            id: id.to_string(),
            name: id.to_string(),
            state: "Running".to_string(),
            affinitygroup: groups,
        });
    }

    pub fn set_tags(&self, resource_type: ResourceType, id: &str, tags: &[(&str, &str)]) {
        let mut inner = self.lock();
        let entry = inner.tags.entry((resource_type, id.to_string())).or_default();
        for (k, v) in tags {
            entry.insert(k.to_string(), v.to_string());
        }
    }

    /// Queue a failure for the next call of `command` (e.g. "startVirtualMachine")
    pub fn fail_next(&self, command: &str, message: &str) {
        self.lock()
            .failures
            .entry(command.to_string())
            .or_default()
            .push_back(message.to_string());
    }

    // --- inspection ---

    /// All recorded calls, as "command args"
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls of `command`
    pub fn count(&self, command: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(command))
            .count()
    }

    /// Mutating calls only (list* commands excluded)
    pub fn mutations(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| !c.starts_with("list"))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn tags(&self, resource_type: ResourceType, id: &str) -> BTreeMap<String, String> {
        self.lock()
            .tags
            .get(&(resource_type, id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn network_exists(&self, id: &str) -> bool {
        self.lock().networks.iter().any(|n| n.id == id)
    }

    pub fn affinity_group_exists(&self, id: &str) -> bool {
        self.lock().affinity_groups.iter().any(|g| g.id == id)
    }

    pub fn public_ip(&self, id: &str) -> Option<PublicIpAddress> {
        self.lock().addresses.iter().find(|a| a.id == id).cloned()
    }

    pub fn vm(&self, id: &str) -> Option<VirtualMachineRecord> {
        self.lock().vms.iter().find(|v| v.id == id).cloned()
    }

    pub fn lb_members(&self, rule_id: &str) -> Vec<String> {
        self.lock()
            .lb_members
            .get(rule_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn lookup_matches(lookup: Lookup<'_>, id: &str, name: &str) -> bool {
    match lookup {
        Lookup::Id(v) => v == id,
        Lookup::Name(v) => v == name,
    }
}

#[async_trait]
impl CloudStackApi for FakeCloudStack {
    fn name(&self) -> &str {
        "fake"
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        match self.lock().check("listZones") {
            Ok(()) => Ok(AuthStatus::ok("fake")),
            Err(e) => Ok(AuthStatus::failed(e.to_string())),
        }
    }

    async fn list_zones(&self, lookup: Lookup<'_>) -> Result<Vec<ZoneRecord>> {
        let mut inner = self.lock();
        inner.record(format!("listZones {}", lookup));
        inner.check("listZones")?;
        Ok(inner
            .zones
            .iter()
            .filter(|z| lookup_matches(lookup, &z.id, &z.name))
            .cloned()
            .collect())
    }

    async fn list_domains(&self, lookup: Lookup<'_>) -> Result<Vec<DomainRecord>> {
        let mut inner = self.lock();
        inner.record(format!("listDomains {}", lookup));
        inner.check("listDomains")?;
        Ok(inner
            .domains
            .iter()
            .filter(|d| lookup_matches(lookup, &d.id, &d.path) || lookup_matches(lookup, &d.id, &d.name))
            .cloned()
            .collect())
    }

    async fn list_accounts(&self, name: &str, domain_id: &str) -> Result<Vec<AccountRecord>> {
        let mut inner = self.lock();
        inner.record(format!("listAccounts name={} domainid={}", name, domain_id));
        inner.check("listAccounts")?;
        Ok(inner
            .accounts
            .iter()
            .filter(|a| a.name == name && a.domainid == domain_id)
            .cloned()
            .collect())
    }

    async fn list_networks(
        &self,
        lookup: Lookup<'_>,
        _scope: &Scope,
    ) -> Result<Vec<NetworkRecord>> {
        let mut inner = self.lock();
        inner.record(format!("listNetworks {}", lookup));
        inner.check("listNetworks")?;
        Ok(inner
            .networks
            .iter()
            .filter(|n| lookup_matches(lookup, &n.id, &n.name))
            .cloned()
            .collect())
    }

    async fn list_network_offerings(&self, name: &str) -> Result<Vec<NetworkOfferingRecord>> {
        let mut inner = self.lock();
        inner.record(format!("listNetworkOfferings name={}", name));
        inner.check("listNetworkOfferings")?;
        Ok(inner
            .offerings
            .iter()
            .filter(|o| o.name == name)
            .cloned()
            .collect())
    }

    async fn create_network(&self, request: &CreateNetworkRequest) -> Result<NetworkRecord> {
        let mut inner = self.lock();
        inner.record(format!(
            "createNetwork name={} zoneid={}",
            request.name, request.zone_id
        ));
        inner.check("createNetwork")?;
        let network = NetworkRecord {
            id: inner.id("net"),
            name: request.name.clone(),
            network_type: "Isolated".to_string(),
            zoneid: request.zone_id.clone(),
        };
        inner.networks.push(network.clone());
        Ok(network)
    }

    async fn delete_network(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record(format!("deleteNetwork id={}", id));
        inner.check("deleteNetwork")?;
        let before = inner.networks.len();
        inner.networks.retain(|n| n.id != id);
        if inner.networks.len() == before {
            return Err(CloudError::ApiError(format!(
                "Unable to find network by id {}",
                id
            )));
        }
        Ok(())
    }

    async fn list_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<BTreeMap<String, String>> {
        let mut inner = self.lock();
        inner.record(format!("listTags {} {}", resource_type, resource_id));
        inner.check("listTags")?;
        Ok(inner
            .tags
            .get(&(resource_type, resource_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let keys: Vec<&str> = tags.keys().map(String::as_str).collect();
        inner.record(format!(
            "createTags {} {} {}",
            resource_type,
            resource_id,
            keys.join(",")
        ));
        inner.check("createTags")?;
        let entry = inner
            .tags
            .entry((resource_type, resource_id.to_string()))
            .or_default();
        for (k, v) in tags {
            entry.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn delete_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let keys: Vec<&str> = tags.keys().map(String::as_str).collect();
        inner.record(format!(
            "deleteTags {} {} {}",
            resource_type,
            resource_id,
            keys.join(",")
        ));
        inner.check("deleteTags")?;
        if let Some(entry) = inner.tags.get_mut(&(resource_type, resource_id.to_string())) {
            for k in tags.keys() {
                entry.remove(k);
            }
        }
        Ok(())
    }

    async fn list_public_ip_addresses(
        &self,
        ip_address: Option<&str>,
        _scope: &Scope,
    ) -> Result<Vec<PublicIpAddress>> {
        let mut inner = self.lock();
        inner.record(format!(
            "listPublicIpAddresses ipaddress={}",
            ip_address.unwrap_or("")
        ));
        inner.check("listPublicIpAddresses")?;
        Ok(inner
            .addresses
            .iter()
            .filter(|a| ip_address.is_none_or(|ip| a.ipaddress == ip))
            .cloned()
            .collect())
    }

    async fn associate_ip_address(
        &self,
        network_id: &str,
        ip_address: &str,
        _scope: &Scope,
    ) -> Result<PublicIpAddress> {
        let mut inner = self.lock();
        inner.record(format!(
            "associateIpAddress networkid={} ipaddress={}",
            network_id, ip_address
        ));
        inner.check("associateIpAddress")?;
        let address = inner
            .addresses
            .iter_mut()
            .find(|a| a.ipaddress == ip_address)
            .ok_or_else(|| {
                CloudError::ApiError(format!("Unable to find ip address {}", ip_address))
            })?;
        address.allocated = "2024-01-01T00:00:00+0000".to_string();
        address.associatednetworkid = network_id.to_string();
        Ok(address.clone())
    }

    async fn disassociate_ip_address(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record(format!("disassociateIpAddress id={}", id));
        inner.check("disassociateIpAddress")?;
        let address = inner
            .addresses
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| CloudError::ApiError(format!("Unable to find ip address {}", id)))?;
        address.allocated.clear();
        address.associatednetworkid.clear();
        Ok(())
    }

    async fn create_egress_firewall_rule(&self, network_id: &str, protocol: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record(format!(
            "createEgressFirewallRule networkid={} protocol={}",
            network_id, protocol
        ));
        inner.check("createEgressFirewallRule")?;
        let rule = (network_id.to_string(), protocol.to_string());
        if inner.firewall_rules.contains(&rule) {
            return Err(CloudError::ApiError(DUPLICATE_FIREWALL_RULE.to_string()));
        }
        inner.firewall_rules.push(rule);
        Ok(())
    }

    async fn list_load_balancer_rules(
        &self,
        public_ip_id: &str,
        _scope: &Scope,
    ) -> Result<Vec<LoadBalancerRule>> {
        let mut inner = self.lock();
        inner.record(format!("listLoadBalancerRules publicipid={}", public_ip_id));
        inner.check("listLoadBalancerRules")?;
        Ok(inner
            .lb_rules
            .iter()
            .filter(|r| r.publicipid == public_ip_id)
            .cloned()
            .collect())
    }

    async fn create_load_balancer_rule(
        &self,
        request: &CreateLoadBalancerRuleRequest,
    ) -> Result<LoadBalancerRule> {
        let mut inner = self.lock();
        inner.record(format!(
            "createLoadBalancerRule publicipid={} publicport={} privateport={}",
            request.public_ip_id, request.public_port, request.private_port
        ));
        inner.check("createLoadBalancerRule")?;
        let rule = LoadBalancerRule {
            id: inner.id("lb"),
            name: request.name.clone(),
            algorithm: request.algorithm.clone(),
            publicport: request.public_port.to_string(),
            privateport: request.private_port.to_string(),
            publicipid: request.public_ip_id.clone(),
            networkid: request.network_id.clone(),
        };
        inner.lb_rules.push(rule.clone());
        Ok(rule)
    }

    async fn list_load_balancer_rule_instances(
        &self,
        rule_id: &str,
    ) -> Result<Vec<VirtualMachineRecord>> {
        let mut inner = self.lock();
        inner.record(format!("listLoadBalancerRuleInstances id={}", rule_id));
        inner.check("listLoadBalancerRuleInstances")?;
        let members = inner.lb_members.get(rule_id).cloned().unwrap_or_default();
        Ok(members
            .into_iter()
            .map(|id| VirtualMachineRecord {
                id,
                ..Default::default()
            })
            .collect())
    }

    async fn assign_to_load_balancer_rule(
        &self,
        rule_id: &str,
        vm_ids: &[String],
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.record(format!(
            "assignToLoadBalancerRule id={} virtualmachineids={}",
            rule_id,
            vm_ids.join(",")
        ));
        inner.check("assignToLoadBalancerRule")?;
        inner
            .lb_members
            .entry(rule_id.to_string())
            .or_default()
            .extend(vm_ids.iter().cloned());
        Ok(())
    }

    async fn list_affinity_groups(&self, lookup: Lookup<'_>) -> Result<Vec<AffinityGroupRecord>> {
        let mut inner = self.lock();
        inner.record(format!("listAffinityGroups {}", lookup));
        inner.check("listAffinityGroups")?;
        Ok(inner
            .affinity_groups
            .iter()
            .filter(|g| lookup_matches(lookup, &g.id, &g.name))
            .cloned()
            .collect())
    }

    async fn create_affinity_group(
        &self,
        name: &str,
        group_type: &str,
        _scope: &Scope,
    ) -> Result<AffinityGroupRecord> {
        let mut inner = self.lock();
        inner.record(format!(
            "createAffinityGroup name={} type={}",
            name, group_type
        ));
        inner.check("createAffinityGroup")?;
        let group = AffinityGroupRecord {
            id: inner.id("ag"),
            name: name.to_string(),
            group_type: group_type.to_string(),
        };
        inner.affinity_groups.push(group.clone());
        Ok(group)
    }

    async fn delete_affinity_group(&self, lookup: Lookup<'_>) -> Result<()> {
        let mut inner = self.lock();
        inner.record(format!("deleteAffinityGroup {}", lookup));
        inner.check("deleteAffinityGroup")?;
        let before = inner.affinity_groups.len();
        inner
            .affinity_groups
            .retain(|g| !lookup_matches(lookup, &g.id, &g.name));
        if inner.affinity_groups.len() == before {
            return Err(CloudError::ApiError(format!(
                "Unable to find affinity group {}",
                lookup
            )));
        }
        Ok(())
    }

    async fn list_virtual_machines(&self, id: &str) -> Result<Vec<VirtualMachineRecord>> {
        let mut inner = self.lock();
        inner.record(format!("listVirtualMachines id={}", id));
        inner.check("listVirtualMachines")?;
        Ok(inner.vms.iter().filter(|v| v.id == id).cloned().collect())
    }

    async fn stop_virtual_machine(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record(format!("stopVirtualMachine id={}", id));
        inner.check("stopVirtualMachine")?;
        let vm = inner
            .vms
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| CloudError::ApiError(format!("Unable to find vm {}", id)))?;
        vm.state = "Stopped".to_string();
        Ok(())
    }

    async fn start_virtual_machine(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record(format!("startVirtualMachine id={}", id));
        inner.check("startVirtualMachine")?;
        let vm = inner
            .vms
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| CloudError::ApiError(format!("Unable to find vm {}", id)))?;
        vm.state = "Running".to_string();
        Ok(())
    }

    async fn update_vm_affinity_groups(&self, vm_id: &str, group_ids: &[String]) -> Result<()> {
        let mut inner = self.lock();
        inner.record(format!(
            "updateVMAffinityGroup id={} affinitygroupids={}",
            vm_id,
            group_ids.join(",")
        ));
        inner.check("updateVMAffinityGroup")?;
        let groups: Vec<AffinityGroupRecord> = group_ids
            .iter()
            .map(|gid| {
                inner
                    .affinity_groups
                    .iter()
                    .find(|g| &g.id == gid)
                    .cloned()
                    .unwrap_or_else(|| AffinityGroupRecord {
                        id: gid.clone(),
                        ..Default::default()
                    })
            })
            .collect();
        let vm = inner
            .vms
            .iter_mut()
            .find(|v| v.id == vm_id)
            .ok_or_else(|| CloudError::ApiError(format!("Unable to find vm {}", vm_id)))?;
        if vm.state != "Stopped" {
            return Err(CloudError::ApiError(format!(
                "vm {} must be stopped to update affinity groups",
                vm_id
            )));
        }
        vm.affinitygroup = groups;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_failure_is_consumed_once() {
        let fake = FakeCloudStack::new();
        fake.add_zone("z-1", "zone-a");
        fake.fail_next("listZones", "connection refused");

        assert!(fake.list_zones(Lookup::Name("zone-a")).await.is_err());
        assert_eq!(fake.list_zones(Lookup::Name("zone-a")).await.unwrap().len(), 1);
        assert_eq!(fake.count("listZones"), 2);
    }

    #[tokio::test]
    async fn test_duplicate_firewall_rule_message() {
        let fake = FakeCloudStack::new();
        fake.create_egress_firewall_rule("net-1", "tcp").await.unwrap();
        let err = fake
            .create_egress_firewall_rule("net-1", "tcp")
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_update_affinity_requires_stopped_vm() {
        let fake = FakeCloudStack::new();
        fake.add_vm("vm-1", &[]);
        let ids = vec!["ag-1".to_string()];

        assert!(fake.update_vm_affinity_groups("vm-1", &ids).await.is_err());
        fake.stop_virtual_machine("vm-1").await.unwrap();
        fake.update_vm_affinity_groups("vm-1", &ids).await.unwrap();
        assert_eq!(fake.vm("vm-1").unwrap().affinitygroup[0].id, "ag-1");
    }
}
