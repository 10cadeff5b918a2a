//! CloudStack provider implementation

use crate::cloud_config::CloudConfig;
use crate::cmk::{Cmk, entity, list_entries};
use async_trait::async_trait;
use serde::Deserialize;
use stackflow_cloud::{
    AccountRecord, AffinityGroupRecord, AuthStatus, CloudStackApi, CreateLoadBalancerRuleRequest,
    CreateNetworkRequest, DomainRecord, LoadBalancerRule, Lookup, NetworkOfferingRecord,
    NetworkRecord, PublicIpAddress, ResourceType, Scope, VirtualMachineRecord, ZoneRecord,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

type CloudResult<T> = stackflow_cloud::Result<T>;

/// Apache CloudStack provider
pub struct CloudStackProvider {
    cmk: Cmk,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    key: String,
    #[serde(default)]
    value: String,
}

impl CloudStackProvider {
    pub fn new(cmk: Cmk, api_url: impl Into<String>) -> Self {
        Self {
            cmk,
            api_url: api_url.into(),
        }
    }

    /// Build a provider from a cloud-config file
    ///
    /// Only the local side is checked here. Use
    /// [`CloudStackApi::check_auth`] to see whether the endpoint answers.
    pub async fn connect(
        cloud_config_path: &Path,
        cmk_binary: &str,
        work_dir: &Path,
        timeout: Duration,
    ) -> crate::Result<Self> {
        let config = CloudConfig::load(cloud_config_path)?;
        let cmk_config = config.write_cmk_config(work_dir, timeout.as_secs()).await?;
        let cmk = Cmk::new(cmk_binary, cmk_config, timeout);
        cmk.check_installed().await?;

        tracing::debug!("Configured cmk for {}", config.api_url);
        Ok(Self::new(cmk, config.api_url))
    }
}

fn scope_params(scope: &Scope) -> Vec<(&'static str, String)> {
    vec![
        ("account", scope.account.clone().unwrap_or_default()),
        ("domainid", scope.domain_id.clone().unwrap_or_default()),
    ]
}

fn lookup_params(lookup: Lookup<'_>) -> Vec<(&'static str, String)> {
    match lookup {
        Lookup::Id(id) => vec![("id", id.to_string())],
        Lookup::Name(name) => vec![("name", name.to_string())],
    }
}

fn tag_params(
    resource_type: ResourceType,
    resource_id: &str,
    tags: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("resourcetype".to_string(), resource_type.as_api_str().to_string()),
        ("resourceids".to_string(), resource_id.to_string()),
    ];
    for (i, (k, v)) in tags.iter().enumerate() {
        params.push((format!("tags[{}].key", i), k.clone()));
        params.push((format!("tags[{}].value", i), v.clone()));
    }
    params
}

fn as_refs(params: &[(String, String)]) -> Vec<(&str, String)> {
    params.iter().map(|(k, v)| (k.as_str(), v.clone())).collect()
}

#[async_trait]
impl CloudStackApi for CloudStackProvider {
    fn name(&self) -> &str {
        "cloudstack"
    }

    async fn check_auth(&self) -> CloudResult<AuthStatus> {
        match self.cmk.run("list", "zones", &[]).await {
            Ok(_) => Ok(AuthStatus::ok(self.api_url.clone())),
            Err(e) => Ok(AuthStatus::failed(e.to_string())),
        }
    }

    async fn list_zones(&self, lookup: Lookup<'_>) -> CloudResult<Vec<ZoneRecord>> {
        Ok(self.cmk.list("zones", "zone", &lookup_params(lookup)).await?)
    }

    async fn list_domains(&self, lookup: Lookup<'_>) -> CloudResult<Vec<DomainRecord>> {
        match lookup {
            Lookup::Id(_) => Ok(self.cmk.list("domains", "domain", &lookup_params(lookup)).await?),
            Lookup::Name(path) => {
                // listDomains filters on the leaf name only
                let leaf = path.rsplit('/').next().unwrap_or(path);
                let domains: Vec<DomainRecord> = self
                    .cmk
                    .list(
                        "domains",
                        "domain",
                        &[("name", leaf.to_string()), ("listall", "true".to_string())],
                    )
                    .await?;
                Ok(domains
                    .into_iter()
                    .filter(|d| d.path == path || d.name == path)
                    .collect())
            }
        }
    }

    async fn list_accounts(&self, name: &str, domain_id: &str) -> CloudResult<Vec<AccountRecord>> {
        Ok(self
            .cmk
            .list(
                "accounts",
                "account",
                &[("name", name.to_string()), ("domainid", domain_id.to_string())],
            )
            .await?)
    }

    async fn list_networks(
        &self,
        lookup: Lookup<'_>,
        scope: &Scope,
    ) -> CloudResult<Vec<NetworkRecord>> {
        let mut params = scope_params(scope);
        match lookup {
            Lookup::Id(id) => params.push(("id", id.to_string())),
            // listNetworks has no exact name filter
            Lookup::Name(name) => params.push(("keyword", name.to_string())),
        }
        let networks: Vec<NetworkRecord> = self.cmk.list("networks", "network", &params).await?;
        Ok(match lookup {
            Lookup::Id(_) => networks,
            Lookup::Name(name) => networks.into_iter().filter(|n| n.name == name).collect(),
        })
    }

    async fn list_network_offerings(&self, name: &str) -> CloudResult<Vec<NetworkOfferingRecord>> {
        Ok(self
            .cmk
            .list("networkofferings", "networkoffering", &[("name", name.to_string())])
            .await?)
    }

    async fn create_network(&self, request: &CreateNetworkRequest) -> CloudResult<NetworkRecord> {
        let mut params = vec![
            ("name", request.name.clone()),
            ("displaytext", request.display_text.clone()),
            ("networkofferingid", request.offering_id.clone()),
            ("zoneid", request.zone_id.clone()),
        ];
        params.extend(scope_params(&request.scope));
        let response = self.cmk.run("create", "network", &params).await?;
        Ok(entity(&response, "network")?)
    }

    async fn delete_network(&self, id: &str) -> CloudResult<()> {
        self.cmk
            .run("delete", "network", &[("id", id.to_string())])
            .await?;
        Ok(())
    }

    async fn list_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> CloudResult<BTreeMap<String, String>> {
        let response = self
            .cmk
            .run(
                "list",
                "tags",
                &[
                    ("resourcetype", resource_type.as_api_str().to_string()),
                    ("resourceid", resource_id.to_string()),
                    ("listall", "true".to_string()),
                ],
            )
            .await?;
        let entries: Vec<TagEntry> = list_entries(&response, "tag")?;
        Ok(entries.into_iter().map(|t| (t.key, t.value)).collect())
    }

    async fn create_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> CloudResult<()> {
        let params = tag_params(resource_type, resource_id, tags);
        self.cmk.run("create", "tags", &as_refs(&params)).await?;
        Ok(())
    }

    async fn delete_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> CloudResult<()> {
        let params = tag_params(resource_type, resource_id, tags);
        self.cmk.run("delete", "tags", &as_refs(&params)).await?;
        Ok(())
    }

    async fn list_public_ip_addresses(
        &self,
        ip_address: Option<&str>,
        scope: &Scope,
    ) -> CloudResult<Vec<PublicIpAddress>> {
        let mut params = scope_params(scope);
        params.push(("allocatedonly", "false".to_string()));
        if let Some(ip) = ip_address {
            params.push(("ipaddress", ip.to_string()));
        }
        Ok(self
            .cmk
            .list("publicipaddresses", "publicipaddress", &params)
            .await?)
    }

    async fn associate_ip_address(
        &self,
        network_id: &str,
        ip_address: &str,
        scope: &Scope,
    ) -> CloudResult<PublicIpAddress> {
        let mut params = vec![
            ("networkid", network_id.to_string()),
            ("ipaddress", ip_address.to_string()),
        ];
        params.extend(scope_params(scope));
        let response = self.cmk.run("associate", "ipaddress", &params).await?;
        Ok(entity(&response, "ipaddress")?)
    }

    async fn disassociate_ip_address(&self, id: &str) -> CloudResult<()> {
        self.cmk
            .run("disassociate", "ipaddress", &[("id", id.to_string())])
            .await?;
        Ok(())
    }

    async fn create_egress_firewall_rule(&self, network_id: &str, protocol: &str) -> CloudResult<()> {
        self.cmk
            .run(
                "create",
                "egressfirewallrule",
                &[
                    ("networkid", network_id.to_string()),
                    ("protocol", protocol.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_load_balancer_rules(
        &self,
        public_ip_id: &str,
        scope: &Scope,
    ) -> CloudResult<Vec<LoadBalancerRule>> {
        let mut params = scope_params(scope);
        params.push(("publicipid", public_ip_id.to_string()));
        Ok(self
            .cmk
            .list("loadbalancerrules", "loadbalancerrule", &params)
            .await?)
    }

    async fn create_load_balancer_rule(
        &self,
        request: &CreateLoadBalancerRuleRequest,
    ) -> CloudResult<LoadBalancerRule> {
        let mut params = vec![
            ("name", request.name.clone()),
            ("algorithm", request.algorithm.clone()),
            ("privateport", request.private_port.to_string()),
            ("publicport", request.public_port.to_string()),
            ("publicipid", request.public_ip_id.clone()),
            ("networkid", request.network_id.clone()),
            ("protocol", request.protocol.clone()),
        ];
        params.extend(scope_params(&request.scope));
        let response = self.cmk.run("create", "loadbalancerrule", &params).await?;
        Ok(entity(&response, "loadbalancer")?)
    }

    async fn list_load_balancer_rule_instances(
        &self,
        rule_id: &str,
    ) -> CloudResult<Vec<VirtualMachineRecord>> {
        Ok(self
            .cmk
            .list(
                "loadbalancerruleinstances",
                "loadbalancerruleinstance",
                &[("id", rule_id.to_string())],
            )
            .await?)
    }

    async fn assign_to_load_balancer_rule(
        &self,
        rule_id: &str,
        vm_ids: &[String],
    ) -> CloudResult<()> {
        self.cmk
            .run(
                "assign",
                "toloadbalancerrule",
                &[
                    ("id", rule_id.to_string()),
                    ("virtualmachineids", vm_ids.join(",")),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_affinity_groups(&self, lookup: Lookup<'_>) -> CloudResult<Vec<AffinityGroupRecord>> {
        Ok(self
            .cmk
            .list("affinitygroups", "affinitygroup", &lookup_params(lookup))
            .await?)
    }

    async fn create_affinity_group(
        &self,
        name: &str,
        group_type: &str,
        scope: &Scope,
    ) -> CloudResult<AffinityGroupRecord> {
        let mut params = vec![("name", name.to_string()), ("type", group_type.to_string())];
        params.extend(scope_params(scope));
        let response = self.cmk.run("create", "affinitygroup", &params).await?;
        Ok(entity(&response, "affinitygroup")?)
    }

    async fn delete_affinity_group(&self, lookup: Lookup<'_>) -> CloudResult<()> {
        self.cmk
            .run("delete", "affinitygroup", &lookup_params(lookup))
            .await?;
        Ok(())
    }

    async fn list_virtual_machines(&self, id: &str) -> CloudResult<Vec<VirtualMachineRecord>> {
        Ok(self
            .cmk
            .list("virtualmachines", "virtualmachine", &[("id", id.to_string())])
            .await?)
    }

    async fn stop_virtual_machine(&self, id: &str) -> CloudResult<()> {
        self.cmk
            .run("stop", "virtualmachine", &[("id", id.to_string())])
            .await?;
        Ok(())
    }

    async fn start_virtual_machine(&self, id: &str) -> CloudResult<()> {
        self.cmk
            .run("start", "virtualmachine", &[("id", id.to_string())])
            .await?;
        Ok(())
    }

    async fn update_vm_affinity_groups(&self, vm_id: &str, group_ids: &[String]) -> CloudResult<()> {
        self.cmk
            .run(
                "update",
                "vmaffinitygroup",
                &[
                    ("id", vm_id.to_string()),
                    ("affinitygroupids", group_ids.join(",")),
                ],
            )
            .await?;
        Ok(())
    }
}
