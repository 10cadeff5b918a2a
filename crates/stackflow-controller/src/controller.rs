//! Cluster control loop
//!
//! A reconcile runs one of two fixed stage lists, picked by [`Phase`].
//! Stages only read and write the topology's status; the loop decides
//! what an outcome means:
//!
//! - `Continue`: next stage
//! - `Requeue`: stop here, status not ready, try again after the delay
//! - retryable error: same as `Requeue` with the error's backoff
//! - terminal error: stop, record `failure_reason`/`failure_message`, return `Err`

use crate::action::{Action, DEFAULT_RESYNC, ReconcileReport, StageOutcome, StageStatus};
use crate::affinity::AffinityGroupManager;
use crate::domain::{DomainResolver, scope_of};
use crate::error::{ReconcileError, Result};
use crate::network::{DEFAULT_NETWORK_OFFERING, NetworkProvisioner};
use crate::zone::ZoneResolver;
use stackflow_cloud::CloudStackApi;
use stackflow_core::{CLUSTER_FINALIZER, ClusterTopology, NetworkType, ObjectMeta};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Terminating,
}

const ACTIVE_STAGES: [Stage; 11] = [
    Stage::EnsureFinalizer,
    Stage::ResolveZones,
    Stage::VerifyZones,
    Stage::SetFailureDomains,
    Stage::ResolveDomain,
    Stage::GetOrCreateNetworks,
    Stage::OpenFirewallRules,
    Stage::AssociatePublicIp,
    Stage::GetOrCreateLoadBalancerRule,
    Stage::GetOrCreateAffinityGroups,
    Stage::MarkReady,
];

// the finalizer goes last
const TERMINATING_STAGES: [Stage; 4] = [
    Stage::DisassociatePublicIp,
    Stage::DeleteAffinityGroups,
    Stage::ReleaseNetworks,
    Stage::RemoveFinalizer,
];

impl Phase {
    pub fn of(metadata: &ObjectMeta) -> Self {
        if metadata.is_being_deleted() {
            Phase::Terminating
        } else {
            Phase::Active
        }
    }

    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Phase::Active => &ACTIVE_STAGES,
            Phase::Terminating => &TERMINATING_STAGES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Active => "active",
            Phase::Terminating => "terminating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    EnsureFinalizer,
    ResolveZones,
    VerifyZones,
    SetFailureDomains,
    ResolveDomain,
    GetOrCreateNetworks,
    OpenFirewallRules,
    AssociatePublicIp,
    GetOrCreateLoadBalancerRule,
    GetOrCreateAffinityGroups,
    MarkReady,
    DisassociatePublicIp,
    DeleteAffinityGroups,
    ReleaseNetworks,
    RemoveFinalizer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::EnsureFinalizer => "ensure-finalizer",
            Stage::ResolveZones => "resolve-zones",
            Stage::VerifyZones => "verify-zones",
            Stage::SetFailureDomains => "set-failure-domains",
            Stage::ResolveDomain => "resolve-domain",
            Stage::GetOrCreateNetworks => "get-or-create-networks",
            Stage::OpenFirewallRules => "open-firewall-rules",
            Stage::AssociatePublicIp => "associate-public-ip",
            Stage::GetOrCreateLoadBalancerRule => "get-or-create-lb-rule",
            Stage::GetOrCreateAffinityGroups => "get-or-create-affinity-groups",
            Stage::MarkReady => "mark-ready",
            Stage::DisassociatePublicIp => "disassociate-public-ip",
            Stage::DeleteAffinityGroups => "delete-affinity-groups",
            Stage::ReleaseNetworks => "release-networks",
            Stage::RemoveFinalizer => "remove-finalizer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Requeue delay after a fully converged pass
    pub resync_period: Duration,
    /// Offering used when a network has to be created
    pub network_offering: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC,
            network_offering: DEFAULT_NETWORK_OFFERING.to_string(),
        }
    }
}

pub struct ClusterController {
    zones: ZoneResolver,
    domains: DomainResolver,
    networks: NetworkProvisioner,
    affinity: AffinityGroupManager,
    config: ControllerConfig,
}

impl ClusterController {
    pub fn new(api: Arc<dyn CloudStackApi>, config: ControllerConfig) -> Self {
        Self {
            zones: ZoneResolver::new(api.clone()),
            domains: DomainResolver::new(api.clone()),
            networks: NetworkProvisioner::new(api.clone(), config.network_offering.clone()),
            affinity: AffinityGroupManager::new(api),
            config,
        }
    }

    pub async fn reconcile(&self, topology: &mut ClusterTopology) -> Result<Action> {
        self.reconcile_with_report(topology).await.1
    }

    /// Run one pass and return the per-stage report alongside the outcome
    pub async fn reconcile_with_report(
        &self,
        topology: &mut ClusterTopology,
    ) -> (ReconcileReport, Result<Action>) {
        let started = Instant::now();
        let phase = Phase::of(&topology.metadata);
        let mut report = ReconcileReport::new(topology.name(), phase.as_str());
        tracing::info!("Reconciling cluster {} ({})", topology.name(), phase.as_str());

        let result = self.run_stages(phase, topology, &mut report).await;
        report.duration_ms = started.elapsed().as_millis() as u64;
        (report, result)
    }

    async fn run_stages(
        &self,
        phase: Phase,
        topology: &mut ClusterTopology,
        report: &mut ReconcileReport,
    ) -> Result<Action> {
        if phase == Phase::Active
            && let Err(err) = stackflow_core::validate_create(topology.name(), &topology.spec)
        {
            let err = ReconcileError::from(err);
            report.record("validate", StageStatus::Failed(err.to_string()), Duration::ZERO);
            return Err(record_failure(topology, err));
        }

        for &stage in phase.stages() {
            let stage_started = Instant::now();
            let outcome = self.run_stage(stage, topology).await;
            let elapsed = stage_started.elapsed();

            match outcome {
                Ok(StageOutcome::Continue) => {
                    tracing::debug!("{}: {} done", topology.name(), stage);
                    report.record(stage.to_string(), StageStatus::Completed, elapsed);
                }
                Ok(StageOutcome::Requeue { after, reason }) => {
                    tracing::info!(
                        "{}: {} requeued in {}s: {}",
                        topology.name(),
                        stage,
                        after.as_secs(),
                        reason
                    );
                    report.record(stage.to_string(), StageStatus::Requeued(reason.clone()), elapsed);
                    topology.status.ready = false;
                    topology.status.message = Some(reason);
                    return Ok(Action::requeue(after));
                }
                Err(err) => {
                    report.record(stage.to_string(), StageStatus::Failed(err.to_string()), elapsed);
                    topology.status.ready = false;
                    if let Some(after) = err.requeue_after() {
                        tracing::warn!(
                            "{}: {} failed, retrying in {}s: {}",
                            topology.name(),
                            stage,
                            after.as_secs(),
                            err
                        );
                        topology.status.message = Some(err.to_string());
                        return Ok(Action::requeue(after));
                    }
                    return Err(record_failure(topology, err));
                }
            }
        }

        Ok(match phase {
            Phase::Active => Action::requeue(self.config.resync_period),
            Phase::Terminating => Action::await_change(),
        })
    }

    async fn run_stage(&self, stage: Stage, topology: &mut ClusterTopology) -> Result<StageOutcome> {
        match stage {
            Stage::EnsureFinalizer => {
                if topology.metadata.uid.is_empty() {
                    topology.metadata.uid = uuid::Uuid::new_v4().to_string();
                    tracing::info!("Assigned uid {} to {}", topology.metadata.uid, topology.name());
                }
                topology.metadata.add_finalizer(CLUSTER_FINALIZER);
            }
            Stage::ResolveZones => {
                self.zones.resolve_zones(topology).await?;
            }
            Stage::VerifyZones => return Ok(self.zones.verify_zones(topology)),
            Stage::SetFailureDomains => self.zones.set_failure_domains(topology),
            Stage::ResolveDomain => self.domains.resolve(topology).await?,
            Stage::GetOrCreateNetworks => {
                let zone_ids: Vec<String> = topology.status.zones.keys().cloned().collect();
                for zone_id in zone_ids {
                    self.networks.get_or_create_network(topology, &zone_id).await?;
                }
            }
            Stage::OpenFirewallRules => {
                if is_isolated(topology) {
                    self.networks.open_firewall_rules(topology).await?;
                }
            }
            Stage::AssociatePublicIp => {
                if is_isolated(topology) {
                    self.networks.associate_public_ip_address(topology).await?;
                } else if !topology.spec.control_plane_endpoint.is_host_set() {
                    return Err(ReconcileError::Fatal(format!(
                        "{} network requires a declared control-plane endpoint host",
                        topology.status.network_type.unwrap_or(NetworkType::Shared)
                    )));
                }
            }
            Stage::GetOrCreateLoadBalancerRule => {
                if is_isolated(topology) {
                    self.networks.get_or_create_load_balancer_rule(topology).await?;
                }
            }
            Stage::GetOrCreateAffinityGroups => {
                let scope = scope_of(topology);
                for declared in topology.spec.affinity_groups.clone() {
                    let mut group = declared;
                    if self.affinity.get_or_create_affinity_group(&mut group, &scope).await? {
                        topology.status.affinity_groups.add_group(group);
                    }
                }
            }
            Stage::MarkReady => {
                topology.status.ready = true;
                topology.status.message = None;
                topology.status.clear_failure();
                tracing::info!("Cluster {} is ready", topology.name());
            }
            Stage::DisassociatePublicIp => {
                self.networks.disassociate_public_ip_address(topology).await?;
            }
            Stage::DeleteAffinityGroups => {
                let created: Vec<_> = topology.status.affinity_groups.iter().cloned().collect();
                for group in created {
                    self.affinity.delete_affinity_group(&group).await?;
                    topology.status.affinity_groups.remove_group(&group.id);
                }
            }
            Stage::ReleaseNetworks => self.release_networks(topology).await?,
            Stage::RemoveFinalizer => {
                topology.metadata.remove_finalizer(CLUSTER_FINALIZER);
                topology.status.ready = false;
                tracing::info!("Cluster {} torn down", topology.name());
            }
        }
        Ok(StageOutcome::Continue)
    }

    async fn release_networks(&self, topology: &mut ClusterTopology) -> Result<()> {
        if topology.metadata.uid.is_empty() {
            return Ok(());
        }
        let network_ids: BTreeSet<String> = topology
            .status
            .zones
            .values()
            .map(|z| z.network.id.clone())
            .chain(topology.status.network_id.clone())
            .filter(|id| !id.is_empty())
            .collect();

        for network_id in network_ids {
            self.networks
                .release_network(&topology.metadata.uid, &network_id)
                .await?;
            for zone in topology.status.zones.values_mut() {
                if zone.network.id == network_id {
                    zone.network.id.clear();
                }
            }
        }
        topology.status.network_id = None;
        topology.status.network_type = None;
        Ok(())
    }
}

fn is_isolated(topology: &ClusterTopology) -> bool {
    topology.status.network_type == Some(NetworkType::Isolated)
}

fn record_failure(topology: &mut ClusterTopology, err: ReconcileError) -> ReconcileError {
    tracing::error!("{}: {}", topology.name(), err);
    topology.status.ready = false;
    topology.status.failure_reason = Some(err.reason().to_string());
    topology.status.failure_message = Some(err.to_string());
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackflow_cloud::ResourceType;
    use stackflow_cloud::testing::FakeCloudStack;
    use stackflow_core::{AffinityGroup, AffinityGroupType, ClusterSpec, Network, Zone};

    fn world() -> Arc<FakeCloudStack> {
        let fake = Arc::new(FakeCloudStack::new());
        fake.add_zone("z-1", "zone-a");
        fake.add_offering("off-1", DEFAULT_NETWORK_OFFERING);
        fake.add_public_ip("ip-1", "203.0.113.10", None);
        fake
    }

    fn zone(name: &str) -> Zone {
        Zone {
            name: name.to_string(),
            network: Network::named("prod-net"),
            ..Default::default()
        }
    }

    fn topology() -> ClusterTopology {
        ClusterTopology::new(
            "prod",
            ClusterSpec {
                zones: vec![zone("zone-a")],
                affinity_groups: vec![AffinityGroup::new(
                    "prod-cp",
                    AffinityGroupType::HostAntiAffinity,
                )],
                ..Default::default()
            },
        )
    }

    fn controller(fake: &Arc<FakeCloudStack>) -> ClusterController {
        ClusterController::new(fake.clone(), ControllerConfig::default())
    }

    #[test]
    fn test_phase_selects_stage_list() {
        let mut meta = ObjectMeta::new("prod");
        assert_eq!(Phase::of(&meta), Phase::Active);
        assert_eq!(Phase::Active.stages().len(), 11);

        meta.deletion_timestamp = Some(chrono::Utc::now());
        assert_eq!(Phase::of(&meta), Phase::Terminating);
        assert_eq!(Phase::Terminating.stages().last(), Some(&Stage::RemoveFinalizer));
    }

    #[tokio::test]
    async fn test_full_pass_converges() {
        let fake = world();
        let mut topo = topology();

        let (report, result) = controller(&fake).reconcile_with_report(&mut topo).await;
        let action = result.unwrap();

        assert!(report.is_success());
        assert_eq!(report.stages.len(), 11);
        assert_eq!(action.requeue_after(), Some(DEFAULT_RESYNC));
        assert!(topo.status.ready);
        assert!(!topo.metadata.uid.is_empty());
        assert!(topo.metadata.has_finalizer(CLUSTER_FINALIZER));
        assert_eq!(topo.status.network_type, Some(NetworkType::Isolated));
        assert_eq!(topo.status.public_ip_id.as_deref(), Some("ip-1"));
        assert_eq!(topo.status.control_plane_host.as_deref(), Some("203.0.113.10"));
        assert!(topo.status.lb_rule_id.is_some());
        assert_eq!(topo.status.affinity_groups.len(), 1);
        assert!(topo.status.failure_domains["z-1"].control_plane);
    }

    #[tokio::test]
    async fn test_second_pass_creates_nothing() {
        let fake = world();
        let mut topo = topology();
        let controller = controller(&fake);

        controller.reconcile(&mut topo).await.unwrap();
        let uid = topo.metadata.uid.clone();
        fake.clear_calls();
        controller.reconcile(&mut topo).await.unwrap();

        assert_eq!(topo.metadata.uid, uid);
        // the egress rule is re-issued and answered as a duplicate
        assert_eq!(
            fake.mutations(),
            vec![format!(
                "createEgressFirewallRule networkid={} protocol=tcp",
                topo.status.network_id.clone().unwrap()
            )]
        );
        assert!(topo.status.ready);
    }

    #[tokio::test]
    async fn test_missing_zone_requeues_before_networks() {
        let fake = world();
        let mut topo = topology();
        topo.spec.zones.push(zone("zone-b"));

        let action = controller(&fake).reconcile(&mut topo).await.unwrap();

        assert_eq!(action.requeue_after(), Some(Duration::from_secs(30)));
        assert!(!topo.status.ready);
        assert_eq!(
            topo.status.message.as_deref(),
            Some("Expected 2 Zones, but found 1")
        );
        assert_eq!(fake.count("listNetworks"), 0);
        assert!(topo.status.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_transient_error_requeues() {
        let fake = world();
        fake.fail_next("listNetworks", "connection refused");
        let mut topo = topology();

        let action = controller(&fake).reconcile(&mut topo).await.unwrap();

        assert_eq!(action.requeue_after(), Some(Duration::from_secs(30)));
        assert!(!topo.status.ready);
        assert!(topo.status.failure_reason.is_none());
        assert!(topo.status.message.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_ambiguous_network_is_terminal() {
        let fake = world();
        fake.add_network("net-1", "prod-net", "Isolated");
        fake.add_network("net-2", "prod-net", "Isolated");
        let mut topo = topology();

        let (report, result) = controller(&fake).reconcile_with_report(&mut topo).await;

        assert!(result.is_err());
        assert_eq!(topo.status.failure_reason.as_deref(), Some("AmbiguousMatch"));
        assert_eq!(fake.count("createNetwork"), 0);
        assert!(matches!(
            report.stages.last().map(|s| &s.status),
            Some(StageStatus::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected_before_stages() {
        let fake = world();
        let mut topo = ClusterTopology::new("prod", ClusterSpec::default());

        let err = controller(&fake).reconcile(&mut topo).await.unwrap_err();

        assert!(matches!(err, ReconcileError::InvalidSpec(_)));
        assert_eq!(topo.status.failure_reason.as_deref(), Some("InvalidSpec"));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_shared_network_needs_endpoint_host() {
        let fake = world();
        fake.add_network("net-1", "prod-net", "Shared");
        let mut topo = topology();

        let err = controller(&fake).reconcile(&mut topo).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Fatal(_)));

        topo.spec.control_plane_endpoint.host = "10.1.0.10".into();
        topo.spec.control_plane_endpoint.port = 6443;
        controller(&fake).reconcile(&mut topo).await.unwrap();
        assert!(topo.status.ready);
        assert!(topo.status.failure_reason.is_none());
        assert_eq!(fake.count("associateIpAddress"), 0);
        assert_eq!(fake.count("createLoadBalancerRule"), 0);
    }

    #[tokio::test]
    async fn test_teardown_releases_everything() {
        let fake = world();
        let mut topo = topology();
        let controller = controller(&fake);
        controller.reconcile(&mut topo).await.unwrap();

        let network_id = topo.status.network_id.clone().unwrap();
        let group_id = topo.status.affinity_groups.ids()[0].clone();

        topo.metadata.deletion_timestamp = Some(chrono::Utc::now());
        let action = controller.reconcile(&mut topo).await.unwrap();

        assert_eq!(action.requeue_after(), None);
        assert!(!topo.metadata.has_finalizer(CLUSTER_FINALIZER));
        assert!(!fake.network_exists(&network_id));
        assert!(!fake.affinity_group_exists(&group_id));
        assert!(!fake.public_ip("ip-1").unwrap().is_allocated());
    }

    #[tokio::test]
    async fn test_teardown_releases_network_without_zone_snapshot() {
        let fake = world();
        let mut topo = topology();
        let controller = controller(&fake);
        controller.reconcile(&mut topo).await.unwrap();
        let network_id = topo.status.network_id.clone().unwrap();

        // snapshot lost while the zone was not listed
        topo.status.zones.clear();
        topo.metadata.deletion_timestamp = Some(chrono::Utc::now());
        controller.reconcile(&mut topo).await.unwrap();

        assert!(!topo.metadata.has_finalizer(CLUSTER_FINALIZER));
        assert!(!fake.network_exists(&network_id));
        assert!(topo.status.network_id.is_none());
    }

    #[tokio::test]
    async fn test_teardown_failure_keeps_finalizer() {
        let fake = world();
        let mut topo = topology();
        let controller = controller(&fake);
        controller.reconcile(&mut topo).await.unwrap();

        topo.metadata.deletion_timestamp = Some(chrono::Utc::now());
        fake.fail_next("deleteNetwork", "Insufficient permissions to delete network");
        let result = controller.reconcile(&mut topo).await;

        assert!(result.is_err());
        assert!(topo.metadata.has_finalizer(CLUSTER_FINALIZER));

        // the next pass finishes the job
        controller.reconcile(&mut topo).await.unwrap();
        assert!(!topo.metadata.has_finalizer(CLUSTER_FINALIZER));
    }

    #[tokio::test]
    async fn test_shared_network_survives_one_owner_leaving() {
        let fake = world();
        fake.add_network("net-1", "prod-net", "Isolated");
        fake.set_tags(
            ResourceType::Network,
            "net-1",
            &[("stackflow_cluster_other", "1"), ("created_by_stackflow", "1")],
        );
        let mut topo = topology();
        let controller = controller(&fake);
        controller.reconcile(&mut topo).await.unwrap();

        topo.metadata.deletion_timestamp = Some(chrono::Utc::now());
        controller.reconcile(&mut topo).await.unwrap();

        assert!(fake.network_exists("net-1"));
        let tags = fake.tags(ResourceType::Network, "net-1");
        assert!(tags.contains_key("stackflow_cluster_other"));
        assert_eq!(tags.len(), 2);
    }
}
