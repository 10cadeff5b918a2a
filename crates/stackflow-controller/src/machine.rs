//! Machine control loop
//!
//! Runs after the owning cluster is ready: resolves the declared affinity
//! groups, converges the instance's membership and registers control-plane
//! instances in the cluster's load balancer rule.

use crate::action::{Action, ReconcileReport, StageOutcome, StageStatus};
use crate::affinity::AffinityGroupManager;
use crate::controller::ControllerConfig;
use crate::error::{REQUEUE_TRANSIENT, ReconcileError, Result};
use crate::network::NetworkProvisioner;
use stackflow_cloud::CloudStackApi;
use stackflow_core::{AffinityGroup, ClusterTopology, Machine, MachineStatus};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStage {
    ResolveAffinityGroups,
    ConvergeAffinityMembership,
    AssignLoadBalancer,
    MarkReady,
}

pub const MACHINE_STAGES: [MachineStage; 4] = [
    MachineStage::ResolveAffinityGroups,
    MachineStage::ConvergeAffinityMembership,
    MachineStage::AssignLoadBalancer,
    MachineStage::MarkReady,
];

impl fmt::Display for MachineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MachineStage::ResolveAffinityGroups => "resolve-affinity-groups",
            MachineStage::ConvergeAffinityMembership => "converge-affinity-membership",
            MachineStage::AssignLoadBalancer => "assign-load-balancer",
            MachineStage::MarkReady => "mark-ready",
        })
    }
}

pub struct MachineController {
    affinity: AffinityGroupManager,
    networks: NetworkProvisioner,
    resync_period: Duration,
}

impl MachineController {
    pub fn new(api: Arc<dyn CloudStackApi>, config: &ControllerConfig) -> Self {
        Self {
            affinity: AffinityGroupManager::new(api.clone()),
            networks: NetworkProvisioner::new(api, config.network_offering.clone()),
            resync_period: config.resync_period,
        }
    }

    pub async fn reconcile(
        &self,
        cluster: &ClusterTopology,
        machine: &Machine,
        status: &mut MachineStatus,
    ) -> Result<Action> {
        self.reconcile_with_report(cluster, machine, status).await.1
    }

    pub async fn reconcile_with_report(
        &self,
        cluster: &ClusterTopology,
        machine: &Machine,
        status: &mut MachineStatus,
    ) -> (ReconcileReport, Result<Action>) {
        let started = Instant::now();
        let mut report = ReconcileReport::new(
            format!("{}/{}", cluster.name(), machine.name),
            "machine",
        );
        let result = self.run_stages(cluster, machine, status, &mut report).await;
        report.duration_ms = started.elapsed().as_millis() as u64;
        (report, result)
    }

    async fn run_stages(
        &self,
        cluster: &ClusterTopology,
        machine: &Machine,
        status: &mut MachineStatus,
        report: &mut ReconcileReport,
    ) -> Result<Action> {
        let waiting = if !cluster.status.ready {
            Some(format!("waiting for cluster {} to become ready", cluster.name()))
        } else if !machine.is_provisioned() {
            Some("instance not provisioned yet".to_string())
        } else {
            None
        };
        if let Some(reason) = waiting {
            tracing::debug!("{}: {}", machine.name, reason);
            status.ready = false;
            status.message = Some(reason.clone());
            report.record("wait", StageStatus::Requeued(reason), Duration::ZERO);
            return Ok(Action::requeue(REQUEUE_TRANSIENT));
        }
        status.instance_id = machine.instance_id.clone();

        for stage in MACHINE_STAGES {
            let stage_started = Instant::now();
            let outcome = self.run_stage(stage, cluster, machine, status).await;
            let elapsed = stage_started.elapsed();

            match outcome {
                Ok(StageOutcome::Continue) => {
                    report.record(stage.to_string(), StageStatus::Completed, elapsed);
                }
                Ok(StageOutcome::Requeue { after, reason }) => {
                    report.record(stage.to_string(), StageStatus::Requeued(reason.clone()), elapsed);
                    status.ready = false;
                    status.message = Some(reason);
                    return Ok(Action::requeue(after));
                }
                Err(err) => {
                    report.record(stage.to_string(), StageStatus::Failed(err.to_string()), elapsed);
                    status.ready = false;
                    if let Some(after) = err.requeue_after() {
                        tracing::warn!(
                            "{}: {} failed, retrying in {}s: {}",
                            machine.name,
                            stage,
                            after.as_secs(),
                            err
                        );
                        status.message = Some(err.to_string());
                        return Ok(Action::requeue(after));
                    }
                    tracing::error!("{}: {}", machine.name, err);
                    status.failure_message = Some(err.to_string());
                    return Err(err);
                }
            }
        }

        Ok(Action::requeue(self.resync_period))
    }

    async fn run_stage(
        &self,
        stage: MachineStage,
        cluster: &ClusterTopology,
        machine: &Machine,
        status: &mut MachineStatus,
    ) -> Result<StageOutcome> {
        let instance_id = machine.instance_id.as_deref().unwrap_or_default();
        match stage {
            MachineStage::ResolveAffinityGroups => {
                let mut ids = BTreeSet::new();
                for id in &machine.affinity_group_ids {
                    let mut group = AffinityGroup {
                        id: id.clone(),
                        ..Default::default()
                    };
                    self.affinity.fetch_affinity_group(&mut group).await?;
                    ids.insert(group.id);
                }
                for key in &machine.affinity_groups {
                    ids.insert(self.resolve_group(cluster, key).await?.id);
                }
                status.affinity_group_ids = ids.into_iter().collect();
            }
            MachineStage::ConvergeAffinityMembership => {
                let wanted = status.affinity_group_ids.clone();
                self.affinity.converge(instance_id, &wanted, status).await?;
            }
            MachineStage::AssignLoadBalancer => {
                if machine.control_plane && cluster.status.lb_rule_id.is_some() {
                    self.networks
                        .assign_vm_to_load_balancer_rule(cluster, instance_id)
                        .await?;
                    status.lb_assigned = true;
                }
            }
            MachineStage::MarkReady => {
                status.ready = true;
                status.message = None;
                status.failure_message = None;
            }
        }
        Ok(StageOutcome::Continue)
    }

    /// Resolve a group given by name or ID, preferring groups the cluster created
    async fn resolve_group(&self, cluster: &ClusterTopology, key: &str) -> Result<AffinityGroup> {
        let created = &cluster.status.affinity_groups;
        if let Some(group) = created.get(key).or_else(|| created.find_by_name(key)) {
            return Ok(group.clone());
        }

        let mut group = AffinityGroup {
            name: key.to_string(),
            ..Default::default()
        };
        match self.affinity.fetch_affinity_group(&mut group).await {
            Ok(()) => Ok(group),
            Err(ReconcileError::NotFound { .. }) => {
                let mut group = AffinityGroup {
                    id: key.to_string(),
                    ..Default::default()
                };
                self.affinity.fetch_affinity_group(&mut group).await?;
                Ok(group)
            }
            Err(err) => Err(err),
        }
    }

    fn require_instance(machine: &Machine) -> Result<&str> {
        machine
            .instance_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ReconcileError::Transient(format!("{} has no instance yet", machine.name)))
    }

    /// Add one group to the instance outside the declared list
    pub async fn associate(
        &self,
        cluster: &ClusterTopology,
        machine: &Machine,
        group_key: &str,
        status: &mut MachineStatus,
    ) -> Result<bool> {
        let instance_id = Self::require_instance(machine)?;
        let group = self.resolve_group(cluster, group_key).await?;
        self.affinity
            .associate_affinity_group(instance_id, &group, status)
            .await
    }

    /// Remove one group from the instance
    pub async fn dissociate(
        &self,
        cluster: &ClusterTopology,
        machine: &Machine,
        group_key: &str,
        status: &mut MachineStatus,
    ) -> Result<bool> {
        let instance_id = Self::require_instance(machine)?;
        let group = self.resolve_group(cluster, group_key).await?;
        status.affinity_group_ids.retain(|id| id != &group.id);
        self.affinity
            .disassociate_affinity_group(instance_id, &group, status)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackflow_cloud::testing::FakeCloudStack;
    use stackflow_core::{AffinityGroupType, ClusterSpec, TransitionStep};

    fn ready_cluster() -> ClusterTopology {
        let mut cluster = ClusterTopology::new("prod", ClusterSpec::default());
        cluster.status.ready = true;
        cluster.status.lb_rule_id = Some("lb-1".into());
        cluster.status.affinity_groups.add_group(
            AffinityGroup::new("prod-cp", AffinityGroupType::HostAntiAffinity).with_id("ag-1"),
        );
        cluster
    }

    fn machine() -> Machine {
        Machine {
            instance_id: Some("vm-1".into()),
            affinity_groups: vec!["prod-cp".into()],
            control_plane: true,
            ..Machine::new("cp-0")
        }
    }

    fn controller(fake: &Arc<FakeCloudStack>) -> MachineController {
        MachineController::new(fake.clone(), &ControllerConfig::default())
    }

    #[tokio::test]
    async fn test_waits_for_cluster() {
        let fake = Arc::new(FakeCloudStack::new());
        let mut cluster = ready_cluster();
        cluster.status.ready = false;
        let mut status = MachineStatus::default();

        let action = controller(&fake)
            .reconcile(&cluster, &machine(), &mut status)
            .await
            .unwrap();

        assert_eq!(action.requeue_after(), Some(REQUEUE_TRANSIENT));
        assert!(status.message.unwrap().contains("waiting for cluster"));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_waits_for_instance() {
        let fake = Arc::new(FakeCloudStack::new());
        let mut status = MachineStatus::default();
        let pending = Machine::new("cp-0");

        let action = controller(&fake)
            .reconcile(&ready_cluster(), &pending, &mut status)
            .await
            .unwrap();
        assert_eq!(action.requeue_after(), Some(REQUEUE_TRANSIENT));
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn test_converges_membership_and_lb() {
        let fake = Arc::new(FakeCloudStack::new());
        fake.add_affinity_group("ag-1", "prod-cp", "host anti-affinity");
        fake.add_vm("vm-1", &[]);
        let controller = controller(&fake);
        let cluster = ready_cluster();
        let mut status = MachineStatus::default();

        let (report, result) = controller
            .reconcile_with_report(&cluster, &machine(), &mut status)
            .await;
        result.unwrap();

        assert!(report.is_success());
        assert!(status.ready);
        assert!(status.lb_assigned);
        assert_eq!(status.affinity_group_ids, vec!["ag-1"]);
        assert_eq!(fake.vm("vm-1").unwrap().affinitygroup[0].id, "ag-1");
        assert_eq!(fake.lb_members("lb-1"), vec!["vm-1"]);

        fake.clear_calls();
        controller
            .reconcile(&cluster, &machine(), &mut status)
            .await
            .unwrap();
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_requeues_quickly_then_resumes() {
        let fake = Arc::new(FakeCloudStack::new());
        fake.add_vm("vm-1", &[]);
        fake.fail_next("startVirtualMachine", "Service Unavailable");
        let controller = controller(&fake);
        let cluster = ready_cluster();
        let mut status = MachineStatus::default();

        let action = controller
            .reconcile(&cluster, &machine(), &mut status)
            .await
            .unwrap();
        assert_eq!(action.requeue_after(), Some(Duration::from_secs(5)));
        assert_eq!(
            status.transition.as_ref().map(|t| t.step),
            Some(TransitionStep::UpdatedPendingStart)
        );

        controller
            .reconcile(&cluster, &machine(), &mut status)
            .await
            .unwrap();
        assert!(status.ready);
        assert_eq!(fake.count("stopVirtualMachine"), 1);
        assert_eq!(fake.count("updateVMAffinityGroup"), 1);
        assert_eq!(fake.vm("vm-1").unwrap().state, "Running");
    }

    #[tokio::test]
    async fn test_unknown_group_requeues() {
        let fake = Arc::new(FakeCloudStack::new());
        fake.add_vm("vm-1", &[]);
        let mut status = MachineStatus::default();
        let machine = Machine {
            affinity_groups: vec!["nope".into()],
            ..machine()
        };

        let action = controller(&fake)
            .reconcile(&ready_cluster(), &machine, &mut status)
            .await
            .unwrap();
        assert_eq!(action.requeue_after(), Some(Duration::from_secs(30)));
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_associate_and_dissociate_by_name() {
        let fake = Arc::new(FakeCloudStack::new());
        fake.add_affinity_group("ag-7", "batch", "host affinity");
        fake.add_vm("vm-1", &[]);
        let controller = controller(&fake);
        let cluster = ready_cluster();
        let mut status = MachineStatus::default();

        assert!(controller
            .associate(&cluster, &machine(), "batch", &mut status)
            .await
            .unwrap());
        assert_eq!(fake.vm("vm-1").unwrap().affinitygroup[0].id, "ag-7");

        assert!(controller
            .dissociate(&cluster, &machine(), "ag-7", &mut status)
            .await
            .unwrap());
        assert!(fake.vm("vm-1").unwrap().affinitygroup.is_empty());
    }
}
