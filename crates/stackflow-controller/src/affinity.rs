//! Affinity group manager
//!
//! Changing the affinity groups of an instance takes three provider calls
//! that are not atomic: stop, update, start. The last completed step is kept
//! in [`MachineStatus::transition`] so that a retry continues where the
//! previous attempt stopped instead of starting over.
//!
//! ```text
//!            stop            update              start
//! (running) -----> Stopped ---------> Updated ---------> Started
//!                  PendingUpdate      PendingStart
//! ```
//!
//! A failure after the stop leaves the instance down and is reported as
//! [`ReconcileError::PartialTransition`].

use crate::error::{ReconcileError, Result};
use stackflow_cloud::{AffinityGroupRecord, CloudStackApi, Lookup, Scope};
use stackflow_core::{
    AffinityGroup, AffinityGroupSet, AffinityGroupType, AffinityTransition, MachineStatus,
    TransitionStep,
};
use std::sync::Arc;

fn to_group(record: AffinityGroupRecord, fallback_type: AffinityGroupType) -> AffinityGroup {
    AffinityGroup {
        group_type: record.group_type.parse().unwrap_or(fallback_type),
        id: record.id,
        name: record.name,
    }
}

pub struct AffinityGroupManager {
    api: Arc<dyn CloudStackApi>,
}

impl AffinityGroupManager {
    pub fn new(api: Arc<dyn CloudStackApi>) -> Self {
        Self { api }
    }

    /// Fill in the missing half of a group known by ID or by name
    pub async fn fetch_affinity_group(&self, group: &mut AffinityGroup) -> Result<()> {
        let (lookup, key) = if !group.id.is_empty() {
            (Lookup::Id(&group.id), group.id.clone())
        } else if !group.name.is_empty() {
            (Lookup::Name(&group.name), group.name.clone())
        } else {
            return Err(ReconcileError::InvalidSpec(
                "affinity group needs a name or an ID".to_string(),
            ));
        };

        let matches = self
            .api
            .list_affinity_groups(lookup)
            .await
            .map_err(ReconcileError::cloud("listAffinityGroups"))?;
        let record = ReconcileError::expect_one("affinity group", &key, matches)?;
        *group = to_group(record, group.group_type);
        Ok(())
    }

    /// Returns true when the group was created by this call
    pub async fn get_or_create_affinity_group(
        &self,
        group: &mut AffinityGroup,
        scope: &Scope,
    ) -> Result<bool> {
        match self.fetch_affinity_group(group).await {
            Ok(()) => return Ok(false),
            Err(err) if !err.is_not_found() => return Err(err),
            Err(_) if !group.id.is_empty() => {
                return Err(ReconcileError::Fatal(format!(
                    "affinity group {} does not exist",
                    group.id
                )));
            }
            Err(_) => {}
        }

        let record = self
            .api
            .create_affinity_group(&group.name, group.group_type.as_api_str(), scope)
            .await
            .map_err(ReconcileError::cloud("createAffinityGroup"))?;
        tracing::info!(
            "Created affinity group {} ({}, {})",
            record.name,
            record.id,
            group.group_type
        );
        group.id = record.id;
        Ok(true)
    }

    /// Already deleted counts as success
    pub async fn delete_affinity_group(&self, group: &AffinityGroup) -> Result<()> {
        let lookup = if group.id.is_empty() {
            Lookup::Name(&group.name)
        } else {
            Lookup::Id(&group.id)
        };
        match self.api.delete_affinity_group(lookup).await {
            Ok(()) => {
                tracing::info!("Deleted affinity group {}", lookup);
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(ReconcileError::cloud("deleteAffinityGroup")(err)),
        }
    }

    /// Groups attached to the live instance
    pub async fn get_current_affinity_groups(&self, instance_id: &str) -> Result<AffinityGroupSet> {
        let vms = self
            .api
            .list_virtual_machines(instance_id)
            .await
            .map_err(ReconcileError::cloud("listVirtualMachines"))?;
        let vm = ReconcileError::expect_one("instance", instance_id, vms)?;
        Ok(vm
            .affinitygroup
            .into_iter()
            .map(|g| to_group(g, AffinityGroupType::default()))
            .collect())
    }

    pub async fn associate_affinity_group(
        &self,
        instance_id: &str,
        group: &AffinityGroup,
        status: &mut MachineStatus,
    ) -> Result<bool> {
        self.modify(instance_id, status, |set| set.add_group(group.clone()))
            .await
    }

    pub async fn disassociate_affinity_group(
        &self,
        instance_id: &str,
        group: &AffinityGroup,
        status: &mut MachineStatus,
    ) -> Result<bool> {
        self.modify(instance_id, status, |set| {
            set.remove_group(&group.id);
        })
        .await
    }

    /// Make sure the instance is a member of every group in `group_ids`
    ///
    /// Memberships added out of band are left alone.
    pub async fn converge(
        &self,
        instance_id: &str,
        group_ids: &[String],
        status: &mut MachineStatus,
    ) -> Result<bool> {
        self.modify(instance_id, status, |set| {
            for id in group_ids {
                if !set.contains(id) {
                    set.add_group(AffinityGroup {
                        id: id.clone(),
                        ..Default::default()
                    });
                }
            }
        })
        .await
    }

    /// Apply `change` to the live membership; returns true if the instance was cycled
    async fn modify<F>(&self, instance_id: &str, status: &mut MachineStatus, change: F) -> Result<bool>
    where
        F: FnOnce(&mut AffinityGroupSet),
    {
        // finish an interrupted change before reading the baseline
        self.run_transition(instance_id, status).await?;

        let current = self.get_current_affinity_groups(instance_id).await?;
        let mut target = current.clone();
        change(&mut target);
        if target.ids() == current.ids() {
            return Ok(false);
        }

        self.begin_transition(instance_id, target.ids(), status)
            .await?;
        self.run_transition(instance_id, status).await?;
        Ok(true)
    }

    /// Stop the instance and record the pending update
    pub async fn begin_transition(
        &self,
        instance_id: &str,
        target_group_ids: Vec<String>,
        status: &mut MachineStatus,
    ) -> Result<()> {
        tracing::info!(
            "Stopping {} to change affinity groups to {:?}",
            instance_id,
            target_group_ids
        );
        self.api
            .stop_virtual_machine(instance_id)
            .await
            .map_err(ReconcileError::cloud("stopVirtualMachine"))?;
        status.transition = Some(AffinityTransition {
            target_group_ids,
            step: TransitionStep::StoppedPendingUpdate,
        });
        Ok(())
    }

    /// Drive a recorded transition to `Started`
    pub async fn run_transition(&self, instance_id: &str, status: &mut MachineStatus) -> Result<()> {
        loop {
            let Some(transition) = status.transition.as_mut() else {
                return Ok(());
            };
            let partial = |step, source| ReconcileError::PartialTransition {
                instance_id: instance_id.to_string(),
                step,
                source,
            };

            match transition.step {
                TransitionStep::Started => return Ok(()),
                TransitionStep::StoppedPendingUpdate => {
                    self.api
                        .update_vm_affinity_groups(instance_id, &transition.target_group_ids)
                        .await
                        .map_err(|e| partial(TransitionStep::StoppedPendingUpdate, e))?;
                    transition.step = TransitionStep::UpdatedPendingStart;
                }
                TransitionStep::UpdatedPendingStart => {
                    self.api
                        .start_virtual_machine(instance_id)
                        .await
                        .map_err(|e| partial(TransitionStep::UpdatedPendingStart, e))?;
                    transition.step = TransitionStep::Started;
                    tracing::info!("Started {} with new affinity groups", instance_id);
                }
            }
        }
    }
}
