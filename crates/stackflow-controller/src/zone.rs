//! Zone & failure-domain resolver

use crate::action::StageOutcome;
use crate::error::{REQUEUE_TRANSIENT, ReconcileError, Result};
use stackflow_cloud::{CloudStackApi, Lookup};
use stackflow_core::{ClusterTopology, FailureDomainSpec, ZoneStatus};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct ZoneResolver {
    api: Arc<dyn CloudStackApi>,
}

impl ZoneResolver {
    pub fn new(api: Arc<dyn CloudStackApi>) -> Self {
        Self { api }
    }

    /// Snapshot every declared zone the provider knows about
    ///
    /// Returns the number of zones discovered in this pass. A zone with no
    /// match that still holds a resolved network keeps its snapshot, marked
    /// missing, so teardown can release that network. A network already
    /// resolved for a zone is carried over.
    pub async fn resolve_zones(&self, topology: &mut ClusterTopology) -> Result<usize> {
        let mut resolved = BTreeMap::new();
        let mut discovered = 0;

        for zone in &topology.spec.zones {
            let lookup = if zone.id.is_empty() {
                Lookup::Name(&zone.name)
            } else {
                Lookup::Id(&zone.id)
            };
            let mut matches = self
                .api
                .list_zones(lookup)
                .await
                .map_err(ReconcileError::cloud("listZones"))?;

            let record = match matches.len() {
                0 => {
                    tracing::debug!("Zone {} not discovered yet", zone.display_key());
                    if let Some(previous) = topology
                        .status
                        .zones
                        .values()
                        .find(|z| {
                            if zone.id.is_empty() {
                                z.name == zone.name
                            } else {
                                z.id == zone.id
                            }
                        })
                        .filter(|z| !z.network.id.is_empty())
                    {
                        resolved.insert(
                            previous.id.clone(),
                            ZoneStatus {
                                missing: true,
                                ..previous.clone()
                            },
                        );
                    }
                    continue;
                }
                1 => matches.remove(0),
                count => {
                    return Err(ReconcileError::AmbiguousMatch {
                        kind: "zone",
                        key: zone.display_key().to_string(),
                        count,
                    });
                }
            };

            let network = topology
                .status
                .zones
                .get(&record.id)
                .map(|z| z.network.clone())
                .filter(|n| !n.id.is_empty())
                .unwrap_or_else(|| zone.network.clone());

            discovered += 1;
            resolved.insert(
                record.id.clone(),
                ZoneStatus {
                    id: record.id,
                    name: record.name,
                    network,
                    missing: false,
                },
            );
        }

        topology.status.zones = resolved;
        Ok(discovered)
    }

    /// Declared and discovered zone counts must agree
    pub fn verify_zones(&self, topology: &ClusterTopology) -> StageOutcome {
        let expected = topology.spec.zones.len();
        let actual = topology.status.zones.values().filter(|z| !z.missing).count();
        if expected != actual {
            return StageOutcome::requeue(
                REQUEUE_TRANSIENT,
                format!("Expected {} Zones, but found {}", expected, actual),
            );
        }
        StageOutcome::Continue
    }

    /// Rebuild the failure-domain map from the discovered zones
    pub fn set_failure_domains(&self, topology: &mut ClusterTopology) {
        topology.status.failure_domains = topology
            .status
            .zones
            .values()
            .filter(|z| !z.missing)
            .map(|z| (z.id.clone(), FailureDomainSpec { control_plane: true }))
            .collect();
    }
}
