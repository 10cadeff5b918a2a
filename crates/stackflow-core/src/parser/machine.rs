//! machine ノードのパース

use super::{all_strings, first_string, prop_string, required_name};
use crate::error::{FlowError, Result};
use crate::model::{DEFAULT_IDENTITY_REF_KIND, DiskOffering, IdentityReference, Machine};
use kdl::KdlNode;

/// machine ノードをパース
///
/// 例:
/// ```kdl
/// machine "cp-0" control-plane=#true {
///     zone "zone-a-id"
///     offering "Medium Instance"
///     template "ubuntu-2404"
///     affinity-group "cp-anti"
///     disk-offering "data" mount-path="/data" device="/dev/vdb" filesystem="ext4"
/// }
/// ```
pub fn parse_machine(node: &KdlNode) -> Result<Machine> {
    let mut machine = Machine::new(required_name(node, "machine")?);

    if let Some(cp) = node.get("control-plane").and_then(|v| v.as_bool()) {
        machine.control_plane = cp;
    }
    if let Some(zone) = prop_string(node, "zone") {
        machine.zone_id = zone;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "instance-id" | "instance_id" => {
                    machine.instance_id = first_string(child);
                }
                "zone" => {
                    machine.zone_id = first_string(child).unwrap_or_default();
                }
                "offering" => {
                    machine.offering = first_string(child);
                }
                "template" => {
                    machine.template = first_string(child);
                }
                "disk-offering" | "disk_offering" => {
                    machine.disk_offering = Some(parse_disk_offering(child));
                }
                "affinity-group" | "affinity_group" => {
                    // 複数指定可: affinity-group "a" "b"
                    machine.affinity_groups.extend(all_strings(child));
                }
                "affinity-group-id" | "affinity_group_id" => {
                    machine.affinity_group_ids.extend(all_strings(child));
                }
                "control-plane" | "control_plane" => {
                    machine.control_plane = child
                        .entries()
                        .first()
                        .and_then(|e| e.value().as_bool())
                        .unwrap_or(true);
                }
                "provider-id" | "provider_id" => {
                    machine.provider_id = first_string(child);
                }
                "identity-ref" | "identity_ref" => {
                    machine.identity_ref = Some(parse_identity_ref(child)?);
                }
                other => {
                    tracing::debug!(machine = %machine.name, "Ignoring unknown machine node: {}", other);
                }
            }
        }
    }

    Ok(machine)
}

fn parse_disk_offering(node: &KdlNode) -> DiskOffering {
    DiskOffering {
        id: prop_string(node, "id").unwrap_or_default(),
        name: first_string(node).unwrap_or_default(),
        mount_path: prop_string(node, "mount-path").unwrap_or_default(),
        device: prop_string(node, "device").unwrap_or_default(),
        filesystem: prop_string(node, "filesystem").unwrap_or_default(),
        label: prop_string(node, "label").unwrap_or_default(),
    }
}

/// identity-ref ノードをパース
///
/// `kind` を省略した場合は Secret 扱い
pub(super) fn parse_identity_ref(node: &KdlNode) -> Result<IdentityReference> {
    let name = first_string(node)
        .ok_or_else(|| FlowError::InvalidConfig("identity-ref requires a name".to_string()))?;
    let kind = prop_string(node, "kind").unwrap_or_else(|| DEFAULT_IDENTITY_REF_KIND.to_string());
    Ok(IdentityReference { kind, name })
}
