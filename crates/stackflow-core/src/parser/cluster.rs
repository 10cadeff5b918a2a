//! cluster ノードのパース

use super::machine::{parse_identity_ref, parse_machine};
use super::{all_strings, first_string, prop_string, required_name};
use crate::error::{FlowError, Result};
use crate::model::{AffinityGroup, AffinityGroupType, ApiEndpoint, ClusterSpec, Network, Zone};
use kdl::KdlNode;

/// cluster ノードをパース
pub fn parse_cluster(node: &KdlNode) -> Result<(String, ClusterSpec)> {
    let name = required_name(node, "cluster")?;
    let mut spec = ClusterSpec::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "zone" => {
                    spec.zones.push(parse_zone(child)?);
                }
                "account" => {
                    spec.account = first_string(child);
                }
                "domain" => {
                    spec.domain = first_string(child);
                }
                "identity-ref" | "identity_ref" => {
                    spec.identity_ref = Some(parse_identity_ref(child)?);
                }
                "control-plane-endpoint" | "control_plane_endpoint" | "endpoint" => {
                    spec.control_plane_endpoint = parse_endpoint(child)?;
                }
                "affinity-group" | "affinity_group" => {
                    spec.affinity_groups.push(parse_affinity_group(child)?);
                }
                "machine" => {
                    spec.machines.push(parse_machine(child)?);
                }
                other => {
                    tracing::debug!(cluster = %name, "Ignoring unknown cluster node: {}", other);
                }
            }
        }
    }

    Ok((name, spec))
}

/// zone ノードをパース
///
/// 形式: `zone "zone-a" id="..." { network "net" id="..." type="Isolated" }`
fn parse_zone(node: &KdlNode) -> Result<Zone> {
    let mut zone = Zone {
        name: first_string(node).unwrap_or_default(),
        id: prop_string(node, "id").unwrap_or_default(),
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "network" {
                zone.network = parse_network(child)?;
            }
        }
    }

    Ok(zone)
}

fn parse_network(node: &KdlNode) -> Result<Network> {
    let network_type = match prop_string(node, "type") {
        Some(t) => Some(t.parse().map_err(FlowError::InvalidConfig)?),
        None => None,
    };

    Ok(Network {
        id: prop_string(node, "id").unwrap_or_default(),
        name: first_string(node).unwrap_or_default(),
        network_type,
    })
}

/// control-plane-endpoint ノードをパース
///
/// 形式: `control-plane-endpoint host="10.0.0.5" port=6443`
/// または位置引数 `control-plane-endpoint "10.0.0.5" 6443`
fn parse_endpoint(node: &KdlNode) -> Result<ApiEndpoint> {
    let host = prop_string(node, "host")
        .or_else(|| first_string(node))
        .unwrap_or_default();

    let port = node
        .get("port")
        .and_then(|v| v.as_integer())
        .or_else(|| {
            node.entries()
                .iter()
                .filter(|e| e.name().is_none())
                .find_map(|e| e.value().as_integer())
        })
        .unwrap_or(0);

    let port = u16::try_from(port)
        .map_err(|_| FlowError::InvalidConfig(format!("invalid endpoint port: {}", port)))?;

    Ok(ApiEndpoint { host, port })
}

/// affinity-group ノードをパース
///
/// 形式: `affinity-group "cp-anti" type="host anti-affinity" id="..."`
fn parse_affinity_group(node: &KdlNode) -> Result<AffinityGroup> {
    let names = all_strings(node);
    let name = names.first().cloned().unwrap_or_default();
    let id = prop_string(node, "id").unwrap_or_default();

    if name.is_empty() && id.is_empty() {
        return Err(FlowError::InvalidConfig(
            "affinity-group requires a name or id".to_string(),
        ));
    }

    let group_type = match prop_string(node, "type") {
        Some(t) => t.parse::<AffinityGroupType>().map_err(FlowError::InvalidConfig)?,
        None => AffinityGroupType::default(),
    };

    Ok(AffinityGroup {
        id,
        name,
        group_type,
    })
}
