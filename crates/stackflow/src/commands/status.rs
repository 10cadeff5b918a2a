use crate::utils;
use colored::Colorize;
use stackflow_cloud::ClusterRecord;
use stackflow_config::Settings;
use std::path::Path;

pub async fn handle(
    settings: &Settings,
    root: &Path,
    cluster: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let store = utils::store_for(settings, root);
    let state = store.load().await?;

    let records: Vec<&ClusterRecord> = match &cluster {
        Some(name) => vec![
            state
                .get_cluster(name)
                .ok_or_else(|| anyhow::anyhow!("クラスタ '{}' のステータスがありません", name))?,
        ],
        None => state.clusters.values().collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("{}", "クラスタはありません".dimmed());
        println!("  {} で作成できます", "stack reconcile".cyan());
        return Ok(());
    }

    for record in records {
        print_record(record);
        println!();
    }
    Ok(())
}

fn print_record(record: &ClusterRecord) {
    let status = &record.status;
    let state = if record.metadata.is_being_deleted() {
        "削除中".yellow()
    } else if status.ready {
        "Ready".green()
    } else if status.failure_reason.is_some() {
        "Failed".red()
    } else {
        "Reconciling".yellow()
    };
    println!("{} {} [{}]", "■".cyan(), record.metadata.name.bold(), state);

    let or_dash = |v: Option<&str>| v.unwrap_or("-").to_string();
    println!("  ネットワーク: {}", or_dash(status.network_id.as_deref()));
    if let Some(network_type) = &status.network_type {
        println!("  タイプ: {}", network_type);
    }
    println!(
        "  エンドポイント: {}",
        or_dash(
            record
                .spec
                .control_plane_endpoint
                .is_host_set()
                .then_some(record.spec.control_plane_endpoint.host.as_str())
                .or(status.control_plane_host.as_deref())
        )
    );
    if let Some(ip) = &status.public_ip_id {
        println!("  パブリックIP: {}", ip);
    }
    if let Some(rule) = &status.lb_rule_id {
        println!("  LBルール: {}", rule);
    }

    println!("  ゾーン: {}個", status.zones.len());
    for zone in status.zones.values() {
        println!(
            "    - {} ({}) network={}",
            zone.name.cyan(),
            zone.id,
            or_dash(Some(zone.network.id.as_str()).filter(|id| !id.is_empty()))
        );
    }

    if !status.affinity_groups.is_empty() {
        println!("  アフィニティグループ: {}個", status.affinity_groups.len());
        for group in status.affinity_groups.iter() {
            println!("    - {} ({})", group.name.cyan(), group.id);
        }
    }

    if !record.machines.is_empty() {
        println!("  マシン: {}個", record.machines.len());
        for (name, machine) in &record.machines {
            let mark = if machine.ready {
                "✓".green()
            } else if machine.is_mid_transition() {
                "!".red()
            } else {
                "…".yellow()
            };
            print!("    {} {}", mark, name.cyan());
            if let Some(transition) = machine.transition.as_ref().filter(|_| machine.is_mid_transition()) {
                print!(" (アフィニティ変更の途中: {})", transition.step);
            }
            println!();
            if let Some(message) = &machine.failure_message {
                println!("      {}", message.red());
            }
        }
    }

    if let (Some(reason), Some(message)) = (&status.failure_reason, &status.failure_message) {
        println!("  {} {}: {}", "✗".red(), reason.red(), message);
    } else if let Some(message) = &status.message {
        println!("  {}", message.dimmed());
    }
    if let Some(at) = record.last_reconciled_at {
        println!("  最終リコンサイル: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
}
