use crate::utils::Project;
use colored::Colorize;
use stackflow_controller::MachineController;

#[derive(Clone, Copy)]
enum Change {
    Associate,
    Dissociate,
}

pub async fn handle_associate(
    project: &Project,
    cluster: &str,
    machine: &str,
    group: &str,
) -> anyhow::Result<()> {
    handle(project, cluster, machine, group, Change::Associate).await
}

pub async fn handle_dissociate(
    project: &Project,
    cluster: &str,
    machine: &str,
    group: &str,
) -> anyhow::Result<()> {
    handle(project, cluster, machine, group, Change::Dissociate).await
}

async fn handle(
    project: &Project,
    cluster: &str,
    machine_name: &str,
    group: &str,
    change: Change,
) -> anyhow::Result<()> {
    let spec = project
        .stack
        .cluster(cluster)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("クラスタ '{}' が見つかりません", cluster))?;

    let store = project.store();
    let lock = store.acquire_lock().await?;
    let mut state = store.load().await?;
    let record = state
        .get_cluster_mut(cluster)
        .ok_or_else(|| anyhow::anyhow!("クラスタ '{}' はまだリコンサイルされていません", cluster))?;

    let topology = record.to_topology(spec);
    let machine = topology
        .machine(machine_name)
        .ok_or_else(|| anyhow::anyhow!("マシン '{}' が見つかりません", machine_name))?;

    let api = project.connect().await?;
    let controller = MachineController::new(api, &project.controller_config());
    let status = record.machines.entry(machine.name.clone()).or_default();

    let result = match change {
        Change::Associate => {
            println!("{} を {} に追加中...", machine.name.cyan(), group.cyan());
            controller.associate(&topology, machine, group, status).await
        }
        Change::Dissociate => {
            println!("{} を {} から外し中...", machine.name.cyan(), group.cyan());
            controller.dissociate(&topology, machine, group, status).await
        }
    };

    // 途中で失敗しても遷移ステップは保存する
    store.save(&state).await?;
    lock.release().await?;

    match result? {
        true => println!("{}", "✓ アフィニティグループを更新しました".green()),
        false => println!("{}", "変更はありません".dimmed()),
    }
    Ok(())
}
