use super::reconcile::{reconcile_cluster, wait_holding};
use crate::utils::{self, Project};
use colored::Colorize;
use stackflow_controller::{ClusterController, MachineController};

pub async fn handle(project: &Project, cluster: &str, yes: bool) -> anyhow::Result<()> {
    let store = project.store();
    let lock = store.acquire_lock().await?;
    let mut state = store.load().await?;

    let Some(record) = state.get_cluster_mut(cluster) else {
        println!(
            "{}",
            format!("クラスタ '{}' のステータスがありません（作成されていません）", cluster).yellow()
        );
        lock.release().await?;
        return Ok(());
    };

    if !yes
        && !utils::confirm(&format!(
            "クラスタ '{}' のネットワーク・パブリックIP・アフィニティグループを削除します。よろしいですか？",
            cluster
        ))?
    {
        println!("{}", "キャンセルしました".yellow());
        lock.release().await?;
        return Ok(());
    }

    if record.metadata.deletion_timestamp.is_none() {
        record.metadata.deletion_timestamp = Some(chrono::Utc::now());
    }
    // 宣言から消えていても、最後に適用した spec でティアダウンできる
    let spec = project
        .stack
        .cluster(cluster)
        .cloned()
        .unwrap_or_else(|| record.spec.clone());
    store.save(&state).await?;
    println!("{}", format!("クラスタ '{}' を削除中...", cluster).yellow());

    let api = project.connect().await?;
    let config = project.controller_config();
    let clusters = ClusterController::new(api.clone(), config.clone());
    let machines = MachineController::new(api, &config);

    let result = loop {
        if let Err(e) = lock.refresh().await {
            break Err(e.into());
        }
        let existing = state.get_cluster(cluster).cloned();
        let pass = reconcile_cluster(&clusters, &machines, cluster.to_string(), spec.clone(), existing)
            .await;
        pass.print();

        let Some(record) = pass.record else {
            state.remove_cluster(cluster);
            store.save(&state).await?;
            println!("{}", format!("✓ クラスタ '{}' を削除しました", cluster).green());
            break Ok(());
        };
        state.set_cluster(record);
        store.save(&state).await?;

        let Some(delay) = pass.requeue_after else {
            break Err(anyhow::anyhow!(
                "クラスタ '{}' のティアダウンに失敗しました（ファイナライザーは残っています）",
                cluster
            ));
        };
        println!(
            "{}",
            format!("{} 秒後に再試行します (Ctrl-Cで中断)", delay.as_secs()).dimmed()
        );
        match wait_holding(&lock, delay).await {
            Ok(true) => {}
            Ok(false) => {
                println!("{}", "中断しました。再度 stack delete で再開できます".yellow());
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    lock.release().await?;
    result
}
