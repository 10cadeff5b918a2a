use crate::utils::{self, Project};
use colored::Colorize;
use futures_util::stream::{self, StreamExt};
use stackflow_cloud::{ClusterRecord, StateLock, StatusStore};
use stackflow_controller::{ClusterController, ControllerConfig, MachineController, ReconcileReport};
use stackflow_core::{CLUSTER_FINALIZER, ClusterSpec, ClusterTopology, validate_update};
use std::time::Duration;

/// 1クラスタ分のリコンサイル結果
pub struct ClusterPass {
    pub name: String,
    /// None ならストアから削除する
    pub record: Option<ClusterRecord>,
    pub reports: Vec<ReconcileReport>,
    pub requeue_after: Option<Duration>,
    pub errors: Vec<String>,
}

impl ClusterPass {
    fn rejected(name: String, record: Option<ClusterRecord>, error: String) -> Self {
        Self {
            name,
            record,
            reports: Vec::new(),
            requeue_after: None,
            errors: vec![error],
        }
    }

    pub fn print(&self) {
        for report in &self.reports {
            utils::print_report(report);
        }
        for error in &self.errors {
            eprintln!("  {} {}", "✗".red(), error);
        }
    }
}

/// クラスタとそのマシンを1回ずつリコンサイル
pub async fn reconcile_cluster(
    clusters: &ClusterController,
    machines: &MachineController,
    name: String,
    spec: ClusterSpec,
    existing: Option<ClusterRecord>,
) -> ClusterPass {
    let mut topology = match &existing {
        Some(record) => {
            // 作成済み（ファイナライザーあり）のクラスタだけ宣言変更を検証
            if record.metadata.has_finalizer(CLUSTER_FINALIZER)
                && !record.metadata.is_being_deleted()
                && record.spec != spec
                && let Err(e) = validate_update(
                    &name,
                    &record.spec,
                    record.status.control_plane_host.as_deref(),
                    &spec,
                )
            {
                return ClusterPass::rejected(name, Some(record.clone()), e.to_string());
            }
            record.to_topology(spec)
        }
        None => ClusterTopology::new(name.clone(), spec),
    };

    let (report, result) = clusters.reconcile_with_report(&mut topology).await;
    let mut reports = vec![report];
    let mut errors = Vec::new();
    let mut requeue_after = match result {
        Ok(action) => action.requeue_after(),
        Err(e) => {
            let after = e.requeue_after();
            errors.push(format!("{}: {}", name, e));
            after
        }
    };

    let mut record = existing.unwrap_or_default();
    if !topology.metadata.is_being_deleted() {
        // 途中まで進んだアフィニティ変更は宣言から消えても記録を残す
        record.machines.retain(|machine, status| {
            let declared = topology.machine(machine).is_some();
            if !declared && status.is_mid_transition() {
                tracing::warn!(
                    "{}/{}: 宣言にないマシンのアフィニティ変更が途中です ({})",
                    name,
                    machine,
                    status.transition.as_ref().map(|t| t.step.to_string()).unwrap_or_default()
                );
            }
            declared || status.is_mid_transition()
        });
        for machine in &topology.spec.machines {
            let status = record.machines.entry(machine.name.clone()).or_default();
            let (report, result) = machines
                .reconcile_with_report(&topology, machine, status)
                .await;
            reports.push(report);
            let after = match result {
                Ok(action) => action.requeue_after(),
                Err(e) => {
                    let after = e.requeue_after();
                    errors.push(format!("{}/{}: {}", name, machine.name, e));
                    after
                }
            };
            requeue_after = earliest(requeue_after, after);
        }
    }

    record.update_from(&topology);
    let released =
        topology.metadata.is_being_deleted() && !topology.metadata.has_finalizer(CLUSTER_FINALIZER);

    ClusterPass {
        name,
        record: if released { None } else { Some(record) },
        reports,
        requeue_after,
        errors,
    }
}

fn earliest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// 1パス分の集計
pub struct PassSummary {
    pub requeue_after: Option<Duration>,
    pub failed: usize,
}

/// 全対象を最大 `workers` 並列でリコンサイルし、完了したクラスタから順に保存
pub async fn run_pass(
    store: &StatusStore,
    clusters: &ClusterController,
    machines: &MachineController,
    targets: &[(String, ClusterSpec)],
    workers: usize,
) -> anyhow::Result<PassSummary> {
    let mut state = store.load().await?;
    let jobs: Vec<_> = targets
        .iter()
        .map(|(name, spec)| (name.clone(), spec.clone(), state.get_cluster(name).cloned()))
        .collect();

    let mut passes = stream::iter(jobs)
        .map(|(name, spec, existing)| reconcile_cluster(clusters, machines, name, spec, existing))
        .buffer_unordered(workers.max(1));

    let mut summary = PassSummary {
        requeue_after: None,
        failed: 0,
    };
    while let Some(pass) = passes.next().await {
        pass.print();
        if !pass.errors.is_empty() {
            summary.failed += 1;
        }
        summary.requeue_after = earliest(summary.requeue_after, pass.requeue_after);

        match pass.record {
            Some(record) => state.set_cluster(record),
            None => {
                state.remove_cluster(&pass.name);
                println!("{}", format!("✓ {} を削除しました", pass.name).green());
            }
        }
        store.save(&state).await?;
    }

    Ok(summary)
}

/// ロックを更新しながら `delay` だけ待つ間隔
const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// ロックを保持したまま `delay` 待機する。Ctrl-C で false
///
/// ロックは1時間で stale 扱いになるので、長い待機中も定期的に更新する。
pub async fn wait_holding(lock: &StateLock, delay: Duration) -> anyhow::Result<bool> {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(true);
        }
        let step = (deadline - now).min(LOCK_REFRESH_INTERVAL);
        tokio::select! {
            _ = tokio::time::sleep(step) => lock.refresh().await?,
            _ = tokio::signal::ctrl_c() => return Ok(false),
        }
    }
}

pub async fn handle(
    project: &Project,
    cluster: Option<String>,
    watch: bool,
    workers: usize,
) -> anyhow::Result<()> {
    let targets = project.targets(cluster.as_deref())?;
    println!(
        "{}",
        format!("{} 個のクラスタをリコンサイル (workers: {})", targets.len(), workers).bold()
    );

    let api = project.connect().await?;
    let config: ControllerConfig = project.controller_config();
    let clusters = ClusterController::new(api.clone(), config.clone());
    let machines = MachineController::new(api, &config);

    let store = project.store();
    let lock = store.acquire_lock().await?;

    let result = loop {
        if let Err(e) = lock.refresh().await {
            break Err(e.into());
        }
        let pass = run_pass(&store, &clusters, &machines, &targets, workers);
        let summary = tokio::select! {
            summary = pass => summary,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("{}", "中断しました（保存済みのステータスから再開できます）".yellow());
                break Ok(());
            }
        };
        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => break Err(e),
        };

        if !watch {
            break if summary.failed > 0 {
                Err(anyhow::anyhow!(
                    "{} 個のクラスタでエラーが発生しました",
                    summary.failed
                ))
            } else {
                Ok(())
            };
        }

        let delay = summary.requeue_after.unwrap_or(config.resync_period);
        println!(
            "{}",
            format!("次のリコンサイルまで {} 秒待機 (Ctrl-Cで停止)", delay.as_secs()).dimmed()
        );
        match wait_holding(&lock, delay).await {
            Ok(true) => {}
            Ok(false) => {
                println!("{}", "停止しました".yellow());
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    lock.release().await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackflow_cloud::testing::FakeCloudStack;
    use stackflow_core::{AffinityTransition, MachineStatus, Network, TransitionStep, Zone};
    use std::sync::Arc;

    fn spec() -> ClusterSpec {
        ClusterSpec {
            zones: vec![Zone {
                id: String::new(),
                name: "zone-a".to_string(),
                network: Network::named("prod-net"),
            }],
            ..Default::default()
        }
    }

    fn fake() -> Arc<FakeCloudStack> {
        let fake = FakeCloudStack::new();
        fake.add_zone("z-1", "zone-a");
        fake.add_network("n-1", "prod-net", "Shared");
        Arc::new(fake)
    }

    fn controllers(fake: Arc<FakeCloudStack>) -> (ClusterController, MachineController) {
        let config = ControllerConfig::default();
        let api: Arc<dyn stackflow_cloud::CloudStackApi> = fake;
        (
            ClusterController::new(api.clone(), config.clone()),
            MachineController::new(api, &config),
        )
    }

    #[tokio::test]
    async fn test_first_pass_creates_record() {
        let (clusters, machines) = controllers(fake());
        let mut spec = spec();
        spec.control_plane_endpoint.host = "10.0.0.5".to_string();

        let pass = reconcile_cluster(&clusters, &machines, "prod".to_string(), spec, None).await;

        assert!(pass.errors.is_empty(), "{:?}", pass.errors);
        let record = pass.record.unwrap();
        assert!(record.metadata.has_finalizer(CLUSTER_FINALIZER));
        assert_eq!(record.status.network_id.as_deref(), Some("n-1"));
        assert!(record.last_reconciled_at.is_some());
    }

    #[tokio::test]
    async fn test_zone_change_rejected_for_created_cluster() {
        let (clusters, machines) = controllers(fake());
        let mut original = spec();
        original.control_plane_endpoint.host = "10.0.0.5".to_string();
        let first =
            reconcile_cluster(&clusters, &machines, "prod".to_string(), original.clone(), None)
                .await;
        let record = first.record.unwrap();

        let mut changed = original;
        changed.zones[0].name = "zone-b".to_string();
        let pass = reconcile_cluster(
            &clusters,
            &machines,
            "prod".to_string(),
            changed,
            Some(record.clone()),
        )
        .await;

        assert_eq!(pass.errors.len(), 1);
        assert!(pass.reports.is_empty());
        assert_eq!(pass.record, Some(record));
    }

    /// 払い出されたアドレスと異なるホストは宣言できない
    #[tokio::test]
    async fn test_assigned_host_cannot_be_redeclared() {
        let fake = Arc::new(FakeCloudStack::new());
        fake.add_zone("z-1", "zone-a");
        fake.add_offering("off-1", stackflow_controller::DEFAULT_NETWORK_OFFERING);
        fake.add_public_ip("ip-1", "203.0.113.10", None);
        fake.add_public_ip("ip-2", "203.0.113.20", None);
        let (clusters, machines) = controllers(fake.clone());

        let first =
            reconcile_cluster(&clusters, &machines, "prod".to_string(), spec(), None).await;
        assert!(first.errors.is_empty(), "{:?}", first.errors);
        let record = first.record.unwrap();
        assert_eq!(record.status.public_ip_id.as_deref(), Some("ip-1"));
        assert_eq!(record.status.control_plane_host.as_deref(), Some("203.0.113.10"));

        fake.clear_calls();
        let mut changed = spec();
        changed.control_plane_endpoint.host = "203.0.113.20".to_string();
        let pass = reconcile_cluster(
            &clusters,
            &machines,
            "prod".to_string(),
            changed,
            Some(record.clone()),
        )
        .await;

        assert_eq!(pass.errors.len(), 1);
        assert!(pass.errors[0].contains("spec.controlPlaneEndpoint.host"));
        assert_eq!(pass.record, Some(record));
        assert_eq!(fake.count("associateIpAddress"), 0);
        assert!(fake.mutations().is_empty());

        // 払い出し済みのアドレスをそのまま書くのは可
        let mut pinned = spec();
        pinned.control_plane_endpoint.host = "203.0.113.10".to_string();
        let pass = reconcile_cluster(
            &clusters,
            &machines,
            "prod".to_string(),
            pinned,
            pass.record,
        )
        .await;
        assert!(pass.errors.is_empty(), "{:?}", pass.errors);
        assert_eq!(
            pass.record.unwrap().status.public_ip_id.as_deref(),
            Some("ip-1")
        );
    }

    #[tokio::test]
    async fn test_deleted_cluster_drops_record() {
        let fake = fake();
        let (clusters, machines) = controllers(fake.clone());
        let mut spec = spec();
        spec.control_plane_endpoint.host = "10.0.0.5".to_string();
        let first =
            reconcile_cluster(&clusters, &machines, "prod".to_string(), spec.clone(), None).await;

        let mut record = first.record.unwrap();
        record.metadata.deletion_timestamp = Some(chrono::Utc::now());
        let pass =
            reconcile_cluster(&clusters, &machines, "prod".to_string(), spec, Some(record)).await;

        assert!(pass.errors.is_empty(), "{:?}", pass.errors);
        assert!(pass.record.is_none());
        // 共有ネットワークは作成していないので残る
        assert!(fake.network_exists("n-1"));
    }

    #[tokio::test]
    async fn test_wait_holding_keeps_lock_fresh() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(temp_dir.path());
        let lock = store.acquire_lock().await.unwrap();

        assert!(wait_holding(&lock, Duration::from_millis(10)).await.unwrap());
        assert!(store.acquire_lock().await.is_err());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_undeclared_machine_mid_transition_is_kept() {
        let (clusters, machines) = controllers(fake());
        let mut spec = spec();
        spec.control_plane_endpoint.host = "10.0.0.5".to_string();
        let first =
            reconcile_cluster(&clusters, &machines, "prod".to_string(), spec.clone(), None).await;
        let mut record = first.record.unwrap();

        let stopped = MachineStatus {
            instance_id: Some("vm-1".to_string()),
            transition: Some(AffinityTransition {
                target_group_ids: vec!["ag-1".to_string()],
                step: TransitionStep::StoppedPendingUpdate,
            }),
            ..Default::default()
        };
        let finished = MachineStatus {
            instance_id: Some("vm-2".to_string()),
            ..Default::default()
        };
        record.machines.insert("cp-0".to_string(), stopped.clone());
        record.machines.insert("cp-1".to_string(), finished);

        let pass =
            reconcile_cluster(&clusters, &machines, "prod".to_string(), spec, Some(record)).await;

        let record = pass.record.unwrap();
        assert_eq!(record.machines.get("cp-0"), Some(&stopped));
        assert!(!record.machines.contains_key("cp-1"));
    }

    #[test]
    fn test_earliest() {
        let s = Duration::from_secs;
        assert_eq!(earliest(Some(s(30)), Some(s(5))), Some(s(5)));
        assert_eq!(earliest(None, Some(s(5))), Some(s(5)));
        assert_eq!(earliest(Some(s(30)), None), Some(s(30)));
        assert_eq!(earliest(None, None), None);
    }
}
