use colored::Colorize;
use stackflow_cloud::{CloudStackApi, StatusStore};
use stackflow_cloud_cloudstack::CloudStackProvider;
use stackflow_config::Settings;
use stackflow_controller::{ControllerConfig, DEFAULT_NETWORK_OFFERING, ReconcileReport, StageStatus};
use stackflow_core::ClusterSpec;
use stackflow_core::parser::StackFile;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 読み込んだ stack.kdl と実行時設定
pub struct Project {
    pub stack_path: PathBuf,
    pub root: PathBuf,
    pub stack: StackFile,
    pub settings: Settings,
}

impl Project {
    pub fn load(file: Option<PathBuf>, settings: Settings) -> anyhow::Result<Self> {
        let stack_path = match file {
            Some(path) => path,
            None => stackflow_config::find_stack_file()?,
        };
        let stack = stackflow_core::parse_kdl_file(&stack_path)?;
        tracing::debug!(
            "{} から {} 個のクラスタを読み込み",
            stack_path.display(),
            stack.clusters.len()
        );

        Ok(Self {
            root: root_of(&stack_path),
            stack_path,
            stack,
            settings,
        })
    }

    /// stack.kdl が見つからなければカレントディレクトリ
    pub fn locate_root(file: Option<PathBuf>) -> anyhow::Result<PathBuf> {
        let found = file.map(Ok).unwrap_or_else(stackflow_config::find_stack_file);
        match found {
            Ok(path) => Ok(root_of(&path)),
            Err(_) => Ok(std::env::current_dir()?),
        }
    }

    pub fn store(&self) -> StatusStore {
        store_for(&self.settings, &self.root)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            resync_period: self.settings.resync_period(),
            network_offering: self
                .settings
                .network_offering
                .clone()
                .unwrap_or_else(|| DEFAULT_NETWORK_OFFERING.to_string()),
        }
    }

    /// 対象クラスタ（名前指定なしなら宣言順に全件）
    pub fn targets(&self, cluster: Option<&str>) -> anyhow::Result<Vec<(String, ClusterSpec)>> {
        match cluster {
            Some(name) => {
                let spec = self.stack.cluster(name).ok_or_else(|| {
                    anyhow::anyhow!(
                        "クラスタ '{}' が見つかりません\n利用可能なクラスタ: {}",
                        name,
                        self.stack.names().join(", ")
                    )
                })?;
                Ok(vec![(name.to_string(), spec.clone())])
            }
            None if self.stack.clusters.is_empty() => Err(anyhow::anyhow!(
                "{} にクラスタが定義されていません",
                self.stack_path.display()
            )),
            None => Ok(self.stack.clusters.clone()),
        }
    }

    /// cloud-config を読み、cmk 経由でCloudStackに接続
    pub async fn connect(&self) -> anyhow::Result<Arc<dyn CloudStackApi>> {
        println!("{}", "CloudStackに接続中...".blue());
        let cloud_config = self.settings.cloud_config_path(&self.root);
        let work_dir = state_root(&self.settings, &self.root).join(".stackflow");
        let provider = CloudStackProvider::connect(
            &cloud_config,
            &self.settings.cmk_binary,
            &work_dir,
            self.settings.request_timeout(),
        )
        .await?;
        ensure_reachable(&provider).await?;
        Ok(Arc::new(provider))
    }
}

/// 認証情報が受け付けられ、APIが応答することを確認
pub async fn ensure_reachable(api: &dyn CloudStackApi) -> anyhow::Result<()> {
    let status = api.check_auth().await?;
    if !status.authenticated {
        anyhow::bail!(
            "{} に接続できません: {}",
            api.name(),
            status.error.unwrap_or_default()
        );
    }
    tracing::info!(
        "{} に接続しました ({})",
        api.name(),
        status.account_info.unwrap_or_default()
    );
    Ok(())
}

fn root_of(stack_path: &Path) -> PathBuf {
    let parent = stack_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    // ./.stackflow/stack.kdl の場合はプロジェクトルートまで上がる
    if parent.file_name().is_some_and(|n| n == ".stackflow") {
        parent.parent().map(Path::to_path_buf).unwrap_or(parent)
    } else {
        parent
    }
}

fn state_root(settings: &Settings, root: &Path) -> PathBuf {
    if settings.state_dir.is_absolute() {
        settings.state_dir.clone()
    } else {
        root.join(&settings.state_dir)
    }
}

pub fn store_for(settings: &Settings, root: &Path) -> StatusStore {
    StatusStore::new(state_root(settings, root))
}

/// ステージごとの結果を表示
pub fn print_report(report: &ReconcileReport) {
    println!(
        "{} {} ({})",
        "■".cyan(),
        report.cluster.bold(),
        report.phase.dimmed()
    );
    for stage in &report.stages {
        match &stage.status {
            StageStatus::Completed => {
                println!("  {} {} ({}ms)", "✓".green(), stage.stage, stage.elapsed_ms);
            }
            StageStatus::Requeued(reason) => {
                println!("  {} {}: {}", "↻".yellow(), stage.stage, reason.yellow());
            }
            StageStatus::Failed(error) => {
                println!("  {} {}: {}", "✗".red(), stage.stage, error.red());
            }
        }
    }

    let summary = report.summary();
    let line = format!("  {} ({}ms)", summary, report.duration_ms);
    if summary.failed > 0 {
        println!("{}", line.red());
    } else if summary.requeued > 0 {
        println!("{}", line.yellow());
    } else {
        println!("{}", line.green());
    }
}

/// y/N の確認
pub fn confirm(prompt: &str) -> anyhow::Result<bool> {
    use std::io::Write;

    print!("{} [y/N]: ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
