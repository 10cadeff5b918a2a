use crate::utils::{self, Project};
use colored::Colorize;
use stackflow_config::Settings;
use stackflow_core::{CLUSTER_FINALIZER, validate_create, validate_update};
use std::path::PathBuf;

pub async fn handle(file: Option<PathBuf>, settings: &Settings) -> anyhow::Result<()> {
    println!("{}", "設定を検証中...".blue());

    let project = match Project::load(file, settings.clone()) {
        Ok(project) => project,
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ stack.kdl を読み込めません".red().bold());
            eprintln!("  {}", e);
            eprintln!();
            eprintln!("stack.kdl が存在するディレクトリで実行するか、--file で指定してください");
            std::process::exit(1);
        }
    };
    println!(
        "設定ファイル: {}",
        project.stack_path.display().to_string().cyan()
    );

    if project.stack.clusters.is_empty() {
        eprintln!("{}", "✗ クラスタが定義されていません".red().bold());
        std::process::exit(1);
    }

    // 作成済みクラスタは前回適用した宣言との差分も検証
    let state = utils::store_for(settings, &project.root).load().await?;

    let mut errors = Vec::new();
    for (name, spec) in &project.stack.clusters {
        if let Err(e) = validate_create(name, spec) {
            errors.push(e.to_string());
            continue;
        }
        if let Some(record) = state.get_cluster(name)
            && record.metadata.has_finalizer(CLUSTER_FINALIZER)
            && let Err(e) = validate_update(
                name,
                &record.spec,
                record.status.control_plane_host.as_deref(),
                spec,
            )
        {
            errors.push(e.to_string());
        }
    }

    if !errors.is_empty() {
        eprintln!();
        eprintln!("{}", "✗ 設定エラー".red().bold());
        for error in &errors {
            eprintln!("  {}", error);
        }
        std::process::exit(1);
    }

    println!("{}", "✓ 設定ファイルは正常です！".green().bold());
    println!();
    println!("サマリー:");
    println!("  クラスタ: {}個", project.stack.clusters.len());
    for (name, spec) in &project.stack.clusters {
        println!(
            "    - {} (ゾーン {}個, マシン {}個, アフィニティグループ {}個)",
            name.cyan(),
            spec.zones.len(),
            spec.machines.len(),
            spec.affinity_groups.len()
        );
        for zone in &spec.zones {
            let network = if zone.network.name.is_empty() {
                zone.network.id.as_str()
            } else {
                zone.network.name.as_str()
            };
            println!("        {} → {}", zone.display_key(), network);
        }
    }

    Ok(())
}
