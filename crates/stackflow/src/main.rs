mod commands;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stack")]
#[command(about = "宣言したクラスタ構成を、CloudStack に収束させる。", long_about = None)]
struct Cli {
    /// stack.kdl のパス（省略時は自動検出）
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// デバッグログを表示
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 宣言をCloudStackに反映（リコンサイル）
    Reconcile {
        /// クラスタ名（省略時は全クラスタ）
        cluster: Option<String>,
        /// 収束後も再リコンサイルを続ける（Ctrl-Cで停止）
        #[arg(short, long)]
        watch: bool,
        /// 同時に処理するクラスタ数
        #[arg(long)]
        workers: Option<usize>,
    },
    /// クラスタを削除（ファイナライザーが外れるまでティアダウン）
    Delete {
        /// クラスタ名
        cluster: String,
        /// 確認プロンプトをスキップ
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// 保存されたステータスを表示
    Status {
        /// クラスタ名（省略時は全クラスタ）
        cluster: Option<String>,
        /// JSONで出力
        #[arg(long)]
        json: bool,
    },
    /// 設定を検証
    Validate,
    /// マシンのアフィニティグループを操作
    #[command(subcommand)]
    Machine(MachineCommands),
    /// バージョン情報を表示
    Version,
}

#[derive(Subcommand)]
enum MachineCommands {
    /// マシンをアフィニティグループに追加
    Associate {
        /// クラスタ名
        cluster: String,
        /// マシン名
        machine: String,
        /// アフィニティグループ名またはID
        group: String,
    },
    /// マシンをアフィニティグループから外す
    Dissociate {
        /// クラスタ名
        cluster: String,
        /// マシン名
        machine: String,
        /// アフィニティグループ名またはID
        group: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログはstderrに出力。RUST_LOG が優先、-v で debug
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Versionコマンドは設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("stackflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = stackflow_config::Settings::load()?;
    let file = cli.file;

    match cli.command {
        Commands::Reconcile {
            cluster,
            watch,
            workers,
        } => {
            let project = utils::Project::load(file, settings)?;
            let workers = workers.unwrap_or(project.settings.workers).max(1);
            commands::reconcile::handle(&project, cluster, watch, workers).await?;
        }
        Commands::Delete { cluster, yes } => {
            let project = utils::Project::load(file, settings)?;
            commands::delete::handle(&project, &cluster, yes).await?;
        }
        Commands::Status { cluster, json } => {
            let root = utils::Project::locate_root(file)?;
            commands::status::handle(&settings, &root, cluster, json).await?;
        }
        Commands::Validate => {
            commands::validate::handle(file, &settings).await?;
        }
        Commands::Machine(machine_cmd) => {
            let project = utils::Project::load(file, settings)?;
            match machine_cmd {
                MachineCommands::Associate {
                    cluster,
                    machine,
                    group,
                } => {
                    commands::machine::handle_associate(&project, &cluster, &machine, &group)
                        .await?;
                }
                MachineCommands::Dissociate {
                    cluster,
                    machine,
                    group,
                } => {
                    commands::machine::handle_dissociate(&project, &cluster, &machine, &group)
                        .await?;
                }
            }
        }
        Commands::Version => {
            unreachable!("Version is handled before config loading");
        }
    }

    Ok(())
}
