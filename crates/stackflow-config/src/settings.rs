//! 実行時設定
//!
//! 読み込み順（後勝ち）:
//! 1. 既定値
//! 2. ~/.config/stackflow/stackflow.toml
//! 3. ./stackflow.toml
//! 4. 環境変数 `STACKFLOW_*`（例: `STACKFLOW_WORKERS=8`）

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE: &str = "stackflow.toml";
const ENV_PREFIX: &str = "STACKFLOW";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 収束後に再リコンサイルするまでの秒数
    pub resync_period_secs: u64,
    /// プロバイダーAPI呼び出し1回あたりのタイムアウト（秒）
    pub request_timeout_secs: u64,
    /// 同時にリコンサイルするクラスタ数
    pub workers: usize,
    /// `[Global]` セクションを持つ cloud-config ファイル
    pub cloud_config: PathBuf,
    pub cmk_binary: String,
    /// ネットワーク作成時のオファリング名（未指定なら既定のオファリング）
    pub network_offering: Option<String>,
    /// `.stackflow/state.json` を置くディレクトリ
    pub state_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resync_period_secs: 300,
            request_timeout_secs: 60,
            workers: 4,
            cloud_config: PathBuf::from("cloud-config"),
            cmk_binary: "cmk".to_string(),
            network_offering: None,
            state_dir: PathBuf::from("."),
        }
    }
}

impl Settings {
    /// グローバル設定・プロジェクト設定・環境変数から読み込む
    pub fn load() -> Result<Self> {
        let mut files = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            files.push(config_dir.join("stackflow").join(SETTINGS_FILE));
        }
        files.push(std::env::current_dir()?.join(SETTINGS_FILE));
        Self::load_from(&files)
    }

    /// 指定ファイル（存在しなければスキップ）と環境変数から読み込む
    pub fn load_from(files: &[PathBuf]) -> Result<Self> {
        let mut builder = config::Config::builder();
        for file in files {
            if file.exists() {
                tracing::debug!("設定ファイルを読み込み: {}", file.display());
            }
            builder = builder.add_source(
                config::File::from(file.as_path())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue(
                "workers は 1 以上を指定してください".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "request_timeout_secs は 1 以上を指定してください".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// 相対パスの cloud-config を `base` 基準で解決
    pub fn cloud_config_path(&self, base: &Path) -> PathBuf {
        if self.cloud_config.is_absolute() {
            self.cloud_config.clone()
        } else {
            base.join(&self.cloud_config)
        }
    }
}
