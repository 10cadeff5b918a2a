use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: stack.kdl, stack.local.kdl, .stack.kdl, .stack.local.kdl\n\
        - ./.stackflow/ ディレクトリ\n\
        - ~/.config/stackflow/stack.kdl\n\
        または STACK_CONFIG_PATH 環境変数で直接指定できます"
    )]
    StackFileNotFound,

    #[error("設定の読み込みに失敗しました: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("無効な設定値: {0}")]
    InvalidValue(String),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
