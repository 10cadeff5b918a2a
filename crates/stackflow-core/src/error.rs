use std::path::PathBuf;
use thiserror::Error;

use crate::validation::FieldError;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("KDLパースエラー: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("無効な設定: {0}")]
    InvalidConfig(String),

    #[error("クラスタが見つかりません: {0}")]
    ClusterNotFound(String),

    #[error("マシンが見つかりません: {0}")]
    MachineNotFound(String),

    #[error("クラスタ '{0}' が重複して定義されています")]
    DuplicateCluster(String),

    #[error("クラスタ '{name}' の検証に失敗しました:\n{}", format_field_errors(.errors))]
    Validation {
        name: String,
        errors: Vec<FieldError>,
    },
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, FlowError>;
