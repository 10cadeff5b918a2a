//! KDLパーサー
//!
//! `stack.kdl` をパースします。
//! 各ノードタイプのパース処理はモジュールに分離されています。

mod cluster;
mod machine;

use cluster::parse_cluster;

// 外部クレートから再利用可能なパース関数
pub use machine::parse_machine;

use crate::error::{FlowError, Result};
use crate::model::ClusterSpec;
use kdl::{KdlDocument, KdlNode};
use std::fs;
use std::path::Path;

/// パース結果（宣言順を保持）
#[derive(Debug, Clone, Default)]
pub struct StackFile {
    pub clusters: Vec<(String, ClusterSpec)>,
}

impl StackFile {
    pub fn cluster(&self, name: &str) -> Option<&ClusterSpec> {
        self.clusters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, spec)| spec)
    }

    pub fn names(&self) -> Vec<&str> {
        self.clusters.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// KDLファイルをパース
pub fn parse_kdl_file<P: AsRef<Path>>(path: P) -> Result<StackFile> {
    let content = fs::read_to_string(path.as_ref()).map_err(|e| FlowError::IoError {
        path: path.as_ref().to_path_buf(),
        message: e.to_string(),
    })?;
    parse_kdl_string(&content)
}

/// KDL文字列をパース
pub fn parse_kdl_string(content: &str) -> Result<StackFile> {
    let doc: KdlDocument = content.parse()?;
    let mut stack = StackFile::default();

    for node in doc.nodes() {
        match node.name().value() {
            "cluster" => {
                let (name, spec) = parse_cluster(node)?;
                if stack.cluster(&name).is_some() {
                    return Err(FlowError::DuplicateCluster(name));
                }
                stack.clusters.push((name, spec));
            }
            other => {
                tracing::debug!("Skipping unknown top-level node: {}", other);
            }
        }
    }

    Ok(stack)
}

/// 先頭の位置引数を文字列として取得
fn first_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// 位置引数をすべて文字列として取得
fn all_strings(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string().map(|s| s.to_string()))
        .collect()
}

/// 名前付きプロパティを文字列として取得
fn prop_string(node: &KdlNode, key: &str) -> Option<String> {
    node.get(key)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// 先頭の位置引数を名前として必須取得
fn required_name(node: &KdlNode, what: &str) -> Result<String> {
    first_string(node).ok_or_else(|| FlowError::InvalidConfig(format!("{} requires a name", what)))
}
