//! マシン定義

use super::topology::IdentityReference;
use serde::{Deserialize, Serialize};
use std::fmt;

/// データディスクの指定
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskOffering {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mount_path: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub filesystem: String,
    #[serde(default)]
    pub label: String,
}

/// マシン宣言
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    /// プロビジョニングされるまでは空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offering: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_offering: Option<DiskOffering>,
    /// IDで直接指定されたアフィニティグループ
    #[serde(default)]
    pub affinity_group_ids: Vec<String>,
    /// 名前（またはID）で指定されたアフィニティグループ
    #[serde(default)]
    pub affinity_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_ref: Option<IdentityReference>,
    #[serde(default)]
    pub zone_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// コントロールプレーンノードはLBルールに登録される
    #[serde(default)]
    pub control_plane: bool,
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_provisioned(&self) -> bool {
        self.instance_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// アフィニティ変更の途中経過
///
/// 停止 → 変更 → 起動 の3ステップはプロバイダー側でアトミックではないため、
/// 最後に完了したステップを永続化して再試行時に途中から再開する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStep {
    /// 停止済み、アフィニティ未変更
    StoppedPendingUpdate,
    /// アフィニティ変更済み、未起動
    UpdatedPendingStart,
    /// 起動済み（遷移完了）
    Started,
}

impl fmt::Display for TransitionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionStep::StoppedPendingUpdate => write!(f, "stopped-pending-update"),
            TransitionStep::UpdatedPendingStart => write!(f, "updated-pending-start"),
            TransitionStep::Started => write!(f, "started"),
        }
    }
}

/// 進行中のアフィニティ変更
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityTransition {
    /// 変更後のアフィニティグループID一覧
    pub target_group_ids: Vec<String>,
    pub step: TransitionStep,
}

/// マシンのステータス
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// 解決済みの宣言アフィニティグループID
    #[serde(default)]
    pub affinity_group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<AffinityTransition>,
    #[serde(default)]
    pub lb_assigned: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MachineStatus {
    /// 停止したまま放置されている可能性がある
    pub fn is_mid_transition(&self) -> bool {
        self.transition
            .as_ref()
            .is_some_and(|t| t.step != TransitionStep::Started)
    }
}
