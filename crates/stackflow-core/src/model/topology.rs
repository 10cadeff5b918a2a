//! クラスタトポロジー定義
//!
//! ユーザーが `stack.kdl` で宣言する内容（spec）と、永続化されるメタデータ。

use super::affinity::AffinityGroup;
use super::machine::Machine;
use super::network::Network;
use super::status::ClusterStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 削除処理が完了するまでクラスタレコードの削除を止めるファイナライザ
pub const CLUSTER_FINALIZER: &str = "stackflow.chronista.club/cluster";

/// identity-ref に許される唯一の kind
pub const DEFAULT_IDENTITY_REF_KIND: &str = "Secret";

/// コントロールプレーンAPIのデフォルトポート
pub const DEFAULT_API_PORT: u16 = 6443;

/// トポロジーオブジェクトのメタデータ
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// クラスタ名（stack.kdl の cluster ノード名）
    pub name: String,
    /// 初回リコンサイル時に払い出される一意なID
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// 削除要求の時刻。セットされるとteardownに切り替わる
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// 追加した場合は true
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// 削除した場合は true
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// 認証情報の参照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityReference {
    pub kind: String,
    pub name: String,
}

impl IdentityReference {
    pub fn secret(name: impl Into<String>) -> Self {
        Self {
            kind: DEFAULT_IDENTITY_REF_KIND.to_string(),
            name: name.into(),
        }
    }
}

/// コントロールプレーンのエンドポイント
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    #[serde(default)]
    pub host: String,
    /// 0 は未指定
    #[serde(default)]
    pub port: u16,
}

impl ApiEndpoint {
    pub fn is_host_set(&self) -> bool {
        !self.host.is_empty()
    }

    /// 未指定なら [`DEFAULT_API_PORT`]
    pub fn effective_port(&self) -> u16 {
        match self.port {
            0 => DEFAULT_API_PORT,
            port => port,
        }
    }
}

/// ゾーン宣言
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// このゾーンで使用するネットワーク
    #[serde(default)]
    pub network: Network,
}

impl Zone {
    /// ログ表示用の識別子（IDがあればID、なければ名前）
    pub fn display_key(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }
}

/// クラスタの宣言内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// 宣言順が保持される
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_ref: Option<IdentityReference>,
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,
    /// クラスタ単位で作成するアフィニティグループ
    #[serde(default)]
    pub affinity_groups: Vec<AffinityGroup>,
    #[serde(default)]
    pub machines: Vec<Machine>,
}

/// トポロジーオブジェクト（メタデータ + 宣言 + ステータス）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub metadata: ObjectMeta,
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

impl ClusterTopology {
    pub fn new(name: impl Into<String>, spec: ClusterSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(name),
            spec,
            status: ClusterStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// 宣言されたエンドポイントか、エンジンが一度だけ割り当てたホスト
    pub fn effective_endpoint_host(&self) -> &str {
        if self.spec.control_plane_endpoint.is_host_set() {
            &self.spec.control_plane_endpoint.host
        } else {
            self.status.control_plane_host.as_deref().unwrap_or("")
        }
    }

    pub fn machine(&self, name: &str) -> Option<&Machine> {
        self.spec.machines.iter().find(|m| m.name == name)
    }
}
