//! ステータス定義
//!
//! リコンシリエーションが解決・作成したリソースIDのミラー。
//! 宣言側からは決して書き換えられない。

use super::affinity::AffinityGroupSet;
use super::network::{Network, NetworkType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// プロバイダー上で発見したゾーンのスナップショット
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneStatus {
    pub id: String,
    pub name: String,
    /// 解決済みのネットワーク（未解決の間は宣言内容のまま）
    #[serde(default)]
    pub network: Network,
    /// 以前は発見できたが直近の解決で見つからなかった
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub missing: bool,
}

/// 配置可能なフェイルドメイン
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDomainSpec {
    pub control_plane: bool,
}

/// クラスタのステータス
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// コントロールプレーン用ネットワーク（先頭ゾーンのネットワーク）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<NetworkType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip_id: Option<String>,
    /// 割り当て要求をこのエンジンが発行した場合のみ true
    #[serde(default)]
    pub public_ip_associated: bool,
    /// エンドポイント未宣言時にエンジンが一度だけ割り当てたホスト
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb_rule_id: Option<String>,
    /// ゾーンID → スナップショット
    #[serde(default)]
    pub zones: BTreeMap<String, ZoneStatus>,
    /// ゾーンID → フェイルドメイン
    #[serde(default)]
    pub failure_domains: BTreeMap<String, FailureDomainSpec>,
    /// このエンジンが作成したアフィニティグループ
    #[serde(default)]
    pub affinity_groups: AffinityGroupSet,
    #[serde(default)]
    pub ready: bool,
    /// 再試行では直らないエラー（オペレーター対応が必要）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// 直近の再キュー理由
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClusterStatus {
    pub fn clear_failure(&mut self) {
        self.failure_reason = None;
        self.failure_message = None;
    }

    /// ゾーンIDに対応するネットワークID
    pub fn zone_network_id(&self, zone_id: &str) -> Option<&str> {
        self.zones
            .get(zone_id)
            .map(|z| z.network.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_missing_flag_only_serialized_when_set() {
        let mut zone = ZoneStatus {
            id: "z-1".to_string(),
            name: "zone-a".to_string(),
            network: Network::named("net-a"),
            missing: false,
        };
        let json = serde_json::to_value(&zone).unwrap();
        assert!(json.get("missing").is_none());

        zone.missing = true;
        let json = serde_json::to_value(&zone).unwrap();
        assert_eq!(json["missing"], true);

        // 古いステータスファイルにはフィールドがない
        let old: ZoneStatus =
            serde_json::from_str(r#"{"id": "z-1", "name": "zone-a"}"#).unwrap();
        assert!(!old.missing);
    }
}
