//! ネットワーク定義

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// ネットワーク種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    /// クラスタ専用のネットワーク（Source NAT付き）
    Isolated,
    /// 複数テナントで共有されるネットワーク
    Shared,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Isolated => write!(f, "Isolated"),
            NetworkType::Shared => write!(f, "Shared"),
        }
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "isolated" => Ok(NetworkType::Isolated),
            "shared" => Ok(NetworkType::Shared),
            other => Err(format!("unknown network type: {}", other)),
        }
    }
}

/// ネットワーク
///
/// 宣言側では `name` か `id` のどちらかが入っていれば良い。
/// 解決後は `id` と `network_type` が必ず埋まる。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub network_type: Option<NetworkType>,
}

impl Network {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.network_type == Some(NetworkType::Isolated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_type_parse() {
        assert_eq!("Isolated".parse::<NetworkType>(), Ok(NetworkType::Isolated));
        assert_eq!("shared".parse::<NetworkType>(), Ok(NetworkType::Shared));
        assert!("L2".parse::<NetworkType>().is_err());
    }
}
