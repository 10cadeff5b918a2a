//! アフィニティグループ定義

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// アフィニティグループの種別
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityGroupType {
    /// 同一ホストに寄せる
    #[serde(rename = "host affinity")]
    HostAffinity,
    /// 別ホストに分散させる
    #[default]
    #[serde(rename = "host anti-affinity")]
    HostAntiAffinity,
}

impl AffinityGroupType {
    /// プロバイダーAPIで使われる種別文字列
    pub fn as_api_str(&self) -> &'static str {
        match self {
            AffinityGroupType::HostAffinity => "host affinity",
            AffinityGroupType::HostAntiAffinity => "host anti-affinity",
        }
    }
}

impl fmt::Display for AffinityGroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_api_str())
    }
}

impl FromStr for AffinityGroupType {
    type Err = String;

    /// `host affinity` / `host-affinity` / `affinity` などの表記を受け付ける
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '_'], " ");
        match normalized.as_str() {
            "host affinity" | "affinity" => Ok(AffinityGroupType::HostAffinity),
            "host anti affinity" | "anti affinity" => Ok(AffinityGroupType::HostAntiAffinity),
            _ => Err(format!("unknown affinity group type: {}", s)),
        }
    }
}

/// アフィニティグループ
///
/// IDと名前のどちらでも解決できるが、IDが判明した後はIDが正となる。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityGroup {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub group_type: AffinityGroupType,
}

impl AffinityGroup {
    pub fn new(name: impl Into<String>, group_type: AffinityGroupType) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            group_type,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// IDをキーにしたアフィニティグループの集合
///
/// 同じIDを追加すると上書きされ、存在しないIDの削除は何もしない。
/// 反復順はID順で安定している。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<AffinityGroup>", into = "Vec<AffinityGroup>")]
pub struct AffinityGroupSet {
    groups: BTreeMap<String, AffinityGroup>,
}

impl AffinityGroupSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, group: AffinityGroup) {
        self.groups.insert(group.id.clone(), group);
    }

    pub fn remove_group(&mut self, id: &str) -> Option<AffinityGroup> {
        self.groups.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.groups.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&AffinityGroup> {
        self.groups.get(id)
    }

    /// 名前で検索（IDが未知の場合のフォールバック）
    pub fn find_by_name(&self, name: &str) -> Option<&AffinityGroup> {
        self.groups.values().find(|g| g.name == name)
    }

    pub fn ids(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AffinityGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl From<Vec<AffinityGroup>> for AffinityGroupSet {
    fn from(groups: Vec<AffinityGroup>) -> Self {
        groups.into_iter().collect()
    }
}

impl From<AffinityGroupSet> for Vec<AffinityGroup> {
    fn from(set: AffinityGroupSet) -> Self {
        set.groups.into_values().collect()
    }
}

impl FromIterator<AffinityGroup> for AffinityGroupSet {
    fn from_iter<I: IntoIterator<Item = AffinityGroup>>(iter: I) -> Self {
        let mut set = AffinityGroupSet::new();
        for group in iter {
            set.add_group(group);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str, name: &str) -> AffinityGroup {
        AffinityGroup::new(name, AffinityGroupType::HostAntiAffinity).with_id(id)
    }

    #[test]
    fn test_add_same_group_twice() {
        let mut set = AffinityGroupSet::new();
        set.add_group(group("ag-1", "cp"));
        set.add_group(group("ag-1", "cp"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_add_duplicate_id_overwrites_in_place() {
        let mut set = AffinityGroupSet::new();
        set.add_group(group("ag-1", "old-name"));
        set.add_group(group("ag-1", "new-name"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("ag-1").unwrap().name, "new-name");
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut set = AffinityGroupSet::new();
        set.add_group(group("ag-1", "cp"));
        assert!(set.remove_group("ag-9").is_none());
        assert_eq!(set.ids(), vec!["ag-1"]);
    }

    #[test]
    fn test_mixed_sequence_never_duplicates() {
        let mut set = AffinityGroupSet::new();
        let ops: [(bool, &str); 8] = [
            (true, "a"),
            (true, "b"),
            (true, "a"),
            (false, "c"),
            (false, "b"),
            (true, "b"),
            (true, "b"),
            (false, "a"),
        ];
        for (add, id) in ops {
            if add {
                set.add_group(group(id, id));
            } else {
                set.remove_group(id);
            }
            let mut ids = set.ids();
            ids.dedup();
            assert_eq!(ids.len(), set.len());
        }
        assert_eq!(set.ids(), vec!["b"]);
    }

    #[test]
    fn test_serde_as_list() {
        let set: AffinityGroupSet = vec![group("ag-2", "w"), group("ag-1", "cp")].into();
        let json = serde_json::to_value(&set).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["id"], "ag-1");
        assert_eq!(json[0]["type"], "host anti-affinity");

        let back: AffinityGroupSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_affinity_type_parse() {
        assert_eq!(
            "host-anti-affinity".parse::<AffinityGroupType>(),
            Ok(AffinityGroupType::HostAntiAffinity)
        );
        assert_eq!(
            "host affinity".parse::<AffinityGroupType>(),
            Ok(AffinityGroupType::HostAffinity)
        );
        assert!("spread".parse::<AffinityGroupType>().is_err());
    }
}
