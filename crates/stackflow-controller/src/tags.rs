//! Tag accessor
//!
//! String tags on any taggable resource. Both writes are idempotent:
//! adding skips names that already carry a value, deleting skips names that
//! are absent. Ownership of shared networks is tracked with these tags.

use crate::error::{ReconcileError, Result};
use stackflow_cloud::{CloudStackApi, ResourceType};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Prefix of the per-cluster ownership tag
pub const CLUSTER_TAG_PREFIX: &str = "stackflow_cluster_";

/// Marks resources this engine created and is responsible for destroying
pub const CREATED_BY_TAG: &str = "created_by_stackflow";

/// Value written for ownership tags
pub const TAG_VALUE: &str = "1";

/// Ownership tag name for the cluster with the given uid
pub fn cluster_tag_name(uid: &str) -> String {
    format!("{}{}", CLUSTER_TAG_PREFIX, uid)
}

#[derive(Clone)]
pub struct TagAccessor {
    api: Arc<dyn CloudStackApi>,
}

impl TagAccessor {
    pub fn new(api: Arc<dyn CloudStackApi>) -> Self {
        Self { api }
    }

    pub async fn get_tags(
        &self,
        resource_type: ResourceType,
        id: &str,
    ) -> Result<BTreeMap<String, String>> {
        self.api
            .list_tags(resource_type, id)
            .await
            .map_err(ReconcileError::cloud("listTags"))
    }

    /// Returns the names that were actually written
    pub async fn add_tags(
        &self,
        resource_type: ResourceType,
        id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let existing = self.get_tags(resource_type, id).await?;
        let missing: BTreeMap<String, String> = tags
            .iter()
            .filter(|(name, _)| existing.get(*name).is_none_or(|v| v.is_empty()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if missing.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!(
            "Tagging {} {}: {:?}",
            resource_type,
            id,
            missing.keys().collect::<Vec<_>>()
        );
        self.api
            .create_tags(resource_type, id, &missing)
            .await
            .map_err(ReconcileError::cloud("createTags"))?;
        Ok(missing.into_keys().collect())
    }

    /// Returns the names that were actually removed
    pub async fn delete_tags(
        &self,
        resource_type: ResourceType,
        id: &str,
        names: &[&str],
    ) -> Result<Vec<String>> {
        let existing = self.get_tags(resource_type, id).await?;
        // the provider matches on key and value
        let present: BTreeMap<String, String> = names
            .iter()
            .filter_map(|name| {
                existing
                    .get(*name)
                    .filter(|v| !v.is_empty())
                    .map(|v| (name.to_string(), v.clone()))
            })
            .collect();

        if present.is_empty() {
            return Ok(Vec::new());
        }

        self.api
            .delete_tags(resource_type, id, &present)
            .await
            .map_err(ReconcileError::cloud("deleteTags"))?;
        Ok(present.into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackflow_cloud::testing::FakeCloudStack;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_add_skips_existing_values() {
        let fake = Arc::new(FakeCloudStack::new());
        fake.set_tags(ResourceType::Network, "net-1", &[("owner", "team-a")]);
        let accessor = TagAccessor::new(fake.clone());

        let written = accessor
            .add_tags(
                ResourceType::Network,
                "net-1",
                &tags(&[("owner", "team-b"), ("env", "prod")]),
            )
            .await
            .unwrap();

        assert_eq!(written, vec!["env"]);
        let current = fake.tags(ResourceType::Network, "net-1");
        assert_eq!(current["owner"], "team-a");
        assert_eq!(current["env"], "prod");
    }

    #[tokio::test]
    async fn test_add_twice_writes_once() {
        let fake = Arc::new(FakeCloudStack::new());
        let accessor = TagAccessor::new(fake.clone());
        let wanted = tags(&[(CREATED_BY_TAG, TAG_VALUE)]);

        accessor
            .add_tags(ResourceType::Network, "net-1", &wanted)
            .await
            .unwrap();
        accessor
            .add_tags(ResourceType::Network, "net-1", &wanted)
            .await
            .unwrap();

        assert_eq!(fake.count("createTags"), 1);
    }

    #[tokio::test]
    async fn test_delete_skips_absent() {
        let fake = Arc::new(FakeCloudStack::new());
        fake.set_tags(ResourceType::Network, "net-1", &[("a", "1")]);
        let accessor = TagAccessor::new(fake.clone());

        let removed = accessor
            .delete_tags(ResourceType::Network, "net-1", &["a", "b"])
            .await
            .unwrap();
        assert_eq!(removed, vec!["a"]);

        let removed = accessor
            .delete_tags(ResourceType::Network, "net-1", &["a"])
            .await
            .unwrap();
        assert!(removed.is_empty());
        assert_eq!(fake.count("deleteTags"), 1);
    }

    #[test]
    fn test_cluster_tag_name() {
        assert_eq!(cluster_tag_name("abc"), "stackflow_cluster_abc");
    }
}
