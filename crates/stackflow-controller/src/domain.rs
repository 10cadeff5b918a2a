//! Domain and account resolution

use crate::error::{ReconcileError, Result};
use stackflow_cloud::{CloudStackApi, Lookup, Scope};
use stackflow_core::ClusterTopology;
use std::sync::Arc;

/// Account/domain scope used for every scoped provider call of a cluster
pub fn scope_of(topology: &ClusterTopology) -> Scope {
    Scope::new(
        topology.spec.account.as_deref(),
        topology.status.domain_id.as_deref(),
    )
}

pub struct DomainResolver {
    api: Arc<dyn CloudStackApi>,
}

impl DomainResolver {
    pub fn new(api: Arc<dyn CloudStackApi>) -> Self {
        Self { api }
    }

    /// Resolve the declared domain into `status.domain_id` and check the account exists in it
    pub async fn resolve(&self, topology: &mut ClusterTopology) -> Result<()> {
        let Some(domain) = topology.spec.domain.clone().filter(|d| !d.is_empty()) else {
            topology.status.domain_id = None;
            return Ok(());
        };

        let domains = self
            .api
            .list_domains(Lookup::Name(&domain))
            .await
            .map_err(ReconcileError::cloud("listDomains"))?;
        let record = ReconcileError::expect_one("domain", &domain, domains)?;
        topology.status.domain_id = Some(record.id.clone());

        if let Some(account) = topology.spec.account.as_deref().filter(|a| !a.is_empty()) {
            let accounts = self
                .api
                .list_accounts(account, &record.id)
                .await
                .map_err(ReconcileError::cloud("listAccounts"))?;
            ReconcileError::expect_one("account", account, accounts)?;
        }

        tracing::debug!("Resolved domain {} -> {}", domain, record.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackflow_cloud::testing::FakeCloudStack;
    use stackflow_core::ClusterSpec;

    fn topology(account: Option<&str>, domain: Option<&str>) -> ClusterTopology {
        ClusterTopology::new(
            "prod",
            ClusterSpec {
                account: account.map(str::to_string),
                domain: domain.map(str::to_string),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_resolve_domain_and_account() {
        let fake = Arc::new(FakeCloudStack::new());
        fake.add_domain("dom-1", "ROOT/team");
        fake.add_account("acc-1", "ops", "dom-1");
        let resolver = DomainResolver::new(fake.clone());

        let mut topo = topology(Some("ops"), Some("ROOT/team"));
        resolver.resolve(&mut topo).await.unwrap();

        assert_eq!(topo.status.domain_id.as_deref(), Some("dom-1"));
        let scope = scope_of(&topo);
        assert_eq!(scope.account.as_deref(), Some("ops"));
        assert_eq!(scope.domain_id.as_deref(), Some("dom-1"));
    }

    #[tokio::test]
    async fn test_missing_account_is_not_found() {
        let fake = Arc::new(FakeCloudStack::new());
        fake.add_domain("dom-1", "ROOT/team");
        let resolver = DomainResolver::new(fake.clone());

        let mut topo = topology(Some("ops"), Some("ROOT/team"));
        let err = resolver.resolve(&mut topo).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_no_domain_declared_skips_lookup() {
        let fake = Arc::new(FakeCloudStack::new());
        let resolver = DomainResolver::new(fake.clone());

        let mut topo = topology(None, None);
        resolver.resolve(&mut topo).await.unwrap();

        assert!(topo.status.domain_id.is_none());
        assert!(fake.calls().is_empty());
        assert!(scope_of(&topo).is_empty());
    }
}
