//! アドミッション検証
//!
//! `stack validate` とリコンサイル前に実行される。
//! エラーはフィールドパス付きで全件集約して返す。

use crate::error::{FlowError, Result};
use crate::model::{ClusterSpec, DEFAULT_IDENTITY_REF_KIND};
use std::fmt;

/// フィールド単位の検証エラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// 例: `spec.identityRef.kind`
    pub path: String,
    pub message: String,
}

impl FieldError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// 新規クラスタの検証
pub fn validate_create(name: &str, spec: &ClusterSpec) -> Result<()> {
    let mut errors = Vec::new();

    check_identity_kind(spec, &mut errors);

    if spec.account.as_deref().is_some_and(|a| !a.is_empty())
        && spec.domain.as_deref().is_none_or(str::is_empty)
    {
        errors.push(FieldError::new(
            "spec.account",
            "specifying account requires additionally specifying domain",
        ));
    }

    if spec.zones.is_empty() {
        errors.push(FieldError::new("spec.zones", "at least one zone is required"));
    }
    for (i, zone) in spec.zones.iter().enumerate() {
        if zone.network.name.is_empty() && zone.network.id.is_empty() {
            errors.push(FieldError::new(
                format!("spec.zones[{}].network", i),
                "each zone requires a network specification",
            ));
        }
    }

    finish(name, errors)
}

/// 既存クラスタの宣言変更の検証
///
/// ゾーンは作成後に変更できない。エンドポイントは旧宣言にホストがある場合か、
/// `assigned_host`（エンジンが払い出したアドレス）がある場合に固定。
pub fn validate_update(
    name: &str,
    old: &ClusterSpec,
    assigned_host: Option<&str>,
    new: &ClusterSpec,
) -> Result<()> {
    let mut errors = Vec::new();

    if old.zones != new.zones {
        errors.push(FieldError::new(
            "spec.zones",
            "zones and sub-attributes may not be modified after creation",
        ));
    }

    let old_endpoint = &old.control_plane_endpoint;
    let new_endpoint = &new.control_plane_endpoint;
    if old_endpoint.is_host_set() {
        if old_endpoint.host != new_endpoint.host {
            errors.push(FieldError::new(
                "spec.controlPlaneEndpoint.host",
                format!("field is immutable (was '{}')", old_endpoint.host),
            ));
        }
        if old_endpoint.port != new_endpoint.port {
            errors.push(FieldError::new(
                "spec.controlPlaneEndpoint.port",
                format!("field is immutable (was {})", old_endpoint.port),
            ));
        }
    } else if let Some(assigned) = assigned_host.filter(|h| !h.is_empty()) {
        // 払い出し済みのアドレスと同じ値を後から書くのは可
        if new_endpoint.is_host_set() && new_endpoint.host != assigned {
            errors.push(FieldError::new(
                "spec.controlPlaneEndpoint.host",
                format!("field is immutable (assigned '{}')", assigned),
            ));
        }
        if old_endpoint.effective_port() != new_endpoint.effective_port() {
            errors.push(FieldError::new(
                "spec.controlPlaneEndpoint.port",
                format!("field is immutable (was {})", old_endpoint.effective_port()),
            ));
        }
    }

    if let (Some(old_ref), Some(new_ref)) = (&old.identity_ref, &new.identity_ref) {
        if old_ref.kind != new_ref.kind {
            errors.push(FieldError::new("spec.identityRef.kind", "field is immutable"));
        }
        if old_ref.name != new_ref.name {
            errors.push(FieldError::new("spec.identityRef.name", "field is immutable"));
        }
    }

    check_identity_kind(new, &mut errors);

    finish(name, errors)
}

fn check_identity_kind(spec: &ClusterSpec, errors: &mut Vec<FieldError>) {
    if let Some(identity) = &spec.identity_ref
        && identity.kind != DEFAULT_IDENTITY_REF_KIND
    {
        errors.push(FieldError::new("spec.identityRef.kind", "must be a Secret"));
    }
}

fn finish(name: &str, errors: Vec<FieldError>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FlowError::Validation {
            name: name.to_string(),
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiEndpoint, IdentityReference, Network, Zone};

    fn valid_spec() -> ClusterSpec {
        ClusterSpec {
            zones: vec![Zone {
                name: "zone-a".to_string(),
                network: Network::named("net-a"),
                ..Default::default()
            }],
            identity_ref: Some(IdentityReference::secret("creds")),
            ..Default::default()
        }
    }

    fn field_paths(result: Result<()>) -> Vec<String> {
        match result {
            Err(FlowError::Validation { errors, .. }) => {
                errors.into_iter().map(|e| e.path).collect()
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_create_valid() {
        assert!(validate_create("prod", &valid_spec()).is_ok());
    }

    #[test]
    fn test_create_identity_kind_must_be_secret() {
        let mut spec = valid_spec();
        spec.identity_ref = Some(IdentityReference {
            kind: "ConfigMap".to_string(),
            name: "creds".to_string(),
        });
        assert_eq!(
            field_paths(validate_create("prod", &spec)),
            vec!["spec.identityRef.kind"]
        );
    }

    #[test]
    fn test_create_account_requires_domain() {
        let mut spec = valid_spec();
        spec.account = Some("ops".to_string());
        assert_eq!(
            field_paths(validate_create("prod", &spec)),
            vec!["spec.account"]
        );

        spec.domain = Some("ROOT".to_string());
        assert!(validate_create("prod", &spec).is_ok());
    }

    #[test]
    fn test_create_requires_zones_and_networks() {
        let spec = ClusterSpec::default();
        assert_eq!(
            field_paths(validate_create("prod", &spec)),
            vec!["spec.zones"]
        );

        let mut spec = valid_spec();
        spec.zones.push(Zone {
            name: "zone-b".to_string(),
            ..Default::default()
        });
        assert_eq!(
            field_paths(validate_create("prod", &spec)),
            vec!["spec.zones[1].network"]
        );
    }

    #[test]
    fn test_create_collects_all_errors() {
        let spec = ClusterSpec {
            account: Some("ops".to_string()),
            identity_ref: Some(IdentityReference {
                kind: "Other".to_string(),
                name: "x".to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(field_paths(validate_create("prod", &spec)).len(), 3);
    }

    #[test]
    fn test_update_zones_immutable() {
        let old = valid_spec();
        let mut new = old.clone();
        new.zones[0].network = Network::named("other-net");
        assert_eq!(
            field_paths(validate_update("prod", &old, None, &new)),
            vec!["spec.zones"]
        );
    }

    #[test]
    fn test_update_endpoint_settable_once() {
        let old = valid_spec();
        let mut new = old.clone();
        new.control_plane_endpoint = ApiEndpoint {
            host: "10.0.0.5".to_string(),
            port: 6443,
        };
        // 旧宣言にホストがなければ設定可能
        assert!(validate_update("prod", &old, None, &new).is_ok());

        let mut changed = new.clone();
        changed.control_plane_endpoint.host = "10.0.0.6".to_string();
        changed.control_plane_endpoint.port = 8443;
        assert_eq!(
            field_paths(validate_update("prod", &new, None, &changed)),
            vec![
                "spec.controlPlaneEndpoint.host",
                "spec.controlPlaneEndpoint.port"
            ]
        );
    }

    #[test]
    fn test_update_assigned_host_is_fixed() {
        let old = valid_spec();
        let assigned = Some("203.0.113.10");

        let mut new = old.clone();
        new.control_plane_endpoint.host = "203.0.113.20".to_string();
        assert_eq!(
            field_paths(validate_update("prod", &old, assigned, &new)),
            vec!["spec.controlPlaneEndpoint.host"]
        );

        // 払い出されたアドレスを明示するだけなら変更ではない
        new.control_plane_endpoint.host = "203.0.113.10".to_string();
        assert!(validate_update("prod", &old, assigned, &new).is_ok());
        new.control_plane_endpoint.port = 6443;
        assert!(validate_update("prod", &old, assigned, &new).is_ok());

        new.control_plane_endpoint.port = 8443;
        assert_eq!(
            field_paths(validate_update("prod", &old, assigned, &new)),
            vec!["spec.controlPlaneEndpoint.port"]
        );
    }

    #[test]
    fn test_update_identity_ref_immutable() {
        let old = valid_spec();
        let mut new = old.clone();
        new.identity_ref = Some(IdentityReference::secret("other-creds"));
        assert_eq!(
            field_paths(validate_update("prod", &old, None, &new)),
            vec!["spec.identityRef.name"]
        );
    }

    #[test]
    fn test_validation_error_display() {
        let err = validate_create("prod", &ClusterSpec::default()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("prod"));
        assert!(message.contains("spec.zones"));
    }
}
