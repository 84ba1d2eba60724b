//! Finalizer handling
//!
//! A registry carries the cleanup token from its first reconcile on. When
//! it is deleted, its dependents are removed in reverse apply order and
//! only then is the token released.

use crate::apply::is_controlled_by;
use crate::client::ResourceClient;
use crate::crd::{instance_selector, ApicurioRegistry3};
use crate::error::{ErrorClass, Result};
use crate::kinds::{ManagedKind, ResourceId};
use kube::ResourceExt;
use tracing::{debug, info};

/// Finalizer token owned by this operator
pub const FINALIZER: &str = "registry.apicur.io/cleanup";

/// Where a registry is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Live and not being deleted
    Active,
    /// Deleting and still holding our token
    Terminating,
    /// Deleting without our token; nothing left to do
    Released,
    /// No longer exists
    Gone,
}

/// Classify a registry (or its absence)
pub fn lifecycle_state(registry: Option<&ApicurioRegistry3>) -> LifecycleState {
    match registry {
        None => LifecycleState::Gone,
        Some(r) if r.metadata.deletion_timestamp.is_none() => LifecycleState::Active,
        Some(r) if r.finalizers().iter().any(|f| f == FINALIZER) => LifecycleState::Terminating,
        Some(_) => LifecycleState::Released,
    }
}

/// Add the token if it is missing; returns the up-to-date registry
pub async fn ensure_finalizer(
    client: &dyn ResourceClient,
    registry: &ApicurioRegistry3,
) -> Result<ApicurioRegistry3> {
    if registry.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(registry.clone());
    }

    let mut finalizers = registry.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let updated = client.replace_finalizers(registry, finalizers).await?;
    debug!(name = %registry.name_any(), "Added finalizer");
    Ok(updated)
}

/// Delete every dependent of `registry`, last-applied kind first
///
/// A dependent that is already gone counts as deleted.
pub async fn delete_dependents(
    client: &dyn ResourceClient,
    registry: &ApicurioRegistry3,
) -> Result<Vec<ResourceId>> {
    let name = registry.name_any();
    let namespace = registry
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let uid = registry.metadata.uid.clone().unwrap_or_default();
    let selector = instance_selector(&name);
    let mut deleted = Vec::new();

    for kind in ManagedKind::all().rev() {
        for live in client.list(kind, &namespace, &selector).await? {
            if !is_controlled_by(&live, &uid) {
                continue;
            }
            let id = ResourceId::new(kind, live.name_any());
            match client.delete(kind, &namespace, &id.name).await {
                Ok(()) => {
                    info!(kind = %kind, name = %id.name, namespace = %namespace, "Deleted dependent");
                    deleted.push(id);
                }
                Err(e) if e.class() == ErrorClass::NotFound => deleted.push(id),
                Err(e) => return Err(e),
            }
        }
    }
    Ok(deleted)
}

/// Run cleanup for a terminating registry and release the token
///
/// On error the token stays in place so the next attempt retries.
pub async fn cleanup(
    client: &dyn ResourceClient,
    registry: &ApicurioRegistry3,
) -> Result<Vec<ResourceId>> {
    let deleted = delete_dependents(client, registry).await?;

    let remaining: Vec<String> = registry
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    client.replace_finalizers(registry, remaining).await?;

    info!(
        name = %registry.name_any(),
        deleted = deleted.len(),
        "Cleanup complete, finalizer released"
    );
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ApicurioRegistry3Spec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn registry(finalizers: Vec<&str>, deleting: bool) -> ApicurioRegistry3 {
        ApicurioRegistry3 {
            metadata: ObjectMeta {
                name: Some("r".to_string()),
                namespace: Some("default".to_string()),
                finalizers: Some(finalizers.into_iter().map(String::from).collect()),
                deletion_timestamp: deleting.then(|| Time(chrono::Utc::now())),
                ..Default::default()
            },
            spec: ApicurioRegistry3Spec::default(),
            status: None,
        }
    }

    #[test]
    fn test_lifecycle_states() {
        assert_eq!(lifecycle_state(None), LifecycleState::Gone);
        assert_eq!(
            lifecycle_state(Some(&registry(vec![], false))),
            LifecycleState::Active
        );
        assert_eq!(
            lifecycle_state(Some(&registry(vec![FINALIZER], false))),
            LifecycleState::Active
        );
        assert_eq!(
            lifecycle_state(Some(&registry(vec![FINALIZER], true))),
            LifecycleState::Terminating
        );
        assert_eq!(
            lifecycle_state(Some(&registry(vec!["other.io/hold"], true))),
            LifecycleState::Released
        );
    }
}
