//! Managed resource kinds
//!
//! Static table of every dependent kind the operator produces: its apply
//! order, API resource, the fields the operator owns, and how readiness is
//! read from a live object. Adding a dependent kind means adding a row here.

use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{ApiResource, DynamicObject};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Dependent resource kind, declared in apply order
///
/// Configuration objects come before workloads so a pod never references a
/// ConfigMap that does not exist yet; network exposure comes last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ManagedKind {
    ConfigMap,
    Deployment,
    Service,
    Ingress,
}

/// Readiness of a single live dependent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending(String),
    Failed(String),
}

/// Per-kind policy row
pub struct KindHandler {
    pub kind: ManagedKind,
    /// JSON pointers compared by the diff engine; everything else is left
    /// to the API server and other controllers
    pub owned_fields: &'static [&'static str],
    /// Owned pointers whose maps must match key for key
    pub exact_fields: &'static [&'static str],
    /// Member names inside owned subtrees that are compared key for key
    /// and removed from the live object when the desired one omits them
    pub exact_members: &'static [&'static str],
    pub readiness: fn(&DynamicObject) -> Readiness,
}

/// Every managed kind, in apply order
pub static MANAGED_KINDS: [KindHandler; 4] = [
    KindHandler {
        kind: ManagedKind::ConfigMap,
        owned_fields: &["/metadata/labels", "/metadata/ownerReferences", "/data"],
        exact_fields: &["/data"],
        exact_members: &[],
        readiness: exists,
    },
    KindHandler {
        kind: ManagedKind::Deployment,
        owned_fields: &[
            "/metadata/labels",
            "/metadata/ownerReferences",
            "/spec/replicas",
            "/spec/selector",
            "/spec/template",
        ],
        exact_fields: &[],
        exact_members: &["resources"],
        readiness: deployment_readiness,
    },
    KindHandler {
        kind: ManagedKind::Service,
        owned_fields: &[
            "/metadata/labels",
            "/metadata/ownerReferences",
            "/spec/selector",
            "/spec/ports",
            "/spec/type",
        ],
        exact_fields: &[],
        exact_members: &[],
        readiness: exists,
    },
    KindHandler {
        kind: ManagedKind::Ingress,
        owned_fields: &[
            "/metadata/labels",
            "/metadata/annotations",
            "/metadata/ownerReferences",
            "/spec/ingressClassName",
            "/spec/rules",
        ],
        exact_fields: &["/metadata/annotations"],
        exact_members: &[],
        readiness: exists,
    },
];

impl ManagedKind {
    /// All kinds in apply order
    pub fn all() -> impl DoubleEndedIterator<Item = ManagedKind> {
        MANAGED_KINDS.iter().map(|h| h.kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedKind::ConfigMap => "ConfigMap",
            ManagedKind::Deployment => "Deployment",
            ManagedKind::Service => "Service",
            ManagedKind::Ingress => "Ingress",
        }
    }

    /// Policy row for this kind
    pub fn handler(&self) -> &'static KindHandler {
        // The table is declared in enum order.
        &MANAGED_KINDS[*self as usize]
    }

    pub fn owned_fields(&self) -> &'static [&'static str] {
        self.handler().owned_fields
    }

    pub fn exact_fields(&self) -> &'static [&'static str] {
        self.handler().exact_fields
    }

    pub fn exact_members(&self) -> &'static [&'static str] {
        self.handler().exact_members
    }

    pub fn readiness(&self, object: &DynamicObject) -> Readiness {
        (self.handler().readiness)(object)
    }

    /// API resource used for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ManagedKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ManagedKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ManagedKind::Service => ApiResource::erase::<Service>(&()),
            ManagedKind::Ingress => ApiResource::erase::<Ingress>(&()),
        }
    }
}

impl fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a dependent within one registry's namespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceId {
    pub kind: ManagedKind,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ManagedKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Convert a typed object into its dynamic form
pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject> {
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}

/// Convert a dynamic object back into a typed one
pub fn to_typed<K: DeserializeOwned>(object: &DynamicObject) -> Result<K> {
    let value = serde_json::to_value(object)?;
    serde_json::from_value(value).map_err(OperatorError::from)
}

fn exists(_: &DynamicObject) -> Readiness {
    Readiness::Ready
}

fn deployment_readiness(object: &DynamicObject) -> Readiness {
    let deployment: Deployment = match to_typed(object) {
        Ok(d) => d,
        Err(e) => return Readiness::Pending(format!("unreadable deployment: {}", e)),
    };

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or(0);
    let status = deployment.status.unwrap_or_default();

    for cond in status.conditions.iter().flatten() {
        let failed_progress = cond.type_ == "Progressing"
            && cond.status == "False"
            && cond.reason.as_deref() == Some("ProgressDeadlineExceeded");
        let replica_failure = cond.type_ == "ReplicaFailure" && cond.status == "True";
        if failed_progress || replica_failure {
            return Readiness::Failed(
                cond.message
                    .clone()
                    .unwrap_or_else(|| cond.reason.clone().unwrap_or_default()),
            );
        }
    }

    if status.observed_generation.unwrap_or(0) < generation {
        return Readiness::Pending("rollout not yet observed".to_string());
    }

    let ready = status.ready_replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);

    if updated >= desired && ready >= desired && available >= desired && total <= desired {
        Readiness::Ready
    } else {
        Readiness::Pending(format!("{}/{} replicas ready", ready, desired))
    }
}

/// Ready replica count of a live Deployment (0 if unknown)
pub fn deployment_ready_replicas(object: &DynamicObject) -> i32 {
    to_typed::<Deployment>(object)
        .ok()
        .and_then(|d| d.status)
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn deployment(generation: i64, replicas: i32, status: DeploymentStatus) -> DynamicObject {
        let d = Deployment {
            metadata: ObjectMeta {
                name: Some("r-app-deployment".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(status),
        };
        to_dynamic(&d).unwrap()
    }

    #[test]
    fn test_table_matches_enum_order() {
        for (i, handler) in MANAGED_KINDS.iter().enumerate() {
            assert_eq!(handler.kind as usize, i);
        }
        let kinds: Vec<_> = ManagedKind::all().collect();
        let mut sorted = kinds.clone();
        sorted.sort();
        assert_eq!(kinds, sorted);
    }

    #[test]
    fn test_apply_order() {
        assert!(ManagedKind::ConfigMap < ManagedKind::Deployment);
        assert!(ManagedKind::Deployment < ManagedKind::Service);
        assert!(ManagedKind::Service < ManagedKind::Ingress);
    }

    #[test]
    fn test_service_does_not_own_cluster_ip() {
        assert!(!ManagedKind::Service
            .owned_fields()
            .iter()
            .any(|f| f.contains("clusterIP")));
    }

    #[test]
    fn test_exact_fields_are_owned() {
        for handler in MANAGED_KINDS.iter() {
            for pointer in handler.exact_fields {
                assert!(handler.owned_fields.contains(pointer), "{}", pointer);
            }
        }
    }

    #[test]
    fn test_api_resource() {
        let ar = ManagedKind::Ingress.api_resource();
        assert_eq!(ar.group, "networking.k8s.io");
        assert_eq!(ar.kind, "Ingress");
        assert_eq!(ManagedKind::Deployment.api_resource().plural, "deployments");
    }

    #[test]
    fn test_deployment_ready() {
        let obj = deployment(
            2,
            3,
            DeploymentStatus {
                observed_generation: Some(2),
                replicas: Some(3),
                ready_replicas: Some(3),
                updated_replicas: Some(3),
                available_replicas: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(ManagedKind::Deployment.readiness(&obj), Readiness::Ready);
        assert_eq!(deployment_ready_replicas(&obj), 3);
    }

    #[test]
    fn test_deployment_pending_until_generation_observed() {
        let obj = deployment(
            3,
            3,
            DeploymentStatus {
                observed_generation: Some(2),
                replicas: Some(3),
                ready_replicas: Some(3),
                updated_replicas: Some(3),
                available_replicas: Some(3),
                ..Default::default()
            },
        );
        assert!(matches!(
            ManagedKind::Deployment.readiness(&obj),
            Readiness::Pending(_)
        ));
    }

    #[test]
    fn test_deployment_partially_ready() {
        let obj = deployment(
            1,
            3,
            DeploymentStatus {
                observed_generation: Some(1),
                replicas: Some(3),
                ready_replicas: Some(1),
                updated_replicas: Some(3),
                available_replicas: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(
            ManagedKind::Deployment.readiness(&obj),
            Readiness::Pending("1/3 replicas ready".to_string())
        );
    }

    #[test]
    fn test_deployment_progress_deadline_is_failure() {
        let obj = deployment(
            1,
            3,
            DeploymentStatus {
                observed_generation: Some(1),
                conditions: Some(vec![DeploymentCondition {
                    type_: "Progressing".to_string(),
                    status: "False".to_string(),
                    reason: Some("ProgressDeadlineExceeded".to_string()),
                    message: Some("deadline exceeded".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
        );
        assert_eq!(
            ManagedKind::Deployment.readiness(&obj),
            Readiness::Failed("deadline exceeded".to_string())
        );
    }

    #[test]
    fn test_resource_id_display() {
        let id = ResourceId::new(ManagedKind::Service, "r-app-service");
        assert_eq!(id.to_string(), "Service/r-app-service");
    }
}
