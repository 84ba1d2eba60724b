//! Diff/apply engine
//!
//! Drives live dependents toward a [`DesiredState`]. Only the owned fields
//! of each kind are compared; updates go through a full replace carrying the
//! live resourceVersion so a concurrent writer surfaces as a conflict.
//! The engine never retries.

use crate::builder::DesiredState;
use crate::client::ResourceClient;
use crate::crd::{instance_selector, ApicurioRegistry3};
use crate::error::{ErrorClass, OperatorError, Result};
use crate::kinds::{ManagedKind, ResourceId};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// What one apply pass did
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub created: Vec<ResourceId>,
    pub updated: Vec<ResourceId>,
    pub deleted: Vec<ResourceId>,
    pub unchanged: Vec<ResourceId>,
    /// Live state of every desired dependent after the pass
    pub observed: BTreeMap<ResourceId, DynamicObject>,
}

impl ApplyReport {
    /// Number of mutating API calls issued
    pub fn apply_ops(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_noop(&self) -> bool {
        self.apply_ops() == 0
    }
}

/// Whether `object` has a controller owner reference to `uid`
pub fn is_controlled_by(object: &DynamicObject, uid: &str) -> bool {
    object
        .owner_references()
        .iter()
        .any(|o| o.controller == Some(true) && o.uid == uid)
}

/// Owned fields of `kind` whose desired value is not reflected in `live`
///
/// An owned field the desired object omits must be absent or empty on the
/// live object.
pub fn owned_diff(
    kind: ManagedKind,
    desired: &DynamicObject,
    live: &DynamicObject,
) -> Result<Vec<&'static str>> {
    let desired = serde_json::to_value(desired)?;
    let live = serde_json::to_value(live)?;
    let exact_members = kind.exact_members();
    Ok(kind
        .owned_fields()
        .iter()
        .copied()
        .filter(|pointer| {
            let have = live.pointer(pointer).unwrap_or(&Value::Null);
            match desired.pointer(pointer) {
                Some(want) if kind.exact_fields().contains(pointer) => !matches_exactly(want, have),
                Some(want) => !is_subset(want, have, exact_members),
                None => !is_empty(have),
            }
        })
        .collect())
}

/// `desired` is contained in `live`; members added by the server are tolerated
/// except for `exact_members`, which must match key for key
fn is_subset(desired: &Value, live: &Value, exact_members: &[&str]) -> bool {
    match (desired, live) {
        (Value::Null, _) => true,
        (Value::Object(want), Value::Object(have)) => {
            let extra_exact = have.iter().any(|(k, v)| {
                exact_members.contains(&k.as_str()) && !want.contains_key(k) && !is_empty(v)
            });
            !extra_exact
                && want.iter().all(|(k, v)| {
                    let have = have.get(k).unwrap_or(&Value::Null);
                    if exact_members.contains(&k.as_str()) {
                        matches_exactly(v, have)
                    } else {
                        is_subset(v, have, exact_members)
                    }
                })
        }
        (Value::Object(want), Value::Null) => want
            .values()
            .all(|v| is_subset(v, &Value::Null, exact_members)),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len()
                && want
                    .iter()
                    .zip(have)
                    .all(|(w, h)| is_subset(w, h, exact_members))
        }
        (Value::Array(want), Value::Null) => want.is_empty(),
        (want, have) => want == have,
    }
}

/// Same keys and values at every depth; null, `{}` and `[]` are equivalent
fn matches_exactly(desired: &Value, live: &Value) -> bool {
    if is_empty(desired) || is_empty(live) {
        return is_empty(desired) && is_empty(live);
    }
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want
            .keys()
            .chain(have.keys())
            .all(|k| {
                matches_exactly(
                    want.get(k).unwrap_or(&Value::Null),
                    have.get(k).unwrap_or(&Value::Null),
                )
            }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| matches_exactly(w, h))
        }
        (want, have) => want == have,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Copy the desired owned fields into the live object, removing owned
/// fields the desired object omits
pub fn merge_owned(
    kind: ManagedKind,
    desired: &DynamicObject,
    live: &DynamicObject,
) -> Result<DynamicObject> {
    let desired = serde_json::to_value(desired)?;
    let mut merged = serde_json::to_value(live)?;
    for pointer in kind.owned_fields() {
        match desired.pointer(pointer) {
            Some(value) => set_pointer(&mut merged, pointer, value.clone()),
            None => remove_pointer(&mut merged, pointer),
        }
    }
    Ok(serde_json::from_value(merged)?)
}

fn remove_pointer(root: &mut Value, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    let parent = if parent.is_empty() {
        Some(root)
    } else {
        root.pointer_mut(parent)
    };
    if let Some(map) = parent.and_then(Value::as_object_mut) {
        map.remove(last);
    }
}

fn set_pointer(root: &mut Value, pointer: &str, value: Value) {
    let parts: Vec<&str> = pointer.split('/').skip(1).collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };

    let mut current = root;
    for part in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        match current.as_object_mut() {
            Some(map) => current = map.entry(part.to_string()).or_insert(Value::Null),
            None => return,
        }
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(last.to_string(), value);
    }
}

/// Applies desired state for one registry
pub struct ApplyEngine<'a> {
    client: &'a dyn ResourceClient,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(client: &'a dyn ResourceClient) -> Self {
        Self { client }
    }

    /// Create, update and prune dependents so they match `desired`
    pub async fn apply(
        &self,
        registry: &ApicurioRegistry3,
        desired: &DesiredState,
    ) -> Result<ApplyReport> {
        let namespace = registry
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        let uid = registry.metadata.uid.clone().unwrap_or_default();
        let mut report = ApplyReport::default();

        for (id, object) in desired.iter() {
            self.apply_one(&namespace, &uid, id, object, &mut report)
                .await?;
        }

        self.prune(registry, &namespace, &uid, desired, &mut report)
            .await?;

        Ok(report)
    }

    async fn apply_one(
        &self,
        namespace: &str,
        uid: &str,
        id: &ResourceId,
        desired: &DynamicObject,
        report: &mut ApplyReport,
    ) -> Result<()> {
        match self.client.get(id.kind, namespace, &id.name).await? {
            None => {
                let created = self.client.create(id.kind, desired).await?;
                info!(kind = %id.kind, name = %id.name, namespace = %namespace, "Created dependent");
                report.created.push(id.clone());
                report.observed.insert(id.clone(), created);
            }
            Some(live) => {
                if !is_controlled_by(&live, uid) {
                    return Err(OperatorError::Ownership {
                        kind: id.kind.to_string(),
                        name: id.name.clone(),
                    });
                }

                let drift = owned_diff(id.kind, desired, &live)?;
                if drift.is_empty() {
                    debug!(kind = %id.kind, name = %id.name, "Dependent up to date");
                    report.unchanged.push(id.clone());
                    report.observed.insert(id.clone(), live);
                    return Ok(());
                }

                let merged = merge_owned(id.kind, desired, &live)?;
                let updated = self.client.replace(id.kind, &merged).await?;
                info!(
                    kind = %id.kind,
                    name = %id.name,
                    namespace = %namespace,
                    fields = ?drift,
                    "Updated dependent"
                );
                report.updated.push(id.clone());
                report.observed.insert(id.clone(), updated);
            }
        }
        Ok(())
    }

    /// Delete dependents of this registry that are no longer desired
    async fn prune(
        &self,
        registry: &ApicurioRegistry3,
        namespace: &str,
        uid: &str,
        desired: &DesiredState,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let selector = instance_selector(&registry.name_any());
        for kind in ManagedKind::all().rev() {
            for live in self.client.list(kind, namespace, &selector).await? {
                let id = ResourceId::new(kind, live.name_any());
                if desired.contains(&id) || !is_controlled_by(&live, uid) {
                    continue;
                }
                match self.client.delete(kind, namespace, &id.name).await {
                    Ok(()) => {
                        info!(kind = %kind, name = %id.name, namespace = %namespace, "Deleted stale dependent");
                        report.deleted.push(id);
                    }
                    Err(e) if e.class() == ErrorClass::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(value: Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    fn desired_service() -> DynamicObject {
        dynamic(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "r-app-service",
                "namespace": "default",
                "labels": {"app.kubernetes.io/instance": "r"},
            },
            "spec": {
                "selector": {"app.kubernetes.io/instance": "r"},
                "ports": [{"name": "http", "port": 8080, "targetPort": 8080}],
                "type": "ClusterIP",
            }
        }))
    }

    fn live_service() -> DynamicObject {
        dynamic(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "r-app-service",
                "namespace": "default",
                "resourceVersion": "42",
                "labels": {"app.kubernetes.io/instance": "r", "extra": "added-by-someone"},
                "annotations": {"cloud.example.com/lb": "x"},
            },
            "spec": {
                "selector": {"app.kubernetes.io/instance": "r"},
                "ports": [{"name": "http", "port": 8080, "targetPort": 8080, "protocol": "TCP"}],
                "type": "ClusterIP",
                "clusterIP": "10.0.0.12",
                "sessionAffinity": "None",
            }
        }))
    }

    #[test]
    fn test_server_defaults_are_not_drift() {
        let drift = owned_diff(ManagedKind::Service, &desired_service(), &live_service()).unwrap();
        assert!(drift.is_empty(), "{:?}", drift);
    }

    #[test]
    fn test_owned_field_change_is_drift() {
        let mut live = live_service();
        live.data["spec"]["ports"][0]["port"] = json!(9090);
        let drift = owned_diff(ManagedKind::Service, &desired_service(), &live).unwrap();
        assert_eq!(drift, vec!["/spec/ports"]);
    }

    #[test]
    fn test_missing_live_field_is_drift() {
        let mut live = live_service();
        live.metadata.labels = None;
        let drift = owned_diff(ManagedKind::Service, &desired_service(), &live).unwrap();
        assert_eq!(drift, vec!["/metadata/labels"]);
    }

    #[test]
    fn test_merge_keeps_unowned_fields() {
        let mut live = live_service();
        live.data["spec"]["type"] = json!("NodePort");
        let merged = merge_owned(ManagedKind::Service, &desired_service(), &live).unwrap();

        assert_eq!(merged.data["spec"]["type"], json!("ClusterIP"));
        assert_eq!(merged.data["spec"]["clusterIP"], json!("10.0.0.12"));
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(
            merged
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("cloud.example.com/lb"))
                .map(String::as_str),
            Some("x")
        );
        assert!(owned_diff(ManagedKind::Service, &desired_service(), &merged)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_set_pointer_creates_parents() {
        let mut value = json!({"metadata": {"name": "x"}});
        set_pointer(&mut value, "/spec/rules", json!([1]));
        assert_eq!(value, json!({"metadata": {"name": "x"}, "spec": {"rules": [1]}}));
    }

    #[test]
    fn test_is_subset_arrays_must_match_length() {
        assert!(is_subset(&json!([1, 2]), &json!([1, 2]), &[]));
        assert!(!is_subset(&json!([1]), &json!([1, 2]), &[]));
        assert!(is_subset(&json!([]), &Value::Null, &[]));
        assert!(is_subset(&json!({}), &Value::Null, &[]));
        assert!(!is_subset(&json!({"a": 1}), &Value::Null, &[]));
    }

    #[test]
    fn test_exact_members_reject_extra_keys() {
        let want = json!({"containers": [{"name": "app", "resources": {"limits": {"cpu": "1"}}}]});
        let have = json!({"containers": [{
            "name": "app",
            "terminationMessagePath": "/dev/termination-log",
            "resources": {"limits": {"cpu": "1", "memory": "512Mi"}},
        }]});
        assert!(is_subset(&want, &have, &[]));
        assert!(!is_subset(&want, &have, &["resources"]));

        // omitted on the desired side, still set on the live side
        let want = json!({"containers": [{"name": "app"}]});
        assert!(!is_subset(&want, &have, &["resources"]));
        let have = json!({"containers": [{"name": "app", "resources": {}}]});
        assert!(is_subset(&want, &have, &["resources"]));
    }

    #[test]
    fn test_matches_exactly() {
        assert!(matches_exactly(&json!({"a": "1"}), &json!({"a": "1"})));
        assert!(!matches_exactly(&json!({"a": "1"}), &json!({"a": "1", "b": "2"})));
        assert!(matches_exactly(&Value::Null, &json!({})));
        assert!(!matches_exactly(&Value::Null, &json!({"a": "1"})));
    }

    fn ingress(annotations: Value) -> DynamicObject {
        dynamic(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": "r-app-ingress", "namespace": "default", "annotations": annotations},
            "spec": {"ingressClassName": "nginx", "rules": []},
        }))
    }

    #[test]
    fn test_removed_annotation_is_drift_and_merge_drops_it() {
        let desired = ingress(json!({"a": "1"}));
        let live = ingress(json!({"a": "1", "b": "2"}));
        assert_eq!(
            owned_diff(ManagedKind::Ingress, &desired, &live).unwrap(),
            vec!["/metadata/annotations"]
        );

        let merged = merge_owned(ManagedKind::Ingress, &desired, &live).unwrap();
        let annotations = merged.metadata.annotations.unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_omitted_owned_field_is_removed() {
        let mut desired = ingress(json!({}));
        desired.metadata.annotations = None;
        desired.data["spec"].as_object_mut().unwrap().remove("ingressClassName");
        let live = ingress(json!({"b": "2"}));

        let drift = owned_diff(ManagedKind::Ingress, &desired, &live).unwrap();
        assert_eq!(drift, vec!["/metadata/annotations", "/spec/ingressClassName"]);

        let merged = merge_owned(ManagedKind::Ingress, &desired, &live).unwrap();
        assert!(merged.metadata.annotations.is_none());
        assert!(merged.data["spec"].get("ingressClassName").is_none());
        assert!(owned_diff(ManagedKind::Ingress, &desired, &merged)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_controlled_by() {
        let mut obj = desired_service();
        assert!(!is_controlled_by(&obj, "uid-1"));
        obj.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "registry.apicur.io/v1".to_string(),
                kind: "ApicurioRegistry3".to_string(),
                name: "r".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
        ]);
        assert!(is_controlled_by(&obj, "uid-1"));
        assert!(!is_controlled_by(&obj, "uid-2"));
    }
}
