//! In-memory cluster for tests
//!
//! [`FakeCluster`] implements [`ResourceClient`] over plain maps with
//! resourceVersion checks, owner-based garbage collection, call counters
//! and one-shot failure injection. It also exposes the actions a user or
//! another controller would take (editing a registry, deleting a
//! dependent, rolling pods to ready).

use crate::client::{ObjectKey, ResourceClient};
use crate::crd::{ApicurioRegistry3, ApicurioRegistry3Status, KIND};
use crate::error::{OperatorError, Result};
use crate::kinds::{ManagedKind, ResourceId};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Client operations failures can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    GetRegistry,
    ReplaceFinalizers,
    PatchStatus,
    Get,
    List,
    Create,
    Replace,
    Delete,
}

/// Successful calls per operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpCounters {
    pub creates: usize,
    pub replaces: usize,
    pub deletes: usize,
    pub status_patches: usize,
    pub finalizer_patches: usize,
}

impl OpCounters {
    /// Every call that changed cluster state
    pub fn mutations(&self) -> usize {
        self.creates + self.replaces + self.deletes + self.status_patches + self.finalizer_patches
    }
}

type ObjectSlot = (ManagedKind, String, String);

#[derive(Default)]
struct State {
    registries: BTreeMap<ObjectKey, ApicurioRegistry3>,
    objects: BTreeMap<ObjectSlot, DynamicObject>,
    revision: u64,
    uid_seq: u64,
    counters: OpCounters,
    failures: Vec<(FakeOp, OperatorError)>,
    deletions: Vec<ResourceId>,
    crd_missing: bool,
}

impl State {
    fn next_revision(&mut self) -> Option<String> {
        self.revision += 1;
        Some(self.revision.to_string())
    }

    fn next_uid(&mut self) -> Option<String> {
        self.uid_seq += 1;
        Some(format!("uid-{}", self.uid_seq))
    }

    fn take_failure(&mut self, op: FakeOp) -> Result<()> {
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(i) => Err(self.failures.remove(i).1),
            None => Ok(()),
        }
    }

    /// Owner-reference garbage collection
    fn collect_garbage(&mut self, owner_uid: &str) {
        self.objects.retain(|_, object| {
            !object
                .owner_references()
                .iter()
                .any(|o| o.uid == owner_uid)
        });
    }
}

fn slot(kind: ManagedKind, object: &DynamicObject) -> ObjectSlot {
    (
        kind,
        object.namespace().unwrap_or_else(|| "default".to_string()),
        object.name_any(),
    )
}

fn matches_selector(object: &DynamicObject, selector: &str) -> bool {
    let labels = object.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

/// In-memory [`ResourceClient`]
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or edit a registry the way `kubectl apply` would
    ///
    /// A spec change bumps `metadata.generation`.
    pub fn apply_registry(&self, mut registry: ApicurioRegistry3) -> ApicurioRegistry3 {
        let mut state = self.state();
        let key = ObjectKey::from_registry(&registry);
        registry.metadata.namespace = Some(key.namespace.clone());

        match state.registries.get(&key).cloned() {
            Some(existing) => {
                let spec_changed = serde_json::to_value(&existing.spec).ok()
                    != serde_json::to_value(&registry.spec).ok();
                let generation = existing.metadata.generation.unwrap_or(1);
                registry.metadata.uid = existing.metadata.uid.clone();
                registry.metadata.finalizers = existing.metadata.finalizers.clone();
                registry.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
                registry.metadata.generation =
                    Some(if spec_changed { generation + 1 } else { generation });
                registry.status = existing.status.clone();
            }
            None => {
                registry.metadata.uid = state.next_uid();
                registry.metadata.generation = Some(1);
            }
        }

        registry.metadata.resource_version = state.next_revision();
        state.registries.insert(key, registry.clone());
        registry
    }

    pub fn registry(&self, key: &ObjectKey) -> Option<ApicurioRegistry3> {
        self.state().registries.get(key).cloned()
    }

    /// User deletion: marks the registry while finalizers remain,
    /// otherwise removes it and its dependents
    pub fn delete_registry(&self, key: &ObjectKey) {
        let mut state = self.state();
        let Some(mut registry) = state.registries.get(key).cloned() else {
            return;
        };
        if registry.finalizers().is_empty() {
            state.registries.remove(key);
            if let Some(uid) = registry.metadata.uid.as_deref() {
                state.collect_garbage(uid);
            }
            return;
        }
        if registry.metadata.deletion_timestamp.is_none() {
            registry.metadata.deletion_timestamp = Some(Time(Utc::now()));
            registry.metadata.resource_version = state.next_revision();
            state.registries.insert(key.clone(), registry);
        }
    }

    pub fn object(&self, kind: ManagedKind, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.state()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every stored object, in apply order
    pub fn objects(&self) -> Vec<(ResourceId, DynamicObject)> {
        self.state()
            .objects
            .iter()
            .map(|((kind, _, name), object)| (ResourceId::new(*kind, name.clone()), object.clone()))
            .collect()
    }

    /// Delete a dependent behind the operator's back
    pub fn remove_object(&self, kind: ManagedKind, namespace: &str, name: &str) -> bool {
        self.state()
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .is_some()
    }

    /// Store an object as-is, e.g. one created by someone else
    pub fn insert_object(&self, kind: ManagedKind, mut object: DynamicObject) {
        let mut state = self.state();
        object.metadata.resource_version = state.next_revision();
        let key = slot(kind, &object);
        state.objects.insert(key, object);
    }

    /// Edit a stored object in place, bumping its resourceVersion
    pub fn edit_object(
        &self,
        kind: ManagedKind,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut DynamicObject),
    ) -> bool {
        let mut state = self.state();
        let revision = state.next_revision();
        match state
            .objects
            .get_mut(&(kind, namespace.to_string(), name.to_string()))
        {
            Some(object) => {
                edit(object);
                object.metadata.resource_version = revision;
                true
            }
            None => false,
        }
    }

    /// Report every Deployment as fully rolled out at its current generation
    pub fn mark_deployments_ready(&self) {
        let mut state = self.state();
        let mut revision = state.revision;
        for ((kind, _, _), object) in state.objects.iter_mut() {
            if *kind != ManagedKind::Deployment {
                continue;
            }
            let replicas = object.data["spec"]["replicas"].as_i64().unwrap_or(1);
            let generation = object.metadata.generation.unwrap_or(1);
            if let Some(data) = object.data.as_object_mut() {
                data.insert(
                    "status".to_string(),
                    json!({
                        "observedGeneration": generation,
                        "replicas": replicas,
                        "readyReplicas": replicas,
                        "updatedReplicas": replicas,
                        "availableReplicas": replicas,
                    }),
                );
            }
            revision += 1;
            object.metadata.resource_version = Some(revision.to_string());
        }
        state.revision = revision;
    }

    /// Fail the next call of `op` with `error`
    pub fn fail_next(&self, op: FakeOp, error: OperatorError) {
        self.state().failures.push((op, error));
    }

    pub fn set_crd_installed(&self, installed: bool) {
        self.state().crd_missing = !installed;
    }

    pub fn counters(&self) -> OpCounters {
        self.state().counters.clone()
    }

    /// Clear the counters and the deletion log
    pub fn reset_counters(&self) {
        let mut state = self.state();
        state.counters = OpCounters::default();
        state.deletions.clear();
    }

    /// Dependents deleted through the client, in call order
    pub fn deletions(&self) -> Vec<ResourceId> {
        self.state().deletions.clone()
    }
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn get_registry(&self, key: &ObjectKey) -> Result<Option<ApicurioRegistry3>> {
        let mut state = self.state();
        state.take_failure(FakeOp::GetRegistry)?;
        Ok(state.registries.get(key).cloned())
    }

    async fn replace_finalizers(
        &self,
        registry: &ApicurioRegistry3,
        finalizers: Vec<String>,
    ) -> Result<ApicurioRegistry3> {
        let mut state = self.state();
        state.take_failure(FakeOp::ReplaceFinalizers)?;
        let key = ObjectKey::from_registry(registry);
        let Some(mut stored) = state.registries.get(&key).cloned() else {
            return Err(OperatorError::not_found(KIND, &key.namespace, &key.name));
        };
        if stored.metadata.resource_version != registry.metadata.resource_version {
            return Err(OperatorError::Conflict(key.to_string()));
        }

        state.counters.finalizer_patches += 1;
        stored.metadata.finalizers = if finalizers.is_empty() {
            None
        } else {
            Some(finalizers)
        };
        stored.metadata.resource_version = state.next_revision();

        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            state.registries.remove(&key);
            if let Some(uid) = stored.metadata.uid.as_deref() {
                state.collect_garbage(uid);
            }
        } else {
            state.registries.insert(key, stored.clone());
        }
        Ok(stored)
    }

    async fn patch_status(
        &self,
        registry: &ApicurioRegistry3,
        status: &ApicurioRegistry3Status,
    ) -> Result<()> {
        let mut state = self.state();
        state.take_failure(FakeOp::PatchStatus)?;
        let key = ObjectKey::from_registry(registry);
        let revision = state.next_revision();
        let Some(stored) = state.registries.get_mut(&key) else {
            return Err(OperatorError::not_found(KIND, &key.namespace, &key.name));
        };
        stored.status = Some(status.clone());
        stored.metadata.resource_version = revision;
        state.counters.status_patches += 1;
        Ok(())
    }

    async fn get(
        &self,
        kind: ManagedKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let mut state = self.state();
        state.take_failure(FakeOp::Get)?;
        Ok(state
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(
        &self,
        kind: ManagedKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let mut state = self.state();
        state.take_failure(FakeOp::List)?;
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), object)| {
                *k == kind && ns == namespace && matches_selector(object, selector)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, kind: ManagedKind, object: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state();
        state.take_failure(FakeOp::Create)?;
        let key = slot(kind, object);
        if state.objects.contains_key(&key) {
            return Err(OperatorError::Conflict(format!(
                "{}/{} already exists",
                kind, key.2
            )));
        }

        let mut created = object.clone();
        created.metadata.namespace = Some(key.1.clone());
        created.metadata.uid = state.next_uid();
        created.metadata.generation = Some(1);
        created.metadata.resource_version = state.next_revision();
        state.counters.creates += 1;
        state.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn replace(&self, kind: ManagedKind, object: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state();
        state.take_failure(FakeOp::Replace)?;
        let key = slot(kind, object);
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(OperatorError::not_found(kind.as_str(), &key.1, &key.2));
        };
        if stored.metadata.resource_version != object.metadata.resource_version {
            return Err(OperatorError::Conflict(format!("{}/{}", kind, key.2)));
        }

        let mut replaced = object.clone();
        let generation = stored.metadata.generation.unwrap_or(1);
        replaced.metadata.generation = Some(if replaced.data.get("spec") != stored.data.get("spec") {
            generation + 1
        } else {
            generation
        });
        replaced.metadata.uid = stored.metadata.uid.clone();
        // status is a sub-resource; a replace never changes it
        if let Some(data) = replaced.data.as_object_mut() {
            match stored.data.get("status") {
                Some(status) => {
                    data.insert("status".to_string(), status.clone());
                }
                None => {
                    data.remove("status");
                }
            }
        }
        replaced.metadata.resource_version = state.next_revision();
        state.counters.replaces += 1;
        state.objects.insert(key, replaced.clone());
        Ok(replaced)
    }

    async fn delete(&self, kind: ManagedKind, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.take_failure(FakeOp::Delete)?;
        let key = (kind, namespace.to_string(), name.to_string());
        if state.objects.remove(&key).is_none() {
            return Err(OperatorError::not_found(kind.as_str(), namespace, name));
        }
        state.counters.deletes += 1;
        state.deletions.push(ResourceId::new(kind, name));
        Ok(())
    }

    async fn check_registration(&self) -> Result<()> {
        if self.state().crd_missing {
            return Err(OperatorError::FatalStartup(format!(
                "{} CRD is not installed in the cluster",
                KIND
            )));
        }
        Ok(())
    }
}
