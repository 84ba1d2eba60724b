//! Cluster access
//!
//! [`ResourceClient`] is the only way the reconcile path talks to the API
//! server. [`KubeResourceClient`] implements it on top of `kube::Client`;
//! tests swap in an in-memory cluster.

use crate::crd::{ApicurioRegistry3, ApicurioRegistry3Status, KIND};
use crate::error::{OperatorError, Result};
use crate::kinds::ManagedKind;
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde::Serialize;
use serde_json::json;
use std::fmt;

/// Work queue key identifying one registry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing registry object
    pub fn from_registry(registry: &ApicurioRegistry3) -> Self {
        Self::new(
            registry.namespace().unwrap_or_else(|| "default".to_string()),
            registry.name_any(),
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// CRUD, status and finalizer access to the cluster
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch a registry; `None` if it does not exist
    async fn get_registry(&self, key: &ObjectKey) -> Result<Option<ApicurioRegistry3>>;

    /// Replace the finalizer list, guarded by the registry's resourceVersion
    async fn replace_finalizers(
        &self,
        registry: &ApicurioRegistry3,
        finalizers: Vec<String>,
    ) -> Result<ApicurioRegistry3>;

    /// Write the status sub-resource
    async fn patch_status(
        &self,
        registry: &ApicurioRegistry3,
        status: &ApicurioRegistry3Status,
    ) -> Result<()>;

    /// Fetch a dependent; `None` if it does not exist
    async fn get(
        &self,
        kind: ManagedKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List dependents matching a label selector
    async fn list(
        &self,
        kind: ManagedKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, kind: ManagedKind, object: &DynamicObject) -> Result<DynamicObject>;

    /// Full replace; the object must carry the resourceVersion it was read at
    async fn replace(&self, kind: ManagedKind, object: &DynamicObject) -> Result<DynamicObject>;

    /// Delete a dependent; a missing object yields [`OperatorError::NotFound`]
    async fn delete(&self, kind: ManagedKind, namespace: &str, name: &str) -> Result<()>;

    /// Fail with [`OperatorError::FatalStartup`] if the CRD is not served
    async fn check_registration(&self) -> Result<()>;
}

/// [`ResourceClient`] backed by a live API server
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, kind: ManagedKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }

    fn registries(&self, namespace: &str) -> Api<ApicurioRegistry3> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn object_name(object: &DynamicObject) -> (String, String) {
    (
        object.namespace().unwrap_or_else(|| "default".to_string()),
        object.name_any(),
    )
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get_registry(&self, key: &ObjectKey) -> Result<Option<ApicurioRegistry3>> {
        self.registries(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| OperatorError::from_kube(e, KIND, &key.namespace, &key.name))
    }

    async fn replace_finalizers(
        &self,
        registry: &ApicurioRegistry3,
        finalizers: Vec<String>,
    ) -> Result<ApicurioRegistry3> {
        let key = ObjectKey::from_registry(registry);
        // resourceVersion in a merge patch turns it into a conditional write
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": registry.resource_version(),
            }
        });
        self.registries(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from_kube(e, KIND, &key.namespace, &key.name))
    }

    async fn patch_status(
        &self,
        registry: &ApicurioRegistry3,
        status: &ApicurioRegistry3Status,
    ) -> Result<()> {
        let key = ObjectKey::from_registry(registry);
        let patch = json!({ "status": status });
        self.registries(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from_kube(e, KIND, &key.namespace, &key.name))?;
        Ok(())
    }

    async fn get(
        &self,
        kind: ManagedKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.dynamic(kind, namespace)
            .get_opt(name)
            .await
            .map_err(|e| OperatorError::from_kube(e, kind.as_str(), namespace, name))
    }

    async fn list(
        &self,
        kind: ManagedKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let list = self
            .dynamic(kind, namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn create(&self, kind: ManagedKind, object: &DynamicObject) -> Result<DynamicObject> {
        let (namespace, name) = object_name(object);
        self.dynamic(kind, &namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| OperatorError::from_kube(e, kind.as_str(), &namespace, &name))
    }

    async fn replace(&self, kind: ManagedKind, object: &DynamicObject) -> Result<DynamicObject> {
        let (namespace, name) = object_name(object);
        self.dynamic(kind, &namespace)
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| OperatorError::from_kube(e, kind.as_str(), &namespace, &name))
    }

    async fn delete(&self, kind: ManagedKind, namespace: &str, name: &str) -> Result<()> {
        self.dynamic(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| OperatorError::from_kube(e, kind.as_str(), namespace, name))?;
        Ok(())
    }

    async fn check_registration(&self) -> Result<()> {
        let registries: Api<ApicurioRegistry3> = Api::all(self.client.clone());
        match registries.list(&ListParams::default().limit(1)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(OperatorError::FatalStartup(
                format!("{} CRD is not installed in the cluster", KIND),
            )),
            Err(e) => Err(e.into()),
        }
    }
}
