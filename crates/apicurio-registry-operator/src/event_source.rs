//! Event source
//!
//! Watches registries and every managed kind and turns each change into the
//! key of the registry it concerns. Keys go down an explicit channel to the
//! work queue; nothing here touches cluster state.

use crate::client::ObjectKey;
use crate::crd::{ApicurioRegistry3, API_VERSION, KIND, MANAGED_BY};
use crate::kinds::ManagedKind;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DynamicObject};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type KeyStream = BoxStream<'static, Result<Option<ObjectKey>, watcher::Error>>;

/// Key of the registry that controls a dependent, if any
pub fn owner_key(meta: &ObjectMeta) -> Option<ObjectKey> {
    let namespace = meta.namespace.clone()?;
    meta.owner_references
        .iter()
        .flatten()
        .find(|o| o.controller == Some(true) && o.kind == KIND && o.api_version == API_VERSION)
        .map(|o| ObjectKey::new(namespace, o.name.clone()))
}

/// Watch streams feeding the work queue
pub struct EventSource {
    client: Client,
    namespace: Option<String>,
}

impl EventSource {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn registry_stream(&self) -> KeyStream {
        let api: Api<ApicurioRegistry3> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        watcher(api, watcher::Config::default())
            .default_backoff()
            .touched_objects()
            .map(|event| event.map(|registry| Some(ObjectKey::from_registry(&registry))))
            .boxed()
    }

    fn dependent_stream(&self, kind: ManagedKind) -> KeyStream {
        let resource = kind.api_resource();
        let api: Api<DynamicObject> = match &self.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        // Only objects labelled by this operator are interesting
        let config =
            watcher::Config::default().labels(&format!("app.kubernetes.io/managed-by={}", MANAGED_BY));
        watcher(api, config)
            .default_backoff()
            .touched_objects()
            .map(|event| event.map(|object| owner_key(&object.metadata)))
            .boxed()
    }

    /// Forward keys until the receiver is dropped
    pub async fn run(self, tx: mpsc::Sender<ObjectKey>) {
        let mut streams = vec![self.registry_stream()];
        streams.extend(ManagedKind::all().map(|kind| self.dependent_stream(kind)));
        let mut events = stream::select_all(streams);

        info!(
            namespace = self.namespace.as_deref().unwrap_or("<all>"),
            "Event source started"
        );

        while let Some(event) = events.next().await {
            match event {
                Ok(Some(key)) => {
                    debug!(key = %key, "Change observed");
                    if tx.send(key).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Watch error"),
            }
        }

        info!("Event source stopped");
    }
}
