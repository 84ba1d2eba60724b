//! # Apicurio Registry Kubernetes Operator
//!
//! Kubernetes operator that deploys and manages Apicurio Registry 3 instances
//! declared through the `ApicurioRegistry3` custom resource.
//!
//! For each registry the operator owns a ConfigMap, a backend Deployment, a
//! Service and an Ingress (plus a UI Deployment when the UI is enabled), and
//! keeps them converged on the declared spec.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use apicurio_registry_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     Operator::new(client, OperatorConfig::default()).run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: the [`event_source`] maps changes to registries and to any
//!    object they control onto the registry's key
//! 2. **Queue**: the [`queue`] deduplicates keys, never hands one key to two
//!    workers at once and rate-limits retries
//! 3. **Reconcile**: the [`dispatcher`] builds the desired state
//!    ([`builder`]), converges the cluster on it ([`apply`]) and writes the
//!    observed health back ([`status`])
//! 4. **Delete**: a [`finalizer`] holds the registry until every dependent
//!    has been removed
//!
//! ## Custom Resource
//!
//! ```yaml
//! apiVersion: registry.apicur.io/v1
//! kind: ApicurioRegistry3
//! metadata:
//!   name: my-registry
//! spec:
//!   app:
//!     replicas: 3
//!     storage:
//!       type: sql
//!       sql:
//!         url: jdbc:postgresql://postgres:5432/registry
//!         username: registry
//!         passwordSecretRef:
//!           name: registry-db
//!           key: password
//!     ingress:
//!       host: registry.example.com
//!   ui:
//!     enabled: true
//!     ingress:
//!       host: registry-ui.example.com
//! ```
//!
//! ## Metrics
//!
//! - `apicurio_operator_reconciliations_total` - Total reconciliation attempts
//! - `apicurio_operator_reconciliation_errors_total` - Failed reconciliations
//! - `apicurio_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `apicurio_operator_queue_depth` - Keys waiting for a worker

pub mod apply;
pub mod builder;
pub mod client;
pub mod config;
pub mod crd;
pub mod dispatcher;
pub mod error;
pub mod event_source;
pub mod finalizer;
pub mod kinds;
pub mod operator;
pub mod queue;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::apply::{ApplyEngine, ApplyReport};
    pub use crate::builder::{build, validate_spec, BuilderDefaults, DesiredState};
    pub use crate::client::{KubeResourceClient, ObjectKey, ResourceClient};
    pub use crate::config::OperatorConfig;
    pub use crate::crd::{
        ApicurioRegistry3, ApicurioRegistry3Spec, ApicurioRegistry3Status, AppSpec, Condition,
        ConditionStatus, IngressSpec, StorageSpec, StorageType, UiSpec,
    };
    pub use crate::dispatcher::{ControllerMetrics, Dispatcher, Outcome};
    pub use crate::error::{ErrorClass, OperatorError, Result};
    pub use crate::kinds::{ManagedKind, Readiness, ResourceId};
    pub use crate::operator::Operator;
    pub use crate::queue::WorkQueue;
    pub use crate::status::Health;
}
