//! Status manager
//!
//! Aggregates dependent health into `Ready`, `Progressing` and `Degraded`
//! conditions and writes the status sub-resource at most once per pass.

use crate::apply::ApplyReport;
use crate::builder::resource_name;
use crate::client::ResourceClient;
use crate::crd::{
    ApicurioRegistry3, ApicurioRegistry3Status, Component, Condition, ConditionStatus,
    ManagedResourceRef, CONDITION_DEGRADED, CONDITION_PROGRESSING, CONDITION_READY,
};
use crate::error::{ErrorClass, OperatorError, Result};
use crate::kinds::{deployment_ready_replicas, ManagedKind, Readiness, ResourceId};
use chrono::Utc;
use kube::ResourceExt;
use tracing::debug;

/// Aggregate health of one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Ready,
    Progressing(String),
    Degraded(String),
}

impl Health {
    pub fn is_ready(&self) -> bool {
        matches!(self, Health::Ready)
    }
}

/// Insert or replace a condition, keeping the transition time when the
/// status value is unchanged
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

fn condition(
    condition_type: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
) -> Condition {
    Condition {
        condition_type: condition_type.to_string(),
        status: ConditionStatus::from(status),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        observed_generation: generation,
    }
}

/// Combine per-dependent readiness; failures win over pending work
pub fn aggregate_health(report: &ApplyReport) -> Health {
    let mut pending = Vec::new();
    for (id, object) in &report.observed {
        match id.kind.readiness(object) {
            Readiness::Ready => {}
            Readiness::Pending(reason) => pending.push(format!("{}: {}", id, reason)),
            Readiness::Failed(reason) => return Health::Degraded(format!("{}: {}", id, reason)),
        }
    }
    if pending.is_empty() {
        Health::Ready
    } else {
        Health::Progressing(pending.join("; "))
    }
}

fn base_status(registry: &ApicurioRegistry3) -> ApicurioRegistry3Status {
    let mut status = registry.status.clone().unwrap_or_default();
    status.observed_generation = registry.metadata.generation.unwrap_or(0);
    status.replicas = registry.spec.app.replicas;
    status.app_url = registry
        .spec
        .app
        .ingress
        .effective_host()
        .map(|host| format!("http://{}", host));
    status
}

fn apply_health(status: &mut ApicurioRegistry3Status, health: &Health, generation: i64) {
    let (ready, progressing, degraded) = match health {
        Health::Ready => (
            condition(CONDITION_READY, true, "AllDependentsReady", "", generation),
            condition(CONDITION_PROGRESSING, false, "Converged", "", generation),
            condition(CONDITION_DEGRADED, false, "AsExpected", "", generation),
        ),
        Health::Progressing(message) => (
            condition(CONDITION_READY, false, "DependentsNotReady", message.clone(), generation),
            condition(CONDITION_PROGRESSING, true, "Reconciling", message.clone(), generation),
            condition(CONDITION_DEGRADED, false, "AsExpected", "", generation),
        ),
        Health::Degraded(message) => (
            condition(CONDITION_READY, false, "Degraded", message.clone(), generation),
            condition(CONDITION_PROGRESSING, false, "Failed", "", generation),
            condition(CONDITION_DEGRADED, true, "DependentFailed", message.clone(), generation),
        ),
    };
    set_condition(&mut status.conditions, ready);
    set_condition(&mut status.conditions, progressing);
    set_condition(&mut status.conditions, degraded);
}

/// Status after a successful apply pass
pub fn compute_status(
    registry: &ApicurioRegistry3,
    report: &ApplyReport,
) -> (ApicurioRegistry3Status, Health) {
    let generation = registry.metadata.generation.unwrap_or(0);
    let mut status = base_status(registry);

    let mut managed: Vec<ManagedResourceRef> = report
        .observed
        .keys()
        .map(|id| ManagedResourceRef {
            kind: id.kind.to_string(),
            name: id.name.clone(),
        })
        .collect();
    managed.sort();
    status.managed_resources = managed;

    let app_deployment = ResourceId::new(
        ManagedKind::Deployment,
        resource_name(&registry.name_any(), Component::App, "deployment"),
    );
    status.ready_replicas = report
        .observed
        .get(&app_deployment)
        .map(deployment_ready_replicas)
        .unwrap_or(0);

    let health = aggregate_health(report);
    apply_health(&mut status, &health, generation);
    (status, health)
}

/// Status after a pass that failed before convergence could be judged
pub fn error_status(registry: &ApicurioRegistry3, error: &OperatorError) -> ApicurioRegistry3Status {
    let generation = registry.metadata.generation.unwrap_or(0);
    let mut status = base_status(registry);
    let message = error.to_string();

    if error.class() == ErrorClass::Permanent {
        set_condition(
            &mut status.conditions,
            condition(CONDITION_READY, false, error.reason(), message.clone(), generation),
        );
        set_condition(
            &mut status.conditions,
            condition(CONDITION_PROGRESSING, false, "Failed", "", generation),
        );
        set_condition(
            &mut status.conditions,
            condition(CONDITION_DEGRADED, true, error.reason(), message, generation),
        );
    } else {
        set_condition(
            &mut status.conditions,
            condition(CONDITION_READY, false, error.reason(), message.clone(), generation),
        );
        set_condition(
            &mut status.conditions,
            condition(CONDITION_PROGRESSING, true, error.reason(), message, generation),
        );
        set_condition(
            &mut status.conditions,
            condition(CONDITION_DEGRADED, false, "AsExpected", "", generation),
        );
    }
    status
}

/// Persist `status` unless it equals what is already stored
///
/// Returns whether a write was issued.
pub async fn write_if_changed(
    client: &dyn ResourceClient,
    registry: &ApicurioRegistry3,
    status: &ApicurioRegistry3Status,
) -> Result<bool> {
    if registry.status.as_ref() == Some(status) {
        debug!(name = %registry.name_any(), "Status unchanged, skipping write");
        return Ok(false);
    }
    client.patch_status(registry, status).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ApicurioRegistry3Spec;
    use crate::kinds::to_dynamic;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn registry(generation: i64) -> ApicurioRegistry3 {
        let mut spec = ApicurioRegistry3Spec::default();
        spec.app.replicas = 3;
        ApicurioRegistry3 {
            metadata: ObjectMeta {
                name: Some("r".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn report(ready_replicas: i32) -> ApplyReport {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("r-app-deployment".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(1),
                replicas: Some(3),
                ready_replicas: Some(ready_replicas),
                updated_replicas: Some(3),
                available_replicas: Some(ready_replicas),
                ..Default::default()
            }),
        };
        let service = Service {
            metadata: ObjectMeta {
                name: Some("r-app-service".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut report = ApplyReport::default();
        report.observed.insert(
            ResourceId::new(ManagedKind::Deployment, "r-app-deployment"),
            to_dynamic(&deployment).unwrap(),
        );
        report.observed.insert(
            ResourceId::new(ManagedKind::Service, "r-app-service"),
            to_dynamic(&service).unwrap(),
        );
        report
    }

    #[test]
    fn test_ready_when_all_dependents_ready() {
        let (status, health) = compute_status(&registry(1), &report(3));
        assert_eq!(health, Health::Ready);
        assert!(status.is_ready(1));
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(status.replicas, 3);
        assert_eq!(status.managed_resources.len(), 2);
        assert_eq!(
            status.condition(CONDITION_PROGRESSING).unwrap().status,
            ConditionStatus::False
        );
    }

    #[test]
    fn test_progressing_while_replicas_pending() {
        let (status, health) = compute_status(&registry(1), &report(1));
        assert!(matches!(health, Health::Progressing(_)));
        assert!(!status.is_ready(1));
        let progressing = status.condition(CONDITION_PROGRESSING).unwrap();
        assert_eq!(progressing.status, ConditionStatus::True);
        assert!(progressing.message.contains("1/3"));
    }

    #[test]
    fn test_conditions_carry_generation() {
        let (status, _) = compute_status(&registry(4), &report(3));
        for c in &status.conditions {
            assert_eq!(c.observed_generation, 4);
        }
        assert_eq!(status.observed_generation, 4);
    }

    #[test]
    fn test_transition_time_preserved_for_unchanged_status() {
        let mut conditions = vec![Condition {
            condition_type: CONDITION_READY.to_string(),
            status: ConditionStatus::True,
            reason: "AllDependentsReady".to_string(),
            message: String::new(),
            last_transition_time: Some("2024-01-01T00:00:00+00:00".to_string()),
            observed_generation: 1,
        }];
        set_condition(
            &mut conditions,
            condition(CONDITION_READY, true, "AllDependentsReady", "", 2),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
        assert_eq!(conditions[0].observed_generation, 2);

        set_condition(
            &mut conditions,
            condition(CONDITION_READY, false, "DependentsNotReady", "", 2),
        );
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
    }

    #[test]
    fn test_recomputed_status_is_stable() {
        let mut registry = registry(1);
        let (first, _) = compute_status(&registry, &report(3));
        registry.status = Some(first.clone());
        let (second, _) = compute_status(&registry, &report(3));
        assert_eq!(first, second);
    }

    #[test]
    fn test_permanent_error_sets_degraded() {
        let err = OperatorError::Validation("bad storage".to_string());
        let status = error_status(&registry(2), &err);
        let degraded = status.condition(CONDITION_DEGRADED).unwrap();
        assert_eq!(degraded.status, ConditionStatus::True);
        assert_eq!(degraded.reason, "InvalidSpec");
        assert!(degraded.message.contains("bad storage"));
        assert!(!status.is_ready(2));
    }

    #[test]
    fn test_transient_error_keeps_progressing() {
        let err = OperatorError::Transient("timeout".to_string());
        let status = error_status(&registry(1), &err);
        assert_eq!(
            status.condition(CONDITION_PROGRESSING).unwrap().status,
            ConditionStatus::True
        );
        assert_eq!(
            status.condition(CONDITION_DEGRADED).unwrap().status,
            ConditionStatus::False
        );
    }
}
