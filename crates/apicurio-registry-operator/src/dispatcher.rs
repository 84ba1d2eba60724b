//! Reconcile dispatcher
//!
//! Pulls keys off the work queue with a bounded pool of workers, runs one
//! reconcile pass per key and turns the result into a requeue decision.
//! This is the only place where errors become retries.

use crate::apply::ApplyEngine;
use crate::builder::build;
use crate::client::{ObjectKey, ResourceClient};
use crate::config::OperatorConfig;
use crate::crd::ApicurioRegistry3;
use crate::error::{ErrorClass, OperatorError, Result};
use crate::finalizer::{cleanup, ensure_finalizer, lifecycle_state, LifecycleState};
use crate::queue::WorkQueue;
use crate::status::{compute_status, error_status, write_if_changed, Health};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Result of one reconcile pass
#[derive(Debug)]
pub enum Outcome {
    /// Converged; no requeue
    Success,
    /// Still converging; look again later
    RequeueAfter(Duration),
    /// Lost an optimistic-concurrency race; retry immediately
    Conflict,
    /// Retry with backoff
    Transient(OperatorError),
    /// Surfaced as a condition; retried on a long fixed interval
    Permanent(OperatorError),
}

impl Outcome {
    fn from_error(err: OperatorError) -> Self {
        match err.class() {
            ErrorClass::Conflict | ErrorClass::NotFound => Outcome::Conflict,
            ErrorClass::Transient => Outcome::Transient(err),
            ErrorClass::Permanent | ErrorClass::Fatal => Outcome::Permanent(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Metrics for the dispatcher
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Keys waiting in the work queue
    pub queue_depth: metrics::Gauge,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("apicurio_operator_reconciliations_total"),
            errors: metrics::counter!("apicurio_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("apicurio_operator_reconciliation_duration_seconds"),
            queue_depth: metrics::gauge!("apicurio_operator_queue_depth"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs reconcile passes for registries
pub struct Dispatcher {
    client: Arc<dyn ResourceClient>,
    config: OperatorConfig,
    metrics: Option<ControllerMetrics>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        config: OperatorConfig,
        metrics: Option<ControllerMetrics>,
    ) -> Self {
        Self {
            client,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Run one reconcile pass for `key` and classify the result
    #[instrument(skip_all, fields(key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Outcome {
        let registry = match self.client.get_registry(key).await {
            Ok(Some(registry)) => registry,
            Ok(None) => {
                debug!("Registry no longer exists, dropping key");
                return Outcome::Success;
            }
            Err(e) => return Outcome::from_error(e),
        };

        match self.reconcile_registry(&registry).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.report_error(&registry, &e).await;
                Outcome::from_error(e)
            }
        }
    }

    async fn reconcile_registry(&self, registry: &ApicurioRegistry3) -> Result<Outcome> {
        let client = self.client.as_ref();

        match lifecycle_state(Some(registry)) {
            LifecycleState::Terminating => {
                info!(name = %registry.name_any(), "Cleaning up registry");
                cleanup(client, registry).await?;
                Ok(Outcome::Success)
            }
            LifecycleState::Released | LifecycleState::Gone => Ok(Outcome::Success),
            LifecycleState::Active => {
                let registry = ensure_finalizer(client, registry).await?;
                let desired = build(&registry, &self.config.defaults)?;
                let report = ApplyEngine::new(client).apply(&registry, &desired).await?;
                let (status, health) = compute_status(&registry, &report);
                write_if_changed(client, &registry, &status).await?;

                debug!(
                    created = report.created.len(),
                    updated = report.updated.len(),
                    deleted = report.deleted.len(),
                    ?health,
                    "Apply pass finished"
                );

                Ok(match health {
                    Health::Ready => Outcome::Success,
                    Health::Progressing(_) => Outcome::RequeueAfter(self.config.progress_poll),
                    Health::Degraded(_) => Outcome::RequeueAfter(self.config.permanent_requeue),
                })
            }
        }
    }

    /// Surface a failed pass in the registry status
    async fn report_error(&self, registry: &ApicurioRegistry3, err: &OperatorError) {
        let reportable = matches!(err.class(), ErrorClass::Permanent | ErrorClass::Transient);
        if !reportable || lifecycle_state(Some(registry)) != LifecycleState::Active {
            return;
        }
        let status = error_status(registry, err);
        if let Err(e) = write_if_changed(self.client.as_ref(), registry, &status).await {
            warn!(error = %e, "Failed to record error in status");
        }
    }

    /// Reconcile a dequeued key and requeue it according to the outcome
    pub async fn process(&self, queue: &WorkQueue<ObjectKey>, key: ObjectKey) {
        let start = Instant::now();
        if let Some(ref metrics) = self.metrics {
            metrics.reconciliations.increment(1);
        }

        let outcome = self.reconcile(&key).await;

        if let Some(ref metrics) = self.metrics {
            metrics.duration.record(start.elapsed().as_secs_f64());
        }

        match outcome {
            Outcome::Success => {
                queue.forget(&key);
            }
            Outcome::RequeueAfter(delay) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Outcome::Conflict => {
                debug!(key = %key, "Conflict, requeueing immediately");
                queue.add(key.clone()).await;
            }
            Outcome::Transient(e) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.errors.increment(1);
                }
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    key = %key,
                    error = %e,
                    retry = queue.num_requeues(&key),
                    delay_ms = delay.as_millis() as u64,
                    "Reconciliation failed, will retry"
                );
            }
            Outcome::Permanent(e) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.errors.increment(1);
                }
                queue.forget(&key);
                queue.add_after(key.clone(), self.config.permanent_requeue);
                error!(
                    key = %key,
                    error = %e,
                    reason = e.reason(),
                    "Reconciliation failed permanently"
                );
            }
        }

        queue.done(&key).await;
    }

    async fn run_worker(self: Arc<Self>, id: usize, queue: WorkQueue<ObjectKey>) {
        debug!(worker = id, "Worker started");
        while let Some(key) = queue.get().await {
            if let Some(ref metrics) = self.metrics {
                metrics.queue_depth.set(queue.len().await as f64);
            }
            self.process(&queue, key).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    /// Run the worker pool until the queue shuts down
    pub async fn run(self: Arc<Self>, queue: WorkQueue<ObjectKey>) {
        let workers = self.config.workers.max(1);
        info!(workers, "Starting reconcile workers");

        let handles: Vec<_> = (0..workers)
            .map(|id| tokio::spawn(Arc::clone(&self).run_worker(id, queue.clone())))
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert!(matches!(
            Outcome::from_error(OperatorError::Conflict("x".into())),
            Outcome::Conflict
        ));
        assert!(matches!(
            Outcome::from_error(OperatorError::not_found("Service", "ns", "x")),
            Outcome::Conflict
        ));
        assert!(matches!(
            Outcome::from_error(OperatorError::Transient("x".into())),
            Outcome::Transient(_)
        ));
        assert!(matches!(
            Outcome::from_error(OperatorError::Validation("x".into())),
            Outcome::Permanent(_)
        ));
        assert!(matches!(
            Outcome::from_error(OperatorError::Ownership {
                kind: "Service".into(),
                name: "x".into()
            }),
            Outcome::Permanent(_)
        ));
    }
}
