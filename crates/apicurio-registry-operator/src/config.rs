//! Runtime configuration of the operator

use crate::builder::{BuilderDefaults, DEFAULT_REGISTRY_VERSION};
use std::time::Duration;

/// Default number of reconcile workers
pub const DEFAULT_WORKERS: usize = 4;

/// Requeue interval while a registry is still converging
pub const DEFAULT_PROGRESS_POLL_SECONDS: u64 = 10;

/// Requeue interval after a permanent error
pub const DEFAULT_PERMANENT_REQUEUE_SECONDS: u64 = 300;

/// First backoff step for transient errors
pub const DEFAULT_BACKOFF_BASE_MILLIS: u64 = 1000;

/// Backoff cap for transient errors
pub const DEFAULT_BACKOFF_MAX_SECONDS: u64 = 300;

/// Settings shared by every component of a running operator
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches the whole cluster
    pub namespace: Option<String>,
    pub workers: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub permanent_requeue: Duration,
    pub progress_poll: Duration,
    pub defaults: BuilderDefaults,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: DEFAULT_WORKERS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MILLIS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECONDS),
            permanent_requeue: Duration::from_secs(DEFAULT_PERMANENT_REQUEUE_SECONDS),
            progress_poll: Duration::from_secs(DEFAULT_PROGRESS_POLL_SECONDS),
            defaults: BuilderDefaults::for_version(DEFAULT_REGISTRY_VERSION),
        }
    }
}
