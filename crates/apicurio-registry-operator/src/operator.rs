//! Operator runtime
//!
//! Wires the event source, work queue and dispatcher together. Everything
//! is constructed here from an explicit [`OperatorConfig`]; there is no
//! process-global state besides the metrics registry.

use crate::client::{KubeResourceClient, ObjectKey, ResourceClient};
use crate::config::OperatorConfig;
use crate::dispatcher::{ControllerMetrics, Dispatcher};
use crate::error::Result;
use crate::event_source::EventSource;
use crate::queue::WorkQueue;
use kube::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Capacity of the channel between the event source and the queue
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A configured operator ready to run
pub struct Operator {
    client: Client,
    resources: Arc<dyn ResourceClient>,
    config: OperatorConfig,
}

impl Operator {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            resources: Arc::new(KubeResourceClient::new(client.clone())),
            client,
            config,
        }
    }

    /// Run until a shutdown signal arrives
    ///
    /// Fails fast with [`crate::error::OperatorError::FatalStartup`] if the
    /// registry CRD is not installed.
    pub async fn run(self) -> Result<()> {
        self.resources.check_registration().await?;

        info!(
            namespace = self.config.namespace.as_deref().unwrap_or("all"),
            workers = self.config.workers,
            "Starting Apicurio Registry operator"
        );

        let queue: WorkQueue<ObjectKey> =
            WorkQueue::new(self.config.backoff_base, self.config.backoff_max);
        let (tx, mut rx) = mpsc::channel::<ObjectKey>(EVENT_CHANNEL_CAPACITY);

        let source = EventSource::new(self.client.clone(), self.config.namespace.clone());
        let source_task = tokio::spawn(source.run(tx));

        let forward_queue = queue.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(key) = rx.recv().await {
                forward_queue.add(key).await;
            }
        });

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.resources),
            self.config.clone(),
            Some(ControllerMetrics::new()),
        ));
        let workers = tokio::spawn(dispatcher.run(queue.clone()));

        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }

        source_task.abort();
        forward_task.abort();
        queue.shutdown().await;
        if let Err(e) = workers.await {
            warn!(error = %e, "Worker pool terminated abnormally");
        }

        info!("Operator stopped");
        Ok(())
    }
}
