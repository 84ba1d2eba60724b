//! Dispatcher and work queue tests
//!
//! Runs reconcile passes through the queue the way the operator does, with
//! paused time so requeue delays elapse instantly.

use apicurio_registry_operator::client::ObjectKey;
use apicurio_registry_operator::config::OperatorConfig;
use apicurio_registry_operator::crd::{ApicurioRegistry3, ApicurioRegistry3Spec, StorageType};
use apicurio_registry_operator::dispatcher::Dispatcher;
use apicurio_registry_operator::error::OperatorError;
use apicurio_registry_operator::queue::WorkQueue;
use apicurio_registry_operator::test_support::{FakeCluster, FakeOp};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};

const NS: &str = "registries";

fn registry(name: &str) -> ApicurioRegistry3 {
    let mut registry = ApicurioRegistry3::new(name, ApicurioRegistry3Spec::default());
    registry.metadata.namespace = Some(NS.to_string());
    registry
}

fn config() -> OperatorConfig {
    OperatorConfig {
        workers: 3,
        backoff_base: Duration::from_millis(100),
        backoff_max: Duration::from_secs(5),
        ..Default::default()
    }
}

fn queue(config: &OperatorConfig) -> WorkQueue<ObjectKey> {
    WorkQueue::new(config.backoff_base, config.backoff_max)
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried_with_backoff() {
    let cluster = Arc::new(FakeCluster::new());
    let key = ObjectKey::from_registry(&cluster.apply_registry(registry("retry")));
    let dispatcher = Dispatcher::new(cluster.clone(), config(), None);
    let queue = queue(dispatcher.config());

    cluster.fail_next(
        FakeOp::GetRegistry,
        OperatorError::Transient("timeout".to_string()),
    );
    queue.add(key.clone()).await;
    let next = queue.get().await.unwrap();
    dispatcher.process(&queue, next).await;

    assert_eq!(queue.num_requeues(&key), 1);
    assert_eq!(queue.len().await, 0);

    let retried = timeout(Duration::from_secs(1), queue.get())
        .await
        .expect("key should come back after its backoff")
        .unwrap();
    assert_eq!(retried, key);
    dispatcher.process(&queue, retried).await;

    // the successful pass resets the backoff
    assert_eq!(queue.num_requeues(&key), 0);
    assert_eq!(cluster.objects().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_conflict_is_requeued_immediately() {
    let cluster = Arc::new(FakeCluster::new());
    let key = ObjectKey::from_registry(&cluster.apply_registry(registry("racy")));
    let dispatcher = Dispatcher::new(cluster.clone(), config(), None);
    let queue = queue(dispatcher.config());

    cluster.fail_next(
        FakeOp::ReplaceFinalizers,
        OperatorError::Conflict("racy".to_string()),
    );
    queue.add(key.clone()).await;
    let next = queue.get().await.unwrap();
    dispatcher.process(&queue, next).await;

    assert_eq!(queue.len().await, 1);
    assert_eq!(queue.num_requeues(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn test_progressing_registry_is_polled() {
    let cluster = Arc::new(FakeCluster::new());
    let key = ObjectKey::from_registry(&cluster.apply_registry(registry("poll")));
    let dispatcher = Dispatcher::new(cluster.clone(), config(), None);
    let queue = queue(dispatcher.config());

    queue.add(key.clone()).await;
    let next = queue.get().await.unwrap();
    dispatcher.process(&queue, next).await;
    assert_eq!(queue.len().await, 0);

    // comes back once the progress poll interval has passed
    let polled = timeout(Duration::from_secs(30), queue.get())
        .await
        .expect("progressing registry should be polled")
        .unwrap();
    assert_eq!(polled, key);
}

#[tokio::test(start_paused = true)]
async fn test_workers_converge_many_registries() {
    let cluster = Arc::new(FakeCluster::new());
    let keys: Vec<ObjectKey> = (0..6)
        .map(|i| ObjectKey::from_registry(&cluster.apply_registry(registry(&format!("r{}", i)))))
        .collect();
    let dispatcher = Arc::new(Dispatcher::new(cluster.clone(), config(), None));
    let queue = queue(dispatcher.config());
    let workers = tokio::spawn(Arc::clone(&dispatcher).run(queue.clone()));

    for key in &keys {
        // duplicate events collapse into one pending key
        queue.add(key.clone()).await;
        queue.add(key.clone()).await;
    }

    for _ in 0..100 {
        if cluster.objects().len() == keys.len() * 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cluster.mark_deployments_ready();

    let all_ready = || {
        keys.iter().all(|key| {
            cluster
                .registry(key)
                .and_then(|r| r.status)
                .map(|s| s.is_ready(1))
                .unwrap_or(false)
        })
    };
    for _ in 0..60 {
        if all_ready() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    queue.shutdown().await;
    workers.await.unwrap();

    assert!(all_ready());
    // one key is never reconciled by two workers at once, so nothing is
    // created twice
    assert_eq!(cluster.counters().creates, keys.len() * 3);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_registry_is_retried_once_per_interval() {
    let cluster = Arc::new(FakeCluster::new());
    let mut invalid = registry("invalid");
    // sql storage without connection settings
    invalid.spec.app.storage.storage_type = StorageType::Sql;
    let key = ObjectKey::from_registry(&cluster.apply_registry(invalid));
    let dispatcher = Dispatcher::new(
        cluster.clone(),
        OperatorConfig {
            permanent_requeue: Duration::from_secs(300),
            ..config()
        },
        None,
    );
    let queue = queue(dispatcher.config());
    let start = Instant::now();

    // three watch events a second apart, each failing the same way
    for _ in 0..3 {
        queue.add(key.clone()).await;
        let next = queue.get().await.unwrap();
        dispatcher.process(&queue, next).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(queue.num_waiting(), 1);

    let mut passes = 0;
    let end = start + Duration::from_secs(1250);
    while let Ok(Some(next)) = timeout_at(end, queue.get()).await {
        passes += 1;
        dispatcher.process(&queue, next).await;
    }

    // 300s, 600s, 900s and 1200s
    assert_eq!(passes, 4);
    assert_eq!(cluster.counters().creates, 0);
}
