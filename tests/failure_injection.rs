//! Failure injection tests for the retry executor and pool health.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use node_network::network::{NetworkError, NodePool, PoolSettings, RandomSelector};
use node_network::resilience::{RetryExecutor, RetryPolicy, Selection};
use node_network::transport::{Code, TransportError};

mod common;
use common::{entries, MockTransport};

async fn pool(
    transport: &Arc<MockTransport>,
    settings: PoolSettings,
    pairs: &[(&str, &str)],
) -> Arc<NodePool<String, MockTransport>> {
    let pool = Arc::new(NodePool::with_selector(
        Arc::clone(transport),
        settings,
        RandomSelector::from_seed(42),
    ));
    pool.reconcile(entries(pairs)).await.unwrap();
    pool
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(250), Duration::from_secs(8)).unwrap()
}

const THREE: &[(&str, &str)] = &[
    ("0.0.3", "h1:50211"),
    ("0.0.4", "h2:50211"),
    ("0.0.5", "h3:50211"),
];

#[tokio::test(start_paused = true)]
async fn test_always_unavailable_stops_after_max_attempts() {
    let transport = MockTransport::new();
    let pool = pool(&transport, common::settings(), THREE).await;
    let exec = RetryExecutor::new(Arc::clone(&pool), policy(3));

    let calls = AtomicU32::new(0);
    let last = Mutex::new(None);
    let err = exec
        .execute(Selection::Random, |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            *last.lock().unwrap() = Some(format!("{}@{}", ctx.node_key, ctx.endpoint));
            async { Err::<(), _>(TransportError::unavailable("down")) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(err.attempts, 3);
    assert!(matches!(err.kind, NetworkError::MaxAttemptsExceeded(ref e) if e.code == Code::Unavailable));
    assert_eq!(err.last_node, *last.lock().unwrap());
    assert!(err.to_string().contains("attempts: 3"));

    // Every node failed once and is backing off.
    assert_eq!(pool.healthy_len().await, 0);
    let snapshot = pool.snapshot().await;
    assert!(snapshot.nodes.iter().all(|n| n.bad_calls == 1));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_between_attempts_prevents_next_attempt() {
    let transport = MockTransport::new();
    let pool = pool(&transport, common::settings(), THREE).await;
    let exec = RetryExecutor::new(Arc::clone(&pool), policy(10));

    // Cancel once attempt 2 has failed, while the executor waits to retry.
    let cancel = CancellationToken::new();
    let second_failed = Arc::new(Notify::new());
    tokio::spawn({
        let cancel = cancel.clone();
        let second_failed = Arc::clone(&second_failed);
        async move {
            second_failed.notified().await;
            cancel.cancel();
        }
    });

    let calls = AtomicU32::new(0);
    let err = exec
        .execute_with_cancel(Selection::Random, &cancel, |_ctx| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                second_failed.notify_one();
            }
            async { Err::<(), _>(TransportError::unavailable("down")) }
        })
        .await
        .unwrap_err();

    assert!(matches!(err.kind, NetworkError::Cancelled));
    assert_eq!(err.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Both failures were fed back before the operation stopped.
    let bad_calls: u64 = pool.snapshot().await.nodes.iter().map(|n| n.bad_calls).sum();
    assert_eq!(bad_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_in_flight_call() {
    let transport = MockTransport::new();
    let pool = pool(&transport, common::settings(), THREE).await;
    let exec = RetryExecutor::new(pool, policy(10));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = exec
        .execute_with_cancel(Selection::Random, &cancel, |_ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TransportError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err.kind, NetworkError::Cancelled));
    assert_eq!(err.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_node_evicted_after_threshold() {
    let transport = MockTransport::new();
    let settings = PoolSettings {
        max_node_attempts: 2,
        ..common::settings()
    };
    let pool = pool(&transport, settings, &[("0.0.3", "h1:50211"), ("0.0.4", "h2:50211")]).await;
    let exec = RetryExecutor::new(Arc::clone(&pool), policy(2));

    let err = exec
        .execute(Selection::Keys(vec!["0.0.3".to_string()]), |_ctx| async {
            Err::<(), _>(TransportError::unavailable("down"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err.kind, NetworkError::MaxAttemptsExceeded(_)));
    assert_eq!(err.attempts, 2);
    assert_eq!(err.last_node.as_deref(), Some("0.0.3@h1:50211"));

    assert!(matches!(
        pool.nodes_for_key(&"0.0.3".to_string()).await,
        Err(NetworkError::UnknownKey(_))
    ));
    assert_eq!(pool.len().await, 1);
    assert!(!pool.network().await.contains_key("h1:50211"));

    let conns = transport.connections_to("h1");
    assert_eq!(conns.len(), 1);
    assert!(conns[0].shut_down.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_leaves_health_alone() {
    let transport = MockTransport::new();
    let pool = pool(&transport, common::settings(), THREE).await;
    let exec = RetryExecutor::new(Arc::clone(&pool), policy(5));

    let err = exec
        .execute(Selection::Random, |_ctx| async {
            Err::<(), _>(TransportError::new(Code::PermissionDenied, "nope"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err.kind, NetworkError::Fatal(ref e) if e.code == Code::PermissionDenied));
    assert_eq!(err.attempts, 1);
    assert_eq!(pool.healthy_len().await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_stream_reset_is_retried() {
    let transport = MockTransport::new();
    let pool = pool(&transport, common::settings(), THREE).await;
    let exec = RetryExecutor::new(pool, policy(5));

    let calls = AtomicU32::new(0);
    let value = exec
        .execute(Selection::Random, |_ctx| {
            let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    Err(TransportError::internal("Received Rst Stream from peer"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_request_deadline_surfaces_timeout() {
    let transport = MockTransport::new();
    let pool = pool(&transport, common::settings(), THREE).await;
    let exec = RetryExecutor::new(pool, policy(5).with_request_timeout(Duration::from_secs(1)));

    let err = exec
        .execute(Selection::Random, |_ctx| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok::<_, TransportError>(())
        })
        .await
        .unwrap_err();
    assert!(err.kind.is_timeout());
    assert_eq!(err.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_counts_against_node() {
    let transport = MockTransport::new();
    transport.refuse("h1");
    let pool = pool(&transport, common::settings(), &[("0.0.3", "h1:50211")]).await;
    let exec = RetryExecutor::new(Arc::clone(&pool), policy(3));
    let start = Instant::now();

    let err = exec
        .execute(Selection::Random, |_ctx| async { Ok::<_, TransportError>(()) })
        .await
        .unwrap_err();

    // The only node is waited out after each failure, so every attempt is used.
    assert!(matches!(err.kind, NetworkError::MaxAttemptsExceeded(_)));
    assert_eq!(err.attempts, 3);
    assert_eq!(err.last_node.as_deref(), Some("0.0.3@h1:50211"));
    assert_eq!(transport.connect_count(), 3);
    // Node backoff 8s then 16s.
    assert!(start.elapsed() >= Duration::from_secs(24));

    let snapshot = pool.snapshot().await;
    assert_eq!(snapshot.nodes[0].bad_calls, 3);
    assert!(!snapshot.nodes[0].healthy);
}

#[tokio::test(start_paused = true)]
async fn test_backed_off_node_readmitted_after_wait() {
    let transport = MockTransport::new();
    transport.refuse("h1");
    let pool = pool(&transport, common::settings(), &[("0.0.3", "h1:50211")]).await;
    let exec = RetryExecutor::new(Arc::clone(&pool), policy(1));

    assert!(exec
        .execute(Selection::Random, |_ctx| async { Ok::<_, TransportError>(()) })
        .await
        .is_err());
    assert_eq!(pool.healthy_len().await, 0);

    transport.accept("h1");
    tokio::time::advance(Duration::from_secs(9)).await;

    exec.execute(Selection::Random, |_ctx| async { Ok::<_, TransportError>(()) })
        .await
        .unwrap();
    assert_eq!(pool.healthy_len().await, 1);
}

#[test]
fn test_execute_blocking() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let transport = MockTransport::new();
    let pool = runtime.block_on(pool(&transport, common::settings(), THREE));
    let exec = RetryExecutor::new(pool, policy(3));

    let key = exec
        .execute_blocking(runtime.handle(), Selection::Keys(vec!["0.0.4".to_string()]), |ctx| async move {
            Ok::<_, TransportError>(ctx.node_key)
        })
        .unwrap();
    assert_eq!(key, "0.0.4");
}
