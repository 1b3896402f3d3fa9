//! Resilient subscriptions: reconnects, chunk reassembly, cancellation.

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use node_network::client::Client;
use node_network::network::{NetworkError, NodePool, RandomSelector};
use node_network::resilience::RetryPolicy;
use node_network::streaming::{
    subscribe, PartStream, StreamPart, SubscribeContext, SubscriptionEvent,
};
use node_network::transport::{Code, TransportError};

mod common;
use common::{config, entries, MockConnection, MockTransport};

type Item = Result<StreamPart<String>, TransportError>;

/// What one attempt's factory call produces. `None` items means a stream
/// that never yields.
type Script = Result<Option<Vec<Item>>, TransportError>;

/// Factory that plays one script per attempt and records (attempt, delivered).
fn scripted(
    scripts: Vec<Script>,
    seen: Arc<Mutex<Vec<(u32, u64)>>>,
) -> impl FnMut(SubscribeContext<String, MockConnection>) -> BoxFuture<'static, Result<PartStream<String>, TransportError>>
       + Send
       + 'static {
    let scripts = Arc::new(Mutex::new(VecDeque::from(scripts)));
    move |ctx| {
        seen.lock().unwrap().push((ctx.attempt, ctx.delivered));
        let next = scripts.lock().unwrap().pop_front();
        let opened: BoxFuture<'static, Result<PartStream<String>, TransportError>> = Box::pin(async move {
            match next {
                Some(Ok(Some(items))) => Ok(stream::iter(items).boxed()),
                Some(Err(e)) => Err(e),
                Some(Ok(None)) | None => Ok(stream::pending().boxed()),
            }
        });
        opened
    }
}

async fn collect(mut rx: mpsc::UnboundedReceiver<SubscriptionEvent<String>>) -> Vec<SubscriptionEvent<String>> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn part(id: &str, n: u32, total: u32) -> Item {
    Ok(StreamPart::chunk(id, n, total, format!("{}{}", id, n)))
}

async fn pool() -> Arc<NodePool<String, MockTransport>> {
    let pool = Arc::new(NodePool::with_selector(
        MockTransport::new(),
        common::settings(),
        RandomSelector::from_seed(17),
    ));
    pool.reconcile(entries(&[
        ("0.0.3", "h1:50211"),
        ("0.0.4", "h2:50211"),
        ("0.0.5", "h3:50211"),
    ]))
    .await
    .unwrap();
    pool
}

fn messages(events: &[SubscriptionEvent<String>]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|e| match e {
            SubscriptionEvent::Message(m) => Some(m.parts.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_mid_stream_failure_reconnects_without_duplicates() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory = scripted(
        vec![
            Ok(Some(vec![
                part("a", 1, 2),
                part("a", 2, 2),
                part("b", 1, 2),
                Err(TransportError::unavailable("stream dropped")),
            ])),
            // The server replays from the start of the interrupted message.
            Ok(Some(vec![
                part("a", 2, 2),
                part("b", 1, 2),
                part("b", 2, 2),
                Ok(StreamPart::single("c".to_string())),
            ])),
        ],
        Arc::clone(&seen),
    );

    let (handle, rx) = subscribe(
        pool().await,
        RetryPolicy::subscription_default(),
        &Handle::current(),
        CancellationToken::new(),
        factory,
    );
    let events = collect(rx).await;
    handle.join().await;

    assert_eq!(
        messages(&events),
        vec![
            vec!["a1".to_string(), "a2".to_string()],
            vec!["b1".to_string(), "b2".to_string()],
            vec!["c".to_string()],
        ]
    );
    assert!(matches!(events.last(), Some(SubscriptionEvent::Completed)));
    assert_eq!(*seen.lock().unwrap(), vec![(1, 0), (2, 1)]);
}

#[tokio::test(start_paused = true)]
async fn test_single_node_reconnects_after_backoff() {
    let pool = Arc::new(NodePool::with_selector(
        MockTransport::new(),
        common::settings(),
        RandomSelector::from_seed(5),
    ));
    pool.reconcile(entries(&[("0.0.5", "mirror:5600")])).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory = scripted(
        vec![
            Ok(Some(vec![Err(TransportError::unavailable("stream dropped"))])),
            Ok(Some(vec![Ok(StreamPart::single("x".to_string()))])),
        ],
        Arc::clone(&seen),
    );
    let start = Instant::now();

    let (handle, rx) = subscribe(
        Arc::clone(&pool),
        RetryPolicy::subscription_default(),
        &Handle::current(),
        CancellationToken::new(),
        factory,
    );
    let events = collect(rx).await;
    handle.join().await;

    assert_eq!(messages(&events), vec![vec!["x".to_string()]]);
    assert!(matches!(events.last(), Some(SubscriptionEvent::Completed)));
    assert_eq!(*seen.lock().unwrap(), vec![(1, 0), (2, 0)]);
    // The reconnect waited out the node's 8s backoff.
    assert!(start.elapsed() >= Duration::from_secs(8));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_for_backed_off_node() {
    let pool = Arc::new(NodePool::with_selector(
        MockTransport::new(),
        common::settings(),
        RandomSelector::from_seed(5),
    ));
    pool.reconcile(entries(&[("0.0.5", "mirror:5600")])).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory = scripted(
        vec![Ok(Some(vec![Err(TransportError::unavailable("stream dropped"))]))],
        Arc::clone(&seen),
    );
    let (handle, rx) = subscribe(
        pool,
        RetryPolicy::subscription_default(),
        &Handle::current(),
        CancellationToken::new(),
        factory,
    );

    // Past the 500ms retry delay, inside the 8s node backoff.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!handle.is_finished());
    handle.cancel();
    let events = collect(rx).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        SubscriptionEvent::Failed(err) if matches!(err.kind, NetworkError::Cancelled) && err.attempts == 1
    ));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_retried_for_streams() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory = scripted(
        vec![
            Err(TransportError::new(Code::NotFound, "topic not yet visible")),
            Ok(Some(vec![Ok(StreamPart::single("x".to_string()))])),
        ],
        Arc::clone(&seen),
    );

    let (_handle, rx) = subscribe(
        pool().await,
        RetryPolicy::subscription_default(),
        &Handle::current(),
        CancellationToken::new(),
        factory,
    );
    let events = collect(rx).await;

    assert_eq!(messages(&events), vec![vec!["x".to_string()]]);
    assert!(matches!(events.last(), Some(SubscriptionEvent::Completed)));
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_stream_error_ends_subscription() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory = scripted(
        vec![Ok(Some(vec![
            Ok(StreamPart::single("x".to_string())),
            Err(TransportError::new(Code::PermissionDenied, "denied")),
        ]))],
        Arc::clone(&seen),
    );

    let (_handle, rx) = subscribe(
        pool().await,
        RetryPolicy::subscription_default(),
        &Handle::current(),
        CancellationToken::new(),
        factory,
    );
    let events = collect(rx).await;

    assert_eq!(events.len(), 2);
    match &events[1] {
        SubscriptionEvent::Failed(err) => {
            assert!(matches!(err.kind, NetworkError::Fatal(ref e) if e.code == Code::PermissionDenied));
            assert_eq!(err.attempts, 1);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_delivers_one_terminal_error() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let down = || -> Script { Err(TransportError::unavailable("down")) };
    let factory = scripted(vec![down(), down(), down(), down()], Arc::clone(&seen));
    let policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(8)).unwrap();

    let (_handle, rx) = subscribe(
        pool().await,
        policy,
        &Handle::current(),
        CancellationToken::new(),
        factory,
    );
    let events = collect(rx).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        SubscriptionEvent::Failed(err) => {
            assert!(matches!(err.kind, NetworkError::MaxAttemptsExceeded(_)));
            assert_eq!(err.attempts, 3);
            assert!(err.last_node.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_ends_open_stream() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory = scripted(vec![Ok(None)], Arc::clone(&seen));

    let (handle, rx) = subscribe(
        pool().await,
        RetryPolicy::subscription_default(),
        &Handle::current(),
        CancellationToken::new(),
        factory,
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!handle.is_finished());

    handle.cancel();
    let events = collect(rx).await;
    handle.join().await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        SubscriptionEvent::Failed(err) if matches!(err.kind, NetworkError::Cancelled)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_client_close_cancels_live_subscriptions() {
    let client = Client::builder(MockTransport::new())
        .config(config(&[("0.0.3", "h1:50211"), ("0.0.4", "h2:50211")]))
        .seed(2)
        .build()
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (first, first_rx) = client.subscribe(scripted(vec![Ok(None)], Arc::clone(&seen)));
    let (second, second_rx) = client.subscribe(scripted(vec![Ok(None)], Arc::clone(&seen)));
    assert_ne!(first.id(), second.id());
    assert_eq!(client.live_subscriptions(), 2);

    client.close().await.unwrap();

    for rx in [first_rx, second_rx] {
        let events = collect(rx).await;
        assert!(matches!(
            events.last(),
            Some(SubscriptionEvent::Failed(err)) if matches!(err.kind, NetworkError::Cancelled)
        ));
    }
    first.join().await;
    second.join().await;
    assert_eq!(client.live_subscriptions(), 0);
}
