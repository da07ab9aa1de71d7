//! Chaos suite: transport flaps under in-flight traffic.
//!
//! The server drops every live socket while invocations are outstanding;
//! clients must reconnect, resume their session, replay what is pending,
//! and still deliver every answer exactly once.

use seanet::{
    ClientConfig, ClientError, InvocationContext, MaritimeClient, MaritimeId, ReconnectPolicy,
    ServiceInit, position_now,
};
use serde::{Deserialize, Serialize};
use sn_test_utils::MockSeaServer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Serialize, Deserialize)]
struct Sound {
    ping: u32,
}

impl ServiceInit for Sound {
    const CHANNEL: &'static str = "sonar.Sound";
    type Reply = String;
}

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn chaos_config(server: &MockSeaServer, id: &str) -> ClientConfig {
    let mut cfg = ClientConfig::new(
        MaritimeId::parse(id).unwrap(),
        server.url(),
        || Ok(position_now(55.0, 12.0)),
    );
    cfg.reconnect = ReconnectPolicy {
        initial: Duration::from_millis(50),
        max: Duration::from_millis(400),
        jitter: 0.25,
        max_attempts: None,
    };
    cfg
}

async fn await_reconnect(client: &MaritimeClient, minimum: u64) {
    timeout(Duration::from_secs(5), async {
        while client.reconnect_count() < minimum {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client reconnected in time");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Flap mid-flight: invocations outstanding when every socket drops must
/// still resolve, and the provider must run each exactly once.
#[tokio::test]
async fn invocations_survive_a_transport_drop() {
    let server = MockSeaServer::start().await.unwrap();
    let provider = MaritimeClient::connect(chaos_config(&server, "mrn:vessel:deep")).await.unwrap();
    let caller = MaritimeClient::connect(chaos_config(&server, "mrn:vessel:surface"))
        .await
        .unwrap();

    // Answers arrive only after the flap below.
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    provider
        .service_register::<Sound, _>(move |ctx, msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                ctx.complete(&format!("echo-{}", msg.ping));
            });
        })
        .unwrap()
        .await_registered(Duration::from_secs(5))
        .await
        .unwrap();

    let futures: Vec<_> = (0..5)
        .map(|n| caller.service_invoke(provider.local_id().clone(), &Sound { ping: n }).unwrap())
        .collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    server.drop_connections();

    for (n, future) in futures.into_iter().enumerate() {
        let reply = future.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, format!("echo-{n}"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5, "each invocation ran exactly once");
    assert!(caller.reconnect_count() >= 1, "the flap forced a reconnect");

    provider.close();
    caller.close();
}

/// Repeated flaps in a short window: nothing is lost, nothing runs twice.
#[tokio::test]
async fn invocations_survive_rapid_reconnects() {
    let server = MockSeaServer::start().await.unwrap();
    let provider = MaritimeClient::connect(chaos_config(&server, "mrn:vessel:deep-2"))
        .await
        .unwrap();
    let caller = MaritimeClient::connect(chaos_config(&server, "mrn:vessel:surface-2"))
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    provider
        .service_register::<Sound, _>(move |ctx, msg| {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(700)).await;
                ctx.complete(&format!("echo-{}", msg.ping));
            });
        })
        .unwrap()
        .await_registered(Duration::from_secs(5))
        .await
        .unwrap();

    let futures: Vec<_> = (0..10)
        .map(|n| caller.service_invoke(provider.local_id().clone(), &Sound { ping: n }).unwrap())
        .collect();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        server.drop_connections();
    }

    for (n, future) in futures.into_iter().enumerate() {
        let reply = future.recv_timeout(Duration::from_secs(10)).await.unwrap();
        assert_eq!(reply, format!("echo-{n}"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 10);

    provider.close();
    caller.close();
}

/// An orphan response is a protocol error: the transport closes, pending
/// futures fail with `ConnectionLost`, and the client reconnects.
#[tokio::test]
async fn orphan_response_fails_pending_and_reconnects() {
    let server = MockSeaServer::start().await.unwrap();
    let provider = MaritimeClient::connect(chaos_config(&server, "mrn:vessel:mute"))
        .await
        .unwrap();
    let caller = MaritimeClient::connect(chaos_config(&server, "mrn:vessel:orphaned"))
        .await
        .unwrap();

    // A service that never answers keeps the invocation pending.
    let held: Arc<Mutex<Vec<InvocationContext<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let parking = Arc::clone(&held);
    provider
        .service_register::<Sound, _>(move |ctx, _| {
            parking.lock().unwrap().push(ctx);
        })
        .unwrap()
        .await_registered(Duration::from_secs(5))
        .await
        .unwrap();

    let stuck = caller.service_invoke(provider.local_id().clone(), &Sound { ping: 1 }).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(caller.pending_request_count(), 1);

    server.inject_frame(caller.local_id(), "[11, 9999]");

    let err = stuck.recv_timeout(Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err, ClientError::ConnectionLost);
    await_reconnect(&caller, 1).await;
    assert_eq!(caller.pending_request_count(), 0);

    // The resumed session is fully usable.
    let locator = caller.service_find::<Sound>();
    let nearest = timeout(Duration::from_secs(5), locator.nearest())
        .await
        .expect("lookup completes")
        .unwrap();
    assert_eq!(nearest, *provider.local_id());

    provider.close();
    caller.close();
}

/// When the server does not retain the session (fresh connection id), the
/// outstanding requests cannot be resumed and fail with `ConnectionLost`.
#[tokio::test]
async fn fresh_session_fails_unresumable_requests() {
    let server = MockSeaServer::start().await.unwrap();
    server.set_resume_sessions(false);

    let provider = MaritimeClient::connect(chaos_config(&server, "mrn:vessel:mute-2"))
        .await
        .unwrap();
    let caller = MaritimeClient::connect(chaos_config(&server, "mrn:vessel:reset"))
        .await
        .unwrap();

    let held: Arc<Mutex<Vec<InvocationContext<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let parking = Arc::clone(&held);
    provider
        .service_register::<Sound, _>(move |ctx, _| {
            parking.lock().unwrap().push(ctx);
        })
        .unwrap()
        .await_registered(Duration::from_secs(5))
        .await
        .unwrap();

    let stuck = caller.service_invoke(provider.local_id().clone(), &Sound { ping: 1 }).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.drop_connections();

    let err = stuck.recv_timeout(Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err, ClientError::ConnectionLost);

    await_reconnect(&caller, 1).await;
    assert_eq!(caller.pending_request_count(), 0);

    provider.close();
    caller.close();
}

/// `close()` during an outage stops the reconnect loop.
#[tokio::test]
async fn close_during_an_outage_terminates_cleanly() {
    let server = MockSeaServer::start().await.unwrap();
    let client = MaritimeClient::connect(chaos_config(&server, "mrn:vessel:leaving"))
        .await
        .unwrap();

    server.drop_connections();
    tokio::time::sleep(Duration::from_millis(30)).await;
    client.close();
    assert!(client.await_terminated(Duration::from_secs(2)).await);
}
