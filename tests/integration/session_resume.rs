//! Session resume: replay ordering and exactly-once retransmission.
//!
//! After a resume, every still-pending request must be retransmitted once,
//! in ascending `reply_to` order, before anything newer reaches the wire.

use seanet::{
    ClientConfig, InvocationContext, MaritimeClient, MaritimeId, ReconnectPolicy, ServiceInit,
    position_now,
};
use serde::{Deserialize, Serialize};
use sn_test_utils::MockSeaServer;
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

fn resume_config(server: &MockSeaServer, id: &str) -> ClientConfig {
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

#[tokio::test]
async fn pending_requests_replay_in_order_exactly_once_before_new_traffic() {
    let server = MockSeaServer::start().await.unwrap();
    let provider = MaritimeClient::connect(resume_config(&server, "mrn:vessel:keeper"))
        .await
        .unwrap();
    let caller = MaritimeClient::connect(resume_config(&server, "mrn:vessel:replayer"))
        .await
        .unwrap();

    // Park invocations so they stay pending across the drop.
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

    let futures: Vec<_> = (0..3)
        .map(|n| caller.service_invoke(provider.local_id().clone(), &Sound { ping: n }).unwrap())
        .collect();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(caller.pending_request_count(), 3);

    server.drop_connections();
    await_reconnect(&caller, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // New traffic only after the replay.
    let fourth = caller.service_invoke(provider.local_id().clone(), &Sound { ping: 3 }).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let id = caller.local_id().clone();
    let log = server.request_log(&id);
    assert_eq!(
        log,
        vec![1, 2, 3, 1, 2, 3, 4],
        "original sends, one ordered replay, then new traffic"
    );

    // Release the parked invocations: all four futures must now resolve
    // (the server deduplicated the replays, so there are exactly four).
    {
        let mut parked = held.lock().unwrap();
        assert_eq!(parked.len(), 4, "replays did not re-run the service");
        for ctx in parked.drain(..) {
            ctx.complete(&"ok".to_owned());
        }
    }
    for future in futures.into_iter().chain(std::iter::once(fourth)) {
        assert_eq!(
            future.recv_timeout(Duration::from_secs(5)).await.unwrap(),
            "ok"
        );
    }

    provider.close();
    caller.close();
}

#[tokio::test]
async fn requests_submitted_during_an_outage_are_sent_after_reconnect() {
    let server = MockSeaServer::start().await.unwrap();
    let provider = MaritimeClient::connect(resume_config(&server, "mrn:vessel:keeper-2"))
        .await
        .unwrap();
    let caller = MaritimeClient::connect(resume_config(&server, "mrn:vessel:buffered"))
        .await
        .unwrap();

    provider
        .service_register::<Sound, _>(|ctx, msg| ctx.complete(&format!("echo-{}", msg.ping)))
        .unwrap()
        .await_registered(Duration::from_secs(5))
        .await
        .unwrap();

    server.drop_connections();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Submitted while the transport is down; buffered, then delivered.
    let future = caller.service_invoke(provider.local_id().clone(), &Sound { ping: 9 }).unwrap();
    let reply = future.recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(reply, "echo-9");
    assert!(caller.reconnect_count() >= 1);

    provider.close();
    caller.close();
}
