//! Exercises the broker-local dispatcher and stats aggregator end-to-end
//! through a real child process, rather than the in-memory loopback
//! transport the router's unit tests use.

use process_broker::{Broker, BrokerConfig};
use std::time::Duration;

fn echo_worker_path() -> String {
    env!("CARGO_BIN_EXE_echo_worker").to_string()
}

#[tokio::test]
async fn stats_reflect_a_real_rpc_round_trip() {
    let broker = Broker::new(BrokerConfig::default()).await;
    broker.spawn_rpc("worker", &echo_worker_path(), vec![]).await.unwrap();

    broker
        .invoke_rpc("worker", "ping", b"{}".to_vec(), Duration::from_secs(2))
        .await
        .expect("invoke_rpc should succeed");

    // The response is delivered straight to invoke_rpc's waiter via the
    // correlation-id match in handle_frame, so it never crosses the inbound
    // queue; only send_to_process-side counters are guaranteed to have
    // bumped here (see Router::recv_inbound for the received-side counter).
    let snapshot = broker.stats_snapshot().await;
    assert!(snapshot.total_sent.request >= 1);
    assert_eq!(snapshot.per_process["worker"].sent.request, 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn process_exited_event_is_published_on_the_broadcast_channel() {
    let broker = Broker::new(BrokerConfig::default()).await;
    let mut events = broker.subscribe_events();

    broker.spawn("short-lived", "true", vec![]).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event should arrive before timeout")
        .expect("broadcast channel should not be closed");

    assert_eq!(event.id, "process_exited");
    assert_eq!(event.source, "short-lived");

    broker.shutdown().await;
}
