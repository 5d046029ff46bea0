//! Happy-path RPC scenario (spec §8.1): spawn an RPC child that echoes
//! Requests as Responses, invoke it, and confirm the pending table empties.

use process_broker::{BrokerConfig, Broker};
use std::time::Duration;

fn echo_worker_path() -> String {
    env!("CARGO_BIN_EXE_echo_worker").to_string()
}

#[tokio::test]
async fn happy_rpc_round_trip_through_a_real_child_process() {
    let broker = Broker::new(BrokerConfig::default()).await;
    broker
        .spawn_rpc("worker", &echo_worker_path(), vec![])
        .await
        .expect("spawn worker");

    let response = broker
        .invoke_rpc("worker", "ping", br#"{"n":1}"#.to_vec(), Duration::from_secs(2))
        .await
        .expect("invoke_rpc should succeed");

    let payload: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["echo"]["n"], 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn invoke_rpc_times_out_against_a_silent_child() {
    let broker = Broker::new(BrokerConfig::default()).await;
    // `sleep` never speaks the wire protocol on its inherited pipes, so any
    // invoke_rpc against it must time out rather than hang.
    broker
        .spawn_rpc("silent", "sleep", vec!["2".to_string()])
        .await
        .expect("spawn silent worker");

    let err = broker
        .invoke_rpc("silent", "ping", b"{}".to_vec(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, process_broker::BrokerError::Timeout { .. }));

    broker.shutdown().await;
}

#[tokio::test]
async fn duplicate_process_id_is_rejected() {
    let broker = Broker::new(BrokerConfig::default()).await;
    broker.spawn_rpc("dup", &echo_worker_path(), vec![]).await.unwrap();
    let err = broker.spawn_rpc("dup", &echo_worker_path(), vec![]).await.unwrap_err();
    assert!(matches!(err, process_broker::BrokerError::DuplicateId(_)));
    broker.shutdown().await;
}
