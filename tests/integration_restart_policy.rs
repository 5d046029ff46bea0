//! Restart policy scenario (spec §8.3): a child that exits immediately is
//! restarted up to `max_attempts` times, then left absent.

use process_broker::{Broker, BrokerConfig};
use std::time::Duration;

fn echo_worker_path() -> String {
    env!("CARGO_BIN_EXE_echo_worker").to_string()
}

#[tokio::test]
async fn bounded_restart_policy_eventually_stops_and_leaves_process_absent() {
    let broker = Broker::new(BrokerConfig::default()).await;
    broker
        .spawn_with_restart("crasher", "false", vec![], 2)
        .await
        .expect("spawn with restart");

    // exit -> backoff(1s) -> restart -> exit -> backoff(1s) -> restart -> exit
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let err = broker.kill("crasher").await.unwrap_err();
    assert!(matches!(err, process_broker::BrokerError::NotRunning(_)));

    broker.shutdown().await;
}

#[tokio::test]
async fn kill_on_already_exited_process_does_not_mutate_status() {
    let broker = Broker::new(BrokerConfig::default()).await;
    broker.spawn("short-lived", "true", vec![]).await.unwrap();

    for _ in 0..50 {
        if broker.kill("short-lived").await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let err = broker.kill("short-lived").await.unwrap_err();
    assert!(matches!(err, process_broker::BrokerError::NotRunning(_)));
    broker.shutdown().await;
}

/// A restarted RPC child must be readable from exactly like the first
/// instance was: the reader task has to reattach on every restart, not only
/// on the caller's initial `spawn_rpc_with_restart` call.
#[tokio::test]
async fn a_restarted_rpc_child_is_still_readable() {
    let broker = Broker::new(BrokerConfig::default()).await;
    broker
        .spawn_rpc_with_restart("worker", &echo_worker_path(), vec![], 1)
        .await
        .expect("spawn_rpc_with_restart");

    broker
        .invoke_rpc("worker", "ping", b"{}".to_vec(), Duration::from_secs(2))
        .await
        .expect("first round trip should succeed");

    broker.kill("worker").await.expect("kill triggers a restart");

    // restart_backoff(1s) + time for the new child to connect its pipes.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    broker
        .invoke_rpc("worker", "ping", b"{}".to_vec(), Duration::from_secs(2))
        .await
        .expect("round trip against the restarted instance should succeed");

    broker.shutdown().await;
}
