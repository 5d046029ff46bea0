//! Kill escalation scenario (spec §8.6): a child that ignores SIGTERM is
//! only terminated once `kill` escalates to SIGKILL, roughly
//! `kill_escalation_timeout` later.

use process_broker::{Broker, BrokerConfig};
use std::time::{Duration, Instant};

fn stubborn_worker_path() -> String {
    env!("CARGO_BIN_EXE_stubborn_worker").to_string()
}

#[tokio::test]
async fn kill_escalates_to_sigkill_after_the_grace_period() {
    let mut config = BrokerConfig::default();
    config.kill_escalation_timeout = Duration::from_millis(500);
    let broker = Broker::new(config).await;

    broker.spawn("stubborn", &stubborn_worker_path(), vec![]).await.unwrap();

    let started = Instant::now();
    broker.kill("stubborn").await.expect("kill should eventually succeed via SIGKILL");
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(450),
        "kill returned too early ({elapsed:?}); SIGTERM-ignoring child should only die on SIGKILL"
    );

    let err = broker.kill("stubborn").await.unwrap_err();
    assert!(matches!(err, process_broker::BrokerError::NotRunning(_)));

    broker.shutdown().await;
}
