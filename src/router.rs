//! # Message Router
//!
//! Parses framed messages read from each child, routes them by explicit
//! target, by correlation ID to a waiting [`Broker::invoke_rpc`] caller, or
//! to the broker-local handler table; generates correlation IDs; enforces
//! at-most-once delivery of a response to its pending waiter.
//!
//! Generalizes the per-connection accept-loop pattern used elsewhere in
//! this crate's socket code (one task spawned per client) into one reader
//! task per RPC child feeding a shared router.

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::handlers::HandlerTable;
use crate::message::{Encoding, Message, MessageType, BROKER_TARGET};
use crate::process::{ProcessRecord, ProcessStatus};
use crate::stats::StatsAggregator;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ProcessTable = Arc<RwLock<HashMap<String, Arc<ProcessRecord>>>>;

/// Router-side bookkeeping for a request awaiting its response. The
/// single-slot delivery channel is a bounded `mpsc` of capacity 1 rather
/// than a `oneshot`, so the reader loop's delivery can honor the
/// `pending_delivery_timeout` bound described in §4.4 via
/// `tokio::time::timeout` around the send.
struct PendingRequest {
    #[allow(dead_code)]
    requester: String,
    sender: mpsc::Sender<Message>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// Owns the pending-request table, the broker-local handler table, the
/// endpoint registry, and the stats aggregator, and drives one reader task
/// per RPC child. Cheap to clone: every field is `Arc`-backed.
#[derive(Clone)]
pub struct Router {
    config: BrokerConfig,
    cancellation: CancellationToken,
    processes: ProcessTable,
    pending: Arc<RwLock<HashMap<String, PendingRequest>>>,
    handlers: Arc<HandlerTable>,
    stats: Arc<StatsAggregator>,
    endpoints: Arc<RwLock<HashMap<String, Vec<String>>>>,
    correlation_seq: Arc<AtomicU64>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    events_tx: broadcast::Sender<Message>,
}

impl Router {
    pub fn new(
        config: BrokerConfig,
        cancellation: CancellationToken,
        processes: ProcessTable,
        handlers: Arc<HandlerTable>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity);
        let (events_tx, _) = broadcast::channel(256);
        Self {
            config,
            cancellation,
            processes,
            pending: Arc::new(RwLock::new(HashMap::new())),
            handlers,
            stats,
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            correlation_seq: Arc::new(AtomicU64::new(0)),
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            events_tx,
        }
    }

    pub fn stats(&self) -> Arc<StatsAggregator> {
        self.stats.clone()
    }

    pub fn handlers(&self) -> Arc<HandlerTable> {
        self.handlers.clone()
    }

    /// Subscribe to a broadcast of every `process_exited` event, mirroring
    /// the CLI's `spawn` subcommand, which prints them as they arrive.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Message> {
        self.events_tx.subscribe()
    }

    /// Number of entries currently in the pending-request table. Exposed for
    /// tests asserting the "no two entries share a correlation ID" / "table
    /// empties after delivery" invariants.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Pull the next message off the broker's inbound queue, bumping the
    /// receive-side stats counters on extraction (not on enqueue), per
    /// "every message pulled from the inbound queue bumps counters". Races
    /// against cancellation so a caller blocked here with an empty queue
    /// doesn't hold `inbound_rx`'s lock forever and wake only once another
    /// message happens to arrive; without that, `close_inbound` would have
    /// no way to ever acquire the lock to close the queue.
    pub async fn recv_inbound(&self) -> Option<Message> {
        let mut rx = self.inbound_rx.lock().await;
        let msg = tokio::select! {
            msg = rx.recv() => msg?,
            _ = self.cancellation.cancelled() => return None,
        };
        self.stats.record_received(&msg.source, msg.message_type).await;
        Some(msg)
    }

    /// Close the inbound queue's receiving half. `inbound_tx` is cloned into
    /// every reader task and into the no-target branch of [`Router::handle_frame`],
    /// so there is no single sender whose drop would close the channel; closing
    /// the receiver instead makes every future `send` on any clone fail
    /// immediately, while still letting an in-progress `recv_inbound` drain
    /// whatever was already buffered before returning `None`.
    pub async fn close_inbound(&self) {
        self.inbound_rx.lock().await.close();
    }

    fn next_correlation_id(&self) -> String {
        let seq = self.correlation_seq.fetch_add(1, Ordering::SeqCst);
        let ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        format!("corr-{ns}-{seq}")
    }

    /// Launch the per-child reader task: reads frames from `transport`
    /// until `ClosedByPeer`/`Closed`/`Disconnected`, handing each to
    /// [`Router::handle_frame`].
    pub fn spawn_reader(&self, process_id: String, transport: Arc<dyn Transport>) {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                match transport.receive().await {
                    Ok(mut msg) => {
                        if msg.source.is_empty() {
                            msg.source = process_id.clone();
                        }
                        router.handle_frame(msg).await;
                    }
                    Err(BrokerError::InvalidFrame(detail)) => {
                        warn!(process_id = %process_id, error = %detail, "dropping invalid frame");
                        if detail.contains("exceeds max_message_size") {
                            warn!(process_id = %process_id, "tearing down transport after oversize frame");
                            let _ = transport.close().await;
                            break;
                        }
                        // Other malformed frames (bad magic, short header):
                        // drop and keep reading so one bad frame cannot kill
                        // the child's session.
                        continue;
                    }
                    Err(BrokerError::ClosedByPeer) | Err(BrokerError::Closed) | Err(BrokerError::Disconnected) => {
                        info!(process_id = %process_id, "reader loop exiting: transport closed");
                        break;
                    }
                    Err(e) => {
                        warn!(process_id = %process_id, error = %e, "reader loop error, exiting");
                        break;
                    }
                }
            }
        });
    }

    /// Core routing decision for one received frame, per §4.4 steps 2-4 (step
    /// 1, source-stamping, happens in the reader loop before this is called).
    pub async fn handle_frame(&self, msg: Message) {
        if matches!(msg.message_type, MessageType::Response | MessageType::Error) && !msg.correlation_id.is_empty() {
            let pending = self.pending.write().await.remove(&msg.correlation_id);
            if let Some(pending_request) = pending {
                let _ = tokio::time::timeout(
                    self.config.pending_delivery_timeout,
                    pending_request.sender.send(msg),
                )
                .await;
                return;
            }
            // Miss: falls through to target-based routing below. This is
            // the deliberate subprocess-to-subprocess forwarding path: a
            // Response whose correlation is tracked by some other child (or
            // by nobody any more).
        }

        if !msg.target.is_empty() {
            self.route_to_target(msg).await;
            return;
        }

        // No target: enqueue on the bounded inbound queue. A full queue
        // blocks the reader until either the send succeeds or the broker is
        // cancelled, per §5's cancellation contract.
        let tx = self.inbound_tx.clone();
        tokio::select! {
            res = tx.send(msg) => { let _ = res; }
            _ = self.cancellation.cancelled() => {}
        }
    }

    async fn route_to_target(&self, msg: Message) {
        if msg.target == BROKER_TARGET {
            self.dispatch_broker_local(msg).await;
            return;
        }

        let target = msg.target.clone();
        let source = msg.source.clone();
        let id = msg.id.clone();
        let correlation_id = msg.correlation_id.clone();
        let is_request = msg.message_type == MessageType::Request;

        if let Err(e) = self.send_to_process(&target, msg).await {
            debug!(target = %target, error = %e, "route_to_target: send failed");
            if is_request && !correlation_id.is_empty() {
                let error_msg = Message {
                    message_type: MessageType::Error,
                    id,
                    source: BROKER_TARGET.to_string(),
                    target: source.clone(),
                    correlation_id,
                    encoding: Encoding::Json,
                    payload: serde_json::to_vec(&serde_json::json!({ "error": e.to_string() }))
                        .unwrap_or_default(),
                    error: Some(e.to_string()),
                };
                // Best-effort, non-blocking: this may race the caller's own
                // timeout, per the design notes' open question; we do not
                // block on it.
                let _ = self.send_to_process(&source, error_msg).await;
            }
        }
    }

    async fn dispatch_broker_local(&self, request: Message) {
        let payload: Value = serde_json::from_slice(&request.payload).unwrap_or(Value::Null);
        match self.handlers.dispatch(&request.id, payload).await {
            Ok(result) => {
                let mut response = Message::response_to(&request, BROKER_TARGET);
                response.payload = serde_json::to_vec(&result).unwrap_or_default();
                let _ = self.send_to_process(&request.source, response).await;
            }
            Err(e) => {
                let mut error_msg = Message::error_to(&request, BROKER_TARGET, e.to_string());
                error_msg.payload =
                    serde_json::to_vec(&serde_json::json!({ "error": e.to_string() })).unwrap_or_default();
                let _ = self.send_to_process(&request.source, error_msg).await;
            }
        }
    }

    /// Encode and send `message` to the named process's transport. Bumps
    /// send-side stats unconditionally (even when the lookup or send
    /// fails), matching "every send_to_process ... bumps counters" — this
    /// is also how the supervisor's `process_exited` event gets counted,
    /// since by the time it's sent the target process is already gone.
    pub async fn send_to_process(&self, target: &str, message: Message) -> Result<()> {
        self.stats.record_sent(target, message.message_type).await;

        let record = {
            let processes = self.processes.read().await;
            processes.get(target).cloned()
        };
        let record = record.ok_or_else(|| BrokerError::Unknown {
            kind: "process",
            what: target.to_string(),
        })?;

        if record.status().await != ProcessStatus::Running {
            return Err(BrokerError::NotRunning(target.to_string()));
        }
        let transport = record.transport.clone().ok_or_else(|| BrokerError::NotRunning(target.to_string()))?;

        let _guard = record.send_lock.lock().await;
        transport.send(&message).await
    }

    /// The canonical client-side RPC call, per §4.4.
    pub async fn invoke_rpc(
        &self,
        source: &str,
        target: &str,
        method: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message> {
        if self.cancellation.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }

        let correlation_id = self.next_correlation_id();
        let (tx, mut rx) = mpsc::channel(1);
        {
            let mut pending = self.pending.write().await;
            pending.insert(
                correlation_id.clone(),
                PendingRequest {
                    requester: source.to_string(),
                    sender: tx,
                    created_at: Utc::now(),
                },
            );
        }

        let request = Message {
            message_type: MessageType::Request,
            id: method.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            correlation_id: correlation_id.clone(),
            encoding: Encoding::Json,
            payload,
            error: None,
        };

        if let Err(e) = self.send_to_process(target, request).await {
            self.pending.write().await.remove(&correlation_id);
            return Err(e);
        }

        let result = tokio::select! {
            received = rx.recv() => received.ok_or(BrokerError::Shutdown),
            _ = tokio::time::sleep(timeout) => Err(BrokerError::Timeout {
                method: method.to_string(),
                target: target.to_string(),
            }),
            _ = self.cancellation.cancelled() => Err(BrokerError::Shutdown),
        };
        self.pending.write().await.remove(&correlation_id);
        result
    }

    /// Entry point for the supervisor's per-child exit callback: routes the
    /// `process_exited` event through the normal send path (bumping stats
    /// as a Send even though the target has already exited) and republishes
    /// it on the events broadcast for any subscriber (e.g. the CLI's
    /// `spawn` subcommand).
    pub async fn handle_process_exited(&self, msg: Message) {
        let _ = self.send_to_process(&msg.target, msg.clone()).await;
        let _ = self.events_tx.send(msg);
    }

    pub async fn register_endpoint(&self, process_id: &str, endpoint: &str) {
        let mut endpoints = self.endpoints.write().await;
        let list = endpoints.entry(process_id.to_string()).or_default();
        if !list.iter().any(|e| e == endpoint) {
            list.push(endpoint.to_string());
        }
    }

    pub async fn get_endpoints(&self, process_id: &str) -> Vec<String> {
        self.endpoints.read().await.get(process_id).cloned().unwrap_or_default()
    }

    pub async fn get_all_endpoints(&self) -> HashMap<String, Vec<String>> {
        self.endpoints.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::register_builtin_handlers;
    use crate::process::RestartPolicy;
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;

    /// An in-memory transport stub: `send` appends to the peer's inbox, and
    /// `receive` pops from its own inbox, letting router tests exercise
    /// real send/receive call shapes without a real pipe or socket.
    struct LoopbackTransport {
        inbox: TokioMutex<mpsc::UnboundedReceiver<Message>>,
        peer: mpsc::UnboundedSender<Message>,
    }

    impl LoopbackTransport {
        fn pair() -> (Arc<Self>, Arc<Self>) {
            let (a_tx, a_rx) = mpsc::unbounded_channel();
            let (b_tx, b_rx) = mpsc::unbounded_channel();
            let a = Arc::new(Self {
                inbox: TokioMutex::new(a_rx),
                peer: b_tx,
            });
            let b = Arc::new(Self {
                inbox: TokioMutex::new(b_rx),
                peer: a_tx,
            });
            (a, b)
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn send(&self, message: &Message) -> Result<()> {
            self.peer.send(message.clone()).map_err(|_| BrokerError::Closed)
        }
        async fn receive(&self) -> Result<Message> {
            let mut inbox = self.inbox.lock().await;
            inbox.recv().await.ok_or(BrokerError::ClosedByPeer)
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_router() -> Router {
        let stats = Arc::new(StatsAggregator::new());
        let handlers = Arc::new(HandlerTable::new());
        Router::new(
            BrokerConfig::default(),
            CancellationToken::new(),
            Arc::new(RwLock::new(HashMap::new())),
            handlers,
            stats,
        )
    }

    async fn insert_running_record(router: &Router, id: &str, transport: Arc<dyn Transport>) {
        let record = Arc::new(ProcessRecord::new(
            id,
            1234,
            "test",
            vec![],
            Some(transport),
            RestartPolicy::none(true),
        ));
        router.processes.write().await.insert(id.to_string(), record);
    }

    #[tokio::test]
    async fn happy_rpc_round_trip() {
        let router = test_router();
        let (broker_side, worker_side) = LoopbackTransport::pair();
        insert_running_record(&router, "worker", broker_side.clone()).await;

        // Worker echoes any Request as a Response carrying {"ok":true}.
        let worker_router = router.clone();
        tokio::spawn(async move {
            let request = worker_side.receive().await.unwrap();
            let mut response = Message::response_to(&request, "worker");
            response.payload = br#"{"ok":true}"#.to_vec();
            worker_side.send(&response).await.unwrap();
            let _ = worker_router; // keep router alive in this scope
        });

        let response = router
            .invoke_rpc("caller", "worker", "ping", b"{}".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        let payload: Value = serde_json::from_slice(&response.payload).unwrap();
        assert_eq!(payload["ok"], true);
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn timeout_leaves_pending_table_empty() {
        let router = test_router();
        let (broker_side, _worker_side) = LoopbackTransport::pair();
        insert_running_record(&router, "silent", broker_side).await;

        let err = router
            .invoke_rpc("caller", "silent", "ping", b"{}".to_vec(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout { .. }));
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn correlation_routing_takes_priority_over_target() {
        let router = test_router();
        let (a_side, _a_peer) = LoopbackTransport::pair();
        let (b_side, _b_peer) = LoopbackTransport::pair();
        insert_running_record(&router, "A", a_side).await;
        insert_running_record(&router, "B", b_side).await;

        let (tx, mut rx) = mpsc::channel(1);
        router.pending.write().await.insert(
            "corr-1".to_string(),
            PendingRequest {
                requester: "B".to_string(),
                sender: tx,
                created_at: Utc::now(),
            },
        );

        let mut response = Message::request("ping", "worker", "A");
        response.message_type = MessageType::Response;
        response.correlation_id = "corr-1".to_string();
        router.handle_frame(response.clone()).await;

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.correlation_id, "corr-1");
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_target_on_request_synthesizes_error_reply() {
        let router = test_router();
        let (caller_side, caller_peer) = LoopbackTransport::pair();
        insert_running_record(&router, "caller", caller_side).await;

        let request = Message {
            message_type: MessageType::Request,
            id: "ping".to_string(),
            source: "caller".to_string(),
            target: "ghost".to_string(),
            correlation_id: "corr-9".to_string(),
            encoding: Encoding::Json,
            payload: vec![],
            error: None,
        };
        router.handle_frame(request).await;

        let reply = caller_peer.receive().await.unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.correlation_id, "corr-9");
    }

    #[tokio::test]
    async fn broker_local_dispatch_answers_message_count() {
        let router = test_router();
        register_builtin_handlers(&router.handlers, router.stats.clone()).await;
        let (caller_side, caller_peer) = LoopbackTransport::pair();
        insert_running_record(&router, "caller", caller_side).await;

        let request = Message {
            message_type: MessageType::Request,
            id: "RPCGetMessageCount".to_string(),
            source: "caller".to_string(),
            target: BROKER_TARGET.to_string(),
            correlation_id: "corr-5".to_string(),
            encoding: Encoding::Json,
            payload: b"{}".to_vec(),
            error: None,
        };
        router.handle_frame(request).await;

        let reply = caller_peer.receive().await.unwrap();
        assert_eq!(reply.message_type, MessageType::Response);
        let payload: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert!(payload["count"].is_number());
    }

    #[tokio::test]
    async fn no_target_message_lands_on_inbound_queue() {
        let router = test_router();
        let msg = Message {
            message_type: MessageType::Event,
            id: "tick".to_string(),
            source: "worker".to_string(),
            target: String::new(),
            correlation_id: String::new(),
            encoding: Encoding::Json,
            payload: vec![],
            error: None,
        };
        router.handle_frame(msg).await;
        let received = router.recv_inbound().await.unwrap();
        assert_eq!(received.id, "tick");
    }

    #[tokio::test]
    async fn endpoint_registry_dedups_and_reads_copies() {
        let router = test_router();
        router.register_endpoint("worker", "http://localhost:1").await;
        router.register_endpoint("worker", "http://localhost:1").await;
        router.register_endpoint("worker", "http://localhost:2").await;
        assert_eq!(router.get_endpoints("worker").await.len(), 2);

        let all = router.get_all_endpoints().await;
        assert_eq!(all.get("worker").unwrap().len(), 2);
    }
}
