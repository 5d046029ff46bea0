//! # Broker Facade
//!
//! The top-level object a caller constructs: owns the shared process table,
//! the handler table, and the stats aggregator, and wires a [`Supervisor`]
//! to a [`Router`] so a process's exit is reported through the same path as
//! any other message.

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::handlers::{register_builtin_handlers, Handler, HandlerTable};
use crate::message::Message;
use crate::router::Router;
use crate::stats::StatsSnapshot;
use crate::supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

/// Owns every shared subsystem and exposes the public surface a caller (the
/// CLI, or an embedding application) drives the broker through.
#[derive(Clone)]
pub struct Broker {
    config: BrokerConfig,
    cancellation: CancellationToken,
    supervisor: Supervisor,
    router: Router,
}

impl Broker {
    /// Build a broker with the built-in broker-local handlers
    /// (`RPCGetMessageStats`, `RPCGetMessageCount`) already registered.
    pub async fn new(config: BrokerConfig) -> Self {
        let cancellation = CancellationToken::new();
        let processes = Arc::new(RwLock::new(HashMap::new()));
        let handlers = Arc::new(HandlerTable::new());
        let stats = Arc::new(crate::stats::StatsAggregator::new());

        register_builtin_handlers(&handlers, stats.clone()).await;

        let router = Router::new(config.clone(), cancellation.clone(), processes.clone(), handlers, stats);

        let router_for_exit = router.clone();
        let on_exit = Arc::new(move |msg: Message| {
            let router = router_for_exit.clone();
            tokio::spawn(async move {
                router.handle_process_exited(msg).await;
            });
        });

        // Attaches a reader task to every RPC child's transport as it comes
        // up, whether from the initial spawn or from a restart, so a
        // restarted process is read from exactly as the first instance was.
        let router_for_transport = router.clone();
        let on_transport = Arc::new(move |process_id: String, transport: Arc<dyn crate::transport::Transport>| {
            router_for_transport.spawn_reader(process_id, transport);
        });

        let supervisor = Supervisor::new(config.clone(), cancellation.clone(), processes, on_exit, on_transport);

        Self {
            config,
            cancellation,
            supervisor,
            router,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub async fn register_handler(&self, method: impl Into<String>, handler: Handler) {
        self.router.handlers().register(method, handler).await;
    }

    pub async fn spawn(&self, process_id: &str, command: &str, args: Vec<String>) -> Result<()> {
        self.supervisor.spawn(process_id, command, args).await
    }

    pub async fn spawn_rpc(&self, process_id: &str, command: &str, args: Vec<String>) -> Result<()> {
        // The supervisor's `on_transport` callback attaches the reader task;
        // it fires for this spawn and, just as importantly, for every
        // restart, so we don't need to touch the router here at all.
        self.supervisor.spawn_rpc(process_id, command, args).await?;
        Ok(())
    }

    pub async fn spawn_with_restart(
        &self,
        process_id: &str,
        command: &str,
        args: Vec<String>,
        max_attempts: i64,
    ) -> Result<()> {
        self.supervisor
            .spawn_with_restart(process_id, command, args, max_attempts)
            .await
    }

    pub async fn spawn_rpc_with_restart(
        &self,
        process_id: &str,
        command: &str,
        args: Vec<String>,
        max_attempts: i64,
    ) -> Result<()> {
        self.supervisor
            .spawn_rpc_with_restart(process_id, command, args, max_attempts)
            .await?;
        Ok(())
    }

    pub async fn kill(&self, process_id: &str) -> Result<()> {
        self.supervisor.kill(process_id).await
    }

    pub async fn invoke_rpc(&self, target: &str, method: &str, payload: Vec<u8>, timeout: Duration) -> Result<Message> {
        self.router.invoke_rpc(BROKER_SELF, target, method, payload, timeout).await
    }

    pub async fn send_to_process(&self, target: &str, message: Message) -> Result<()> {
        self.router.send_to_process(target, message).await
    }

    /// Pull the next untargeted message off the broker's inbound queue.
    pub async fn recv_inbound(&self) -> Option<Message> {
        self.router.recv_inbound().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Message> {
        self.router.subscribe_events()
    }

    pub async fn register_endpoint(&self, process_id: &str, endpoint: &str) {
        self.router.register_endpoint(process_id, endpoint).await
    }

    pub async fn get_endpoints(&self, process_id: &str) -> Vec<String> {
        self.router.get_endpoints(process_id).await
    }

    pub async fn get_all_endpoints(&self) -> HashMap<String, Vec<String>> {
        self.router.get_all_endpoints().await
    }

    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        self.router.stats().snapshot().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cancel the broker, kill every running process and wait for their
    /// reapers to finish, then close the router's inbound queue so that a
    /// post-shutdown `recv_inbound` call cannot block forever.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        self.router.close_inbound().await;
    }
}

/// Identity the broker uses as `source` on requests it originates itself
/// (as opposed to ones originated by a child and merely forwarded).
const BROKER_SELF: &str = "broker";
