//! # Broker Configuration
//!
//! Construction-time settings threaded through every subsystem, built from
//! the `clap`-parsed [`crate::cli::Args`] via `BrokerConfig::from_args`.

use std::path::PathBuf;
use std::time::Duration;

/// Settings that shape broker behavior but aren't part of the wire protocol.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Largest payload (in bytes) encode/decode will accept. Applied
    /// symmetrically: encode refuses to produce an oversize frame, decode
    /// refuses to accept one.
    pub max_message_size: usize,

    /// Base path for named filesystem sockets. The actual per-process path
    /// is `<socket_base_path>_<process_id>.sock`.
    pub socket_base_path: PathBuf,

    /// File descriptor number the child sees for its inbound (parent->child)
    /// pipe end. Exposed to the child as `RPC_INPUT_FD`.
    pub rpc_input_fd: i32,

    /// File descriptor number the child sees for its outbound (child->parent)
    /// pipe end. Exposed to the child as `RPC_OUTPUT_FD`.
    pub rpc_output_fd: i32,

    /// Delay between reconnect attempts for a client-role socket transport.
    pub reconnect_delay: Duration,

    /// Maximum reconnect attempts before a client-role socket transport gives
    /// up and reports `ReconnectExhausted`.
    pub reconnect_max_attempts: u32,

    /// Capacity of the broker's bounded inbound message queue.
    pub inbound_queue_capacity: usize,

    /// Bound on how long the reader loop will wait to hand a matched
    /// response to its pending waiter before giving up on that delivery.
    pub pending_delivery_timeout: Duration,

    /// How long `kill` waits after SIGTERM before escalating to SIGKILL.
    pub kill_escalation_timeout: Duration,

    /// Delay the reaper sleeps before re-spawning a process under restart
    /// policy.
    pub restart_backoff: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024,
            socket_base_path: PathBuf::from("/tmp/process-broker"),
            rpc_input_fd: 3,
            rpc_output_fd: 4,
            reconnect_delay: Duration::from_secs(1),
            reconnect_max_attempts: 5,
            inbound_queue_capacity: 100,
            pending_delivery_timeout: Duration::from_secs(5),
            kill_escalation_timeout: Duration::from_secs(5),
            restart_backoff: Duration::from_secs(1),
        }
    }
}

impl BrokerConfig {
    /// Path of the named socket a given process would use, under this
    /// config's base path. Parent and child MUST compute the same value, so
    /// this is the single source of truth for the naming scheme (see the
    /// wire protocol's "Named-socket layout").
    pub fn socket_path(&self, process_id: &str) -> PathBuf {
        let mut name = self
            .socket_base_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!("_{process_id}.sock"));
        match self.socket_base_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
            _ => PathBuf::from(name),
        }
    }
}
