//! # Error Taxonomy
//!
//! Behavioral error categories shared by every subsystem (codec, transport,
//! supervisor, router). Library functions return `Result<T, BrokerError>`;
//! the CLI binary wraps these in `anyhow::Result` at the application edge.

use thiserror::Error;

/// Unified error type for the process broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// `spawn` was called with a `process_id` already present in the table.
    #[error("process id '{0}' already exists")]
    DuplicateId(String),

    /// The OS refused to start the child process.
    #[error("failed to start process '{id}': {source}")]
    StartFailed {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation targeted a process whose status is not `Running`.
    #[error("process '{0}' is not running")]
    NotRunning(String),

    /// Operation targeted an unknown process, method, or correlation id.
    #[error("unknown {kind}: '{what}'")]
    Unknown { kind: &'static str, what: String },

    /// `invoke_rpc` exceeded its caller-supplied deadline.
    #[error("rpc call '{method}' to '{target}' timed out")]
    Timeout { method: String, target: String },

    /// The transport observed its peer disconnecting from its end.
    #[error("transport disconnected")]
    Disconnected,

    /// The remote peer closed the connection cleanly.
    #[error("closed by peer")]
    ClosedByPeer,

    /// A frame failed header validation: bad magic, truncated header, or
    /// oversize/malformed payload.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The transport (or the broker it belongs to) was already closed.
    #[error("transport closed")]
    Closed,

    /// The broker's root cancellation token was triggered.
    #[error("broker is shutting down")]
    Shutdown,

    /// A client-role socket transport exhausted its reconnect attempt budget.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    /// Escape hatch for I/O errors that don't fit a more specific kind.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Escape hatch for JSON (de)serialization errors in payload handling.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
