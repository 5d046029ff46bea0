//! # Transport Abstraction
//!
//! Two interchangeable framed byte-channel implementations share one
//! contract: [`Transport`] — an inherited pipe pair and a named filesystem
//! socket — keeping a small async, `Send + Sync` capability interface that
//! callers program against without caring which concrete transport they
//! hold.
//!
//! Every method takes `&self`: a transport endpoint is shared between the
//! router's per-process sender and its reader task, so interior mutability
//! (per-endpoint locks) lives inside each implementation rather than being
//! imposed by `&mut self` borrowing.

pub mod multiplex;
pub mod pipe;
pub mod socket;

use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;

pub use multiplex::MultiplexedTransport;
pub use pipe::{PipeFraming, PipeTransport};
pub use socket::SocketTransport;

/// Capability interface shared by every transport implementation.
///
/// | Operation | Semantics |
/// |---|---|
/// | `connect` | Idempotent where meaningful; brings the endpoint to a state where send/receive can be called. |
/// | `send` | Writes one complete frame atomically with respect to other sends on the same endpoint. |
/// | `receive` | Blocks until one complete frame is available, or fails with `Disconnected`/`ClosedByPeer`. |
/// | `close` | Releases OS resources; idempotent; after close, send/receive fail with `Closed`. |
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn send(&self, message: &Message) -> Result<()>;
    async fn receive(&self) -> Result<Message>;
    async fn close(&self) -> Result<()>;
}

/// Endpoint lifecycle, tracked so `send`/`receive` after `close` fail fast
/// with `Closed` rather than attempting I/O on a torn-down resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Connected,
    Closed,
}
