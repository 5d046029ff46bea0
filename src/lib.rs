//! # process-broker
//!
//! A local process broker: a parent supervisor that spawns long-lived child
//! worker processes, establishes a bidirectional framed message channel with
//! each, multiplexes request/response/event/error traffic between children
//! (and a broker-local handler), and enforces lifecycle policy (spawn,
//! restart, kill, reap, graceful shutdown). Children are peers that
//! discover each other only through the broker; they never communicate
//! directly.
//!
//! [`broker::Broker`] is the entry point most callers want.

pub mod broker;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod handlers;
pub mod message;
pub mod process;
pub mod router;
pub mod stats;
pub mod supervisor;
pub mod transport;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use message::{Encoding, Message, MessageType};
