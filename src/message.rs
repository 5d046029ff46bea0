//! # Message Types
//!
//! The unit of traffic the broker routes between children and its own
//! local handlers. Field layout mirrors the 128-byte fixed header described
//! by the wire codec (see [`crate::codec`]); this module only carries the
//! in-memory representation plus the pool that amortizes its allocation.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Fixed-size fields, matching the wire header byte ranges exactly.
pub const ID_FIELD_LEN: usize = 32;
pub const SOURCE_FIELD_LEN: usize = 32;
pub const TARGET_FIELD_LEN: usize = 32;
pub const CORRELATION_FIELD_LEN: usize = 20;

/// Reserved target naming the broker's own local dispatcher.
pub const BROKER_TARGET: &str = "broker";

/// Message type, carried in the header's 1-byte type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    #[default]
    Request = 0,
    Response = 1,
    Event = 2,
    Error = 3,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Event),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Payload encoding, carried in the header's 1-byte encoding tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Encoding {
    /// Payload bytes are a JSON document, kept verbatim.
    #[default]
    Json = 0,
    /// Payload bytes are a length-prefixed binary container wrapping a JSON
    /// document.
    BinaryContainer = 1,
    /// Payload bytes are opaque and not further interpreted by the codec.
    Plain = 2,
}

impl Encoding {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Json),
            1 => Some(Self::BinaryContainer),
            2 => Some(Self::Plain),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// The unit of traffic routed by the broker.
///
/// Field lengths are not enforced here; truncation to the wire header's
/// fixed-size fields happens in [`crate::codec`] at encode/decode time, per
/// the codec's declared truncation policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    pub id: String,
    pub source: String,
    pub target: String,
    pub correlation_id: String,
    pub encoding: Encoding,
    pub payload: Vec<u8>,
    pub error: Option<String>,
}

impl Message {
    /// Build a request. `correlation_id` is typically assigned by the
    /// router's `invoke_rpc`, not by callers constructing messages directly.
    pub fn request(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Request,
            id: id.into(),
            source: source.into(),
            target: target.into(),
            ..Default::default()
        }
    }

    /// Build a response echoing `request`'s id and correlation id, per the
    /// "id on a Response/Error echoes the request's id" invariant.
    pub fn response_to(request: &Message, source: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Response,
            id: request.id.clone(),
            source: source.into(),
            target: request.source.clone(),
            correlation_id: request.correlation_id.clone(),
            ..Default::default()
        }
    }

    /// Build an error reply echoing `request`'s id and correlation id.
    pub fn error_to(request: &Message, source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Error,
            id: request.id.clone(),
            source: source.into(),
            target: request.source.clone(),
            correlation_id: request.correlation_id.clone(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Reset every field to its zero value, as required of a pooled message
    /// on both acquire and release.
    fn reset(&mut self) {
        *self = Message::default();
    }
}

/// A bounded pool of zeroed [`Message`] structs, used to amortize allocation
/// under high message throughput.
///
/// Borrowed messages are reset on both acquire and release; nothing is
/// implicitly retained by a caller across a release.
pub struct MessagePool {
    free: Mutex<Vec<Message>>,
    capacity: usize,
}

impl MessagePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Acquire a zeroed message, reusing a pooled instance if one is free.
    pub fn acquire(&self) -> Message {
        let mut free = self.free.lock().expect("message pool mutex poisoned");
        let mut msg = free.pop().unwrap_or_default();
        msg.reset();
        msg
    }

    /// Return a message to the pool for reuse. The message is reset before
    /// being stored so a caller cannot observe stale data by acquiring it
    /// again.
    pub fn release(&self, mut msg: Message) {
        msg.reset();
        let mut free = self.free.lock().expect("message pool mutex poisoned");
        if free.len() < self.capacity {
            free.push(msg);
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_and_resets() {
        let pool = MessagePool::new(4);
        let mut msg = pool.acquire();
        msg.id = "ping".to_string();
        msg.payload = vec![1, 2, 3];
        pool.release(msg);

        let msg2 = pool.acquire();
        assert_eq!(msg2.id, "");
        assert!(msg2.payload.is_empty());
    }

    #[test]
    fn response_echoes_request_id_and_correlation() {
        let mut req = Message::request("ping", "caller", "worker");
        req.correlation_id = "corr-1".to_string();
        let resp = Message::response_to(&req, "worker");
        assert_eq!(resp.id, "ping");
        assert_eq!(resp.correlation_id, "corr-1");
        assert_eq!(resp.target, "caller");
        assert_eq!(resp.message_type, MessageType::Response);
    }
}
