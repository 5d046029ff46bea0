//! # Multiplexed Transport
//!
//! An optional switch-over wrapper around two [`Transport`] endpoints: a
//! primary and a secondary. Swapping to a new endpoint connects it first and
//! only retires the previous one once the new connection succeeds, so a
//! failed switch leaves the existing endpoint active rather than dropping
//! traffic.

use super::{Transport, TransportState};
use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Wraps a currently-active transport endpoint, allowing it to be swapped
/// out for another endpoint of the same (or a different) concrete type
/// without the caller needing to reconnect or re-register anything.
pub struct MultiplexedTransport {
    active: RwLock<Arc<dyn Transport>>,
}

impl MultiplexedTransport {
    pub fn new(primary: Arc<dyn Transport>) -> Self {
        Self {
            active: RwLock::new(primary),
        }
    }

    /// Connect `next`, and only on success make it the active endpoint,
    /// closing the previously active one. If `next` fails to connect, the
    /// current endpoint is left untouched and the error is returned.
    pub async fn switch_to(&self, next: Arc<dyn Transport>) -> Result<()> {
        next.connect().await?;
        let previous = {
            let mut guard = self.active.write().await;
            std::mem::replace(&mut *guard, next)
        };
        let _ = previous.close().await;
        Ok(())
    }

    async fn current(&self) -> Arc<dyn Transport> {
        self.active.read().await.clone()
    }
}

#[async_trait]
impl Transport for MultiplexedTransport {
    async fn connect(&self) -> Result<()> {
        self.current().await.connect().await
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.current().await.send(message).await
    }

    async fn receive(&self) -> Result<Message> {
        self.current().await.receive().await
    }

    async fn close(&self) -> Result<()> {
        self.current().await.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    /// A transport stub whose `connect` can be made to fail, and which
    /// counts how many times `close` is called, so switch-over semantics
    /// can be verified without standing up a real pipe or socket.
    struct StubTransport {
        fail_connect: bool,
        closes: AtomicU32,
        inbox: TokioMutex<Vec<Message>>,
        state: RwLock<TransportState>,
    }

    impl StubTransport {
        fn new(fail_connect: bool) -> Arc<Self> {
            Arc::new(Self {
                fail_connect,
                closes: AtomicU32::new(0),
                inbox: TokioMutex::new(Vec::new()),
                state: RwLock::new(TransportState::Uninitialized),
            })
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn connect(&self) -> Result<()> {
            if self.fail_connect {
                return Err(BrokerError::Closed);
            }
            *self.state.write().await = TransportState::Connected;
            Ok(())
        }

        async fn send(&self, message: &Message) -> Result<()> {
            self.inbox.lock().await.push(message.clone());
            Ok(())
        }

        async fn receive(&self) -> Result<Message> {
            self.inbox.lock().await.pop().ok_or(BrokerError::Closed)
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            *self.state.write().await = TransportState::Closed;
            Ok(())
        }
    }

    #[tokio::test]
    async fn switch_replaces_active_endpoint_on_success() {
        let primary = StubTransport::new(false);
        let secondary = StubTransport::new(false);
        let mux = MultiplexedTransport::new(primary.clone());

        mux.switch_to(secondary.clone()).await.unwrap();

        mux.send(&Message::request("id", "a", "b")).await.unwrap();
        assert_eq!(secondary.inbox.lock().await.len(), 1);
        assert_eq!(primary.inbox.lock().await.len(), 0);
        assert_eq!(primary.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_switch_leaves_previous_endpoint_active() {
        let primary = StubTransport::new(false);
        let broken = StubTransport::new(true);
        let mux = MultiplexedTransport::new(primary.clone());

        let err = mux.switch_to(broken.clone()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Closed));

        mux.send(&Message::request("id", "a", "b")).await.unwrap();
        assert_eq!(primary.inbox.lock().await.len(), 1);
        assert_eq!(primary.closes.load(Ordering::SeqCst), 0);
    }
}
