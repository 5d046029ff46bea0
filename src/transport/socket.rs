//! # Variant B — Named Filesystem Socket Transport
//!
//! A stream endpoint bound to a filesystem path with Unix-style
//! permissions. The server role accepts exactly one active client at a
//! time, replacing the previous active connection on each new accept. The
//! client role dials the path and transparently reconnects on transient
//! disconnects, bounded by a configurable attempt cap.

use super::{Transport, TransportState};
use crate::codec;
use crate::error::{BrokerError, Result};
use crate::message::Message;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Which side of the named socket this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Callback invoked when a client-role transport exhausts its reconnect
/// attempt budget. Registered at construction; optional.
pub type ReconnectFailedCallback = Box<dyn Fn() + Send + Sync>;

/// A named filesystem socket transport endpoint.
pub struct SocketTransport {
    path: PathBuf,
    role: Role,
    max_message_size: usize,
    reconnect_delay: Duration,
    reconnect_max_attempts: u32,
    reconnect_attempts: AtomicU32,
    on_reconnect_failed: Option<ReconnectFailedCallback>,

    state: RwLock<TransportState>,
    stream: Mutex<Option<UnixStream>>,
    listener: Mutex<Option<UnixListener>>,
}

impl SocketTransport {
    pub fn new(
        path: impl Into<PathBuf>,
        role: Role,
        max_message_size: usize,
        reconnect_delay: Duration,
        reconnect_max_attempts: u32,
    ) -> Self {
        Self {
            path: path.into(),
            role,
            max_message_size,
            reconnect_delay,
            reconnect_max_attempts,
            reconnect_attempts: AtomicU32::new(0),
            on_reconnect_failed: None,
            state: RwLock::new(TransportState::Uninitialized),
            stream: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    pub fn with_reconnect_failed_callback(mut self, callback: ReconnectFailedCallback) -> Self {
        self.on_reconnect_failed = Some(callback);
        self
    }

    async fn bind_server(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.path);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755));
            }
        }

        let listener = UnixListener::bind(&self.path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        debug!(path = %self.path.display(), "bound named socket server");
        let (client, _addr) = listener.accept().await?;
        *self.listener.lock().await = Some(listener);
        *self.stream.lock().await = Some(client);
        Ok(())
    }

    async fn dial_client(&self) -> Result<()> {
        let stream = UnixStream::connect(&self.path).await?;
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    /// Re-dial, replacing the current client connection with the new one
    /// only once the new accept/dial succeeds. The listener (server role)
    /// keeps running across reconnects, accepting the next client.
    async fn accept_next(&self) -> Result<()> {
        let listener_guard = self.listener.lock().await;
        let listener = listener_guard.as_ref().ok_or(BrokerError::Closed)?;
        let (client, _addr) = listener.accept().await?;
        drop(listener_guard);
        *self.stream.lock().await = Some(client);
        Ok(())
    }

    fn is_reconnectable_error(err: &std::io::Error) -> bool {
        let msg = err.to_string().to_lowercase();
        matches!(err.kind(), std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset)
            || msg.contains("broken pipe")
            || msg.contains("connection reset")
            || msg.contains("connection closed")
            || msg.contains("eof")
    }

    /// Client-role reconnect loop. MUST NOT hold any endpoint lock across
    /// the backoff sleep, so other observers (e.g. a concurrent `close`)
    /// can still read transport state while this endpoint is backing off.
    async fn reconnect(&self) -> Result<()> {
        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.reconnect_max_attempts {
                if let Some(cb) = &self.on_reconnect_failed {
                    cb();
                }
                return Err(BrokerError::ReconnectExhausted {
                    attempts: self.reconnect_max_attempts,
                });
            }

            warn!(attempt, path = %self.path.display(), "reconnecting named socket client");
            tokio::time::sleep(self.reconnect_delay).await;

            match UnixStream::connect(&self.path).await {
                Ok(stream) => {
                    *self.stream.lock().await = Some(stream);
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    return Ok(());
                }
                Err(_) => continue,
            }
        }
    }

    async fn handle_io_error(&self, err: std::io::Error) -> Result<()> {
        *self.stream.lock().await = None;
        match self.role {
            Role::Client if Self::is_reconnectable_error(&err) => self.reconnect().await,
            Role::Server if Self::is_reconnectable_error(&err) => {
                // Server replaces the active connection on the next accept;
                // it does not redial itself.
                self.accept_next().await
            }
            _ => Err(BrokerError::Io(err)),
        }
    }

    fn cleanup_socket_file(&self) {
        if self.role != Role::Server {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove socket file");
            }
        }
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::remove_dir(parent);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn connect(&self) -> Result<()> {
        if *self.state.read().await == TransportState::Connected {
            return Ok(());
        }

        match self.role {
            Role::Server => self.bind_server().await?,
            Role::Client => self.dial_client().await?,
        }

        *self.state.write().await = TransportState::Connected;
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if *self.state.read().await != TransportState::Connected {
            return Err(BrokerError::Closed);
        }
        let frame = codec::encode(message, self.max_message_size)?;

        loop {
            let mut guard = self.stream.lock().await;
            let stream = match guard.as_mut() {
                Some(s) => s,
                None => {
                    drop(guard);
                    self.handle_io_error(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "no active connection",
                    ))
                    .await?;
                    continue;
                }
            };
            match stream.write_all(&frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    drop(guard);
                    self.handle_io_error(e).await?;
                }
            }
        }
    }

    async fn receive(&self) -> Result<Message> {
        if *self.state.read().await != TransportState::Connected {
            return Err(BrokerError::Closed);
        }

        loop {
            let mut guard = self.stream.lock().await;
            let stream = match guard.as_mut() {
                Some(s) => s,
                None => {
                    drop(guard);
                    self.handle_io_error(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "no active connection",
                    ))
                    .await?;
                    continue;
                }
            };

            let mut header = vec![0u8; codec::HEADER_LEN];
            let read_result = read_exact_or_eof(stream, &mut header).await;
            match read_result {
                Ok(0) => {
                    drop(guard);
                    match self.handle_io_error(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    ))
                    .await
                    {
                        Ok(()) => continue,
                        Err(BrokerError::Io(_)) => return Err(BrokerError::ClosedByPeer),
                        Err(e) => return Err(e),
                    }
                }
                Ok(n) if n < codec::HEADER_LEN => return Err(BrokerError::ClosedByPeer),
                Ok(_) => {}
                Err(e) => {
                    drop(guard);
                    self.handle_io_error(e).await?;
                    continue;
                }
            }

            let payload_len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
            if payload_len > self.max_message_size {
                return Err(BrokerError::InvalidFrame(format!(
                    "payload_len {} exceeds max_message_size {}",
                    payload_len, self.max_message_size
                )));
            }
            let mut payload = vec![0u8; payload_len];
            stream.read_exact(&mut payload).await?;
            let mut frame = header;
            frame.extend_from_slice(&payload);
            return codec::decode(&frame, self.max_message_size);
        }
    }

    async fn close(&self) -> Result<()> {
        *self.stream.lock().await = None;
        *self.listener.lock().await = None;
        *self.state.write().await = TransportState::Closed;
        self.cleanup_socket_file();
        Ok(())
    }
}

async fn read_exact_or_eof(stream: &mut UnixStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read_total = 0;
    while read_total < buf.len() {
        let n = stream.read(&mut buf[read_total..]).await?;
        if n == 0 {
            return Ok(read_total);
        }
        read_total += n;
    }
    Ok(read_total)
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.cleanup_socket_file();
    }
}
