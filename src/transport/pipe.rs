//! # Variant A — Inherited Pipe Pair Transport
//!
//! Used when the parent spawned the child and passed two pipe ends as known
//! numeric file descriptors via the child's inherited descriptor table.
//! Framing is either raw framed (magic-prefixed, see [`crate::codec`]) or
//! newline-delimited JSON, by configuration. Pipe closure is terminal:
//! there is no reconnect for this variant, matching the named socket
//! transport's client-only reconnect in [`crate::transport::socket`].

use super::{Transport, TransportState};
use crate::codec;
use crate::error::{BrokerError, Result};
use crate::message::{Message, MessageType};
use async_trait::async_trait;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::RwLock as StdRwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;

/// Well-known environment variables a child process consults to learn which
/// inherited descriptors carry its broker channel.
pub const ENV_RPC_INPUT_FD: &str = "RPC_INPUT_FD";
pub const ENV_RPC_OUTPUT_FD: &str = "RPC_OUTPUT_FD";

/// How frames are delimited on the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeFraming {
    /// Magic-prefixed frames per the wire codec.
    Framed,
    /// One JSON document per line.
    NewlineJson,
}

/// An inherited-pipe-pair transport endpoint: a dedicated read fd and a
/// dedicated write fd, each unidirectional.
pub struct PipeTransport {
    read_fd: RawFd,
    write_fd: RawFd,
    framing: PipeFraming,
    max_message_size: usize,
    state: StdRwLock<TransportState>,
    reader: Mutex<Option<BufReader<pipe::Receiver>>>,
    writer: Mutex<Option<pipe::Sender>>,
}

impl PipeTransport {
    /// Build a transport over two already-known raw descriptors. This is
    /// how the supervisor constructs the parent's side of the channel
    /// immediately after spawning an RPC child: `read_fd` is the parent's
    /// kept end of the child-to-parent pipe, `write_fd` the parent's kept
    /// end of the parent-to-child pipe.
    pub fn from_raw_fds(
        read_fd: RawFd,
        write_fd: RawFd,
        framing: PipeFraming,
        max_message_size: usize,
    ) -> Self {
        Self {
            read_fd,
            write_fd,
            framing,
            max_message_size,
            state: StdRwLock::new(TransportState::Uninitialized),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Build a transport by resolving descriptor numbers from the
    /// well-known `RPC_INPUT_FD`/`RPC_OUTPUT_FD` environment variables, as
    /// a child process would on startup.
    pub fn from_env(framing: PipeFraming, max_message_size: usize) -> Result<Self> {
        let input_fd = read_fd_env(ENV_RPC_INPUT_FD)?;
        let output_fd = read_fd_env(ENV_RPC_OUTPUT_FD)?;
        Ok(Self::from_raw_fds(input_fd, output_fd, framing, max_message_size))
    }

    fn state(&self) -> TransportState {
        *self.state.read().expect("transport state lock poisoned")
    }

    async fn read_framed(reader: &mut BufReader<pipe::Receiver>, max_message_size: usize) -> Result<Message> {
        let mut header = vec![0u8; codec::HEADER_LEN];
        match read_exact_or_eof(reader, &mut header).await? {
            0 => return Err(BrokerError::ClosedByPeer),
            n if n < codec::HEADER_LEN => return Err(BrokerError::ClosedByPeer),
            _ => {}
        }
        let payload_len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        if payload_len > max_message_size {
            return Err(BrokerError::InvalidFrame(format!(
                "payload_len {} exceeds max_message_size {}",
                payload_len, max_message_size
            )));
        }
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).await?;
        let mut frame = header;
        frame.extend_from_slice(&payload);
        codec::decode(&frame, max_message_size)
    }

    async fn read_newline_json(reader: &mut BufReader<pipe::Receiver>) -> Result<Message> {
        use tokio::io::AsyncBufReadExt;
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(BrokerError::ClosedByPeer);
        }
        let value: serde_json::Value = serde_json::from_str(line.trim_end())?;
        let message_type = match value.get("type").and_then(|v| v.as_str()) {
            Some("response") => MessageType::Response,
            Some("event") => MessageType::Event,
            Some("error") => MessageType::Error,
            _ => MessageType::Request,
        };
        Ok(Message {
            message_type,
            id: value.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            source: value.get("source").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            target: value.get("target").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            correlation_id: value
                .get("correlation_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            encoding: crate::message::Encoding::Json,
            payload: value.get("payload").map(|v| v.to_string().into_bytes()).unwrap_or_default(),
            error: value.get("error").and_then(|v| v.as_str()).map(str::to_owned),
        })
    }
}

/// `read_exact` that reports the number of bytes actually read before an
/// EOF, instead of erroring, so callers can distinguish "closed cleanly
/// before any data" from "closed mid-header".
async fn read_exact_or_eof(reader: &mut BufReader<pipe::Receiver>, buf: &mut [u8]) -> Result<usize> {
    let mut read_total = 0;
    while read_total < buf.len() {
        let n = reader.read(&mut buf[read_total..]).await?;
        if n == 0 {
            return Ok(read_total);
        }
        read_total += n;
    }
    Ok(read_total)
}

fn read_fd_env(var: &str) -> Result<RawFd> {
    std::env::var(var)
        .map_err(|_| BrokerError::InvalidFrame(format!("{var} not set")))?
        .parse::<RawFd>()
        .map_err(|e| BrokerError::InvalidFrame(format!("{var} is not a valid fd number: {e}")))
}

#[async_trait]
impl Transport for PipeTransport {
    async fn connect(&self) -> Result<()> {
        if self.state() == TransportState::Connected {
            return Ok(());
        }

        // SAFETY: these descriptors were either handed to us directly by the
        // supervisor right after spawning the child (still open, owned by
        // this process) or resolved from RPC_INPUT_FD/RPC_OUTPUT_FD, which
        // name descriptors the parent set up specifically for this child to
        // own. Either way the caller is asserting unique ownership.
        let read_owned = unsafe { OwnedFd::from_raw_fd(self.read_fd) };
        let write_owned = unsafe { OwnedFd::from_raw_fd(self.write_fd) };

        let receiver = pipe::Receiver::try_from(read_owned)
            .map_err(|e| BrokerError::InvalidFrame(format!("not a valid pipe read fd: {e}")))?;
        let sender = pipe::Sender::try_from(write_owned)
            .map_err(|e| BrokerError::InvalidFrame(format!("not a valid pipe write fd: {e}")))?;

        *self.reader.lock().await = Some(BufReader::new(receiver));
        *self.writer.lock().await = Some(sender);
        *self.state.write().expect("transport state lock poisoned") = TransportState::Connected;
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if self.state() != TransportState::Connected {
            return Err(BrokerError::Closed);
        }
        let mut guard = self.writer.lock().await;
        let sender = guard.as_mut().ok_or(BrokerError::Closed)?;

        match self.framing {
            PipeFraming::Framed => {
                let frame = codec::encode(message, self.max_message_size)?;
                sender.write_all(&frame).await?;
            }
            PipeFraming::NewlineJson => {
                let mut line = serde_json::to_vec(&serde_json::json!({
                    "type": match message.message_type {
                        MessageType::Request => "request",
                        MessageType::Response => "response",
                        MessageType::Event => "event",
                        MessageType::Error => "error",
                    },
                    "id": message.id,
                    "source": message.source,
                    "target": message.target,
                    "correlation_id": message.correlation_id,
                    "payload": serde_json::from_slice::<serde_json::Value>(&message.payload)
                        .unwrap_or(serde_json::Value::Null),
                    "error": message.error,
                }))?;
                line.push(b'\n');
                sender.write_all(&line).await?;
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Message> {
        if self.state() != TransportState::Connected {
            return Err(BrokerError::Closed);
        }
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(BrokerError::Closed)?;

        match self.framing {
            PipeFraming::Framed => Self::read_framed(reader, self.max_message_size).await,
            PipeFraming::NewlineJson => Self::read_newline_json(reader).await,
        }
    }

    async fn close(&self) -> Result<()> {
        *self.reader.lock().await = None;
        *self.writer.lock().await = None;
        *self.state.write().expect("transport state lock poisoned") = TransportState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    async fn connected_pair(framing: PipeFraming) -> (PipeTransport, PipeTransport) {
        let (parent_to_child_rx, parent_to_child_tx) = os_pipe::pipe().unwrap();
        let (child_to_parent_rx, child_to_parent_tx) = os_pipe::pipe().unwrap();

        let parent = PipeTransport::from_raw_fds(
            child_to_parent_rx.into_raw_fd(),
            parent_to_child_tx.into_raw_fd(),
            framing,
            1024,
        );
        let child = PipeTransport::from_raw_fds(
            parent_to_child_rx.into_raw_fd(),
            child_to_parent_tx.into_raw_fd(),
            framing,
            1024,
        );
        parent.connect().await.unwrap();
        child.connect().await.unwrap();
        (parent, child)
    }

    #[tokio::test]
    async fn framed_round_trip_over_pipes() {
        let (parent, child) = connected_pair(PipeFraming::Framed).await;
        let msg = Message::request("ping", "parent", "child").with_payload(b"{}".to_vec());
        parent.send(&msg).await.unwrap();
        let received = child.receive().await.unwrap();
        assert_eq!(received.id, "ping");
        assert_eq!(received.source, "parent");
    }

    #[tokio::test]
    async fn closed_pipe_reports_closed_by_peer() {
        let (parent, child) = connected_pair(PipeFraming::Framed).await;
        parent.close().await.unwrap();
        let err = child.receive().await.unwrap_err();
        assert!(matches!(err, BrokerError::ClosedByPeer));
    }

    #[tokio::test]
    async fn newline_json_round_trip() {
        let (parent, child) = connected_pair(PipeFraming::NewlineJson).await;
        let msg = Message::request("ping", "parent", "child");
        parent.send(&msg).await.unwrap();
        let received = child.receive().await.unwrap();
        assert_eq!(received.id, "ping");
    }
}
