//! A minimal RPC child used by the integration tests: resolves its
//! inherited pipe pair from `RPC_INPUT_FD`/`RPC_OUTPUT_FD`, then answers
//! every Request with a Response carrying `{"ok":true,"echo":<payload>}`,
//! until the broker closes its end.

use process_broker::error::BrokerError;
use process_broker::message::Message;
use process_broker::transport::{PipeFraming, PipeTransport, Transport};

#[tokio::main]
async fn main() {
    let transport = PipeTransport::from_env(PipeFraming::Framed, 10 * 1024 * 1024)
        .expect("RPC_INPUT_FD/RPC_OUTPUT_FD must be set by the parent broker");
    transport.connect().await.expect("connect inherited pipes");

    loop {
        match transport.receive().await {
            Ok(request) => {
                let payload: serde_json::Value =
                    serde_json::from_slice(&request.payload).unwrap_or(serde_json::Value::Null);
                let mut response = Message::response_to(&request, std::env::var("PROCESS_ID").unwrap_or_default());
                response.payload = serde_json::to_vec(&serde_json::json!({"ok": true, "echo": payload})).unwrap();
                if transport.send(&response).await.is_err() {
                    break;
                }
            }
            Err(BrokerError::ClosedByPeer) | Err(BrokerError::Closed) | Err(BrokerError::Disconnected) => break,
            Err(_) => continue,
        }
    }
}
