//! A plain (non-RPC) child used by the kill-escalation integration test:
//! installs a SIGTERM handler that does nothing, so it can only be
//! terminated by SIGKILL.

#[tokio::main]
async fn main() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        loop {
            term.recv().await;
        }
    }
    #[cfg(not(unix))]
    {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}
