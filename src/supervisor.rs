//! # Process Supervisor
//!
//! Spawn, reap, restart, and kill child processes: pipe provisioning for
//! RPC children, a reaper task per child that drives restart policy, and
//! SIGTERM->SIGKILL escalation on kill.
//!
//! The reaper never holds a process record's lock across a call that takes
//! the broker's process-table lock, to avoid deadlocking with a restart's
//! re-entry into `spawn_internal`.

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::message::{Encoding, Message, MessageType};
use crate::process::{ProcessRecord, ProcessStatus, RestartPolicy};
use crate::transport::pipe::{PipeFraming, PipeTransport};
use crate::transport::Transport;
use std::collections::HashMap;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type ProcessTable = Arc<RwLock<HashMap<String, Arc<ProcessRecord>>>>;

/// Options threaded through the single internal spawn implementation; the
/// four public spawn variants (`spawn`, `spawn_rpc`, `spawn_with_restart`,
/// `spawn_rpc_with_restart`) are one-line wrappers over this, per the
/// "duplicated spawn variants" design note.
#[derive(Clone)]
pub struct SpawnOptions {
    pub rpc: bool,
    pub restart: Option<RestartPolicy>,
    pub env_overrides: HashMap<String, String>,
}

impl SpawnOptions {
    pub fn plain() -> Self {
        Self {
            rpc: false,
            restart: None,
            env_overrides: HashMap::new(),
        }
    }

    pub fn rpc() -> Self {
        Self {
            rpc: true,
            restart: None,
            env_overrides: HashMap::new(),
        }
    }

    pub fn with_restart(mut self, max_attempts: i64) -> Self {
        self.restart = Some(RestartPolicy::with_max_attempts(max_attempts, self.rpc));
        self
    }

    #[allow(dead_code)]
    pub fn with_env(mut self, env_overrides: HashMap<String, String>) -> Self {
        self.env_overrides = env_overrides;
        self
    }
}

/// A spawn request: the external description of the child to run.
#[derive(Clone)]
struct SpawnRequest {
    process_id: String,
    command: String,
    args: Vec<String>,
    options: SpawnOptions,
}

/// Callback the supervisor invokes once a child has exited and its
/// `process_exited` event has been built and restart policy applied. The
/// router supplies this at construction so the supervisor doesn't need to
/// know about the process table or inbound queue directly.
pub type ExitHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback the supervisor invokes whenever an RPC child's transport comes
/// up, whether from an initial spawn or from a restart. The router supplies
/// this at construction to attach its reader task, so a restarted RPC child
/// gets read from exactly as the first one did.
pub type TransportHandler = Arc<dyn Fn(String, Arc<dyn Transport>) + Send + Sync>;

/// Drives spawn/reap/restart/kill over a table of [`ProcessRecord`]s.
///
/// Does not own the process table itself — that's the router's job, since
/// the table is shared with send/routing code paths. The supervisor is
/// handed a reference to it at construction and mutates it directly under
/// its own lock.
#[derive(Clone)]
pub struct Supervisor {
    config: BrokerConfig,
    cancellation: CancellationToken,
    processes: ProcessTable,
    on_exit: ExitHandler,
    on_transport: TransportHandler,
    /// One join handle per reaper task currently in flight (including ones
    /// sitting in a restart's backoff sleep). `shutdown` drains and awaits
    /// all of them so it doesn't return while a reaper is still mid-flight.
    reaper_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Supervisor {
    pub fn new(
        config: BrokerConfig,
        cancellation: CancellationToken,
        processes: ProcessTable,
        on_exit: ExitHandler,
        on_transport: TransportHandler,
    ) -> Self {
        Self {
            config,
            cancellation,
            processes,
            on_exit,
            on_transport,
            reaper_handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn a non-RPC child with no restart policy.
    pub async fn spawn(&self, process_id: &str, command: &str, args: Vec<String>) -> Result<()> {
        self.spawn_internal(SpawnRequest {
            process_id: process_id.to_string(),
            command: command.to_string(),
            args,
            options: SpawnOptions::plain(),
        })
        .await
    }

    /// Spawn an RPC child (inherited pipe pair) with no restart policy.
    /// Returns the parent-side transport so the router can attach a reader.
    pub async fn spawn_rpc(&self, process_id: &str, command: &str, args: Vec<String>) -> Result<Arc<dyn Transport>> {
        self.spawn_internal(SpawnRequest {
            process_id: process_id.to_string(),
            command: command.to_string(),
            args,
            options: SpawnOptions::rpc(),
        })
        .await?;
        self.transport_for(process_id).await
    }

    /// Spawn a non-RPC child with a restart policy.
    pub async fn spawn_with_restart(
        &self,
        process_id: &str,
        command: &str,
        args: Vec<String>,
        max_attempts: i64,
    ) -> Result<()> {
        self.spawn_internal(SpawnRequest {
            process_id: process_id.to_string(),
            command: command.to_string(),
            args,
            options: SpawnOptions::plain().with_restart(max_attempts),
        })
        .await
    }

    /// Spawn an RPC child with a restart policy.
    pub async fn spawn_rpc_with_restart(
        &self,
        process_id: &str,
        command: &str,
        args: Vec<String>,
        max_attempts: i64,
    ) -> Result<Arc<dyn Transport>> {
        self.spawn_internal(SpawnRequest {
            process_id: process_id.to_string(),
            command: command.to_string(),
            args,
            options: SpawnOptions::rpc().with_restart(max_attempts),
        })
        .await?;
        self.transport_for(process_id).await
    }

    async fn transport_for(&self, process_id: &str) -> Result<Arc<dyn Transport>> {
        let processes = self.processes.read().await;
        let record = processes.get(process_id).ok_or_else(|| BrokerError::Unknown {
            kind: "process",
            what: process_id.to_string(),
        })?;
        record.transport.clone().ok_or_else(|| BrokerError::Unknown {
            kind: "process transport",
            what: process_id.to_string(),
        })
    }

    /// The single internal spawn implementation every public variant funnels
    /// through, per the "duplicated spawn variants" design note.
    async fn spawn_internal(&self, request: SpawnRequest) -> Result<()> {
        if self.cancellation.is_cancelled() {
            // Covers both a fresh external spawn attempted after shutdown
            // and a reaper's restart racing shutdown's cancellation; narrows
            // (without fully eliminating) the window in which a restart can
            // still slip a new process past `shutdown`'s reaper-join loop.
            return Err(BrokerError::Shutdown);
        }
        if self.processes.read().await.contains_key(&request.process_id) {
            return Err(BrokerError::DuplicateId(request.process_id));
        }

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args);
        cmd.env("PROCESS_ID", &request.process_id);
        for (k, v) in &request.options.env_overrides {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        // Raw fds that belong to the *child's* end of each pipe. The parent
        // only needs these open long enough for `pre_exec` (running in the
        // forked child, before exec) to `dup2` them onto the configured
        // descriptor numbers; the parent's own copies must be closed right
        // after `cmd.spawn()` returns, successful or not, or the parent's
        // read end of the child->parent pipe will never see EOF when the
        // child exits (fork duplicates the whole fd table, so these numbers
        // stay open in the parent regardless of what the forked child does
        // with its copies).
        let mut child_owned_fds: Option<(RawFd, RawFd)> = None;

        let transport: Option<Arc<dyn Transport>> = if request.options.rpc {
            let (parent_to_child_rx, parent_to_child_tx) = os_pipe::pipe().map_err(|e| BrokerError::StartFailed {
                id: request.process_id.clone(),
                source: e,
            })?;
            let (child_to_parent_rx, child_to_parent_tx) = os_pipe::pipe().map_err(|e| BrokerError::StartFailed {
                id: request.process_id.clone(),
                source: e,
            })?;

            cmd.env("RPC_INPUT_FD", self.config.rpc_input_fd.to_string());
            cmd.env("RPC_OUTPUT_FD", self.config.rpc_output_fd.to_string());

            let child_read_fd = parent_to_child_rx.into_raw_fd();
            let child_write_fd = child_to_parent_tx.into_raw_fd();
            let input_fd_target = self.config.rpc_input_fd;
            let output_fd_target = self.config.rpc_output_fd;
            child_owned_fds = Some((child_read_fd, child_write_fd));

            // SAFETY: `pre_exec` runs in the forked child between fork and
            // exec. `dup2` is async-signal-safe; `child_read_fd`/`child_write_fd`
            // are fds this process owns exclusively at this point (just
            // created by os_pipe::pipe above, not yet shared with anything
            // else), so duplicating them onto fixed numbers here cannot race
            // with other code in this process.
            unsafe {
                cmd.pre_exec(move || {
                    if libc::dup2(child_read_fd, input_fd_target) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::dup2(child_write_fd, output_fd_target) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }

            let parent_transport = PipeTransport::from_raw_fds(
                child_to_parent_rx.into_raw_fd(),
                parent_to_child_tx.into_raw_fd(),
                PipeFraming::Framed,
                self.config.max_message_size,
            );
            parent_transport.connect().await?;
            Some(Arc::new(parent_transport) as Arc<dyn Transport>)
        } else {
            None
        };

        let spawn_result = cmd.spawn();

        // The child (if one was actually forked) now has its own dup'd
        // copies of these descriptors from `pre_exec`; the parent's copies
        // are pure overhead from here on and must be closed unconditionally,
        // whether or not the spawn itself succeeded.
        if let Some((child_read_fd, child_write_fd)) = child_owned_fds.take() {
            // SAFETY: these fds are owned by this process (just created
            // above, never shared past the `pre_exec` closure that already
            // ran or failed to run in the forked child) and are not used
            // again after this point.
            unsafe {
                libc::close(child_read_fd);
                libc::close(child_write_fd);
            }
        }

        let child = spawn_result.map_err(|e| BrokerError::StartFailed {
            id: request.process_id.clone(),
            source: e,
        })?;
        let pid = child.id().unwrap_or(0);

        let restart_policy = request
            .options
            .restart
            .clone()
            .unwrap_or_else(|| RestartPolicy::none(request.options.rpc));

        let transport_for_reader = transport.clone();
        let record = Arc::new(ProcessRecord::new(
            request.process_id.clone(),
            pid,
            request.command.clone(),
            request.args.clone(),
            transport,
            restart_policy,
        ));

        self.processes
            .write()
            .await
            .insert(request.process_id.clone(), record.clone());

        // Only attach the reader once the record is visible in the table:
        // the reader can otherwise deliver a broker-local request from this
        // very process before `send_to_process` has anywhere to route its
        // reply back to.
        if let Some(t) = transport_for_reader {
            (self.on_transport)(request.process_id.clone(), t);
        }

        info!(process_id = %request.process_id, pid, "spawned process");

        self.spawn_reaper(child, request, record);

        Ok(())
    }

    /// Launch the reaper task that awaits the child's OS termination, emits
    /// `process_exited`, and drives restart policy.
    fn spawn_reaper(&self, mut child: Child, original_request: SpawnRequest, record: Arc<ProcessRecord>) {
        let supervisor = self.clone();
        let process_id = record.process_id.clone();

        let handle = tokio::spawn(async move {
            let wait_result = child.wait().await;
            let exit_code = match &wait_result {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };

            let current_attempts = {
                let mut state = record.state.write().await;
                state.end_time = Some(chrono::Utc::now());
                state.exit_code = Some(exit_code);
                state.status = ProcessStatus::Exited;
                state.restart_policy.current_attempts
            };

            let event_payload = serde_json::to_vec(&serde_json::json!({
                "event": "process_exited",
                "id": process_id,
                "pid": record.pid,
                "exit_code": exit_code,
            }))
            .unwrap_or_default();
            (supervisor.on_exit)(Message {
                message_type: MessageType::Event,
                id: "process_exited".to_string(),
                source: process_id.clone(),
                target: process_id.clone(),
                correlation_id: String::new(),
                encoding: Encoding::Json,
                payload: event_payload,
                error: None,
            });

            let allows_another = {
                let state = record.state.read().await;
                state.restart_policy.allows_another()
            };

            if !allows_another || supervisor.cancellation.is_cancelled() {
                // Restart policy exhausted (or shutdown in progress): the
                // record has already served its purpose for the caller
                // (final exit_code/status were just recorded above), so
                // drop it rather than leaving a stale Exited entry behind.
                supervisor.processes.write().await.remove(&process_id);
                return;
            }

            let next_attempts = current_attempts + 1;
            supervisor.processes.write().await.remove(&process_id);

            tokio::time::sleep(supervisor.config.restart_backoff).await;

            if supervisor.cancellation.is_cancelled() {
                // Shutdown landed while this reaper was in its backoff
                // sleep; don't bring up a new process only to kill it again.
                return;
            }

            let mut next_options = original_request.options.clone();
            if let Some(policy) = &mut next_options.restart {
                policy.current_attempts = next_attempts;
            }
            let next_request = SpawnRequest {
                process_id: process_id.clone(),
                command: original_request.command.clone(),
                args: original_request.args.clone(),
                options: next_options,
            };

            if let Err(e) = supervisor.spawn_internal(next_request).await {
                warn!(process_id = %process_id, error = %e, "restart attempt failed; process remains absent");
            }
        });

        let mut handles = self.reaper_handles.lock().expect("reaper handle list poisoned");
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Send SIGTERM, wait up to `kill_escalation_timeout`, then SIGKILL if
    /// the process hasn't exited.
    pub async fn kill(&self, process_id: &str) -> Result<()> {
        let record = {
            let processes = self.processes.read().await;
            processes
                .get(process_id)
                .cloned()
                .ok_or_else(|| BrokerError::NotRunning(process_id.to_string()))?
        };

        {
            let state = record.state.read().await;
            if state.status != ProcessStatus::Running {
                return Err(BrokerError::NotRunning(process_id.to_string()));
            }
        }

        send_signal(record.pid, Signal::Term)?;

        let deadline = tokio::time::Instant::now() + self.config.kill_escalation_timeout;
        loop {
            if record.status().await != ProcessStatus::Running {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        send_signal(record.pid, Signal::Kill)?;
        while record.status().await == ProcessStatus::Running {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    /// Cancel the supervisor's cancellation token, kill every running
    /// process concurrently, and wait for every reaper (including ones
    /// mid-restart-backoff) to finish before returning.
    ///
    /// A reaper that read `is_cancelled() == false` a moment before `cancel`
    /// ran above can still win the race to restart a process once: its own
    /// handle is in the very first snapshot this function joins, but the
    /// *new* handle it registers for the restarted process lands after that
    /// snapshot was taken. Looping — kill whatever is running, join whatever
    /// handles exist, repeat until a pass finds nothing left to join — closes
    /// that window: `spawn_internal`'s own cancellation check (now that
    /// `cancel` has already run) stops any restart attempted in a later
    /// pass, so this converges in at most a couple of iterations.
    pub async fn shutdown(&self) {
        self.cancellation.cancel();

        loop {
            let ids: Vec<String> = {
                let processes = self.processes.read().await;
                processes.keys().cloned().collect()
            };

            let kill_tasks: Vec<JoinHandle<()>> = ids
                .into_iter()
                .map(|id| {
                    let supervisor = self.clone();
                    tokio::spawn(async move {
                        let is_running = {
                            let processes = supervisor.processes.read().await;
                            match processes.get(&id) {
                                Some(record) => record.status().await == ProcessStatus::Running,
                                None => false,
                            }
                        };
                        if is_running {
                            if let Err(e) = supervisor.kill(&id).await {
                                warn!(process_id = %id, error = %e, "shutdown: kill failed");
                            }
                        }
                    })
                })
                .collect();
            for task in kill_tasks {
                let _ = task.await;
            }

            let handles = {
                let mut guard = self.reaper_handles.lock().expect("reaper handle list poisoned");
                std::mem::take(&mut *guard)
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    use nix::sys::signal::{self, Signal as NixSignal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    match signal::kill(Pid::from_raw(pid as i32), nix_signal) {
        Ok(()) => Ok(()),
        // The process may have already exited between our status check and
        // the kill call; that's not an error condition for the caller.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(BrokerError::Io(std::io::Error::from_raw_os_error(e as i32))),
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    fn test_supervisor() -> Supervisor {
        Supervisor::new(
            BrokerConfig::default(),
            CancellationToken::new(),
            Arc::new(RwLock::new(HashMap::new())),
            Arc::new(|_msg| {}),
            Arc::new(|_process_id, _transport| {}),
        )
    }

    #[tokio::test]
    async fn spawn_rejects_duplicate_process_id() {
        let sup = test_supervisor();
        sup.spawn("dup", "true", vec![]).await.unwrap();
        let err = sup.spawn("dup", "true", vec![]).await.unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn kill_on_exited_process_returns_not_running() {
        let sup = test_supervisor();
        sup.spawn("short-lived", "true", vec![]).await.unwrap();
        for _ in 0..50 {
            let processes = sup.processes.read().await;
            if let Some(record) = processes.get("short-lived") {
                if record.status().await != ProcessStatus::Running {
                    break;
                }
            }
            drop(processes);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let err = sup.kill("short-lived").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotRunning(_)));
    }

    #[tokio::test]
    async fn kill_on_unknown_process_returns_not_running() {
        let sup = test_supervisor();
        let err = sup.kill("nope").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotRunning(_)));
    }

    #[tokio::test]
    async fn spawn_with_restart_eventually_stops_restarting() {
        let sup = test_supervisor();
        sup.spawn_with_restart("crasher", "false", vec![], 2).await.unwrap();
        // Wait long enough for: exit -> backoff(1s) -> restart -> exit ->
        // backoff(1s) -> restart -> exit -> no more restarts.
        tokio::time::sleep(Duration::from_millis(2400)).await;
        assert!(!sup.processes.read().await.contains_key("crasher"));
    }
}
