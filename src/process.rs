//! # Process Record
//!
//! A handle to one spawned child: its OS identity, its transport endpoint
//! (if any — non-RPC children have none), its lifecycle state, and its
//! restart policy. The supervisor is the sole owner; everything else reaches
//! a child only by `process_id` through the router.

use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Restart policy attached to a process record at spawn time.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// `-1` means unlimited.
    pub max_attempts: i64,
    pub current_attempts: u32,
    pub is_rpc: bool,
}

impl RestartPolicy {
    pub fn none(is_rpc: bool) -> Self {
        Self {
            enabled: false,
            max_attempts: 0,
            current_attempts: 0,
            is_rpc,
        }
    }

    pub fn with_max_attempts(max_attempts: i64, is_rpc: bool) -> Self {
        Self {
            enabled: true,
            max_attempts,
            current_attempts: 0,
            is_rpc,
        }
    }

    /// Whether another restart attempt is permitted given the attempts
    /// already spent.
    pub fn allows_another(&self) -> bool {
        self.enabled && (self.max_attempts < 0 || (self.current_attempts as i64) < self.max_attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited,
    Failed,
}

/// Mutable half of a process record, guarded by one reader-writer lock per
/// the concurrency model: status, timestamps, exit code, and restart policy
/// change together and are read together.
#[derive(Debug, Clone)]
pub struct ProcessRecordState {
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub restart_policy: RestartPolicy,
}

/// A spawned child, immutable identity plus a lock-guarded mutable state.
pub struct ProcessRecord {
    pub process_id: String,
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    /// Present only for RPC children; `None` for plain spawns.
    pub transport: Option<Arc<dyn Transport>>,
    pub state: RwLock<ProcessRecordState>,
    /// Serializes send_to_process calls against this record so an
    /// in-flight encode+send cannot interleave with another one to the
    /// same child.
    pub send_lock: Mutex<()>,
}

impl ProcessRecord {
    pub fn new(
        process_id: impl Into<String>,
        pid: u32,
        command: impl Into<String>,
        args: Vec<String>,
        transport: Option<Arc<dyn Transport>>,
        restart_policy: RestartPolicy,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            pid,
            command: command.into(),
            args,
            transport,
            state: RwLock::new(ProcessRecordState {
                status: ProcessStatus::Running,
                exit_code: None,
                start_time: Utc::now(),
                end_time: None,
                restart_policy,
            }),
            send_lock: Mutex::new(()),
        }
    }

    pub async fn status(&self) -> ProcessStatus {
        self.state.read().await.status
    }

    pub fn is_rpc(&self) -> bool {
        self.transport.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_respects_unlimited_and_bounded_attempts() {
        let unlimited = RestartPolicy::with_max_attempts(-1, true);
        assert!(unlimited.allows_another());

        let mut bounded = RestartPolicy::with_max_attempts(2, true);
        assert!(bounded.allows_another());
        bounded.current_attempts = 2;
        assert!(!bounded.allows_another());

        let disabled = RestartPolicy::none(false);
        assert!(!disabled.allows_another());
    }
}
