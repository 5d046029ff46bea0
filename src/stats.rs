//! # Message Stats Aggregator
//!
//! Every `send_to_process` and every message pulled off the broker's inbound
//! queue bumps these counters. Per-process breakdowns are keyed by `target`
//! on sends and `source` on receipts, matching the router's framing in
//! §4.4. Guarded by its own reader-writer lock, independent of the
//! process-table and pending-request-table locks.

use crate::message::MessageType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CounterSet {
    pub request: u64,
    pub response: u64,
    pub event: u64,
    pub error: u64,
}

impl CounterSet {
    fn bump(&mut self, message_type: MessageType) {
        match message_type {
            MessageType::Request => self.request += 1,
            MessageType::Response => self.response += 1,
            MessageType::Event => self.event += 1,
            MessageType::Error => self.error += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.request + self.response + self.event + self.error
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessStats {
    pub sent: CounterSet,
    pub received: CounterSet,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ProcessStats {
    fn touch(&mut self, now: DateTime<Utc>) {
        if self.first_message_at.is_none() {
            self.first_message_at = Some(now);
        }
        self.last_message_at = Some(now);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub total_sent: CounterSet,
    pub total_received: CounterSet,
    pub per_process: HashMap<String, ProcessStats>,
}

#[derive(Default)]
struct StatsInner {
    total_sent: CounterSet,
    total_received: CounterSet,
    per_process: HashMap<String, ProcessStats>,
}

/// Aggregates send/receive counters across every process the broker has
/// ever talked to.
pub struct StatsAggregator {
    inner: RwLock<StatsInner>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StatsInner::default()),
        }
    }

    /// Record a message handed to `send_to_process(target, ..)`.
    pub async fn record_sent(&self, target: &str, message_type: MessageType) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        inner.total_sent.bump(message_type);
        let entry = inner.per_process.entry(target.to_string()).or_default();
        entry.sent.bump(message_type);
        entry.touch(now);
    }

    /// Record a message pulled off the inbound queue, attributed to its
    /// original `source`.
    pub async fn record_received(&self, source: &str, message_type: MessageType) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        inner.total_received.bump(message_type);
        let entry = inner.per_process.entry(source.to_string()).or_default();
        entry.received.bump(message_type);
        entry.touch(now);
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.read().await;
        StatsSnapshot {
            total_sent: inner.total_sent.clone(),
            total_received: inner.total_received.clone(),
            per_process: inner.per_process.clone(),
        }
    }

    pub async fn total_message_count(&self) -> u64 {
        let inner = self.inner.read().await;
        inner.total_sent.total() + inner.total_received.total()
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
