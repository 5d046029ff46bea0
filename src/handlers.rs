//! # Broker-Local Handler Table
//!
//! Requests with `target == "broker"` are routed here by `id` (the method
//! name) instead of to a child. A handler takes the request's decoded JSON
//! payload and produces the response's JSON payload; an unknown method is
//! the router's problem, not this table's — it reports `Unknown` and lets
//! the caller decide how to reply.

use crate::error::{BrokerError, Result};
use crate::stats::StatsAggregator;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const RPC_GET_MESSAGE_STATS: &str = "RPCGetMessageStats";
pub const RPC_GET_MESSAGE_COUNT: &str = "RPCGetMessageCount";

/// A boxed, `Send` future carrying a handler's result, avoiding a dependency
/// on the `futures` crate for a single type alias.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// A registry of broker-local RPC methods, keyed by request `id`.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, method: impl Into<String>, handler: Handler) {
        self.handlers.write().await.insert(method.into(), handler);
    }

    pub async fn dispatch(&self, method: &str, payload: Value) -> Result<Value> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(method).cloned()
        };
        match handler {
            Some(handler) => handler(payload).await,
            None => Err(BrokerError::Unknown {
                kind: "method",
                what: method.to_string(),
            }),
        }
    }
}

/// Register the minimum built-in handlers: a stats query and a count
/// query, both backed by the broker's [`StatsAggregator`].
pub async fn register_builtin_handlers(table: &HandlerTable, stats: Arc<StatsAggregator>) {
    let stats_for_get_stats = stats.clone();
    table
        .register(
            RPC_GET_MESSAGE_STATS,
            Arc::new(move |_payload: Value| {
                let stats = stats_for_get_stats.clone();
                Box::pin(async move {
                    let snapshot = stats.snapshot().await;
                    Ok(json!({
                        "total": {
                            "sent": snapshot.total_sent,
                            "received": snapshot.total_received,
                        },
                        "per_process": snapshot.per_process,
                    }))
                }) as HandlerFuture
            }),
        )
        .await;

    table
        .register(
            RPC_GET_MESSAGE_COUNT,
            Arc::new(move |_payload: Value| {
                let stats = stats.clone();
                Box::pin(async move {
                    let count = stats.total_message_count().await;
                    Ok(json!({ "count": count }))
                }) as HandlerFuture
            }),
        )
        .await;
}
