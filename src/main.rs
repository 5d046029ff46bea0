//! # process-broker - Main Entry Point
//!
//! Bootstraps logging, parses CLI arguments, constructs a [`Broker`], and
//! drives the one supported subcommand (`spawn`). The broker library itself
//! has no CLI dependency; this binary is glue, per §6's "CLI surface"
//! description.

use anyhow::Result;
use clap::Parser;
use process_broker::broker::Broker;
use process_broker::cli::{Args, Command};
use tracing::info;

use tracing_subscriber::{prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments first, as they control logging behavior.
    let args = Args::parse();
    let log_level = args.log_level();

    // Configure the detailed log layer (file or stderr). The guard must be
    // kept alive for the duration of the program for file logging.
    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("process-broker.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "process-broker.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean, user-facing output on stdout, colorized by level, suppressed
    // entirely by --quiet.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
    let _log_guard = guard;

    info!("starting process broker");
    let config = args.to_broker_config();
    let broker = Broker::new(config).await;

    match args.command {
        Command::Spawn {
            process_id,
            command,
            args: child_args,
            restart,
        } => run_spawn(&broker, process_id, command, child_args, restart).await?,
    }

    Ok(())
}

/// Spawn one RPC child, print `process_exited` events as they arrive, and
/// run until Ctrl-C, at which point the broker is shut down and every
/// running child killed.
async fn run_spawn(
    broker: &Broker,
    process_id: String,
    command: String,
    child_args: Vec<String>,
    restart: Option<i64>,
) -> Result<()> {
    let mut events = broker.subscribe_events();

    match restart {
        Some(max_attempts) => {
            broker
                .spawn_rpc_with_restart(&process_id, &command, child_args, max_attempts)
                .await?
        }
        None => broker.spawn_rpc(&process_id, &command, child_args).await?,
    }
    info!(process_id = %process_id, "spawned");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(msg) => {
                        let payload: serde_json::Value =
                            serde_json::from_slice(&msg.payload).unwrap_or(serde_json::Value::Null);
                        info!(process_id = %msg.source, event = %msg.id, payload = %payload, "process event");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down");
                broker.shutdown().await;
                break;
            }
        }
    }

    Ok(())
}
