//! # Command-Line Interface
//!
//! A thin `clap`-derived binary surface around [`crate::broker::Broker`].
//! A CLI that would really front a production broker is a separate
//! concern; this one exists as a driver for manual exercising and a home
//! for the logging/config bootstrap.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, Subcommand,
};
use std::path::PathBuf;

use crate::config::BrokerConfig;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Green.on_default())
        .literal(AnsiColor::Cyan.on_default())
        .placeholder(AnsiColor::Cyan.on_default())
}

/// process-broker - supervise child worker processes and route framed
/// request/response/event traffic between them.
#[derive(Parser, Debug, Clone)]
#[command(name = "process-broker", version, about, styles = styles())]
pub struct Args {
    /// Base path for named filesystem sockets; the per-process path is
    /// `<socket-base-path>_<process_id>.sock`.
    #[arg(long, default_value = "/tmp/process-broker")]
    pub socket_base_path: PathBuf,

    /// Largest payload, in bytes, encode/decode will accept.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_message_size: usize,

    /// Increase log verbosity. Repeatable: `-v` for debug, `-vv` for trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress the colorized stdout log layer; the detailed log layer
    /// (file or stderr) is unaffected.
    #[arg(long)]
    pub quiet: bool,

    /// Where the detailed log layer writes: a file path, or the literal
    /// `stderr`. Defaults to a daily-rotating file in the working directory.
    #[arg(long)]
    pub log_file: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Spawn one RPC child under the broker and print `process_exited`
    /// events as they arrive. Useful as a smoke-test harness; it is glue
    /// around the library, not a restatement of business logic.
    Spawn {
        /// Process ID to register the child under.
        process_id: String,
        /// Command to execute.
        command: String,
        /// Arguments passed to the command.
        args: Vec<String>,
        /// Enable automatic restart on exit, with this many attempts
        /// (-1 for unlimited).
        #[arg(long)]
        restart: Option<i64>,
    },
}

impl Args {
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_message_size: self.max_message_size,
            socket_base_path: self.socket_base_path.clone(),
            ..Default::default()
        }
    }

    pub fn log_level(&self) -> tracing_subscriber::filter::LevelFilter {
        use tracing_subscriber::filter::LevelFilter;
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}
