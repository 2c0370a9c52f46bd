//! Command-line interface definitions using clap.

use crate::broker::BrokerConfig;
use crate::logging::{LogConfig, LogFormat, parse_level};
use crate::paths;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Connection broker in front of a pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "rustica")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, global = true, env = "RUSTICA_LOG_LEVEL", value_parser = parse_level_arg)]
    pub log_level: Option<Level>,

    /// Log format: pretty, compact, json.
    #[arg(long, global = true, env = "RUSTICA_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true, env = "RUSTICA_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the broker.
    Serve(ServeArgs),

    /// Run one worker process (started by the broker).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Comma-separated addresses to listen on; `*` means all interfaces.
    #[arg(long, env = "RUSTICA_LISTEN_ADDRESSES", default_value = "localhost")]
    pub listen_addresses: String,

    /// TCP port for the public listeners. Also names the worker channel.
    #[arg(short, long, env = "RUSTICA_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory for the worker channel socket.
    #[arg(long, env = "RUSTICA_IPC_DIR", default_value_os_t = paths::default_ipc_dir())]
    pub ipc_dir: PathBuf,

    /// Maximum number of worker processes.
    #[arg(long, env = "RUSTICA_MAX_WORKERS", default_value_t = 8,
          value_parser = clap::value_parser!(u16).range(1..))]
    pub max_workers: u16,

    /// Log the peer address of every client connection.
    #[arg(long, env = "RUSTICA_LOG_CONNECTIONS")]
    pub log_connections: bool,

    /// Program started for each worker (defaults to this executable).
    #[arg(long, env = "RUSTICA_WORKER_PROGRAM")]
    pub worker_program: Option<PathBuf>,
}

impl ServeArgs {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            listen_addresses: self.listen_addresses.clone(),
            port: self.port,
            ipc_dir: self.ipc_dir.clone(),
            max_workers: usize::from(self.max_workers),
            log_connections: self.log_connections,
        }
    }
}

/// Arguments for the worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Index of this worker in the broker's worker table.
    pub index: usize,

    /// Path of the broker's worker channel socket.
    #[arg(long, env = crate::worker::IPC_PATH_ENV)]
    pub ipc_path: PathBuf,

    /// Exit after this many seconds without work (0 = never).
    #[arg(long, env = "RUSTICA_WORKER_IDLE_TIMEOUT", default_value_t = 0)]
    pub idle_timeout: u64,
}

impl WorkerArgs {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }
}

fn parse_level_arg(s: &str) -> Result<Level, String> {
    parse_level(s).ok_or_else(|| format!("unknown log level '{}'", s))
}

impl Cli {
    /// Logging settings for the selected command.
    ///
    /// Environment overrides apply first; explicit flags win over them.
    /// A level from `-v` or `--log-level` replaces any `RUSTICA_LOG` or
    /// `RUST_LOG` filter.
    pub fn log_config(&self) -> LogConfig {
        let base = match self.command {
            Commands::Serve(_) => LogConfig::for_broker(),
            Commands::Worker(_) => LogConfig::for_worker(),
        };
        let mut config = base.with_env_overrides();

        if self.verbose > 0 || self.log_level.is_some() {
            config.filter = None;
        }
        match self.verbose {
            0 => {}
            1 => config = config.with_level(Level::DEBUG),
            _ => config = config.with_level(Level::TRACE),
        }
        if let Some(level) = self.log_level {
            config = config.with_level(level);
        }
        if let Some(format) = self.log_format {
            config = config.with_format(format);
        }
        if let Some(path) = &self.log_file {
            config = config.with_file(path.clone());
        }
        config
    }
}
