//! rustica - connection broker

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use rustica::broker::{Broker, signals};
use rustica::cli::{Cli, Commands, ServeArgs, WorkerArgs};
use rustica::logging;
use rustica::worker::{self, ProcessSpawner};

/// Parses the command line, initializes logging, and runs the selected
/// command. Errors are printed with their cause chain and exit with status 1.
fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_config());

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(args),
        Commands::Worker(args) => cmd_worker(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn cmd_serve(args: &ServeArgs) -> Result<()> {
    let config = args.broker_config();
    let spawner = match &args.worker_program {
        Some(program) => ProcessSpawner::new(program, config.ipc_path()),
        None => ProcessSpawner::current_exe(config.ipc_path())?,
    };

    let mut broker = Broker::start(config, spawner).context("failed to start broker")?;
    signals::install(broker.control()).context("failed to install signal handlers")?;
    broker.run()?;
    broker.shutdown();
    Ok(())
}

fn cmd_worker(args: &WorkerArgs) -> Result<()> {
    worker::run_worker(args.index, &args.ipc_path, args.idle_timeout())
        .with_context(|| format!("worker {} failed", args.index))
}
