//! rustica - a connection broker for a pool of worker processes.
//!
//! The broker accepts client connections on one or more public TCP
//! listeners, collects worker processes on a local Unix socket, and passes
//! each client connection to an idle worker over that socket.
//!
//! ```no_run
//! use rustica::broker::{Broker, BrokerConfig, signals};
//! use rustica::worker::ProcessSpawner;
//!
//! # fn main() -> rustica::error::Result<()> {
//! let config = BrokerConfig::default();
//! let spawner = ProcessSpawner::current_exe(config.ipc_path())?;
//! let mut broker = Broker::start(config, spawner)?;
//! signals::install(broker.control())?;
//! broker.run()?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod cli;
pub mod error;
pub mod logging;
pub mod paths;
pub mod worker;
