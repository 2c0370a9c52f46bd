//! The connection broker.
//!
//! A single-threaded reactor that accepts client connections on the public
//! listeners, collects worker processes on the local channel, and passes each
//! client connection to the longest-idle worker.
//!
//! # Lifecycle
//!
//! ```text
//!   Broker::start ──► Broker::run ──(shutdown signal)──► teardown
//!        │                 │
//!  open listeners     wait ► handle batch ► wait ...
//!  size tables
//! ```

mod control;
pub mod handoff;
pub mod hello;
mod idle;
pub mod listen;
mod poller;
mod reactor;
pub mod signals;
mod slots;

use crate::paths;
use std::path::PathBuf;

pub use control::Control;
pub use idle::IdleQueue;
pub use poller::{Event, Events, Interest, Poller};
pub use reactor::Broker;
pub use slots::{Endpoint, SlotKind, SlotTable, WorkerConn};

/// Broker settings, built from the command line or directly by callers.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Comma-separated public listen addresses; `*` means all interfaces.
    pub listen_addresses: String,
    /// TCP port of every public listener. Also names the local channel.
    pub port: u16,
    /// Directory holding the local channel's socket file.
    pub ipc_dir: PathBuf,
    /// Maximum number of worker processes.
    pub max_workers: usize,
    /// Log the peer address of each public connection.
    pub log_connections: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addresses: "localhost".to_string(),
            port: 8080,
            ipc_dir: paths::default_ipc_dir(),
            max_workers: 8,
            log_connections: false,
        }
    }
}

impl BrokerConfig {
    /// Path of the local channel socket.
    pub fn ipc_path(&self) -> PathBuf {
        paths::ipc_socket_path(&self.ipc_dir, self.port)
    }

    /// Slot table size: the wake channel, the public listeners, and one
    /// slot per possible worker.
    pub fn slot_capacity(&self, listeners: usize) -> usize {
        1 + listeners + self.max_workers
    }

    /// Public connections only trigger a spawn while fewer workers than this
    /// are running.
    pub fn spawn_limit(&self) -> usize {
        self.max_workers.saturating_sub(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_path_named_by_port() {
        let config = BrokerConfig {
            ipc_dir: PathBuf::from("/run/rustica"),
            port: 5433,
            ..Default::default()
        };
        assert_eq!(config.ipc_path(), PathBuf::from("/run/rustica/.s.rustica.5433"));
    }

    #[test]
    fn test_capacity_and_spawn_limit() {
        let config = BrokerConfig {
            max_workers: 8,
            ..Default::default()
        };
        assert_eq!(config.slot_capacity(2), 11);
        assert_eq!(config.spawn_limit(), 6);

        let tiny = BrokerConfig {
            max_workers: 1,
            ..Default::default()
        };
        assert_eq!(tiny.spawn_limit(), 0);
    }
}
