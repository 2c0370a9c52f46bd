//! Worker processes: how the broker starts and tracks them, and what a
//! worker does once started.
//!
//! # Architecture
//!
//! ```text
//!        clients ──tcp──►┌─────────────────┐
//!                        │     Broker      │
//!                        │   (reactor)     │
//!                        └────────┬────────┘
//!                                 │ .s.rustica.<port>
//!               ┌─────────────────┼─────────────────┐
//!               │                 │                 │
//!         ┌─────▼─────┐     ┌─────▼─────┐     ┌─────▼─────┐
//!         │ Worker 0  │     │ Worker 1  │     │ Worker N  │
//!         │ (process) │     │ (process) │     │ (process) │
//!         └───────────┘     └───────────┘     └───────────┘
//! ```
//!
//! Each worker connects to the local channel, sends a hello, and then waits
//! for the broker to pass it a client connection's descriptor.
//!
//! The broker only depends on the [`WorkerSpawner`] and [`WorkerHandle`]
//! traits, so tests can drive it without starting real processes.

mod proc;
mod spawn;
mod table;
pub mod worker_main;

use crate::error::Result;
use nix::unistd::Pid;

pub use proc::{TerminationReason, WorkerProc};
pub use spawn::{IPC_PATH_ENV, ProcessSpawner};
pub use table::{ExitedWorker, WorkerTable};
pub use worker_main::{ConnectionHandler, StatusHandler, run_worker};

/// A spawned worker, queried for liveness on demand.
pub trait WorkerHandle {
    /// Whether the process is still running. Never cached.
    fn is_running(&mut self) -> bool;

    fn pid(&self) -> Pid;

    /// How the process ended, when the handle knows.
    fn termination(&self) -> Option<TerminationReason> {
        None
    }
}

/// Starts worker processes for the broker.
pub trait WorkerSpawner {
    type Handle: WorkerHandle;

    /// Start a worker that will occupy handle-table slot `index`.
    ///
    /// The process must connect to the local channel and send its hello.
    /// Its exit has to raise `SIGCHLD` in the broker.
    fn spawn(&mut self, index: usize) -> Result<Self::Handle>;
}
