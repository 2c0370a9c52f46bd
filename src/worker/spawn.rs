//! Starting worker processes.

use super::WorkerSpawner;
use super::proc::WorkerProc;
use crate::error::{BrokerError, Result};
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Environment variable carrying the local channel path to a worker.
pub const IPC_PATH_ENV: &str = "RUSTICA_IPC_PATH";

/// Spawns `<program> worker <index>` for each requested worker.
///
/// Workers inherit stderr so their logs interleave with the broker's. There
/// is no restart policy: a worker that exits stays gone until the broker
/// asks for another one.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    ipc_path: PathBuf,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, ipc_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ipc_path: ipc_path.into(),
        }
    }

    /// Spawn copies of the running executable.
    pub fn current_exe(ipc_path: impl Into<PathBuf>) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| BrokerError::Spawn(format!("failed to get current executable: {}", e)))?;
        Ok(Self::new(program, ipc_path))
    }

    fn command(&self, index: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker");
        cmd.arg(index.to_string());
        cmd.env(IPC_PATH_ENV, &self.ipc_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());
        cmd
    }
}

impl WorkerSpawner for ProcessSpawner {
    type Handle = WorkerProc;

    fn spawn(&mut self, index: usize) -> Result<WorkerProc> {
        let child = self.command(index).spawn().map_err(|e| {
            BrokerError::Spawn(format!("{}: {}", self.program.display(), e))
        })?;
        Ok(WorkerProc::from_child(child))
    }
}
