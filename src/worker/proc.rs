//! Process handle for a spawned worker.

use super::WorkerHandle;
use crate::error::{BrokerError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Reason a worker process is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Reaped elsewhere, or a stop/continue notification.
    Unknown,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {}", sig),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal),
            WaitStatus::StillAlive => Self::StillAlive,
            _ => Self::Unknown,
        }
    }
}

/// Handle to a worker process started by [`ProcessSpawner`](super::ProcessSpawner).
///
/// Liveness is never cached: every [`is_running`](WorkerHandle::is_running)
/// asks the kernel, reaping the process once it has exited.
#[derive(Debug)]
pub struct WorkerProc {
    pid: Pid,
    /// Set once the exit status has been collected.
    exit: Option<TerminationReason>,
}

impl WorkerProc {
    pub fn new(pid: Pid) -> Self {
        Self { pid, exit: None }
    }

    /// Take over a spawned child. The broker reaps it by pid from now on.
    pub fn from_child(child: std::process::Child) -> Self {
        Self::new(Pid::from_raw(child.id() as i32))
    }

    /// Why the process stopped, once it has been reaped.
    pub fn exit_reason(&self) -> Option<&TerminationReason> {
        self.exit.as_ref()
    }

    /// Non-blocking reap. `Ok(None)` while the process runs.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = &self.exit {
            return Ok(Some(*reason));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                let reason = TerminationReason::from(status);
                self.exit = Some(reason);
                Ok(Some(reason))
            }
            Err(e) => Err(BrokerError::Spawn(format!("waitpid({}) failed: {}", self.pid, e))),
        }
    }

    /// Send SIGTERM.
    pub fn terminate(&self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| BrokerError::Spawn(format!("failed to send SIGTERM: {}", e)))
    }

    /// SIGTERM, wait up to `timeout`, then SIGKILL and reap.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.terminate()?;

        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| BrokerError::Spawn(format!("failed to send SIGKILL: {}", e)))?;
        let status = waitpid(self.pid, None)
            .map_err(|e| BrokerError::Spawn(format!("waitpid({}) failed: {}", self.pid, e)))?;
        self.exit = Some(status.into());
        Ok(())
    }
}

impl WorkerHandle for WorkerProc {
    fn is_running(&mut self) -> bool {
        // A failed waitpid means the pid is not our child any more.
        matches!(self.try_wait(), Ok(None))
    }

    fn pid(&self) -> Pid {
        self.pid
    }

    fn termination(&self) -> Option<TerminationReason> {
        self.exit
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.stop(Duration::from_millis(500));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn(program: &str, args: &[&str]) -> WorkerProc {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .expect("spawn test process");
        WorkerProc::from_child(child)
    }

    #[test]
    fn test_reason_from_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            TerminationReason::from(WaitStatus::Exited(pid, 3)),
            TerminationReason::Exited(3)
        );
        assert_eq!(
            TerminationReason::from(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::Signaled(Signal::SIGKILL)
        );
        assert_eq!(
            TerminationReason::from(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(TerminationReason::Exited(0).to_string(), "exited with code 0");
        assert!(
            TerminationReason::Signaled(Signal::SIGSEGV)
                .to_string()
                .contains("SIGSEGV")
        );
    }

    #[test]
    fn test_exited_process_is_not_running() {
        let mut proc = spawn("true", &[]);
        let start = Instant::now();
        while proc.is_running() {
            assert!(start.elapsed() < Duration::from_secs(5), "true never exited");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(proc.exit_reason(), Some(&TerminationReason::Exited(0)));
        // Still reports stopped after being reaped.
        assert!(!proc.is_running());
    }

    #[test]
    fn test_stop_terminates_sleeper() {
        let mut proc = spawn("sleep", &["60"]);
        assert!(proc.is_running());
        proc.stop(Duration::from_secs(2)).unwrap();
        assert!(!proc.is_running());
        assert_eq!(
            proc.exit_reason(),
            Some(&TerminationReason::Signaled(Signal::SIGTERM))
        );
    }
}
