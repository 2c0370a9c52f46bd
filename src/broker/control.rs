//! Control flags and the wake channel.
//!
//! Signal handlers may only flip a flag and poke the wake channel; the reactor
//! drains the channel, then reads and clears the flags synchronously.

use crate::error::Result;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// The two process-wide control flags plus a self-pipe.
#[derive(Debug)]
pub struct Control {
    shutdown_requested: AtomicBool,
    worker_exit_pending: AtomicBool,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
}

impl Control {
    pub fn new() -> Result<Self> {
        let (wake_rx, wake_tx) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self {
            shutdown_requested: AtomicBool::new(false),
            worker_exit_pending: AtomicBool::new(false),
            wake_rx,
            wake_tx,
        })
    }

    /// Read end of the wake channel, registered with the poller.
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake_rx.as_fd()
    }

    /// Make a blocked `wait` return. Async-signal-safe.
    pub fn wake(&self) {
        // A full pipe already holds a pending wake.
        let _ = unistd::write(&self.wake_tx, &[1u8]);
    }

    /// Empty the wake channel so the next `wait` blocks again.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(&self.wake_rx, &mut buf) {
                Ok(0) | Err(Errno::EAGAIN) => return,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(_) => return,
            }
        }
    }

    /// Ask the reactor to stop. Async-signal-safe.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Report that some worker process exited. Async-signal-safe.
    pub fn notify_worker_exit(&self) {
        self.worker_exit_pending.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Clear the worker-exit flag, returning whether it was set.
    pub fn take_worker_exit(&self) -> bool {
        self.worker_exit_pending.swap(false, Ordering::SeqCst)
    }
}
