//! Fixed-size table of spawned worker handles.

use super::{TerminationReason, WorkerHandle};
use nix::unistd::Pid;

/// A worker found stopped during [`WorkerTable::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitedWorker {
    pub index: usize,
    pub pid: Pid,
    pub reason: Option<TerminationReason>,
}

/// One entry per possible worker process, indexed by the number passed to
/// the worker at spawn time.
#[derive(Debug)]
pub struct WorkerTable<H> {
    handles: Vec<Option<H>>,
    /// Estimate of running workers, corrected by [`reconcile`](Self::reconcile).
    active: usize,
}

impl<H: WorkerHandle> WorkerTable<H> {
    pub fn new(capacity: usize) -> Self {
        Self {
            handles: (0..capacity).map(|_| None).collect(),
            active: 0,
        }
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn first_empty(&self) -> Option<usize> {
        self.handles.iter().position(Option::is_none)
    }

    pub fn get(&self, index: usize) -> Option<&H> {
        self.handles.get(index).and_then(Option::as_ref)
    }

    /// Store a freshly spawned handle and count it as running.
    pub fn insert(&mut self, index: usize, handle: H) {
        debug_assert!(self.handles[index].is_none(), "worker slot {} in use", index);
        self.handles[index] = Some(handle);
        self.active += 1;
    }

    /// Rescan every entry, releasing handles whose process stopped.
    ///
    /// The running count is recomputed from scratch, so several exits
    /// reported by one notification are all accounted for.
    pub fn reconcile(&mut self) -> Vec<ExitedWorker> {
        let mut running = 0;
        let mut exited = Vec::new();
        for (index, entry) in self.handles.iter_mut().enumerate() {
            let Some(handle) = entry else { continue };
            if handle.is_running() {
                running += 1;
            } else {
                exited.push(ExitedWorker {
                    index,
                    pid: handle.pid(),
                    reason: handle.termination(),
                });
                *entry = None;
            }
        }
        self.active = running;
        exited
    }

    /// Release every handle. Dropping a process handle stops the process.
    pub fn stop_all(&mut self) {
        self.handles.iter_mut().for_each(|entry| *entry = None);
        self.active = 0;
    }
}
