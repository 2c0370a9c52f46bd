//! The reactor loop and its per-socket handlers.

use super::control::Control;
use super::handoff;
use super::hello::{HELLO_LEN, HelloStep};
use super::idle::IdleQueue;
use super::listen;
use super::poller::{Event, Events, Interest, Poller};
use super::slots::{Endpoint, SlotKind, SlotTable, WorkerConn};
use super::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::worker::{WorkerHandle, WorkerSpawner, WorkerTable};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::ops::ControlFlow;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Pause after a failed accept before going back to the poller.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Single-threaded connection broker.
///
/// Owns every socket, the idle worker queue, and the worker handle table.
/// Signal context reaches it only through [`Control`].
pub struct Broker<S: WorkerSpawner> {
    config: BrokerConfig,
    control: Arc<Control>,
    poller: Poller,
    events: Events,
    slots: SlotTable,
    idle: IdleQueue,
    workers: WorkerTable<S::Handle>,
    spawner: S,
    /// Client connections waiting for an idle worker.
    pending: VecDeque<TcpStream>,
    ipc_path: PathBuf,
    public_addrs: Vec<SocketAddr>,
    torn_down: bool,
}

impl<S: WorkerSpawner> Broker<S> {
    /// Open the public listeners and the local channel, size the tables,
    /// and register everything with the poller.
    ///
    /// Fails on an invalid address list, when no public listener could be
    /// opened, or when the local channel cannot be created.
    pub fn start(config: BrokerConfig, spawner: S) -> Result<Self> {
        if config.max_workers == 0 {
            return Err(BrokerError::InvalidConfig(
                "max_workers must be at least 1".into(),
            ));
        }

        let listeners = listen::open_public_listeners(&config.listen_addresses, config.port)?;
        let capacity = config.slot_capacity(listeners.len());
        let public_addrs = listeners
            .iter()
            .map(|l| l.local_addr())
            .collect::<io::Result<Vec<_>>>()?;
        let control = Arc::new(Control::new()?);
        let poller = Poller::new(capacity)?;

        // Bound last: from here on `Drop` removes the socket file.
        let ipc_path = config.ipc_path();
        let channel = listen::open_ipc_listener(&ipc_path)?;

        let mut broker = Self {
            control,
            poller,
            events: Events::with_capacity(capacity),
            slots: SlotTable::new(capacity),
            idle: IdleQueue::new(capacity),
            workers: WorkerTable::new(config.max_workers),
            spawner,
            pending: VecDeque::with_capacity(capacity),
            ipc_path,
            public_addrs,
            config,
            torn_down: false,
        };

        broker.add_startup(Endpoint::Wake, Interest::Wake)?;
        broker.add_startup(Endpoint::LocalChannel(channel), Interest::Accept)?;
        for listener in listeners {
            broker.add_startup(Endpoint::PublicListener(listener), Interest::Accept)?;
        }

        info!(
            listeners = broker.public_addrs.len(),
            ipc_path = %broker.ipc_path.display(),
            slots = capacity,
            max_workers = broker.config.max_workers,
            "rustica broker started"
        );
        Ok(broker)
    }

    /// Flags and wake channel shared with signal handlers.
    pub fn control(&self) -> Arc<Control> {
        Arc::clone(&self.control)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn public_addrs(&self) -> &[SocketAddr] {
        &self.public_addrs
    }

    pub fn ipc_path(&self) -> &Path {
        &self.ipc_path
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    /// Worker ids in the idle queue, head first.
    pub fn idle_worker_ids(&self) -> Vec<u32> {
        self.idle
            .iter()
            .filter_map(|pos| match self.slots.get(pos) {
                Some(Endpoint::Worker(w)) => w.worker_id,
                _ => None,
            })
            .collect()
    }

    pub fn active_workers(&self) -> usize {
        self.workers.active()
    }

    pub fn workers(&self) -> &WorkerTable<S::Handle> {
        &self.workers
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Run until shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.turn(None)?.is_break() {
                return Ok(());
            }
        }
    }

    /// Wait for one batch of events and handle it.
    ///
    /// Returns `Break` once shutdown was requested. Events after the wake
    /// event in that batch are left unhandled.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<ControlFlow<()>> {
        self.poller.wait(&mut self.events, timeout)?;

        for i in 0..self.events.len() {
            let Some(event) = self.events.get(i) else {
                break;
            };
            let Some(pos) = self.slots.resolve(event.token) else {
                trace!(token = event.token, "event for a released slot");
                continue;
            };

            match self.slots.kind(pos) {
                SlotKind::Wake => {
                    self.control.drain();
                    if self.control.shutdown_requested() {
                        return Ok(ControlFlow::Break(()));
                    }
                    if self.control.take_worker_exit() {
                        self.reconcile_workers();
                    }
                }
                SlotKind::LocalChannel => self.accept_worker(pos),
                SlotKind::PublicListener => self.accept_client(pos),
                SlotKind::Worker => self.on_worker(pos, event),
                SlotKind::Unset => {}
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Stop workers, close every socket and remove the local channel file.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn add_startup(&mut self, endpoint: Endpoint, interest: Interest) -> Result<()> {
        if self.add(endpoint, interest)? {
            Ok(())
        } else {
            Err(BrokerError::InvalidConfig("slot table full at startup".into()))
        }
    }

    /// Register `endpoint` and store it in the lowest free slot.
    ///
    /// `Ok(false)` means no capacity was left; the endpoint is dropped.
    fn add(&mut self, endpoint: Endpoint, interest: Interest) -> Result<bool> {
        let Some(pos) = self.slots.free_position() else {
            return Ok(false);
        };
        let token = self.slots.token(pos);
        let registered = match endpoint.as_fd() {
            Some(fd) => self.poller.register(fd, token, interest)?,
            None => self.poller.register(self.control.wake_fd(), token, interest)?,
        };
        if registered {
            self.slots.occupy(pos, endpoint);
        }
        Ok(registered)
    }

    /// Deregister, then close. Also forgets the slot if it was idle.
    fn release_slot(&mut self, pos: usize) {
        self.idle.remove(pos);
        let Some(endpoint) = self.slots.take(pos) else {
            return;
        };
        let result = match endpoint.as_fd() {
            Some(fd) => self.poller.deregister(fd),
            None => self.poller.deregister(self.control.wake_fd()),
        };
        if let Err(e) = result {
            debug!(slot = pos, error = %e, "deregister failed");
        }
        drop(endpoint);
    }

    fn accept_worker(&mut self, pos: usize) {
        let Some(Endpoint::LocalChannel(listener)) = self.slots.get(pos) else {
            return;
        };
        debug!(slot = pos, "accepting worker connection");
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => return accept_failed(e, "worker"),
        };
        self.register_worker(stream);
    }

    fn register_worker(&mut self, stream: UnixStream) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(error = %e, "could not set worker connection non-blocking");
            return;
        }
        match self.add(Endpoint::Worker(WorkerConn::new(stream)), Interest::ReadOrClose) {
            Ok(true) => debug!("worker connection registered"),
            Ok(false) => warn!("too many worker connections, closing new one"),
            Err(e) => warn!(error = %e, "could not register worker connection"),
        }
    }

    fn accept_client(&mut self, pos: usize) {
        let Some(Endpoint::PublicListener(listener)) = self.slots.get(pos) else {
            return;
        };
        let conn = match listener.accept() {
            Ok((conn, peer)) => {
                if self.config.log_connections {
                    info!(%peer, "connection received");
                }
                conn
            }
            Err(e) => return accept_failed(e, "client"),
        };

        if self.idle.is_empty() && self.workers.active() < self.config.spawn_limit() {
            self.spawn_worker();
        }

        if let Some(conn) = self.dispatch(conn) {
            self.park(conn);
        }
    }

    /// Hand `conn` to the longest-idle worker.
    ///
    /// Workers that cannot take it are released. Gives the connection back
    /// when no idle worker is left.
    fn dispatch(&mut self, conn: TcpStream) -> Option<TcpStream> {
        while let Some(pos) = self.idle.pop() {
            let token = self.slots.token(pos);
            let Some(Endpoint::Worker(worker)) = self.slots.get_mut(pos) else {
                continue;
            };
            let worker_id = worker.worker_id;
            if let Err(e) = handoff::send_connection(&worker.stream, &conn) {
                debug!(slot = pos, worker_id, error = %e, "hand-off failed, dropping worker");
                self.release_slot(pos);
                continue;
            }

            // Delivered: never offer this descriptor to another worker.
            worker.hello.reset();
            match self.poller.modify(&worker.stream, token, Interest::ReadOrClose) {
                Ok(()) => debug!(slot = pos, worker_id, "connection dispatched"),
                Err(e) => {
                    debug!(slot = pos, worker_id, error = %e, "could not rearm worker, dropping it");
                    self.release_slot(pos);
                }
            }
            return None;
        }
        Some(conn)
    }

    fn park(&mut self, conn: TcpStream) {
        if self.pending.len() >= self.slots.capacity() {
            warn!("no idle worker and too many waiting connections, closing connection");
            return;
        }
        self.pending.push_back(conn);
        debug!(pending = self.pending.len(), "connection waiting for a worker");
    }

    fn drain_pending(&mut self) {
        while !self.idle.is_empty() {
            let Some(conn) = self.pending.pop_front() else {
                return;
            };
            if let Some(conn) = self.dispatch(conn) {
                self.pending.push_front(conn);
                return;
            }
        }
    }

    fn on_worker(&mut self, pos: usize, event: Event) {
        if event.closed {
            debug!(slot = pos, "worker connection closed");
            self.release_slot(pos);
            return;
        }
        if !event.readable {
            return;
        }

        let token = self.slots.token(pos);
        let Some(Endpoint::Worker(worker)) = self.slots.get_mut(pos) else {
            return;
        };

        if worker.hello.is_complete() {
            if let Err(e) = self.poller.modify(&worker.stream, token, Interest::CloseOnly) {
                debug!(slot = pos, error = %e, "could not narrow worker interest");
            }
            return;
        }

        let mut buf = [0u8; HELLO_LEN];
        let want = worker.hello.remaining();
        let received = match worker.stream.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => 0,
            Err(e) => {
                debug!(slot = pos, error = %e, "worker read failed");
                self.release_slot(pos);
                return;
            }
        };

        match worker.hello.feed(&buf[..received]) {
            HelloStep::Partial => {
                trace!(slot = pos, progress = worker.hello.progress(), "partial worker hello");
            }
            HelloStep::Rejected { offset } => {
                info!(slot = pos, offset, "invalid worker hello, closing connection");
                self.release_slot(pos);
            }
            HelloStep::Complete(worker_id) => {
                worker.worker_id = Some(worker_id);
                if let Err(e) = self.poller.modify(&worker.stream, token, Interest::CloseOnly) {
                    debug!(slot = pos, error = %e, "could not narrow worker interest");
                    self.release_slot(pos);
                    return;
                }
                assert!(self.idle.len() < self.idle.capacity());
                self.idle.push(pos);
                debug!(slot = pos, worker_id, "worker {} is idle", worker_id);
                self.drain_pending();
            }
        }
    }

    /// Rescan the worker table after a child-exit notification.
    fn reconcile_workers(&mut self) {
        for exited in self.workers.reconcile() {
            match exited.reason {
                Some(reason) => {
                    info!(index = exited.index, pid = %exited.pid, %reason, "worker process exited")
                }
                None => info!(index = exited.index, pid = %exited.pid, "worker process exited"),
            }
        }
        debug!(active = self.workers.active(), "worker table reconciled");
    }

    fn spawn_worker(&mut self) {
        let Some(index) = self.workers.first_empty() else {
            warn!("worker table full, not spawning");
            return;
        };
        match self.spawner.spawn(index) {
            Ok(handle) => {
                info!(index, pid = %handle.pid(), "started worker process");
                self.workers.insert(index, handle);
            }
            Err(e) => debug!(index, error = %e, "could not start worker process"),
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!("rustica broker shutting down");

        self.workers.stop_all();
        self.pending.clear();
        self.idle.clear();
        let occupied: Vec<usize> = self.slots.occupied().collect();
        for pos in occupied {
            self.release_slot(pos);
        }

        match std::fs::remove_file(&self.ipc_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.ipc_path.display(), error = %e, "could not remove local channel"),
        }
    }
}

impl<S: WorkerSpawner> Drop for Broker<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn accept_failed(e: io::Error, what: &str) {
    // Level-triggered: another reader may have won the race.
    if e.kind() == io::ErrorKind::WouldBlock {
        return;
    }
    warn!(error = %e, "could not accept {} connection", what);
    std::thread::sleep(ACCEPT_RETRY_DELAY);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::hello;
    use nix::unistd::Pid;
    use std::io::Write;
    use tempfile::TempDir;

    struct NoSpawn;

    struct NeverHandle;

    impl WorkerHandle for NeverHandle {
        fn is_running(&mut self) -> bool {
            false
        }

        fn pid(&self) -> Pid {
            Pid::from_raw(0)
        }
    }

    impl WorkerSpawner for NoSpawn {
        type Handle = NeverHandle;

        fn spawn(&mut self, _index: usize) -> Result<NeverHandle> {
            Err(BrokerError::Spawn("disabled".into()))
        }
    }

    fn start(max_workers: usize) -> (Broker<NoSpawn>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            listen_addresses: "127.0.0.1".into(),
            port: 0,
            ipc_dir: dir.path().to_path_buf(),
            max_workers,
            log_connections: true,
        };
        (Broker::start(config, NoSpawn).unwrap(), dir)
    }

    fn pump(broker: &mut Broker<NoSpawn>) {
        for _ in 0..5 {
            let _ = broker.turn(Some(Duration::from_millis(20))).unwrap();
        }
    }

    #[test]
    fn test_start_registers_wake_channel_and_listener() {
        let (broker, _dir) = start(4);
        assert_eq!(broker.public_addrs().len(), 1);
        assert!(broker.ipc_path().exists());
        assert_eq!(broker.slots.capacity(), 1 + 1 + 4);
        assert_eq!(broker.poller.registered(), 3);
        assert_eq!(broker.slots.kind(0), SlotKind::Wake);
        assert_eq!(broker.slots.kind(1), SlotKind::LocalChannel);
        assert_eq!(broker.slots.kind(2), SlotKind::PublicListener);
    }

    #[test]
    fn test_zero_max_workers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            listen_addresses: "127.0.0.1".into(),
            port: 0,
            ipc_dir: dir.path().to_path_buf(),
            max_workers: 0,
            log_connections: false,
        };
        assert!(matches!(
            Broker::start(config, NoSpawn),
            Err(BrokerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_released_worker_leaves_idle_queue() {
        let (mut broker, _dir) = start(4);
        let mut worker = UnixStream::connect(broker.ipc_path()).unwrap();
        worker.write_all(&hello::encode(9)).unwrap();
        pump(&mut broker);
        assert_eq!(broker.idle_worker_ids(), vec![9]);

        drop(worker);
        pump(&mut broker);
        assert_eq!(broker.idle_len(), 0);
        assert_eq!(broker.poller.registered(), 3);
    }

    #[test]
    fn test_rearm_failure_does_not_send_twice() {
        let (mut broker, _dir) = start(4);
        let mut first = UnixStream::connect(broker.ipc_path()).unwrap();
        first.write_all(&hello::encode(1)).unwrap();
        pump(&mut broker);
        let second = UnixStream::connect(broker.ipc_path()).unwrap();
        (&second).write_all(&hello::encode(2)).unwrap();
        pump(&mut broker);
        assert_eq!(broker.idle_worker_ids(), vec![1, 2]);

        // Pull the first worker out of epoll so rearming it fails.
        let pos = broker.idle.iter().next().unwrap();
        let Some(Endpoint::Worker(conn)) = broker.slots.get(pos) else {
            panic!("expected a worker slot");
        };
        broker.poller.deregister(&conn.stream).unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        assert!(broker.dispatch(accepted).is_none());

        first.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert!(handoff::recv_connection(&first).unwrap().is_some());
        assert_eq!(broker.idle_worker_ids(), vec![2]);
        second.set_nonblocking(true).unwrap();
        assert!(handoff::recv_connection(&second).is_err());
    }

    #[test]
    fn test_teardown_removes_socket_file() {
        let (broker, _dir) = start(2);
        let path = broker.ipc_path().to_path_buf();
        broker.shutdown();
        assert!(!path.exists());
    }
}
