//! Connection slot table.
//!
//! A fixed arena of per-socket records indexed by position. A slot's position
//! identifies its socket for the whole time it stays registered; the poller
//! token also carries the slot's generation so an event queued for a socket
//! that was closed earlier in the same batch cannot reach its successor.

use super::hello::HelloReader;
use std::net::TcpListener;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};

/// Which handler a slot's events go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Unset,
    Wake,
    LocalChannel,
    PublicListener,
    Worker,
}

/// A worker's end of the local channel.
#[derive(Debug)]
pub struct WorkerConn {
    pub stream: UnixStream,
    pub hello: HelloReader,
    /// Id from the most recent complete hello.
    pub worker_id: Option<u32>,
}

impl WorkerConn {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            hello: HelloReader::new(),
            worker_id: None,
        }
    }
}

/// The socket a slot owns. Dropping it closes the descriptor.
#[derive(Debug)]
pub enum Endpoint {
    /// The wake channel. Its descriptor belongs to [`Control`](super::Control).
    Wake,
    LocalChannel(UnixListener),
    PublicListener(TcpListener),
    Worker(WorkerConn),
}

impl Endpoint {
    pub fn kind(&self) -> SlotKind {
        match self {
            Endpoint::Wake => SlotKind::Wake,
            Endpoint::LocalChannel(_) => SlotKind::LocalChannel,
            Endpoint::PublicListener(_) => SlotKind::PublicListener,
            Endpoint::Worker(_) => SlotKind::Worker,
        }
    }

    /// The owned descriptor, if the slot owns one.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            Endpoint::Wake => None,
            Endpoint::LocalChannel(l) => Some(l.as_fd()),
            Endpoint::PublicListener(l) => Some(l.as_fd()),
            Endpoint::Worker(w) => Some(w.stream.as_fd()),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    endpoint: Option<Endpoint>,
}

/// Fixed-capacity arena of slots.
#[derive(Debug)]
pub struct SlotTable {
    slots: Box<[Slot]>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= u32::MAX as usize, "slot table too large");
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Lowest unset position.
    pub fn free_position(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.endpoint.is_none())
    }

    /// Poller token for whatever currently occupies `pos`, or will next.
    pub fn token(&self, pos: usize) -> u64 {
        (u64::from(self.slots[pos].generation) << 32) | pos as u64
    }

    /// Position named by `token`, if that registration is still current.
    pub fn resolve(&self, token: u64) -> Option<usize> {
        let pos = (token & u64::from(u32::MAX)) as usize;
        let generation = (token >> 32) as u32;
        let slot = self.slots.get(pos)?;
        (slot.endpoint.is_some() && slot.generation == generation).then_some(pos)
    }

    pub fn occupy(&mut self, pos: usize, endpoint: Endpoint) {
        let slot = &mut self.slots[pos];
        debug_assert!(slot.endpoint.is_none(), "slot {} already in use", pos);
        slot.endpoint = Some(endpoint);
    }

    /// Reset `pos` to unset, handing back its endpoint.
    ///
    /// The caller deregisters the descriptor before dropping the endpoint.
    pub fn take(&mut self, pos: usize) -> Option<Endpoint> {
        let slot = self.slots.get_mut(pos)?;
        let endpoint = slot.endpoint.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(endpoint)
    }

    pub fn get(&self, pos: usize) -> Option<&Endpoint> {
        self.slots.get(pos)?.endpoint.as_ref()
    }

    pub fn get_mut(&mut self, pos: usize) -> Option<&mut Endpoint> {
        self.slots.get_mut(pos)?.endpoint.as_mut()
    }

    pub fn kind(&self, pos: usize) -> SlotKind {
        self.get(pos).map_or(SlotKind::Unset, Endpoint::kind)
    }

    /// Positions currently in use.
    pub fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.endpoint.is_some())
            .map(|(pos, _)| pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Endpoint {
        let (a, _b) = UnixStream::pair().unwrap();
        Endpoint::Worker(WorkerConn::new(a))
    }

    #[test]
    fn test_occupy_and_take() {
        let mut table = SlotTable::new(3);
        assert_eq!(table.free_position(), Some(0));
        table.occupy(0, Endpoint::Wake);
        table.occupy(1, worker());
        assert_eq!(table.kind(0), SlotKind::Wake);
        assert_eq!(table.kind(1), SlotKind::Worker);
        assert_eq!(table.kind(2), SlotKind::Unset);
        assert_eq!(table.free_position(), Some(2));

        assert!(table.take(1).is_some());
        assert_eq!(table.kind(1), SlotKind::Unset);
        assert_eq!(table.free_position(), Some(1));
        assert!(table.take(1).is_none());
        assert_eq!(table.occupied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_stale_token_does_not_resolve() {
        let mut table = SlotTable::new(2);
        let first = table.token(1);
        table.occupy(1, worker());
        assert_eq!(table.resolve(first), Some(1));

        table.take(1);
        assert_eq!(table.resolve(first), None);

        let second = table.token(1);
        assert_ne!(first, second);
        table.occupy(1, worker());
        assert_eq!(table.resolve(first), None);
        assert_eq!(table.resolve(second), Some(1));
    }

    #[test]
    fn test_resolve_out_of_range() {
        let table = SlotTable::new(2);
        assert_eq!(table.resolve(5), None);
        assert_eq!(table.resolve(0), None);
    }

    #[test]
    fn test_wake_has_no_descriptor() {
        assert!(Endpoint::Wake.as_fd().is_none());
        assert!(worker().as_fd().is_some());
    }
}
