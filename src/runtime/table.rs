//! Descriptor-indexed connection table.
//!
//! Slot `i` owns the connection whose socket is descriptor `i`, giving O(1)
//! lookup from a readiness event to its state. The table is the sole owner of
//! every connection: dropping a slot (or the table) closes its socket.

use super::connection::{Connection, Readiness, Step};
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use tracing::debug;

/// A connection together with the readiness last registered for it.
#[derive(Debug)]
pub struct Slot<S: AsFd> {
    pub conn: Connection<S>,
    /// What the readiness backend currently watches for; empty when the
    /// socket is not registered.
    pub registered: Readiness,
}

/// Why an accepted stream was turned away.
#[derive(Debug)]
pub enum AdmitError {
    /// The descriptor does not index a slot.
    OverCapacity { fd: RawFd, capacity: usize },
    /// The socket could not be switched to non-blocking mode.
    NonBlocking { fd: RawFd, source: io::Error },
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmitError::OverCapacity { fd, capacity } => {
                write!(f, "descriptor {} exceeds table capacity {}", fd, capacity)
            }
            AdmitError::NonBlocking { fd, source } => {
                write!(f, "failed to make descriptor {} non-blocking: {}", fd, source)
            }
        }
    }
}

impl std::error::Error for AdmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdmitError::OverCapacity { .. } => None,
            AdmitError::NonBlocking { source, .. } => Some(source),
        }
    }
}

/// Fixed-capacity table of connections keyed by descriptor.
pub struct ConnectionTable<S: AsFd> {
    slots: Vec<Option<Slot<S>>>,
    len: usize,
    max_payload: usize,
}

impl<S: AsFd> ConnectionTable<S> {
    /// Create a table accepting descriptors `0..capacity`.
    pub fn new(capacity: usize, max_payload: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
            max_payload,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots, including connections closed since the last
    /// [`reap`](Self::reap).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Install a freshly accepted stream in the slot for its descriptor.
    ///
    /// A stream whose descriptor has no slot, or that cannot be made
    /// non-blocking, is closed immediately and the table is left unchanged.
    /// Any previous occupant of the slot is dropped.
    pub fn admit(&mut self, stream: S) -> Result<RawFd, AdmitError> {
        let fd = stream.as_fd().as_raw_fd();
        let capacity = self.capacity();

        let index = match usize::try_from(fd) {
            Ok(index) if index < capacity => index,
            _ => {
                drop(Connection::new(stream, self.max_payload));
                return Err(AdmitError::OverCapacity { fd, capacity });
            }
        };

        if let Err(source) = SockRef::from(&stream).set_nonblocking(true) {
            drop(Connection::new(stream, self.max_payload));
            return Err(AdmitError::NonBlocking { fd, source });
        }

        let slot = Slot {
            conn: Connection::new(stream, self.max_payload),
            registered: Readiness::NONE,
        };
        match self.slots[index].replace(slot) {
            Some(previous) => debug!(
                fd = previous.conn.fd(),
                active = previous.conn.is_active(),
                "Slot reused"
            ),
            None => self.len += 1,
        }
        Ok(fd)
    }

    #[cfg(test)]
    pub fn get(&self, fd: RawFd) -> Option<&Connection<S>> {
        let index = usize::try_from(fd).ok()?;
        self.slots.get(index)?.as_ref().map(|slot| &slot.conn)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection<S>> {
        self.slot_mut(fd).map(|slot| &mut slot.conn)
    }

    /// Drop every slot whose connection has closed. Returns how many.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        for entry in self.slots.iter_mut() {
            if entry.as_ref().is_some_and(|slot| !slot.conn.is_active()) {
                *entry = None;
                reaped += 1;
            }
        }
        self.len -= reaped;
        reaped
    }

    /// Occupied slots in ascending descriptor order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RawFd, &mut Slot<S>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, entry)| entry.as_mut().map(|slot| (index as RawFd, slot)))
    }

    fn slot_mut(&mut self, fd: RawFd) -> Option<&mut Slot<S>> {
        let index = usize::try_from(fd).ok()?;
        self.slots.get_mut(index)?.as_mut()
    }
}

impl<S: Read + Write + AsFd> ConnectionTable<S> {
    /// Route a readiness notification for `fd` to its connection.
    ///
    /// Each direction is stepped until it would block or has nothing left to
    /// do, so an edge-triggered notification is never left half-consumed.
    /// Unknown descriptors are ignored.
    pub fn dispatch(&mut self, fd: RawFd, readable: bool, writable: bool) {
        let Some(conn) = self.get_mut(fd) else {
            return;
        };

        if readable {
            while conn.can_receive() && conn.receive_step() == Step::Continue {}
        }
        if writable {
            while conn.can_send() && conn.send_step() == Step::Continue {}
        }
    }
}
