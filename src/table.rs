//! Socket descriptor table.
//!
//! Fixed size arena of [`Socket`]s. A socket is identified by its [`Index`]
//! in the table, its file descriptor is the index plus a fixed offset.

use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::queue::ReceiveQueue;
use crate::stack::{IpAddress, NativeSocket};

/// Index into the [`Table`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct Index(pub(crate) usize);

/// [`Index`] combined with the generation of the slot at the time the handle
/// was created.
///
/// Used by blocking calls to detect the socket being closed (and possibly the
/// slot being reused) while they were suspended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Handle {
    pub(crate) index: Index,
    generation: u32,
}

/// Status flags of a socket.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub(crate) struct Flags(u32);

impl Flags {
    pub(crate) const IN_USE: Flags = Flags(1 << 0);
    pub(crate) const BOUND: Flags = Flags(1 << 1);
    pub(crate) const CONNECTED: Flags = Flags(1 << 2);
    pub(crate) const CONNECTION_INPROGRESS: Flags = Flags(1 << 3);
    pub(crate) const CONNECTION_REQUEST: Flags = Flags(1 << 4);
    pub(crate) const ERROR: Flags = Flags(1 << 5);
    pub(crate) const DISCONNECTION_REQUEST: Flags = Flags(1 << 6);
    pub(crate) const ENABLE_LISTEN: Flags = Flags(1 << 7);
    pub(crate) const CLIENT: Flags = Flags(1 << 8);
    pub(crate) const SERVER_MASTER: Flags = Flags(1 << 9);
    pub(crate) const SERVER_SECONDARY: Flags = Flags(1 << 10);
    pub(crate) const NON_BLOCKING: Flags = Flags(1 << 11);
    pub(crate) const REUSEADDR: Flags = Flags(1 << 12);
    pub(crate) const RAW_SOCKET: Flags = Flags(1 << 13);
    pub(crate) const TX_HDR_INCLUDE: Flags = Flags(1 << 14);
    pub(crate) const RX_NO_HDR: Flags = Flags(1 << 15);

    const NAMES: [(Flags, &'static str); 16] = [
        (Flags::IN_USE, "IN_USE"),
        (Flags::BOUND, "BOUND"),
        (Flags::CONNECTED, "CONNECTED"),
        (Flags::CONNECTION_INPROGRESS, "CONNECTION_INPROGRESS"),
        (Flags::CONNECTION_REQUEST, "CONNECTION_REQUEST"),
        (Flags::ERROR, "ERROR"),
        (Flags::DISCONNECTION_REQUEST, "DISCONNECTION_REQUEST"),
        (Flags::ENABLE_LISTEN, "ENABLE_LISTEN"),
        (Flags::CLIENT, "CLIENT"),
        (Flags::SERVER_MASTER, "SERVER_MASTER"),
        (Flags::SERVER_SECONDARY, "SERVER_SECONDARY"),
        (Flags::NON_BLOCKING, "NON_BLOCKING"),
        (Flags::REUSEADDR, "REUSEADDR"),
        (Flags::RAW_SOCKET, "RAW_SOCKET"),
        (Flags::TX_HDR_INCLUDE, "TX_HDR_INCLUDE"),
        (Flags::RX_NO_HDR, "RX_NO_HDR"),
    ];

    pub(crate) const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) const fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    pub(crate) const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    pub(crate) fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    pub(crate) fn set(&mut self, other: Flags, enable: bool) {
        if enable {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Flags::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("(empty)")?;
        }
        Ok(())
    }
}

/// Kind of socket, from the type passed to `socket`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Kind {
    Stream,
    Datagram,
    Raw,
}

/// Role of a socket in the listen/accept pairing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Role {
    /// Client socket, or not (yet) listening.
    Standalone,
    /// Listening socket owned by the application, `secondary` performs the
    /// actual listen.
    Master { secondary: Index },
    /// Socket listening on behalf of one or more masters. `master` is the
    /// master the current connection request matched, `None` once the
    /// connection is handed to `accept` (or before any request matched).
    Secondary { master: Option<Index> },
}

/// Options set using `setsockopt` that only need to be stored.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Options {
    pub(crate) receive_timeout: Option<Duration>,
    pub(crate) send_timeout: Option<Duration>,
    pub(crate) linger: Option<u32>,
    pub(crate) keep_alive: bool,
    pub(crate) broadcast: bool,
    pub(crate) no_delay: bool,
}

/// A socket descriptor.
#[derive(Debug)]
pub(crate) struct Socket {
    pub(crate) flags: Flags,
    pub(crate) family: libc::c_int,
    pub(crate) kind: Kind,
    /// IP protocol number, or the ethernet protocol for `AF_PACKET`.
    pub(crate) protocol: u16,
    pub(crate) role: Role,
    /// Native TCP or UDP socket, `None` for raw sockets.
    pub(crate) native: Option<NativeSocket>,
    pub(crate) local_port: u16,
    /// Interface the socket is bound to, `None` for any interface.
    pub(crate) local_interface: Option<usize>,
    pub(crate) peer: Option<(IpAddress, u16)>,
    pub(crate) queue: ReceiveQueue,
    /// Sticky error, only valid if the `ERROR` flag is set.
    error: i32,
    /// Backlog passed to `listen`, reused when re-arming.
    pub(crate) backlog: usize,
    pub(crate) options: Options,
}

impl Socket {
    pub(crate) fn new(family: libc::c_int, kind: Kind, protocol: u16, queue: ReceiveQueue) -> Socket {
        let mut flags = Flags::IN_USE;
        if let Kind::Raw = kind {
            flags.insert(Flags::RAW_SOCKET);
        }
        Socket {
            flags,
            family,
            kind,
            protocol,
            role: Role::Standalone,
            native: None,
            local_port: 0,
            local_interface: None,
            peer: None,
            queue,
            error: 0,
            backlog: 0,
            options: Options::default(),
        }
    }

    /// Latch `errno` as sticky error.
    pub(crate) fn set_error(&mut self, errno: i32) {
        self.error = errno;
        self.flags.insert(Flags::ERROR);
    }

    /// Read and clear the sticky error.
    pub(crate) fn take_error(&mut self) -> Option<i32> {
        if self.flags.contains(Flags::ERROR) {
            self.flags.remove(Flags::ERROR);
            Some(std::mem::take(&mut self.error))
        } else {
            None
        }
    }

    pub(crate) const fn has_error(&self) -> bool {
        self.flags.contains(Flags::ERROR)
    }

    pub(crate) const fn is_stream(&self) -> bool {
        matches!(self.kind, Kind::Stream)
    }

    pub(crate) const fn is_non_blocking(&self) -> bool {
        self.flags.contains(Flags::NON_BLOCKING)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    socket: Option<Socket>,
}

/// Returned by [`Table::allocate`] when all slots are in use.
#[derive(Debug)]
pub(crate) struct Exhausted;

/// The socket descriptor table.
pub(crate) struct Table {
    slots: Box<[Slot]>,
    /// Slot to start the next allocation probe at.
    next: usize,
    fd_start: RawFd,
}

impl Table {
    pub(crate) fn new(size: usize, fd_start: RawFd) -> Table {
        let slots = (0..size)
            .map(|_| Slot {
                generation: 0,
                socket: None,
            })
            .collect();
        Table {
            slots,
            next: 0,
            fd_start,
        }
    }

    /// Store `socket` in a free slot.
    ///
    /// Slots are probed round-robin starting after the slot last allocated,
    /// so a just released slot isn't handed out again immediately.
    pub(crate) fn allocate(&mut self, socket: Socket) -> Result<Index, Exhausted> {
        debug_assert!(socket.flags.contains(Flags::IN_USE));
        let len = self.slots.len();
        for i in 0..len {
            let n = (self.next + i) % len;
            let slot = &mut self.slots[n];
            if slot.socket.is_none() {
                slot.generation = slot.generation.wrapping_add(1);
                slot.socket = Some(socket);
                self.next = (n + 1) % len;
                log::trace!(index = n, generation = slot.generation; "allocated socket");
                return Ok(Index(n));
            }
        }
        Err(Exhausted)
    }

    /// Release the slot at `index`, returning the socket that was in it.
    pub(crate) fn release(&mut self, index: Index) -> Option<Socket> {
        let slot = self.slots.get_mut(index.0)?;
        let socket = slot.socket.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        log::trace!(index = index.0; "released socket");
        Some(socket)
    }

    pub(crate) fn get(&self, index: Index) -> Option<&Socket> {
        self.slots.get(index.0)?.socket.as_ref()
    }

    pub(crate) fn get_mut(&mut self, index: Index) -> Option<&mut Socket> {
        self.slots.get_mut(index.0)?.socket.as_mut()
    }

    /// Create a handle for the socket at `index`.
    pub(crate) fn handle(&self, index: Index) -> Handle {
        Handle {
            index,
            generation: self.slots[index.0].generation,
        }
    }

    /// Returns the socket if `handle` still refers to the same socket.
    pub(crate) fn validate(&mut self, handle: Handle) -> Option<&mut Socket> {
        let slot = self.slots.get_mut(handle.index.0)?;
        if slot.generation == handle.generation {
            slot.socket.as_mut()
        } else {
            None
        }
    }

    /// Index of the in use socket with file descriptor `fd`.
    ///
    /// Armed secondaries are internal to the listen engine, they're never
    /// returned.
    pub(crate) fn lookup(&self, fd: RawFd) -> Option<Index> {
        let n = usize::try_from(fd.checked_sub(self.fd_start)?).ok()?;
        match self.slots.get(n) {
            Some(Slot {
                socket: Some(socket),
                ..
            }) if !socket.flags.contains(Flags::SERVER_SECONDARY) => Some(Index(n)),
            _ => None,
        }
    }

    /// Index for a back-pointer stored in a native socket, validating the
    /// range and liveness.
    pub(crate) fn from_reserved(&self, reserved: Option<usize>) -> Option<Index> {
        let n = reserved?;
        if n >= self.slots.len() {
            log::error!(index = n; "back-pointer of native socket out of range");
            return None;
        }
        self.slots[n].socket.as_ref().map(|_| Index(n))
    }

    pub(crate) fn fd(&self, index: Index) -> RawFd {
        self.fd_start + index.0 as RawFd
    }

    /// Iterate over all in use sockets.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Index, &Socket)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(n, slot)| slot.socket.as_ref().map(|socket| (Index(n), socket)))
    }

    /// Indices of all in use sockets.
    pub(crate) fn indices(&self) -> Vec<Index> {
        self.iter().map(|(index, _)| index).collect()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn in_use(&self) -> usize {
        self.iter().count()
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("capacity", &self.slots.len())
            .field("in_use", &self.in_use())
            .field("next", &self.next)
            .field("fd_start", &self.fd_start)
            .finish()
    }
}

#[cfg(test)]
fn test_socket() -> Socket {
    Socket::new(libc::AF_INET, Kind::Datagram, 17, ReceiveQueue::new(5, 100))
}

#[test]
fn allocation_is_round_robin() {
    let mut table = Table::new(4, 32);
    let a = table.allocate(test_socket()).unwrap();
    let b = table.allocate(test_socket()).unwrap();
    assert_eq!(a, Index(0));
    assert_eq!(b, Index(1));

    // Releasing `a` doesn't make it the next slot handed out.
    assert!(table.release(a).is_some());
    let c = table.allocate(test_socket()).unwrap();
    assert_eq!(c, Index(2));
    let d = table.allocate(test_socket()).unwrap();
    assert_eq!(d, Index(3));
    // Wraps around to the free slot.
    let e = table.allocate(test_socket()).unwrap();
    assert_eq!(e, Index(0));
    assert!(table.allocate(test_socket()).is_err());
    assert_eq!(table.in_use(), 4);
}

#[test]
fn lookup_and_fd() {
    let mut table = Table::new(4, 32);
    let a = table.allocate(test_socket()).unwrap();
    assert_eq!(table.fd(a), 32);
    assert_eq!(table.lookup(32), Some(a));
    assert_eq!(table.lookup(33), None); // Not in use.
    assert_eq!(table.lookup(31), None); // Below the start.
    assert_eq!(table.lookup(100), None); // Above the end.
    assert_eq!(table.lookup(-1), None);
}

#[test]
fn handles_detect_reuse() {
    let mut table = Table::new(1, 32);
    let a = table.allocate(test_socket()).unwrap();
    let handle = table.handle(a);
    assert!(table.validate(handle).is_some());

    table.release(a).unwrap();
    assert!(table.validate(handle).is_none());
    let b = table.allocate(test_socket()).unwrap();
    assert_eq!(a, b);
    // Same slot, different socket.
    assert!(table.validate(handle).is_none());
}

#[test]
fn slots_are_free_or_fully_initialised() {
    let mut table = Table::new(3, 32);
    let a = table.allocate(test_socket()).unwrap();
    let _b = table.allocate(test_socket()).unwrap();
    table.release(a);
    for n in 0..table.capacity() {
        if let Some(socket) = table.get(Index(n)) {
            assert!(socket.flags.contains(Flags::IN_USE));
        }
    }
    assert!(table.from_reserved(Some(0)).is_none());
    assert_eq!(table.from_reserved(Some(1)), Some(Index(1)));
    assert!(table.from_reserved(Some(99)).is_none());
}

#[test]
fn sticky_error_is_read_once() {
    let mut socket = test_socket();
    assert_eq!(socket.take_error(), None);
    socket.set_error(libc::ECONNREFUSED);
    assert!(socket.has_error());
    assert_eq!(socket.take_error(), Some(libc::ECONNREFUSED));
    assert_eq!(socket.take_error(), None);
}
