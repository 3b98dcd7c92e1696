//! Wakeup and multiplexing.
//!
//! All blocked callers, of `select` and of the blocking socket calls, share a
//! single condition variable. Before blocking a caller registers the
//! descriptors it's interested in with [`Waiters`]. When a socket becomes
//! ready [`NetworkingCore::wake`] wakes all blocked threads, if at least one
//! waiter is interested in it. Each woken thread re-checks its own condition,
//! it can't assume it was the one being signalled.

use std::os::fd::RawFd;
use std::sync::MutexGuard;
use std::task::Poll;
use std::time::{Duration, Instant};
use std::{fmt, io};

use crate::stack::Stack;
use crate::table::{Flags, Handle, Index, Role, Table};
use crate::{errno, NetworkingCore, State};

/// Maximum number of descriptors in a [`FdSet`].
pub const FD_SETSIZE: usize = 1024;

const WORDS: usize = FD_SETSIZE / usize::BITS as usize;

/// Set of file descriptors, used by [`NetworkingCore::select`].
#[derive(Clone, Eq, PartialEq)]
pub struct FdSet {
    data: [usize; WORDS],
}

impl FdSet {
    /// Create an empty set.
    #[doc(alias = "FD_ZERO")]
    pub const fn new() -> FdSet {
        FdSet { data: [0; WORDS] }
    }

    /// Add `fd` to the set. Descriptors outside of `0..FD_SETSIZE` are
    /// ignored.
    #[doc(alias = "FD_SET")]
    pub fn insert(&mut self, fd: RawFd) {
        if let Some((idx, n)) = position(fd) {
            self.data[idx] |= 1 << n;
        }
    }

    /// Remove `fd` from the set.
    #[doc(alias = "FD_CLR")]
    pub fn remove(&mut self, fd: RawFd) {
        if let Some((idx, n)) = position(fd) {
            self.data[idx] &= !(1 << n);
        }
    }

    /// Returns true if `fd` is in the set.
    #[doc(alias = "FD_ISSET")]
    pub fn contains(&self, fd: RawFd) -> bool {
        match position(fd) {
            Some((idx, n)) => is_set(self.data[idx], n),
            None => false,
        }
    }

    /// Remove all descriptors.
    pub fn clear(&mut self) {
        self.data = [0; WORDS];
    }

    /// Number of descriptors in the set.
    pub fn len(&self) -> usize {
        self.data.iter().map(|data| data.count_ones() as usize).sum()
    }

    /// Returns true if the set contains no descriptors.
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|data| *data == 0)
    }

    /// Iterate over the descriptors in the set, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.data.iter().enumerate().flat_map(|(idx, data)| {
            let data = *data;
            (0..usize::BITS as usize)
                .filter(move |n| is_set(data, *n))
                .map(move |n| (idx * usize::BITS as usize + n) as RawFd)
        })
    }
}

/// Returns the word index and bit of `fd`.
fn position(fd: RawFd) -> Option<(usize, usize)> {
    let fd = usize::try_from(fd).ok()?;
    if fd >= FD_SETSIZE {
        return None;
    }
    Some((fd / usize::BITS as usize, fd % usize::BITS as usize))
}

/// Returns true if bit `n` is set in `value`.
const fn is_set(value: usize, n: usize) -> bool {
    ((value >> n) & 1) == 1
}

impl Default for FdSet {
    fn default() -> FdSet {
        FdSet::new()
    }
}

impl FromIterator<RawFd> for FdSet {
    fn from_iter<I: IntoIterator<Item = RawFd>>(iter: I) -> FdSet {
        let mut set = FdSet::new();
        for fd in iter {
            set.insert(fd);
        }
        set
    }
}

impl fmt::Debug for FdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Readiness events.
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct Events(u8);

impl Events {
    pub(crate) const NONE: Events = Events(0);
    pub(crate) const READ: Events = Events(1 << 0);
    pub(crate) const WRITE: Events = Events(1 << 1);
    pub(crate) const EXCEPTION: Events = Events(1 << 2);
    pub(crate) const ALL: Events = Events(0b111);

    pub(crate) const fn intersects(self, other: Events) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("read", &self.intersects(Events::READ))
            .field("write", &self.intersects(Events::WRITE))
            .field("exception", &self.intersects(Events::EXCEPTION))
            .finish()
    }
}

/// Identifier of a registered waiter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct WaiterId(u64);

/// A blocked caller.
#[derive(Debug)]
struct Waiter {
    id: WaiterId,
    read: FdSet,
    write: FdSet,
    except: FdSet,
}

/// Registry of all blocked callers.
#[derive(Debug)]
pub(crate) struct Waiters {
    waiters: Vec<Waiter>,
    next_id: u64,
}

impl Waiters {
    pub(crate) const fn new() -> Waiters {
        Waiters {
            waiters: Vec::new(),
            next_id: 0,
        }
    }

    /// Register interest in the descriptors in the sets.
    pub(crate) fn register(&mut self, read: &FdSet, write: &FdSet, except: &FdSet) -> WaiterId {
        let id = WaiterId(self.next_id);
        self.next_id += 1;
        self.waiters.push(Waiter {
            id,
            read: read.clone(),
            write: write.clone(),
            except: except.clone(),
        });
        id
    }

    /// Register interest in `events` of a single descriptor.
    pub(crate) fn register_fd(&mut self, fd: RawFd, events: Events) -> WaiterId {
        let mut read = FdSet::new();
        let mut write = FdSet::new();
        let mut except = FdSet::new();
        if events.intersects(Events::READ) {
            read.insert(fd);
        }
        if events.intersects(Events::WRITE) {
            write.insert(fd);
        }
        if events.intersects(Events::EXCEPTION) {
            except.insert(fd);
        }
        self.register(&read, &write, &except)
    }

    pub(crate) fn deregister(&mut self, id: WaiterId) {
        if let Some(pos) = self.waiters.iter().position(|waiter| waiter.id == id) {
            self.waiters.swap_remove(pos);
        }
    }

    /// Returns true if any waiter is interested in `events` on `fd`.
    pub(crate) fn is_interested(&self, fd: RawFd, events: Events) -> bool {
        self.waiters.iter().any(|waiter| {
            (events.intersects(Events::READ) && waiter.read.contains(fd))
                || (events.intersects(Events::WRITE) && waiter.write.contains(fd))
                || (events.intersects(Events::EXCEPTION) && waiter.except.contains(fd))
        })
    }
}

/// Current readiness of the socket at `index`.
pub(crate) fn readiness(table: &Table, index: Index) -> Events {
    let Some(socket) = table.get(index) else {
        return Events::NONE;
    };
    let mut events = Events::NONE;
    if !socket.queue.is_empty() || socket.has_error() {
        events |= Events::READ;
    }
    if socket.has_error() {
        events |= Events::EXCEPTION;
    }
    if socket.is_stream() {
        if let Role::Master { secondary } = socket.role {
            if has_pending_connection(table, index, secondary) {
                events |= Events::READ;
            }
        }
        if socket.flags.contains(Flags::DISCONNECTION_REQUEST) {
            events |= Events::READ | Events::EXCEPTION;
        } else if socket.flags.contains(Flags::CONNECTED) || socket.has_error() {
            events |= Events::WRITE;
        }
    } else {
        events |= Events::WRITE;
    }
    events
}

/// Returns true if `secondary` holds a connection for `master` that can be
/// accepted.
pub(crate) fn has_pending_connection(table: &Table, master: Index, secondary: Index) -> bool {
    match table.get(secondary) {
        Some(socket) => {
            socket.role == (Role::Secondary { master: Some(master) })
                && socket.flags.contains(Flags::CONNECTED)
        }
        None => false,
    }
}

/// Operations of the wakeup engine.
impl<S: Stack> NetworkingCore<S> {
    /// Wait until one or more descriptors become ready.
    ///
    /// Only descriptors lower than `nfds` are checked. On return the sets
    /// only contain the descriptors that are ready, the total number of which
    /// is returned. A `timeout` of `None` waits forever, zero polls.
    ///
    /// Returns `EBADF` if a set contains a descriptor that isn't an open
    /// socket.
    pub fn select(
        &self,
        nfds: RawFd,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        errno::record(self.select_sets(nfds, read, write, except, timeout))
    }

    fn select_sets(
        &self,
        nfds: RawFd,
        read: Option<&mut FdSet>,
        write: Option<&mut FdSet>,
        except: Option<&mut FdSet>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        if nfds < 0 {
            return Err(errno::error(libc::EINVAL));
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let limit = |set: &Option<&mut FdSet>| -> FdSet {
            match set {
                Some(set) => set.iter().filter(|fd| *fd < nfds).collect(),
                None => FdSet::new(),
            }
        };
        let interest = [limit(&read), limit(&write), limit(&except)];

        let mut state = self.lock()?;
        let mut waiter = None;
        let result = loop {
            let mut ready = [FdSet::new(), FdSet::new(), FdSet::new()];
            let mut count = 0;
            let mut bad_fd = false;
            for (set, events) in interest.iter().zip([Events::READ, Events::WRITE, Events::EXCEPTION]) {
                for fd in set.iter() {
                    let Some(index) = state.table.lookup(fd) else {
                        bad_fd = true;
                        break;
                    };
                    if readiness(&state.table, index).intersects(events) {
                        ready[events_slot(events)].insert(fd);
                        count += 1;
                    }
                }
            }
            if bad_fd {
                break Err(errno::error(libc::EBADF));
            }

            let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if count > 0 || expired {
                log::trace!(ready = count; "select returning");
                break Ok((ready, count));
            }

            if waiter.is_none() {
                waiter = Some(state.waiters.register(&interest[0], &interest[1], &interest[2]));
            }
            // Signalled, spuriously woken or timed out, we recheck all
            // descriptors.
            state = self.wait(state, deadline)?;
        };
        if let Some(id) = waiter {
            state.waiters.deregister(id);
        }
        drop(state);

        let (ready, count) = result?;
        let [ready_read, ready_write, ready_except] = ready;
        for (set, ready) in [(read, ready_read), (write, ready_write), (except, ready_except)] {
            if let Some(set) = set {
                *set = ready;
            }
        }
        Ok(count)
    }

    /// Wake the waiters if any is interested in `events` on the socket at
    /// `index`.
    pub(crate) fn wake(&self, state: &mut State, index: Index, events: Events) {
        let fd = state.table.fd(index);
        if state.waiters.is_interested(fd, events) {
            log::trace!(fd = fd; "waking waiters");
            self.wakeup.notify_all();
        }
    }

    /// Run `poll` until it returns a result, blocking between attempts.
    ///
    /// `poll` is called with the table lock held, once before blocking and
    /// again after each wakeup. The socket behind `handle` is validated
    /// before each call, returning `EBADF` if it was closed.
    ///
    /// If `non_blocking` is true this never blocks, returning `EWOULDBLOCK`
    /// instead. Otherwise returns `ETIMEDOUT` once `timeout` expires.
    pub(crate) fn wait_for<'a, T, F>(
        &'a self,
        mut state: MutexGuard<'a, State>,
        handle: Handle,
        events: Events,
        non_blocking: bool,
        timeout: Option<Duration>,
        mut poll: F,
    ) -> io::Result<T>
    where
        F: FnMut(&mut State, Index) -> Poll<io::Result<T>>,
    {
        if non_blocking {
            return match poll(&mut state, handle.index) {
                Poll::Ready(result) => result,
                Poll::Pending => Err(errno::error(libc::EWOULDBLOCK)),
            };
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let fd = state.table.fd(handle.index);
        let id = state.waiters.register_fd(fd, events);
        let result = loop {
            if state.table.validate(handle).is_none() {
                log::debug!(fd = fd; "socket closed while blocked");
                break Err(errno::error(libc::EBADF));
            }
            if let Poll::Ready(result) = poll(&mut state, handle.index) {
                break result;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break Err(errno::error(libc::ETIMEDOUT));
            }
            state = self.wait(state, deadline)?;
        };
        state.waiters.deregister(id);
        result
    }
}

const fn events_slot(events: Events) -> usize {
    if events.intersects(Events::READ) {
        0
    } else if events.intersects(Events::WRITE) {
        1
    } else {
        2
    }
}

#[test]
fn fd_set_insert_remove() {
    let mut set = FdSet::new();
    assert!(set.is_empty());
    set.insert(0);
    set.insert(63);
    set.insert(64);
    set.insert(FD_SETSIZE as RawFd - 1);
    // Ignored.
    set.insert(-1);
    set.insert(FD_SETSIZE as RawFd);
    assert_eq!(set.len(), 4);
    assert!(set.contains(63));
    assert!(!set.contains(62));
    assert_eq!(
        set.iter().collect::<Vec<_>>(),
        vec![0, 63, 64, FD_SETSIZE as RawFd - 1]
    );

    set.remove(63);
    assert!(!set.contains(63));
    set.clear();
    assert!(set.is_empty());
}

#[test]
fn waiters_interest() {
    let mut waiters = Waiters::new();
    let a = waiters.register_fd(32, Events::READ);
    let b = waiters.register_fd(33, Events::WRITE);
    let c = waiters.register(&[32, 34].into_iter().collect(), &FdSet::new(), &FdSet::new());

    assert!(waiters.is_interested(32, Events::READ));
    assert!(!waiters.is_interested(32, Events::WRITE | Events::EXCEPTION));
    assert!(waiters.is_interested(33, Events::WRITE | Events::READ));
    assert!(!waiters.is_interested(33, Events::EXCEPTION));
    assert!(waiters.is_interested(34, Events::ALL));
    assert!(!waiters.is_interested(35, Events::ALL));

    waiters.deregister(a);
    // Still registered by `c`.
    assert!(waiters.is_interested(32, Events::READ));
    waiters.deregister(c);
    assert!(!waiters.is_interested(32, Events::ALL));
    waiters.deregister(b);
    assert!(!waiters.is_interested(33, Events::ALL));
}
