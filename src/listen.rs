//! Listen/accept pairing.
//!
//! The stack listens on a port using one native socket at a time, which
//! becomes the connection once a client connects. The BSD listening socket
//! (the master) therefore never listens itself. Instead a hidden secondary
//! socket is armed to listen on the master's behalf. Once a connection is
//! established on the secondary, `accept` hands the secondary to the
//! application and arms a new secondary on the same port.
//!
//! Multiple masters bound to the same port (on different interfaces) share a
//! single secondary. Incoming connection requests are matched to the master
//! whose interface matches the one the request arrived on.
//!
//! A secondary moves through the following states:
//!
//! ```text
//! armed (CONNECTION_INPROGRESS, no master)
//!   -> pending (CONNECTION_INPROGRESS, matched a master)
//!   -> connected (CONNECTED, matched a master)
//!   -> claimed by accept (standalone socket)
//! ```
//!
//! A secondary that is disconnected before it's connected is armed again.

use std::io;
use std::os::fd::RawFd;
use std::task::Poll;

use crate::addr::{self, SockAddr};
use crate::errno;
use crate::net::warn_on_error;
use crate::stack::{Segment, Stack, Status, TcpState};
use crate::table::{Flags, Index, Kind, Role, Socket, Table};
use crate::wakeup::{has_pending_connection, Events};
use crate::{NetworkingCore, State};

/// Masters using `secondary` to listen.
fn masters_of(table: &Table, secondary: Index) -> Vec<Index> {
    table
        .iter()
        .filter(|(_, socket)| socket.role == (Role::Master { secondary }))
        .map(|(index, _)| index)
        .collect()
}

impl<S: Stack> NetworkingCore<S> {
    /// Start listening for connections on a bound stream socket.
    ///
    /// `backlog` is clamped to the configured bounds. Calling `listen` on an
    /// already listening socket only updates the backlog.
    pub fn listen(&self, fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
        errno::record(self.listen_socket(fd, backlog))
    }

    fn listen_socket(&self, fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let index = state.table.lookup(fd).ok_or_else(|| errno::error(libc::EBADF))?;
        let backlog = usize::try_from(backlog)
            .unwrap_or(0)
            .clamp(self.config.min_backlog, self.config.max_backlog);
        let socket = state.table.get_mut(index).ok_or_else(|| errno::error(libc::EBADF))?;
        if !socket.is_stream() {
            return Err(errno::error(libc::EOPNOTSUPP));
        } else if socket.flags.contains(Flags::ENABLE_LISTEN) {
            socket.backlog = backlog;
            return Ok(());
        } else if !socket.flags.contains(Flags::BOUND) {
            return Err(errno::error(libc::EDESTADDRREQ));
        } else if socket.flags.intersects(
            Flags::CONNECTED
                .union(Flags::CONNECTION_INPROGRESS)
                .union(Flags::CLIENT)
                .union(Flags::DISCONNECTION_REQUEST),
        ) {
            return Err(errno::error(libc::EINVAL));
        }
        socket.backlog = backlog;
        let port = socket.local_port;
        let family = socket.family;

        let shared = state.table.iter().find_map(|(i, other)| match other.role {
            Role::Master { secondary }
                if i != index
                    && other.local_port == port
                    && other.flags.contains(Flags::ENABLE_LISTEN) =>
            {
                Some(secondary)
            }
            _ => None,
        });
        let (secondary, fresh) = match shared {
            Some(secondary) => (secondary, false),
            None => (self.arm_secondary(state, port, family, backlog, false)?, true),
        };

        let socket = state.table.get_mut(index).ok_or_else(|| errno::error(libc::EBADF))?;
        socket.role = Role::Master { secondary };
        socket.flags.insert(Flags::ENABLE_LISTEN | Flags::SERVER_MASTER);
        log::debug!(fd = fd, port = port, backlog = backlog, shared = !fresh; "listening");
        if fresh {
            self.replay_pending(state, secondary);
        }
        Ok(())
    }

    /// Accept a connection on a listening socket.
    ///
    /// Blocks until a connection is available, at most `SO_RCVTIMEO`.
    /// Returns the descriptor of the new connection and the peer's address.
    pub fn accept(&self, fd: RawFd) -> io::Result<(RawFd, SockAddr)> {
        errno::record(self.accept_connection(fd))
    }

    fn accept_connection(&self, fd: RawFd) -> io::Result<(RawFd, SockAddr)> {
        let mut state = self.lock()?;
        let index = state.table.lookup(fd).ok_or_else(|| errno::error(libc::EBADF))?;
        let socket = state.table.get_mut(index).ok_or_else(|| errno::error(libc::EBADF))?;
        if !socket.is_stream() {
            return Err(errno::error(libc::EOPNOTSUPP));
        }
        // A master that failed to listen again keeps the error until here.
        if let Some(errno) = socket.take_error() {
            return Err(errno::error(errno));
        } else if !socket.flags.contains(Flags::ENABLE_LISTEN) {
            return Err(errno::error(libc::EINVAL));
        }
        let non_blocking = socket.is_non_blocking();
        let timeout = socket.options.receive_timeout;
        let handle = state.table.handle(index);
        self.wait_for(state, handle, Events::READ, non_blocking, timeout, |state, master| {
            let Some(socket) = state.table.get_mut(master) else {
                return Poll::Ready(Err(errno::error(libc::EBADF)));
            };
            if let Some(errno) = socket.take_error() {
                return Poll::Ready(Err(errno::error(errno)));
            }
            let Role::Master { secondary } = socket.role else {
                return Poll::Ready(Err(errno::error(libc::EINVAL)));
            };
            if has_pending_connection(&state.table, master, secondary) {
                Poll::Ready(self.claim(state, master, secondary))
            } else {
                Poll::Pending
            }
        })
    }

    /// Hand the connection on `secondary` to the application and arm a new
    /// secondary for all masters sharing it.
    fn claim(&self, state: &mut State, master: Index, secondary: Index) -> io::Result<(RawFd, SockAddr)> {
        let socket = state.table.get_mut(secondary).ok_or_else(|| errno::error(libc::EBADF))?;
        let peer = socket
            .peer
            .or_else(|| socket.native.and_then(|native| self.stack.tcp_peer(native)));
        socket.role = Role::Standalone;
        socket.flags.remove(Flags::SERVER_SECONDARY);
        if socket.flags.contains(Flags::DISCONNECTION_REQUEST) {
            socket.flags.remove(Flags::CONNECTED);
        }
        socket.peer = peer;
        let family = socket.family;

        let socket = state.table.get_mut(master).ok_or_else(|| errno::error(libc::EBADF))?;
        socket.flags.remove(Flags::CONNECTED | Flags::CONNECTION_REQUEST);
        let port = socket.local_port;
        let backlog = socket.backlog;

        match self.arm_secondary(state, port, family, backlog, true) {
            Ok(armed) => {
                for index in masters_of(&state.table, secondary) {
                    if let Some(socket) = state.table.get_mut(index) {
                        socket.role = Role::Master { secondary: armed };
                    }
                }
                self.replay_pending(state, armed);
            }
            Err(err) => {
                log::warn!(port = port; "failed to arm listener after accept: {err}");
                self.fail_masters(state, secondary, err.raw_os_error().unwrap_or(libc::EIO));
                warn_on_error(self.stack.tcp_unlisten(port), "stop listening");
            }
        }

        let fd = state.table.fd(secondary);
        let address = match peer {
            Some((ip, port)) => addr::from_native(ip, port),
            None => addr::from_native(addr::any_address(family), 0),
        };
        log::debug!(fd = fd, listener = state.table.fd(master); "accepted connection");
        Ok((fd, address))
    }

    /// Create a secondary listening on `port`.
    ///
    /// If `relisten` is true the port is already registered with the stack
    /// and only the listening socket is replaced.
    fn arm_secondary(
        &self,
        state: &mut State,
        port: u16,
        family: libc::c_int,
        backlog: usize,
        relisten: bool,
    ) -> io::Result<Index> {
        let native = self.stack.tcp_create().map_err(errno::status_error)?;
        let mut socket = Socket::new(family, Kind::Stream, libc::IPPROTO_TCP as u16, self.new_queue());
        socket.flags.insert(
            Flags::SERVER_SECONDARY
                .union(Flags::BOUND)
                .union(Flags::CONNECTION_INPROGRESS),
        );
        socket.role = Role::Secondary { master: None };
        socket.native = Some(native);
        socket.local_port = port;
        socket.backlog = backlog;

        let Ok(index) = state.table.allocate(socket) else {
            self.delete_native(native);
            return Err(errno::error(libc::ENFILE));
        };
        self.stack.set_reserved(native, Some(index.0));
        let result = if relisten {
            self.stack.tcp_relisten(port, native)
        } else {
            self.stack.tcp_listen(port, native, backlog)
        };
        if let Err(status) = result {
            let _ = state.table.release(index);
            self.delete_native(native);
            return Err(errno::status_error(status));
        }
        log::trace!(index = index.0, port = port; "armed secondary");
        Ok(index)
    }

    /// Process connection requests the stack queued while no secondary was
    /// listening on the port.
    fn replay_pending(&self, state: &mut State, secondary: Index) {
        let Some(socket) = state.table.get(secondary) else {
            return;
        };
        let Some(native) = socket.native else {
            return;
        };
        let port = socket.local_port;
        while let Some(segment) = self.stack.tcp_pending_connection(port) {
            if self.match_syn(state, secondary, &segment).is_none() {
                log::debug!(port = port; "refusing queued connection request");
                self.stack.tcp_refuse_pending(port);
                continue;
            }
            match self.stack.tcp_accept(native) {
                Ok(()) => self.secondary_connected(state, secondary),
                // Completed by `on_connection_established`.
                Err(Status::InProgress) => {}
                Err(status) => log::warn!(port = port; "failed to accept queued connection: {status:?}"),
            }
            break;
        }
    }

    /// Match an incoming connection request on `secondary` to one of its
    /// masters, returning the master.
    pub(crate) fn match_syn(&self, state: &mut State, secondary: Index, segment: &Segment) -> Option<Index> {
        let socket = state.table.get(secondary)?;
        if !socket.flags.contains(Flags::SERVER_SECONDARY)
            || socket.role != (Role::Secondary { master: None })
        {
            return None;
        }
        let master = state
            .table
            .iter()
            .find(|(_, socket)| {
                socket.role == (Role::Master { secondary })
                    && socket.flags.contains(Flags::ENABLE_LISTEN)
                    && socket.local_port == segment.local_port
                    && socket
                        .local_interface
                        .map_or(true, |interface| interface == segment.interface)
            })
            .map(|(index, _)| index)?;

        if let Some(socket) = state.table.get_mut(secondary) {
            socket.role = Role::Secondary {
                master: Some(master),
            };
        }
        if let Some(socket) = state.table.get_mut(master) {
            socket.flags.insert(Flags::CONNECTION_REQUEST);
        }
        log::trace!(master = state.table.fd(master), port = segment.local_port; "matched connection request");
        Some(master)
    }

    /// Connection on `secondary` is established.
    pub(crate) fn secondary_connected(&self, state: &mut State, secondary: Index) {
        let Some(socket) = state.table.get_mut(secondary) else {
            return;
        };
        if socket.flags.contains(Flags::CONNECTED) {
            return;
        }
        socket.flags.remove(Flags::CONNECTION_INPROGRESS);
        socket.flags.insert(Flags::CONNECTED);
        if let Some(native) = socket.native {
            socket.peer = self.stack.tcp_peer(native);
        }
        let master = match socket.role {
            Role::Secondary { master } => master,
            _ => None,
        };
        let _ = self.drain_tcp(state, secondary);
        if let Some(master) = master {
            log::trace!(master = state.table.fd(master); "connection pending accept");
            self.wake(state, master, Events::READ);
        }
    }

    /// Reset `secondary` and listen again, dropping its connection (request).
    pub(crate) fn rearm_in_place(&self, state: &mut State, secondary: Index) {
        let Some(socket) = state.table.get_mut(secondary) else {
            return;
        };
        let Some(native) = socket.native else {
            return;
        };
        let port = socket.local_port;
        let matched = match socket.role {
            Role::Secondary { master } => master,
            _ => None,
        };
        socket.role = Role::Secondary { master: None };
        socket
            .flags
            .remove(Flags::CONNECTED | Flags::DISCONNECTION_REQUEST | Flags::ERROR);
        socket.flags.insert(Flags::CONNECTION_INPROGRESS);
        socket.queue.clear();
        socket.peer = None;
        if let Some(master) = matched {
            if let Some(master) = state.table.get_mut(master) {
                master.flags.remove(Flags::CONNECTION_REQUEST);
            }
        }

        match self.stack.tcp_state(native) {
            TcpState::Closed | TcpState::Listen => {}
            _ => warn_on_error(self.stack.tcp_disconnect(native), "disconnect secondary"),
        }
        let result = self
            .stack
            .tcp_unaccept(native)
            .and_then(|()| self.stack.tcp_relisten(port, native));
        match result {
            Ok(()) => {
                log::debug!(port = port; "re-armed listener");
                self.replay_pending(state, secondary);
            }
            Err(status) => {
                log::warn!(port = port; "failed to re-arm listener: {status:?}");
                self.fail_masters(state, secondary, errno::from_status(status));
                self.teardown_secondary(state, secondary);
            }
        }
    }

    /// Latch `errno` on all masters of `secondary`, they stop listening.
    fn fail_masters(&self, state: &mut State, secondary: Index, errno: i32) {
        for index in masters_of(&state.table, secondary) {
            if let Some(socket) = state.table.get_mut(index) {
                socket.set_error(errno);
                socket.role = Role::Standalone;
                socket.flags.remove(
                    Flags::ENABLE_LISTEN
                        .union(Flags::SERVER_MASTER)
                        .union(Flags::CONNECTION_REQUEST),
                );
            }
            self.wake(state, index, Events::ALL);
        }
    }

    /// Stop listening on the port of `secondary` and release it.
    fn teardown_secondary(&self, state: &mut State, secondary: Index) {
        let Some(socket) = state.table.release(secondary) else {
            return;
        };
        warn_on_error(self.stack.tcp_unlisten(socket.local_port), "stop listening");
        if let Some(native) = socket.native {
            if socket.flags.contains(Flags::CONNECTED) {
                warn_on_error(self.stack.tcp_disconnect(native), "disconnect secondary");
            }
            self.delete_native(native);
        }
        log::debug!(port = socket.local_port; "stopped listening");
    }

    /// Clean up after closing the master at `index`.
    pub(crate) fn close_master(&self, state: &mut State, index: Index, secondary: Index, master: &Socket) {
        if let Some(native) = master.native {
            self.delete_native(native);
        }
        let Some(socket) = state.table.get(secondary) else {
            return;
        };
        let matched = socket.role == (Role::Secondary { master: Some(index) });
        if masters_of(&state.table, secondary).is_empty() {
            self.teardown_secondary(state, secondary);
        } else if matched {
            // The connection was meant for the closed master.
            self.rearm_in_place(state, secondary);
        }
    }
}
