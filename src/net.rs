//! BSD socket calls.
//!
//! All calls are methods on [`NetworkingCore`], taking the file descriptor
//! returned by [`NetworkingCore::socket`] as first argument.

use std::net::Shutdown;
use std::os::fd::RawFd;
use std::task::Poll;
use std::{fmt, io};

use crate::addr::{self, SockAddr};
use crate::errno;
use crate::queue::Payload;
use crate::raw::ETH_P_ALL;
use crate::stack::{IpAddress, NativeSocket, Stack, Status};
use crate::table::{Flags, Index, Kind, Role, Socket, Table};
use crate::wakeup::Events;
use crate::{NetworkingCore, State};

pub mod option;

/// Peek at incoming data, without removing it from the receive queue.
pub const MSG_PEEK: libc::c_int = libc::MSG_PEEK;
/// Don't block, even if the socket is in blocking mode.
pub const MSG_DONTWAIT: libc::c_int = libc::MSG_DONTWAIT;

/// Socket domain.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Domain(pub(crate) libc::c_int);

impl Domain {
    /// Domain for IPv4 communication.
    #[doc(alias = "AF_INET")]
    pub const IPV4: Domain = Domain(libc::AF_INET);
    /// Domain for IPv6 communication.
    #[doc(alias = "AF_INET6")]
    pub const IPV6: Domain = Domain(libc::AF_INET6);
    /// Domain for low-level packet interface.
    #[doc(alias = "AF_PACKET")]
    #[cfg(any(target_os = "android", target_os = "linux"))]
    pub const PACKET: Domain = Domain(libc::AF_PACKET);
}

impl From<libc::c_int> for Domain {
    fn from(domain: libc::c_int) -> Domain {
        Domain(domain)
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            libc::AF_INET => f.write_str("AF_INET"),
            libc::AF_INET6 => f.write_str("AF_INET6"),
            #[cfg(any(target_os = "android", target_os = "linux"))]
            libc::AF_PACKET => f.write_str("AF_PACKET"),
            domain => write!(f, "{domain}"),
        }
    }
}

/// Socket type.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Type(pub(crate) libc::c_int);

impl Type {
    /// Used with TCP.
    #[doc(alias = "SOCK_STREAM")]
    pub const STREAM: Type = Type(libc::SOCK_STREAM);
    /// Used with UDP.
    #[doc(alias = "SOCK_DGRAM")]
    pub const DGRAM: Type = Type(libc::SOCK_DGRAM);
    /// Raw network protocol access.
    #[doc(alias = "SOCK_RAW")]
    pub const RAW: Type = Type(libc::SOCK_RAW);

    /// Create the socket in non-blocking mode.
    #[doc(alias = "SOCK_NONBLOCK")]
    #[cfg(any(target_os = "android", target_os = "linux"))]
    pub const fn non_blocking(self) -> Type {
        Type(self.0 | libc::SOCK_NONBLOCK)
    }
}

impl From<libc::c_int> for Type {
    fn from(r#type: libc::c_int) -> Type {
        Type(r#type)
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            libc::SOCK_STREAM => f.write_str("SOCK_STREAM"),
            libc::SOCK_DGRAM => f.write_str("SOCK_DGRAM"),
            libc::SOCK_RAW => f.write_str("SOCK_RAW"),
            r#type => write!(f, "{type}"),
        }
    }
}

/// Socket protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Protocol(pub(crate) libc::c_int);

impl Protocol {
    /// Default protocol of the socket type.
    pub const DEFAULT: Protocol = Protocol(0);
    /// Internet Control Message Protocol.
    #[doc(alias = "IPPROTO_ICMP")]
    pub const ICMP: Protocol = Protocol(libc::IPPROTO_ICMP);
    /// ICMP for IPv6.
    #[doc(alias = "IPPROTO_ICMPV6")]
    pub const ICMPV6: Protocol = Protocol(libc::IPPROTO_ICMPV6);
    /// Transmission Control Protocol.
    #[doc(alias = "IPPROTO_TCP")]
    pub const TCP: Protocol = Protocol(libc::IPPROTO_TCP);
    /// User Datagram Protocol.
    #[doc(alias = "IPPROTO_UDP")]
    pub const UDP: Protocol = Protocol(libc::IPPROTO_UDP);
    /// All link layer frames, used with [`Domain::PACKET`].
    #[doc(alias = "ETH_P_ALL")]
    #[cfg(any(target_os = "android", target_os = "linux"))]
    pub const ALL_FRAMES: Protocol = Protocol(ETH_P_ALL.to_be() as libc::c_int);
}

impl From<libc::c_int> for Protocol {
    fn from(protocol: libc::c_int) -> Protocol {
        Protocol(protocol)
    }
}

/// Request for [`NetworkingCore::ioctl`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Ioctl {
    /// Number of bytes that can be read without blocking.
    #[doc(alias = "FIONREAD")]
    BytesReadable,
    /// Set or clear non-blocking mode.
    #[doc(alias = "FIONBIO")]
    NonBlocking(bool),
}

#[cfg(any(target_os = "android", target_os = "linux"))]
const fn is_packet(family: libc::c_int) -> bool {
    family == libc::AF_PACKET
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
const fn is_packet(_: libc::c_int) -> bool {
    false
}

/// Split the type into the socket type and whether or not the socket is
/// non-blocking.
#[cfg(any(target_os = "android", target_os = "linux"))]
const fn split_type(r#type: libc::c_int) -> (libc::c_int, bool) {
    (
        r#type & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC),
        r#type & libc::SOCK_NONBLOCK != 0,
    )
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
const fn split_type(r#type: libc::c_int) -> (libc::c_int, bool) {
    (r#type, false)
}

/// Determine the socket kind and protocol number.
fn classify(family: libc::c_int, r#type: libc::c_int, protocol: libc::c_int) -> io::Result<(Kind, u16)> {
    if is_packet(family) {
        if r#type != libc::SOCK_RAW {
            return Err(errno::error(libc::ESOCKTNOSUPPORT));
        }
        // Ethernet protocol in network byte order.
        let protocol = u16::from_be(protocol as u16);
        return Ok((Kind::Raw, protocol));
    }
    if family != libc::AF_INET && family != libc::AF_INET6 {
        return Err(errno::error(libc::EAFNOSUPPORT));
    }
    match r#type {
        libc::SOCK_STREAM if protocol == 0 || protocol == libc::IPPROTO_TCP => {
            Ok((Kind::Stream, libc::IPPROTO_TCP as u16))
        }
        libc::SOCK_DGRAM if protocol == 0 || protocol == libc::IPPROTO_UDP => {
            Ok((Kind::Datagram, libc::IPPROTO_UDP as u16))
        }
        libc::SOCK_RAW if (1..=255).contains(&protocol) => Ok((Kind::Raw, protocol as u16)),
        libc::SOCK_STREAM | libc::SOCK_DGRAM | libc::SOCK_RAW => {
            Err(errno::error(libc::EPROTONOSUPPORT))
        }
        _ => Err(errno::error(libc::ESOCKTNOSUPPORT)),
    }
}

/// Look up the in use socket for `fd`.
fn lookup(table: &Table, fd: RawFd) -> io::Result<Index> {
    table.lookup(fd).ok_or_else(|| errno::error(libc::EBADF))
}

fn lookup_mut(table: &mut Table, fd: RawFd) -> io::Result<(Index, &mut Socket)> {
    let index = lookup(table, fd)?;
    let socket = table.get_mut(index).ok_or_else(|| errno::error(libc::EBADF))?;
    Ok((index, socket))
}

/// Returns true if `socket` holds an established (or ended) connection
/// handed out by `accept`.
const fn is_accepted(socket: &Socket) -> bool {
    !socket.flags.contains(Flags::CLIENT)
        && socket
            .flags
            .intersects(Flags::CONNECTED.union(Flags::DISCONNECTION_REQUEST))
}

/// Returns true if binding `port` on `interface` collides with a socket
/// other than `index`.
fn port_in_use(
    table: &Table,
    index: Index,
    kind: Kind,
    port: u16,
    interface: Option<usize>,
    reuse: bool,
) -> bool {
    table.iter().any(|(i, socket)| {
        i != index
            && socket.kind == kind
            && socket.flags.contains(Flags::BOUND)
            && socket.local_port == port
            && !matches!(socket.role, Role::Secondary { .. })
            && !is_accepted(socket)
            && (socket.local_interface.is_none()
                || interface.is_none()
                || socket.local_interface == interface)
            && !(reuse && socket.flags.contains(Flags::REUSEADDR))
    })
}

/// First free dynamic port for TCP sockets in the table.
fn free_port(table: &Table, index: Index) -> Option<u16> {
    (49152..=u16::MAX).find(|port| !port_in_use(table, index, Kind::Stream, *port, None, false))
}

/// A disconnect of a socket the stack already closed succeeds.
pub(crate) fn already_closed_ok(result: Result<(), Status>) -> Result<(), Status> {
    match result {
        Err(Status::NotConnected) => Ok(()),
        result => result,
    }
}

/// Log a failed cleanup call to the stack.
pub(crate) fn warn_on_error(result: Result<(), Status>, what: &str) {
    if let Err(status) = result {
        log::warn!("failed to {what}: {status:?}");
    }
}

/// Operations of the BSD call surface.
impl<S: Stack> NetworkingCore<S> {
    /// Create a new socket.
    ///
    /// Returns `ENFILE` if all sockets are in use.
    pub fn socket(&self, domain: Domain, r#type: Type, protocol: Protocol) -> io::Result<RawFd> {
        errno::record(self.new_socket(domain, r#type, protocol))
    }

    fn new_socket(&self, domain: Domain, r#type: Type, protocol: Protocol) -> io::Result<RawFd> {
        let (socket_type, non_blocking) = split_type(r#type.0);
        let (kind, protocol) = classify(domain.0, socket_type, protocol.0)?;

        let mut guard = self.lock()?;
        let state = &mut *guard;
        let native = match kind {
            Kind::Stream => Some(self.stack.tcp_create().map_err(errno::status_error)?),
            Kind::Datagram => Some(self.stack.udp_create().map_err(errno::status_error)?),
            Kind::Raw => None,
        };
        let mut socket = Socket::new(domain.0, kind, protocol, self.new_queue());
        socket.native = native;
        socket.flags.set(Flags::NON_BLOCKING, non_blocking);

        let index = match state.table.allocate(socket) {
            Ok(index) => index,
            Err(_) => {
                if let Some(native) = native {
                    self.delete_native(native);
                }
                log::debug!(sockets = state.table.capacity(); "socket table full");
                return Err(errno::error(libc::ENFILE));
            }
        };
        if let Some(native) = native {
            self.stack.set_reserved(native, Some(index.0));
        }
        if let Kind::Raw = kind {
            if is_packet(domain.0) {
                state.raw.register_link(index);
            } else {
                state.raw.register(protocol, index);
            }
        }
        let fd = state.table.fd(index);
        log::debug!(fd = fd, domain = domain.0, protocol = protocol; "created socket");
        Ok(fd)
    }

    /// Bind the socket to a local `address`.
    ///
    /// Binding a datagram socket to a port already bound by another datagram
    /// socket is allowed if both have `SO_REUSEADDR` set, the sockets then
    /// share the port.
    pub fn bind(&self, fd: RawFd, address: &SockAddr) -> io::Result<()> {
        errno::record(self.bind_socket(fd, address))
    }

    fn bind_socket(&self, fd: RawFd, address: &SockAddr) -> io::Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let (index, socket) = lookup_mut(&mut state.table, fd)?;
        if socket.flags.contains(Flags::BOUND) {
            return Err(errno::error(libc::EINVAL));
        }
        let kind = socket.kind;
        let family = socket.family;
        let reuse = socket.flags.contains(Flags::REUSEADDR);

        if is_packet(family) {
            let interface = link_interface(address)?;
            socket.local_interface = interface;
            socket.flags.insert(Flags::BOUND);
            return Ok(());
        }

        let (ip, port) = addr::to_native(address, family)?;
        let interface = self.interface_of(ip)?;
        let port = match kind {
            Kind::Raw => 0,
            Kind::Stream if port == 0 => {
                free_port(&state.table, index).ok_or_else(|| errno::error(libc::EADDRINUSE))?
            }
            Kind::Stream => {
                if port_in_use(&state.table, index, kind, port, interface, reuse) {
                    return Err(errno::error(libc::EADDRINUSE));
                }
                port
            }
            Kind::Datagram => self.bind_datagram(state, index, port, reuse)?,
        };

        let socket = state.table.get_mut(index).ok_or_else(|| errno::error(libc::EBADF))?;
        socket.local_port = port;
        socket.local_interface = interface;
        socket.flags.insert(Flags::BOUND);
        log::debug!(fd = fd, port = port; "bound socket");
        Ok(())
    }

    /// Bind the native socket of the datagram socket at `index`, or join the
    /// group of sockets already bound to `port`. Returns the bound port.
    fn bind_datagram(&self, state: &mut State, index: Index, port: u16, reuse: bool) -> io::Result<u16> {
        let Some(own) = state.table.get(index).and_then(|socket| socket.native) else {
            return Err(errno::error(libc::EBADF));
        };
        if port != 0 {
            let other = state.table.iter().find(|(i, socket)| {
                *i != index
                    && socket.kind == Kind::Datagram
                    && socket.flags.contains(Flags::BOUND)
                    && socket.local_port == port
            });
            if let Some((_, other)) = other {
                if !(reuse && other.flags.contains(Flags::REUSEADDR)) {
                    return Err(errno::error(libc::EADDRINUSE));
                }
                let Some(shared) = other.native else {
                    return Err(errno::error(libc::EADDRINUSE));
                };
                // Share the native socket of the group.
                self.delete_native(own);
                if let Some(socket) = state.table.get_mut(index) {
                    socket.native = Some(shared);
                }
                log::debug!(fd = state.table.fd(index), port = port; "joined shared datagram port");
                return Ok(port);
            }
        }
        self.stack.udp_bind(own, port).map_err(errno::status_error)
    }

    /// Bind a datagram socket to a dynamic port, if it isn't bound yet.
    fn ensure_bound(&self, state: &mut State, index: Index) -> io::Result<()> {
        match state.table.get(index) {
            Some(socket) if socket.kind != Kind::Datagram || socket.flags.contains(Flags::BOUND) => {
                return Ok(())
            }
            Some(_) => {}
            None => return Err(errno::error(libc::EBADF)),
        }
        let port = self.bind_datagram(state, index, 0, false)?;
        if let Some(socket) = state.table.get_mut(index) {
            socket.local_port = port;
            socket.flags.insert(Flags::BOUND);
        }
        Ok(())
    }

    /// Interface with `address`, `None` for the wildcard address.
    pub(crate) fn interface_of(&self, address: IpAddress) -> io::Result<Option<usize>> {
        if address.is_unspecified() {
            return Ok(None);
        }
        (0..self.stack.interface_count())
            .find(|interface| self.stack.interface_address(*interface) == Some(address))
            .map(Some)
            .ok_or_else(|| errno::error(libc::EADDRNOTAVAIL))
    }

    /// Connect the socket to `address`.
    ///
    /// For stream sockets this blocks until the connection is established,
    /// at most `SO_SNDTIMEO` or the configured connect timeout. In
    /// non-blocking mode this returns `EINPROGRESS`, use
    /// [`NetworkingCore::select`] to wait for the socket to become writable.
    ///
    /// For datagram and raw sockets this sets the default destination and
    /// filters incoming datagrams, an `AF_UNSPEC` address removes the
    /// association.
    pub fn connect(&self, fd: RawFd, address: &SockAddr) -> io::Result<()> {
        errno::record(self.connect_socket(fd, address))
    }

    fn connect_socket(&self, fd: RawFd, address: &SockAddr) -> io::Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let (index, socket) = lookup_mut(&mut state.table, fd)?;
        if !socket.is_stream() {
            return self.associate(state, index, address);
        }

        if matches!(socket.role, Role::Master { .. }) {
            return Err(errno::error(libc::EINVAL));
        } else if socket.flags.contains(Flags::CONNECTED) {
            return Err(errno::error(libc::EISCONN));
        } else if socket.flags.contains(Flags::CONNECTION_INPROGRESS) {
            return Err(errno::error(libc::EALREADY));
        } else if let Some(errno) = socket.take_error() {
            return Err(errno::error(errno));
        } else if socket.flags.contains(Flags::DISCONNECTION_REQUEST) {
            return Err(errno::error(libc::EISCONN));
        }
        let (ip, port) = addr::to_native(address, socket.family)?;
        let native = socket.native.ok_or_else(|| errno::error(libc::EBADF))?;

        let bound = self
            .stack
            .tcp_bind(native, socket.local_port)
            .map_err(errno::status_error)?;
        socket.local_port = bound;
        socket
            .flags
            .insert(Flags::BOUND | Flags::CLIENT | Flags::CONNECTION_INPROGRESS);
        socket.peer = Some((ip, port));

        match self.stack.tcp_connect(native, ip, port) {
            Ok(()) => {
                self.client_connected(state, index);
                return Ok(());
            }
            Err(Status::InProgress) => {}
            Err(status) => {
                socket.flags.remove(Flags::CONNECTION_INPROGRESS);
                socket.peer = None;
                return Err(errno::status_error(status));
            }
        }
        log::debug!(fd = fd, port = port; "connecting");
        if socket.is_non_blocking() {
            return Err(errno::error(libc::EINPROGRESS));
        }

        let timeout = socket.options.send_timeout.or(self.config.connect_timeout);
        let handle = state.table.handle(index);
        let result = self.wait_for(
            guard,
            handle,
            Events::WRITE | Events::EXCEPTION,
            false,
            timeout,
            |state, index| {
                let Some(socket) = state.table.get_mut(index) else {
                    return Poll::Ready(Err(errno::error(libc::EBADF)));
                };
                if socket.flags.contains(Flags::CONNECTED) {
                    Poll::Ready(Ok(()))
                } else if let Some(errno) = socket.take_error() {
                    Poll::Ready(Err(errno::error(errno)))
                } else if !socket.flags.contains(Flags::CONNECTION_INPROGRESS) {
                    Poll::Ready(Err(errno::error(libc::ECONNABORTED)))
                } else {
                    Poll::Pending
                }
            },
        );

        if let Err(err) = &result {
            if err.raw_os_error() == Some(libc::ETIMEDOUT) {
                // Give up on the attempt, the socket can be connected again.
                let mut state = self.lock()?;
                if let Some(socket) = state.table.validate(handle) {
                    socket.flags.remove(Flags::CONNECTION_INPROGRESS);
                    socket.peer = None;
                    warn_on_error(already_closed_ok(self.stack.tcp_disconnect(native)), "abort connect");
                }
            }
        }
        result
    }

    /// Set (or remove) the peer of a datagram or raw socket.
    fn associate(&self, state: &mut State, index: Index, address: &SockAddr) -> io::Result<()> {
        let socket = state.table.get_mut(index).ok_or_else(|| errno::error(libc::EBADF))?;
        if address.family() == libc::AF_UNSPEC {
            socket.peer = None;
            socket.flags.remove(Flags::CONNECTED);
            return Ok(());
        }
        if is_packet(socket.family) {
            return Err(errno::error(libc::EOPNOTSUPP));
        }
        let peer = addr::to_native(address, socket.family)?;
        self.ensure_bound(state, index)?;
        let socket = state.table.get_mut(index).ok_or_else(|| errno::error(libc::EBADF))?;
        socket.peer = Some(peer);
        socket.flags.insert(Flags::CONNECTED);
        Ok(())
    }

    /// Send `buf` on a connected socket.
    ///
    /// Never blocks. For stream sockets the returned count may be smaller than
    /// `buf` if the peer's window is (almost) full, `EWOULDBLOCK` is returned
    /// if it's completely full.
    pub fn send(&self, fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
        errno::record(self.send_to(fd, buf, flags, None))
    }

    /// Send `buf` to `address`.
    ///
    /// For stream sockets `address` is ignored.
    pub fn sendto(
        &self,
        fd: RawFd,
        buf: &[u8],
        flags: libc::c_int,
        address: &SockAddr,
    ) -> io::Result<usize> {
        errno::record(self.send_to(fd, buf, flags, Some(address)))
    }

    fn send_to(
        &self,
        fd: RawFd,
        buf: &[u8],
        flags: libc::c_int,
        address: Option<&SockAddr>,
    ) -> io::Result<usize> {
        if flags & !MSG_DONTWAIT != 0 {
            return Err(errno::error(libc::EOPNOTSUPP));
        }
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let (index, socket) = lookup_mut(&mut state.table, fd)?;
        match socket.kind {
            Kind::Stream => {
                if let Some(errno) = socket.take_error() {
                    return Err(errno::error(errno));
                } else if !socket.flags.contains(Flags::CONNECTED) {
                    let errno = if socket.flags.contains(Flags::DISCONNECTION_REQUEST) {
                        libc::EPIPE
                    } else {
                        libc::ENOTCONN
                    };
                    return Err(errno::error(errno));
                }
                let native = socket.native.ok_or_else(|| errno::error(libc::EBADF))?;
                let n = self.stack.tcp_send(native, buf).map_err(errno::status_error)?;
                log::trace!(fd = fd, n = n; "sent stream data");
                Ok(n)
            }
            Kind::Datagram => {
                let (ip, port) = match address {
                    Some(address) => addr::to_native(address, socket.family)?,
                    None => socket.peer.ok_or_else(|| errno::error(libc::EDESTADDRREQ))?,
                };
                self.ensure_bound(state, index)?;
                let socket = state.table.get(index).ok_or_else(|| errno::error(libc::EBADF))?;
                let native = socket.native.ok_or_else(|| errno::error(libc::EBADF))?;
                self.stack
                    .udp_send(native, ip, port, buf, socket.local_interface)
                    .map_err(errno::status_error)?;
                log::trace!(fd = fd, n = buf.len(), port = port; "sent datagram");
                Ok(buf.len())
            }
            Kind::Raw if is_packet(socket.family) => {
                let interface = match address {
                    Some(address) => link_interface(address)?,
                    None => socket.local_interface,
                };
                let interface = interface.ok_or_else(|| errno::error(libc::EDESTADDRREQ))?;
                self.stack.link_send(interface, buf).map_err(errno::status_error)?;
                Ok(buf.len())
            }
            Kind::Raw => {
                let ip = match address {
                    Some(address) => addr::to_native(address, socket.family)?.0,
                    None => socket.peer.ok_or_else(|| errno::error(libc::EDESTADDRREQ))?.0,
                };
                let protocol = u8::try_from(socket.protocol).map_err(|_| errno::error(libc::EINVAL))?;
                let header_included = socket.flags.contains(Flags::TX_HDR_INCLUDE);
                self.stack
                    .raw_send(protocol, ip, buf, header_included)
                    .map_err(errno::status_error)?;
                Ok(buf.len())
            }
        }
    }

    /// Receive data into `buf`.
    ///
    /// Blocks until data is available, unless the socket is non-blocking or
    /// [`MSG_DONTWAIT`] is passed. With [`MSG_PEEK`] the data is not removed
    /// from the receive queue. Returns zero once the peer closed the
    /// connection.
    ///
    /// For datagram and raw sockets only a single datagram is read, if `buf`
    /// is too small the remainder is discarded.
    pub fn recv(&self, fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
        errno::record(self.receive(fd, buf, flags)).map(|(n, _)| n)
    }

    /// Same as [`NetworkingCore::recv`], but also returns the address the data
    /// was sent from.
    pub fn recvfrom(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        flags: libc::c_int,
    ) -> io::Result<(usize, SockAddr)> {
        errno::record(self.receive(fd, buf, flags))
    }

    fn receive(&self, fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<(usize, SockAddr)> {
        if flags & !(MSG_PEEK | MSG_DONTWAIT) != 0 {
            return Err(errno::error(libc::EOPNOTSUPP));
        }
        let peek = flags & MSG_PEEK != 0;
        let state = self.lock()?;
        let index = lookup(&state.table, fd)?;
        let socket = state.table.get(index).ok_or_else(|| errno::error(libc::EBADF))?;
        let non_blocking = flags & MSG_DONTWAIT != 0 || socket.is_non_blocking();
        let timeout = socket.options.receive_timeout;
        let handle = state.table.handle(index);
        self.wait_for(state, handle, Events::READ, non_blocking, timeout, |state, index| {
            self.poll_receive(state, index, buf, peek)
        })
    }

    fn poll_receive(
        &self,
        state: &mut State,
        index: Index,
        buf: &mut [u8],
        peek: bool,
    ) -> Poll<io::Result<(usize, SockAddr)>> {
        let stream = state.table.get(index).is_some_and(Socket::is_stream);
        if stream {
            let _ = self.drain_tcp(state, index);
        }
        let Some(socket) = state.table.get_mut(index) else {
            return Poll::Ready(Err(errno::error(libc::EBADF)));
        };

        if !socket.queue.is_empty() {
            let read = socket.queue.peek_or_dequeue(buf, peek, stream);
            let address = if stream {
                peer_address(socket)
            } else {
                payload_address(socket, read.source, read.interface)
            };
            if stream && !peek {
                // Make room for data the stack is still holding.
                let _ = self.drain_tcp(state, index);
            }
            return Poll::Ready(Ok((read.n, address)));
        }

        if let Some(errno) = socket.take_error() {
            return Poll::Ready(Err(errno::error(errno)));
        }
        if stream {
            if socket.flags.contains(Flags::DISCONNECTION_REQUEST) {
                return Poll::Ready(Ok((0, peer_address(socket))));
            } else if !socket.flags.contains(Flags::CONNECTED) {
                return Poll::Ready(Err(errno::error(libc::ENOTCONN)));
            }
        }
        Poll::Pending
    }

    /// Close the socket.
    ///
    /// Threads blocked on the socket are woken and fail with `EBADF`.
    pub fn close(&self, fd: RawFd) -> io::Result<()> {
        errno::record(self.close_socket(fd))
    }

    fn close_socket(&self, fd: RawFd) -> io::Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let index = lookup(&state.table, fd)?;
        let socket = state.table.release(index).ok_or_else(|| errno::error(libc::EBADF))?;
        self.wake(state, index, Events::ALL);

        match socket.kind {
            Kind::Raw if is_packet(socket.family) => state.raw.unregister_link(index),
            Kind::Raw => state.raw.unregister(socket.protocol, index),
            Kind::Datagram => self.close_datagram(state, &socket),
            Kind::Stream => match socket.role {
                Role::Master { secondary } => self.close_master(state, index, secondary, &socket),
                Role::Standalone | Role::Secondary { .. } => self.close_connection(&socket),
            },
        }
        log::debug!(fd = fd; "closed socket");
        Ok(())
    }

    /// Release the native socket of a closed datagram socket, unless other
    /// sockets still share it.
    fn close_datagram(&self, state: &mut State, socket: &Socket) {
        let Some(native) = socket.native else {
            return;
        };
        let member = state
            .table
            .iter()
            .find(|(_, other)| other.native == Some(native))
            .map(|(index, _)| index);
        match member {
            Some(member) => {
                log::debug!(index = member.0; "handing shared datagram port to next socket");
                self.stack.set_reserved(native, Some(member.0));
            }
            None => {
                if socket.flags.contains(Flags::BOUND) {
                    warn_on_error(self.stack.udp_unbind(native), "unbind UDP socket");
                }
                self.delete_native(native);
            }
        }
    }

    /// Tear down the connection of a closed stream socket.
    fn close_connection(&self, socket: &Socket) {
        let Some(native) = socket.native else {
            return;
        };
        let active = Flags::CONNECTED
            .union(Flags::CONNECTION_INPROGRESS)
            .union(Flags::DISCONNECTION_REQUEST);
        if socket.flags.intersects(active) {
            warn_on_error(already_closed_ok(self.stack.tcp_disconnect(native)), "disconnect TCP socket");
        }
        if socket.flags.contains(Flags::CLIENT) {
            warn_on_error(self.stack.tcp_unbind(native), "unbind TCP socket");
        } else if is_accepted(socket) {
            warn_on_error(self.stack.tcp_unaccept(native), "unaccept TCP socket");
        }
        self.delete_native(native);
    }

    /// Remove the back-pointer of `native` and delete it.
    pub(crate) fn delete_native(&self, native: NativeSocket) {
        self.stack.set_reserved(native, None);
        warn_on_error(self.stack.delete(native), "delete native socket");
    }

    /// Returns the local address of the socket.
    pub fn getsockname(&self, fd: RawFd) -> io::Result<SockAddr> {
        errno::record(self.local_address(fd))
    }

    fn local_address(&self, fd: RawFd) -> io::Result<SockAddr> {
        let state = self.lock()?;
        let index = lookup(&state.table, fd)?;
        let socket = state.table.get(index).ok_or_else(|| errno::error(libc::EBADF))?;
        if is_packet(socket.family) {
            return Ok(link_address(socket.local_interface.unwrap_or(0), socket.protocol));
        }
        let connected = socket
            .flags
            .intersects(Flags::CONNECTED.union(Flags::DISCONNECTION_REQUEST));
        let local = match socket.native {
            Some(native) if socket.is_stream() && connected => {
                self.stack.tcp_local(native).map(|(ip, _)| ip)
            }
            _ => None,
        };
        let ip = local
            .or_else(|| {
                socket
                    .local_interface
                    .and_then(|interface| self.stack.interface_address(interface))
            })
            .unwrap_or(addr::any_address(socket.family));
        Ok(addr::from_native(ip, socket.local_port))
    }

    /// Returns the address of the peer the socket is connected to.
    pub fn getpeername(&self, fd: RawFd) -> io::Result<SockAddr> {
        errno::record(self.peer_name(fd))
    }

    fn peer_name(&self, fd: RawFd) -> io::Result<SockAddr> {
        let state = self.lock()?;
        let index = lookup(&state.table, fd)?;
        let socket = state.table.get(index).ok_or_else(|| errno::error(libc::EBADF))?;
        let connected = socket
            .flags
            .intersects(Flags::CONNECTED.union(Flags::DISCONNECTION_REQUEST));
        match socket.peer {
            Some((ip, port)) if connected => Ok(addr::from_native(ip, port)),
            _ => Err(errno::error(libc::ENOTCONN)),
        }
    }

    /// Shut down part of a connection.
    ///
    /// Shutting down the reading half only discards the received data,
    /// shutting down writing disconnects the stream.
    pub fn shutdown(&self, fd: RawFd, how: Shutdown) -> io::Result<()> {
        errno::record(self.shutdown_socket(fd, how))
    }

    fn shutdown_socket(&self, fd: RawFd, how: Shutdown) -> io::Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let (index, socket) = lookup_mut(&mut state.table, fd)?;
        let connected = socket
            .flags
            .intersects(Flags::CONNECTED.union(Flags::DISCONNECTION_REQUEST));
        if !connected {
            return Err(errno::error(libc::ENOTCONN));
        }
        if let Shutdown::Read | Shutdown::Both = how {
            socket.queue.clear();
        }
        if socket.is_stream() && matches!(how, Shutdown::Write | Shutdown::Both) {
            if let Some(native) = socket.native {
                already_closed_ok(self.stack.tcp_disconnect(native)).map_err(errno::status_error)?;
            }
            socket.flags.remove(Flags::CONNECTED);
            socket.flags.insert(Flags::DISCONNECTION_REQUEST);
            self.wake(state, index, Events::ALL);
        }
        Ok(())
    }

    /// File control, supports `F_GETFL` and `F_SETFL` with `O_NONBLOCK`.
    pub fn fcntl(&self, fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> io::Result<libc::c_int> {
        errno::record(self.file_control(fd, cmd, arg))
    }

    fn file_control(&self, fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> io::Result<libc::c_int> {
        let mut state = self.lock()?;
        let (_, socket) = lookup_mut(&mut state.table, fd)?;
        match cmd {
            libc::F_GETFL => {
                let mut flags = libc::O_RDWR;
                if socket.is_non_blocking() {
                    flags |= libc::O_NONBLOCK;
                }
                Ok(flags)
            }
            libc::F_SETFL => {
                socket.flags.set(Flags::NON_BLOCKING, arg & libc::O_NONBLOCK != 0);
                Ok(0)
            }
            _ => Err(errno::error(libc::EINVAL)),
        }
    }

    /// Control the socket, see [`Ioctl`].
    pub fn ioctl(&self, fd: RawFd, request: Ioctl) -> io::Result<usize> {
        errno::record(self.io_control(fd, request))
    }

    fn io_control(&self, fd: RawFd, request: Ioctl) -> io::Result<usize> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let index = lookup(&state.table, fd)?;
        match request {
            Ioctl::BytesReadable => {
                if state.table.get(index).is_some_and(Socket::is_stream) {
                    let _ = self.drain_tcp(state, index);
                }
                let socket = state.table.get(index).ok_or_else(|| errno::error(libc::EBADF))?;
                Ok(socket.queue.bytes())
            }
            Ioctl::NonBlocking(enable) => {
                let socket = state.table.get_mut(index).ok_or_else(|| errno::error(libc::EBADF))?;
                socket.flags.set(Flags::NON_BLOCKING, enable);
                Ok(0)
            }
        }
    }

    /// Move data held by the stack into the receive queue of the stream
    /// socket at `index`, as far as the queue has room.
    ///
    /// Returns true if anything was queued.
    pub(crate) fn drain_tcp(&self, state: &mut State, index: Index) -> bool {
        let Some(socket) = state.table.get_mut(index) else {
            return false;
        };
        let Some(native) = socket.native else {
            return false;
        };
        let mut queued = false;
        loop {
            let room = socket.queue.room();
            if room == 0 {
                break;
            }
            let Some(data) = self.stack.tcp_receive(native, room) else {
                break;
            };
            if data.is_empty() {
                break;
            }
            if !socket.queue.enqueue(Payload::stream(data)) {
                log::error!("stack returned more stream data than requested, dropping it");
                break;
            }
            queued = true;
        }
        queued
    }
}

/// Peer of a stream socket as address.
fn peer_address(socket: &Socket) -> SockAddr {
    match socket.peer {
        Some((ip, port)) => addr::from_native(ip, port),
        None => addr::from_native(addr::any_address(socket.family), 0),
    }
}

/// Address to report for a received datagram, raw packet or frame.
fn payload_address(
    socket: &Socket,
    source: Option<(IpAddress, u16)>,
    interface: Option<usize>,
) -> SockAddr {
    match source {
        Some((ip, port)) => addr::from_native(ip, port),
        None => link_address(interface.unwrap_or(0), socket.protocol),
    }
}

#[cfg(any(target_os = "android", target_os = "linux"))]
fn link_address(interface: usize, protocol: u16) -> SockAddr {
    SockAddr::link(interface, protocol)
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn link_address(_: usize, _: u16) -> SockAddr {
    SockAddr::unspecified()
}

/// Interface of a link layer address, `None` for any interface.
#[cfg(any(target_os = "android", target_os = "linux"))]
fn link_interface(address: &SockAddr) -> io::Result<Option<usize>> {
    match address.interface() {
        Some(0) => Ok(None),
        Some(interface) => Ok(Some(interface)),
        None => Err(errno::error(libc::EAFNOSUPPORT)),
    }
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn link_interface(_: &SockAddr) -> io::Result<Option<usize>> {
    Err(errno::error(libc::EAFNOSUPPORT))
}

#[test]
fn classify_sockets() {
    let (kind, protocol) = classify(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    assert_eq!(kind, Kind::Stream);
    assert_eq!(protocol, libc::IPPROTO_TCP as u16);
    let (kind, protocol) = classify(libc::AF_INET6, libc::SOCK_DGRAM, libc::IPPROTO_UDP).unwrap();
    assert_eq!(kind, Kind::Datagram);
    assert_eq!(protocol, libc::IPPROTO_UDP as u16);
    let (kind, protocol) = classify(libc::AF_INET, libc::SOCK_RAW, 17).unwrap();
    assert_eq!(kind, Kind::Raw);
    assert_eq!(protocol, 17);

    let errno = |res: io::Result<(Kind, u16)>| res.unwrap_err().raw_os_error().unwrap();
    assert_eq!(errno(classify(libc::AF_UNIX, libc::SOCK_STREAM, 0)), libc::EAFNOSUPPORT);
    assert_eq!(errno(classify(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_UDP)), libc::EPROTONOSUPPORT);
    assert_eq!(errno(classify(libc::AF_INET, libc::SOCK_RAW, 0)), libc::EPROTONOSUPPORT);
    assert_eq!(errno(classify(libc::AF_INET, libc::SOCK_SEQPACKET, 0)), libc::ESOCKTNOSUPPORT);
}

#[test]
fn disconnect_of_closed_socket_succeeds() {
    assert_eq!(already_closed_ok(Ok(())), Ok(()));
    assert_eq!(already_closed_ok(Err(Status::NotConnected)), Ok(()));
    assert_eq!(already_closed_ok(Err(Status::InvalidSocket)), Err(Status::InvalidSocket));
}
