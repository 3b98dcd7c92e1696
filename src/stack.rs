//! Contract with the underlying IP stack.
//!
//! The BSD layer never runs any protocol logic itself, it drives the IP stack
//! through the [`Stack`] trait and is driven by it through the [`Callbacks`]
//! trait, which is implemented by [`NetworkingCore`].
//!
//! # Re-entrancy
//!
//! All [`Stack`] methods are called while the table lock of the
//! [`NetworkingCore`] is held. Implementations must not call any of the
//! [`Callbacks`] from within those calls, but must deliver them from their own
//! context, e.g. the thread processing incoming packets. The callbacks acquire
//! the same table lock, calling them from within a [`Stack`] method would
//! deadlock.
//!
//! All [`Stack`] methods must be non-blocking, blocking semantics are
//! implemented by the BSD layer.
//!
//! [`NetworkingCore`]: crate::NetworkingCore

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Weak;

pub mod loopback;

/// Socket inside the IP stack.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NativeSocket(pub u32);

/// IP address as used by the stack, in host byte order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum IpAddress {
    /// IPv4 address.
    V4(u32),
    /// IPv6 address, most significant word first.
    V6([u32; 4]),
}

impl IpAddress {
    /// IPv4 wildcard address.
    pub const V4_ANY: IpAddress = IpAddress::V4(0);
    /// IPv6 wildcard address.
    pub const V6_ANY: IpAddress = IpAddress::V6([0; 4]);

    /// Returns true if this is a wildcard address.
    pub const fn is_unspecified(&self) -> bool {
        match self {
            IpAddress::V4(addr) => *addr == 0,
            IpAddress::V6(addr) => addr[0] == 0 && addr[1] == 0 && addr[2] == 0 && addr[3] == 0,
        }
    }

    /// Returns true for IPv6 addresses.
    pub const fn is_ipv6(&self) -> bool {
        matches!(self, IpAddress::V6(_))
    }

    /// Address family (`AF_INET` or `AF_INET6`) of the address.
    pub const fn family(&self) -> libc::c_int {
        match self {
            IpAddress::V4(_) => libc::AF_INET,
            IpAddress::V6(_) => libc::AF_INET6,
        }
    }
}

impl From<IpAddr> for IpAddress {
    fn from(addr: IpAddr) -> IpAddress {
        match addr {
            IpAddr::V4(addr) => IpAddress::V4(u32::from(addr)),
            IpAddr::V6(addr) => {
                let s = addr.segments();
                let mut words = [0; 4];
                for (i, word) in words.iter_mut().enumerate() {
                    *word = (u32::from(s[i * 2]) << 16) | u32::from(s[i * 2 + 1]);
                }
                IpAddress::V6(words)
            }
        }
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> IpAddress {
        IpAddress::V4(u32::from(addr))
    }
}

impl From<IpAddress> for IpAddr {
    fn from(addr: IpAddress) -> IpAddr {
        match addr {
            IpAddress::V4(addr) => IpAddr::V4(Ipv4Addr::from(addr)),
            IpAddress::V6(words) => {
                let mut s = [0u16; 8];
                for (i, word) in words.iter().enumerate() {
                    s[i * 2] = (word >> 16) as u16;
                    s[i * 2 + 1] = *word as u16;
                }
                IpAddr::V6(Ipv6Addr::from(s))
            }
        }
    }
}

/// State of a native TCP socket.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TcpState {
    /// Not connected or listening.
    Closed,
    /// Waiting for a connection request.
    Listen,
    /// Connection request sent, waiting for the reply.
    SynSent,
    /// Connection request received and answered.
    SynReceived,
    /// Connected.
    Established,
    /// Peer closed its side of the connection.
    CloseWait,
    /// We closed our side of the connection.
    FinWait,
    /// Both sides closed, waiting for stray segments.
    TimedWait,
}

/// Status returned by the stack when an operation did not succeed.
///
/// Translated into an errno by the BSD layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Status {
    /// Operation started but not yet completed.
    InProgress,
    /// Socket is not connected.
    NotConnected,
    /// Socket is already connected.
    AlreadyConnected,
    /// Socket is already bound to a port.
    AlreadyBound,
    /// Socket is not bound to a port.
    NotBound,
    /// Port is used by another socket.
    PortUnavailable,
    /// No free ephemeral port.
    NoFreePorts,
    /// Port already has a listener.
    DuplicateListen,
    /// Port has no listener.
    NotListening,
    /// Peer refused the connection.
    Refused,
    /// Peer didn't respond in time.
    NoResponse,
    /// Operation was aborted.
    WaitAborted,
    /// No route to the destination.
    Unreachable,
    /// Nothing to receive.
    NoPacket,
    /// Transmit queue is full.
    TxQueueFull,
    /// Peer's receive window is full.
    WindowFull,
    /// Invalid argument.
    InvalidParameters,
    /// Unknown interface.
    InvalidInterface,
    /// Protocol is not enabled in the stack.
    NotEnabled,
    /// Out of packet memory.
    NoMemory,
    /// Unknown native socket.
    InvalidSocket,
}

/// Incoming connection request, as seen when a SYN is received.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    /// Port the connection request is for.
    pub local_port: u16,
    /// Destination address of the request.
    pub local_address: IpAddress,
    /// Interface the request arrived on.
    pub interface: usize,
    /// Address of the peer.
    pub peer_address: IpAddress,
    /// Port of the peer.
    pub peer_port: u16,
}

/// Received UDP datagram.
#[derive(Clone, Debug)]
pub struct Datagram {
    /// Payload.
    pub data: Vec<u8>,
    /// Sender's address.
    pub source: IpAddress,
    /// Sender's port.
    pub source_port: u16,
    /// Address the datagram was sent to.
    pub destination: IpAddress,
    /// Interface the datagram arrived on.
    pub interface: usize,
}

/// Received IP packet for a raw protocol.
#[derive(Clone, Debug)]
pub struct RawPacket {
    /// IP protocol number.
    pub protocol: u8,
    /// Sender's address.
    pub source: IpAddress,
    /// Interface the packet arrived on.
    pub interface: usize,
    /// Length of the IP header at the start of `data`.
    pub header_len: usize,
    /// Packet including the IP header.
    pub data: Vec<u8>,
}

/// Received link layer frame.
#[derive(Clone, Debug)]
pub struct LinkFrame {
    /// Interface the frame arrived on.
    pub interface: usize,
    /// Frame including the link layer header.
    pub data: Vec<u8>,
}

/// Notifications from the IP stack to the BSD layer.
///
/// See the [module documentation](self) for the re-entrancy rules.
pub trait Callbacks: Send + Sync {
    /// Data arrived on `socket`.
    fn on_receive(&self, socket: NativeSocket);

    /// Connection on `socket` is established, for both client and server
    /// sockets.
    fn on_connection_established(&self, socket: NativeSocket);

    /// Connection on `socket` was torn down, locally or by the peer.
    fn on_disconnect(&self, socket: NativeSocket);

    /// Connection request received on listening `socket`.
    ///
    /// Returns false if no BSD socket wants the connection, in which case the
    /// stack should refuse it.
    fn on_syn_received(&self, socket: NativeSocket, segment: &Segment) -> bool;

    /// Packet for a raw protocol received.
    ///
    /// Returns true if the packet was consumed, false if the stack should
    /// continue processing it.
    fn on_raw_packet(&self, packet: &RawPacket) -> bool;

    /// Link layer frame received. Same return value as `on_raw_packet`.
    fn on_link_frame(&self, frame: &LinkFrame) -> bool;
}

/// Operations the BSD layer requires from the IP stack.
///
/// Each native socket has a reserved field, see [`Stack::set_reserved`], in
/// which the BSD layer stores the index of the socket it belongs to.
pub trait Stack: Send + Sync + 'static {
    /// Register the callbacks to deliver notifications to.
    fn attach(&self, callbacks: Weak<dyn Callbacks>);

    /// Address of `interface`, `None` if the interface doesn't exist.
    fn interface_address(&self, interface: usize) -> Option<IpAddress>;

    /// Number of interfaces.
    fn interface_count(&self) -> usize;

    fn tcp_create(&self) -> Result<NativeSocket, Status>;
    fn udp_create(&self) -> Result<NativeSocket, Status>;
    /// Delete a TCP or UDP socket.
    fn delete(&self, socket: NativeSocket) -> Result<(), Status>;

    /// Set the reserved back-pointer.
    fn set_reserved(&self, socket: NativeSocket, value: Option<usize>);
    /// Get the reserved back-pointer.
    fn reserved(&self, socket: NativeSocket) -> Option<usize>;

    /// Bind a client socket to `port`, zero picks a free port. Returns the
    /// port.
    fn tcp_bind(&self, socket: NativeSocket, port: u16) -> Result<u16, Status>;
    fn tcp_unbind(&self, socket: NativeSocket) -> Result<(), Status>;
    /// Start connecting. Returns `Err(Status::InProgress)` if the connection
    /// is not yet established.
    fn tcp_connect(&self, socket: NativeSocket, address: IpAddress, port: u16) -> Result<(), Status>;
    /// Register a listener on `port`, with `socket` as the first socket to
    /// receive a connection.
    fn tcp_listen(&self, port: u16, socket: NativeSocket, backlog: usize) -> Result<(), Status>;
    /// Make `socket` the socket to receive the next connection on the
    /// listening `port`.
    fn tcp_relisten(&self, port: u16, socket: NativeSocket) -> Result<(), Status>;
    fn tcp_unlisten(&self, port: u16) -> Result<(), Status>;
    /// Complete a connection on a listening socket, without waiting. Returns
    /// `Err(Status::InProgress)` if no connection is available yet.
    fn tcp_accept(&self, socket: NativeSocket) -> Result<(), Status>;
    /// Undo [`Stack::tcp_relisten`] or a completed accept, so the socket can
    /// be used to listen again.
    fn tcp_unaccept(&self, socket: NativeSocket) -> Result<(), Status>;
    /// Connection request queued on `port` while no socket was listening.
    fn tcp_pending_connection(&self, port: u16) -> Option<Segment>;
    /// Refuse the connection request returned by
    /// [`Stack::tcp_pending_connection`].
    fn tcp_refuse_pending(&self, port: u16);
    fn tcp_disconnect(&self, socket: NativeSocket) -> Result<(), Status>;
    /// Send `data`, returns the number of bytes accepted.
    fn tcp_send(&self, socket: NativeSocket, data: &[u8]) -> Result<usize, Status>;
    /// Take at most `max` received bytes.
    fn tcp_receive(&self, socket: NativeSocket, max: usize) -> Option<Vec<u8>>;
    fn tcp_state(&self, socket: NativeSocket) -> TcpState;
    /// Remote address and port of a connected socket.
    fn tcp_peer(&self, socket: NativeSocket) -> Option<(IpAddress, u16)>;
    /// Local address and interface of a connected socket.
    fn tcp_local(&self, socket: NativeSocket) -> Option<(IpAddress, usize)>;

    /// Bind to `port`, zero picks a free port. Returns the port.
    fn udp_bind(&self, socket: NativeSocket, port: u16) -> Result<u16, Status>;
    fn udp_unbind(&self, socket: NativeSocket) -> Result<(), Status>;
    fn udp_send(
        &self,
        socket: NativeSocket,
        address: IpAddress,
        port: u16,
        data: &[u8],
        interface: Option<usize>,
    ) -> Result<(), Status>;
    fn udp_receive(&self, socket: NativeSocket) -> Option<Datagram>;

    /// Send an IP packet for `protocol`. If `header_included` is true `data`
    /// starts with the IP header.
    fn raw_send(
        &self,
        protocol: u8,
        address: IpAddress,
        data: &[u8],
        header_included: bool,
    ) -> Result<(), Status>;

    /// Send a link layer frame.
    fn link_send(&self, interface: usize, frame: &[u8]) -> Result<(), Status>;
}
