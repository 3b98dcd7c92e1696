//! Test utilities.

#![allow(dead_code, unused_imports, unused_macros)] // Not all tests use all code here.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;
use std::sync::{Arc, Once};

use bsdsock::net::{Domain, Protocol, Type};
use bsdsock::stack::loopback::Loopback;
use bsdsock::{Config, NetworkingCore, SockAddr};

pub(crate) type Core = Arc<NetworkingCore<Loopback>>;

/// Initialise logging.
///
/// Automatically called when [`test_core`] is used.
pub(crate) fn init() {
    static START: Once = Once::new();
    START.call_once(|| {
        std_logger::Config::logfmt().with_call_location(true).init();
    });
}

/// Create a core with the default configuration on top of a [`Loopback`]
/// stack.
pub(crate) fn test_core() -> Core {
    test_core_with(NetworkingCore::<Loopback>::config())
}

/// Create a core using `config`.
pub(crate) fn test_core_with(config: Config) -> Core {
    init();
    let stack = Loopback::new().expect("failed to create loopback stack");
    config.build(stack).expect("failed to create networking core")
}

/// Address of the second interface of [`test_core_with_interface`].
pub(crate) const INTERFACE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Create a core on top of a [`Loopback`] stack with a second interface,
/// with address [`INTERFACE`].
pub(crate) fn test_core_with_interface() -> Core {
    init();
    let stack = Loopback::with_interfaces([IpAddr::V4(INTERFACE)])
        .expect("failed to create loopback stack");
    NetworkingCore::new(stack).expect("failed to create networking core")
}

pub(crate) fn is_sync<T: Sync>() {}
pub(crate) fn is_send<T: Send>() {}

/// Expect `result` to contain an [`io::Error`] with `expected` error number.
#[track_caller]
pub(crate) fn expect_io_errno<T>(result: Result<T, io::Error>, expected: libc::c_int) {
    match result {
        Ok(_) => panic!("unexpected ok result"),
        Err(ref err) if err.raw_os_error() == Some(expected) => return,
        Err(err) => panic!("unexpected error result, error: {err:?}"),
    }
}

/// `127.0.0.1:port`.
pub(crate) fn localhost(port: u16) -> SockAddr {
    SockAddr::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// `INTERFACE:port`.
pub(crate) fn interface_address(port: u16) -> SockAddr {
    SockAddr::from(SocketAddrV4::new(INTERFACE, port))
}

/// `0.0.0.0:port`.
pub(crate) fn any_address(port: u16) -> SockAddr {
    SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
}

/// Port of the local address of `fd`.
pub(crate) fn local_port(core: &Core, fd: RawFd) -> u16 {
    let address = core.getsockname(fd).expect("failed to get local address");
    address.as_socket_addr().expect("not an IP address").port()
}

/// Create an IPv4, TCP socket.
pub(crate) fn tcp_socket(core: &Core) -> RawFd {
    core.socket(Domain::IPV4, Type::STREAM, Protocol::DEFAULT)
        .expect("failed to create TCP socket")
}

/// Create an IPv4, UDP socket.
pub(crate) fn udp_socket(core: &Core) -> RawFd {
    core.socket(Domain::IPV4, Type::DGRAM, Protocol::DEFAULT)
        .expect("failed to create UDP socket")
}

/// Create a TCP socket listening on `127.0.0.1:port`.
pub(crate) fn listener(core: &Core, port: u16) -> RawFd {
    let fd = tcp_socket(core);
    core.bind(fd, &localhost(port)).expect("failed to bind");
    core.listen(fd, 5).expect("failed to listen");
    fd
}

/// Connect a new client to the `listener` on `port`, returning the client
/// and accepted sockets.
pub(crate) fn connected_pair(core: &Core, listener: RawFd, port: u16) -> (RawFd, RawFd) {
    let client = tcp_socket(core);
    core.connect(client, &localhost(port)).expect("failed to connect");
    let (accepted, address) = core.accept(listener).expect("failed to accept");
    assert_ne!(accepted, listener);
    assert_ne!(accepted, client);
    let expected = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port(core, client)));
    assert_eq!(address.as_socket_addr(), Some(expected));
    (client, accepted)
}

/// Receive all of `expected` on `fd`.
#[track_caller]
pub(crate) fn expect_recv(core: &Core, fd: RawFd, expected: &[u8]) {
    let mut buf = vec![0; expected.len()];
    let mut read = 0;
    while read < expected.len() {
        let n = core.recv(fd, &mut buf[read..], 0).expect("failed to receive");
        assert!(n != 0, "unexpected end of stream");
        read += n;
    }
    assert_eq!(buf, expected);
}
