use std::net::{Ipv4Addr, SocketAddr};

use bsdsock::net::{option, Ioctl, MSG_DONTWAIT, MSG_PEEK};
use bsdsock::SockAddr;

use crate::util::{expect_io_errno, local_port, localhost, test_core, udp_socket};

#[test]
fn send_and_receive() {
    let core = test_core();
    let receiver = udp_socket(&core);
    core.bind(receiver, &localhost(7000)).unwrap();
    let sender = udp_socket(&core);
    assert_eq!(core.sendto(sender, b"hello", 0, &localhost(7000)).unwrap(), 5);

    let mut buf = [0; 16];
    let (n, address) = core.recvfrom(receiver, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"hello");
    // Sender was bound to a dynamic port.
    let expected = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port(&core, sender)));
    assert_eq!(address.as_socket_addr(), Some(expected));

    // Reply to the source.
    core.sendto(receiver, b"world", 0, &address).unwrap();
    let n = core.recv(sender, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"world");

    core.close(receiver).unwrap();
    core.close(sender).unwrap();
}

#[test]
fn datagram_boundaries() {
    let core = test_core();
    let receiver = udp_socket(&core);
    core.bind(receiver, &localhost(7001)).unwrap();
    let sender = udp_socket(&core);
    core.sendto(sender, b"first datagram", 0, &localhost(7001)).unwrap();
    core.sendto(sender, b"second", 0, &localhost(7001)).unwrap();
    core.stack().flush();

    // All queued bytes, not just the first datagram.
    assert_eq!(core.ioctl(receiver, Ioctl::BytesReadable).unwrap(), 20);
    let mut buf = [0; 5];
    assert_eq!(core.recv(receiver, &mut buf, MSG_PEEK).unwrap(), 5);
    assert_eq!(&buf, b"first");
    // Remainder of the datagram is discarded.
    assert_eq!(core.recv(receiver, &mut buf, 0).unwrap(), 5);
    assert_eq!(&buf, b"first");
    let mut buf = [0; 16];
    let n = core.recv(receiver, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"second");
    expect_io_errno(core.recv(receiver, &mut buf, MSG_DONTWAIT), libc::EWOULDBLOCK);

    core.close(receiver).unwrap();
    core.close(sender).unwrap();
}

#[test]
fn bind_same_port() {
    let core = test_core();
    let a = udp_socket(&core);
    core.bind(a, &localhost(7002)).unwrap();
    let b = udp_socket(&core);
    expect_io_errno(core.bind(b, &localhost(7002)), libc::EADDRINUSE);
    // Both need the option.
    core.set_socket_option::<option::ReuseAddress>(b, true).unwrap();
    expect_io_errno(core.bind(b, &localhost(7002)), libc::EADDRINUSE);
    core.close(a).unwrap();
    core.close(b).unwrap();
}

#[test]
fn shared_port() {
    let core = test_core();
    let a = udp_socket(&core);
    let b = udp_socket(&core);
    for fd in [a, b] {
        core.set_socket_option::<option::ReuseAddress>(fd, true).unwrap();
        core.bind(fd, &localhost(7003)).unwrap();
    }
    let sender = udp_socket(&core);
    core.sendto(sender, b"to all", 0, &localhost(7003)).unwrap();
    core.stack().flush();

    // Both sockets get a copy.
    let mut buf = [0; 16];
    for fd in [a, b] {
        let n = core.recv(fd, &mut buf, MSG_DONTWAIT).unwrap();
        assert_eq!(&buf[..n], b"to all");
    }

    // Port stays bound while one of the sockets is open.
    core.close(a).unwrap();
    core.sendto(sender, b"to b", 0, &localhost(7003)).unwrap();
    let n = core.recv(b, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"to b");

    core.close(b).unwrap();
    core.close(sender).unwrap();
}

#[test]
fn connected_socket_filters_source() {
    let core = test_core();
    let fd = udp_socket(&core);
    core.bind(fd, &localhost(7004)).unwrap();
    let peer = udp_socket(&core);
    core.bind(peer, &localhost(7005)).unwrap();
    let other = udp_socket(&core);
    core.bind(other, &localhost(7006)).unwrap();

    core.connect(fd, &localhost(7005)).unwrap();
    assert_eq!(
        core.getpeername(fd).unwrap().as_socket_addr(),
        Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 7005)))
    );
    core.sendto(other, b"ignored", 0, &localhost(7004)).unwrap();
    core.sendto(peer, b"accepted", 0, &localhost(7004)).unwrap();
    core.stack().flush();

    let mut buf = [0; 16];
    let n = core.recv(fd, &mut buf, MSG_DONTWAIT).unwrap();
    assert_eq!(&buf[..n], b"accepted");
    expect_io_errno(core.recv(fd, &mut buf, MSG_DONTWAIT), libc::EWOULDBLOCK);

    // `send` uses the peer address.
    core.send(fd, b"reply", 0).unwrap();
    let n = core.recv(peer, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"reply");

    // Disconnect.
    core.connect(fd, &SockAddr::unspecified()).unwrap();
    expect_io_errno(core.send(fd, b"reply", 0), libc::EDESTADDRREQ);
    expect_io_errno(core.getpeername(fd), libc::ENOTCONN);

    for fd in [fd, peer, other] {
        core.close(fd).unwrap();
    }
}

#[test]
fn full_queue_drops_datagrams() {
    let core = test_core();
    let receiver = udp_socket(&core);
    core.bind(receiver, &localhost(7007)).unwrap();
    core.set_socket_option::<option::ReceiveBuffer>(receiver, 8).unwrap();
    let sender = udp_socket(&core);
    core.sendto(sender, b"12345", 0, &localhost(7007)).unwrap();
    core.sendto(sender, b"67890", 0, &localhost(7007)).unwrap();
    core.stack().flush();

    let mut buf = [0; 16];
    let n = core.recv(receiver, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"12345");
    expect_io_errno(core.recv(receiver, &mut buf, MSG_DONTWAIT), libc::EWOULDBLOCK);

    core.close(receiver).unwrap();
    core.close(sender).unwrap();
}

#[test]
fn datagram_to_closed_port() {
    let core = test_core();
    let sender = udp_socket(&core);
    core.sendto(sender, b"nobody", 0, &localhost(7008)).unwrap();
    core.stack().flush();
    assert_eq!(core.stack().dropped_datagrams(), 1);
    core.close(sender).unwrap();
}

#[test]
fn send_errors() {
    let core = test_core();
    let fd = udp_socket(&core);
    expect_io_errno(core.send(fd, b"no peer", 0), libc::EDESTADDRREQ);
    expect_io_errno(core.sendto(fd, b"oob", libc::MSG_OOB, &localhost(7009)), libc::EOPNOTSUPP);
    core.close(fd).unwrap();
}
