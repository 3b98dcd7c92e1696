use std::net::{Ipv4Addr, SocketAddr};

use bsdsock::net::option;
use bsdsock::net::{Domain, Protocol, Type, MSG_DONTWAIT};
use bsdsock::Config;

use crate::util::{
    expect_io_errno, interface_address, localhost, test_core, test_core_with, test_core_with_interface,
    udp_socket,
};

const DATA: &[u8] = b"raw data";

/// Size of the IPv4 header the loopback stack adds.
const IP_HEADER: usize = 20;
/// Size of the UDP header.
const UDP_HEADER: usize = 8;

#[test]
fn raw_socket_intercepts_udp() {
    let core = test_core();
    let raw_udp = core.socket(Domain::IPV4, Type::RAW, Protocol::UDP).unwrap();
    let raw_tcp = core.socket(Domain::IPV4, Type::RAW, Protocol::TCP).unwrap();
    let receiver = udp_socket(&core);
    core.bind(receiver, &localhost(6000)).unwrap();
    let sender = udp_socket(&core);
    core.sendto(sender, DATA, 0, &localhost(6000)).unwrap();
    core.stack().flush();

    let mut buf = [0; 128];
    let (n, address) = core.recvfrom(raw_udp, &mut buf, MSG_DONTWAIT).unwrap();
    assert_eq!(n, IP_HEADER + UDP_HEADER + DATA.len());
    assert_eq!(buf[0] >> 4, 4, "not an IPv4 header");
    assert_eq!(buf[9], libc::IPPROTO_UDP as u8);
    assert_eq!(&buf[IP_HEADER + 2..IP_HEADER + 4], &6000u16.to_be_bytes());
    assert_eq!(&buf[IP_HEADER + UDP_HEADER..n], DATA);
    assert_eq!(address.as_socket_addr().map(|a| a.ip()), Some(Ipv4Addr::LOCALHOST.into()));

    // Raw socket for a different protocol doesn't see it.
    expect_io_errno(core.recv(raw_tcp, &mut buf, MSG_DONTWAIT), libc::EWOULDBLOCK);
    // Consumed by the raw socket.
    expect_io_errno(core.recv(receiver, &mut buf, MSG_DONTWAIT), libc::EWOULDBLOCK);

    // Protocol 6 socket only sees its own traffic.
    core.sendto(raw_tcp, DATA, 0, &localhost(0)).unwrap();
    let n = core.recv(raw_tcp, &mut buf, 0).unwrap();
    assert_eq!(buf[9], libc::IPPROTO_TCP as u8);
    assert_eq!(&buf[IP_HEADER..n], DATA);
    expect_io_errno(core.recv(raw_udp, &mut buf, MSG_DONTWAIT), libc::EWOULDBLOCK);

    for fd in [raw_udp, raw_tcp, receiver, sender] {
        core.close(fd).unwrap();
    }
}

#[test]
fn raw_socket_without_header() {
    let core = test_core();
    let raw = core.socket(Domain::IPV4, Type::RAW, Protocol::UDP).unwrap();
    core.set_socket_option::<option::RawNoHeader>(raw, true).unwrap();
    let sender = udp_socket(&core);
    core.sendto(sender, DATA, 0, &localhost(6001)).unwrap();
    core.stack().flush();

    let mut buf = [0; 128];
    let n = core.recv(raw, &mut buf, 0).unwrap();
    assert_eq!(n, UDP_HEADER + DATA.len());
    assert_eq!(&buf[2..4], &6001u16.to_be_bytes());
    assert_eq!(&buf[UDP_HEADER..n], DATA);
    core.close(raw).unwrap();
    core.close(sender).unwrap();
}

#[test]
fn raw_packets_go_to_first_socket() {
    let core = test_core();
    let first = core.socket(Domain::IPV4, Type::RAW, Protocol::UDP).unwrap();
    let second = core.socket(Domain::IPV4, Type::RAW, Protocol::UDP).unwrap();
    let sender = udp_socket(&core);
    core.sendto(sender, DATA, 0, &localhost(6002)).unwrap();
    core.stack().flush();

    let mut buf = [0; 128];
    assert_eq!(core.recv(first, &mut buf, MSG_DONTWAIT).unwrap(), IP_HEADER + UDP_HEADER + DATA.len());
    expect_io_errno(core.recv(second, &mut buf, MSG_DONTWAIT), libc::EWOULDBLOCK);
    for fd in [first, second, sender] {
        core.close(fd).unwrap();
    }
}

#[test]
fn duplicate_raw_packets() {
    let core = test_core_with(Config::default().duplicate_raw_packets(true));
    let first = core.socket(Domain::IPV4, Type::RAW, Protocol::UDP).unwrap();
    let second = core.socket(Domain::IPV4, Type::RAW, Protocol::UDP).unwrap();
    let sender = udp_socket(&core);
    core.sendto(sender, DATA, 0, &localhost(6003)).unwrap();
    core.stack().flush();

    let mut buf = [0; 128];
    for fd in [first, second] {
        assert_eq!(core.recv(fd, &mut buf, MSG_DONTWAIT).unwrap(), IP_HEADER + UDP_HEADER + DATA.len());
    }
    for fd in [first, second, sender] {
        core.close(fd).unwrap();
    }
}

#[test]
fn icmp_to_self() {
    let core = test_core();
    let fd = core.socket(Domain::IPV4, Type::RAW, Protocol::ICMP).unwrap();
    // Echo request, checksum isn't checked.
    let request = [8, 0, 0, 0, 0, 1, 0, 1];
    assert_eq!(core.sendto(fd, &request, 0, &localhost(0)).unwrap(), request.len());

    let mut buf = [0; 64];
    let (n, address) = core.recvfrom(fd, &mut buf, 0).unwrap();
    assert_eq!(n, IP_HEADER + request.len());
    assert_eq!(buf[9], libc::IPPROTO_ICMP as u8);
    assert_eq!(&buf[IP_HEADER..n], &request);
    assert_eq!(address.as_socket_addr(), Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))));

    // With a connected peer `send` works as well.
    core.connect(fd, &localhost(0)).unwrap();
    core.send(fd, &request, 0).unwrap();
    assert_eq!(core.recv(fd, &mut buf, 0).unwrap(), IP_HEADER + request.len());
    core.close(fd).unwrap();
}

#[test]
fn header_included() {
    let core = test_core();
    let fd = core.socket(Domain::IPV4, Type::RAW, Protocol::ICMP).unwrap();
    core.set_socket_option::<option::HeaderIncluded>(fd, true).unwrap();
    core.set_socket_option::<option::RawNoHeader>(fd, true).unwrap();

    let mut packet = vec![0x45, 0, 0, 28, 0, 0, 0, 0, 64, 1, 0, 0, 127, 0, 0, 1, 127, 0, 0, 1];
    packet.extend_from_slice(&[8, 0, 0, 0, 0, 2, 0, 2]);
    core.sendto(fd, &packet, 0, &localhost(0)).unwrap();
    let mut buf = [0; 64];
    let n = core.recv(fd, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], &packet[IP_HEADER..]);

    // Header must be present.
    expect_io_errno(core.sendto(fd, &[0x45, 0], 0, &localhost(0)), libc::EINVAL);
    core.close(fd).unwrap();
}

#[test]
fn raw_socket_bound_to_interface() {
    let core = test_core_with_interface();
    let fd = core.socket(Domain::IPV4, Type::RAW, Protocol::from(253)).unwrap();
    core.bind(fd, &interface_address(0)).unwrap();

    // Arrives on the loopback interface, which the socket isn't bound to.
    core.sendto(fd, DATA, 0, &localhost(0)).unwrap();
    core.stack().flush();
    assert_eq!(core.stack().unclaimed_packets(), 1);
    let mut buf = [0; 64];
    expect_io_errno(core.recv(fd, &mut buf, MSG_DONTWAIT), libc::EWOULDBLOCK);

    core.sendto(fd, DATA, 0, &interface_address(0)).unwrap();
    let n = core.recv(fd, &mut buf, 0).unwrap();
    assert_eq!(&buf[IP_HEADER..n], DATA);
    assert_eq!(core.stack().unclaimed_packets(), 1);
    core.close(fd).unwrap();
}

#[test]
fn raw_socket_errors() {
    let core = test_core();
    expect_io_errno(core.socket(Domain::IPV4, Type::RAW, Protocol::from(256)), libc::EPROTONOSUPPORT);
    expect_io_errno(core.socket(Domain::IPV4, Type::STREAM, Protocol::UDP), libc::EPROTONOSUPPORT);
    expect_io_errno(core.socket(Domain::from(libc::AF_UNIX), Type::STREAM, Protocol::DEFAULT), libc::EAFNOSUPPORT);
    let fd = core.socket(Domain::IPV4, Type::RAW, Protocol::ICMP).unwrap();
    // No peer.
    expect_io_errno(core.send(fd, DATA, 0), libc::EDESTADDRREQ);
    core.close(fd).unwrap();
}

#[cfg(any(target_os = "android", target_os = "linux"))]
mod link {
    use bsdsock::net::{Domain, Protocol, Type, MSG_DONTWAIT};
    use bsdsock::SockAddr;

    use crate::util::{expect_io_errno, test_core, test_core_with_interface};

    /// Ethernet frame with ether type 0x88b5 (local experimental).
    fn frame() -> Vec<u8> {
        let mut frame = vec![0xff; 6];
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        frame.extend_from_slice(&[0x88, 0xb5]);
        frame.extend_from_slice(b"link layer payload");
        frame
    }

    #[test]
    fn link_frames_loop_back() {
        let core = test_core_with_interface();
        let all = core.socket(Domain::PACKET, Type::RAW, Protocol::ALL_FRAMES).unwrap();
        let experimental = core
            .socket(Domain::PACKET, Type::RAW, Protocol::from(i32::from(0x88b5u16.to_be())))
            .unwrap();
        let other = core
            .socket(Domain::PACKET, Type::RAW, Protocol::from(i32::from(0x0800u16.to_be())))
            .unwrap();

        let frame = frame();
        assert_eq!(core.sendto(all, &frame, 0, &SockAddr::link(1, 0x88b5)).unwrap(), frame.len());
        core.stack().flush();

        let mut buf = [0; 64];
        for fd in [all, experimental] {
            let n = core.recv(fd, &mut buf, MSG_DONTWAIT).unwrap();
            assert_eq!(&buf[..n], &frame);
        }
        expect_io_errno(core.recv(other, &mut buf, MSG_DONTWAIT), libc::EWOULDBLOCK);
        assert_eq!(core.stack().unclaimed_packets(), 0);

        // Frames no socket wants are counted.
        core.close(all).unwrap();
        core.close(experimental).unwrap();
        core.sendto(other, &frame, 0, &SockAddr::link(1, 0x88b5)).unwrap();
        core.stack().flush();
        assert_eq!(core.stack().unclaimed_packets(), 1);
        core.close(other).unwrap();

    }

    #[test]
    fn link_send_errors() {
        let core = test_core();
        let fd = core.socket(Domain::PACKET, Type::RAW, Protocol::ALL_FRAMES).unwrap();
        // Interface zero means any, which can't be sent on.
        expect_io_errno(core.sendto(fd, &frame(), 0, &SockAddr::link(0, 0x88b5)), libc::EDESTADDRREQ);
        // Loopback stack only has a single interface.
        expect_io_errno(core.sendto(fd, &frame(), 0, &SockAddr::link(1, 0x88b5)), libc::EADDRNOTAVAIL);
        expect_io_errno(core.socket(Domain::PACKET, Type::DGRAM, Protocol::ALL_FRAMES), libc::ESOCKTNOSUPPORT);
        core.close(fd).unwrap();
    }
}
