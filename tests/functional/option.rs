use std::mem::size_of;
use std::ptr;
use std::time::Duration;

use bsdsock::net::option::{self, Level, Opt, SocketOpt, TcpOpt};
use bsdsock::net::{Domain, Protocol, Type};

use crate::util::{expect_io_errno, tcp_socket, test_core, udp_socket};

#[test]
fn socket_type() {
    let core = test_core();
    let tcp = tcp_socket(&core);
    let udp = udp_socket(&core);
    let raw = core.socket(Domain::IPV4, Type::RAW, Protocol::ICMP).unwrap();
    assert_eq!(core.socket_option::<option::Type>(tcp).unwrap(), Type::STREAM);
    assert_eq!(core.socket_option::<option::Type>(udp).unwrap(), Type::DGRAM);
    assert_eq!(core.socket_option::<option::Type>(raw).unwrap(), Type::RAW);
    for fd in [tcp, udp, raw] {
        core.close(fd).unwrap();
    }
}

#[test]
fn no_error_initially() {
    let core = test_core();
    let fd = tcp_socket(&core);
    assert!(core.socket_option::<option::Error>(fd).unwrap().is_none());
    core.close(fd).unwrap();
}

#[test]
fn flag_options() {
    let core = test_core();
    let fd = tcp_socket(&core);

    assert!(!core.socket_option::<option::ReuseAddress>(fd).unwrap());
    core.set_socket_option::<option::ReuseAddress>(fd, true).unwrap();
    assert!(core.socket_option::<option::ReuseAddress>(fd).unwrap());

    assert!(!core.socket_option::<option::KeepAlive>(fd).unwrap());
    core.set_socket_option::<option::KeepAlive>(fd, true).unwrap();
    assert!(core.socket_option::<option::KeepAlive>(fd).unwrap());

    assert!(!core.socket_option::<option::Broadcast>(fd).unwrap());
    core.set_socket_option::<option::Broadcast>(fd, true).unwrap();
    assert!(core.socket_option::<option::Broadcast>(fd).unwrap());

    assert!(!core.socket_option::<option::NoDelay>(fd).unwrap());
    core.set_socket_option::<option::NoDelay>(fd, true).unwrap();
    assert!(core.socket_option::<option::NoDelay>(fd).unwrap());
    core.set_socket_option::<option::NoDelay>(fd, false).unwrap();
    assert!(!core.socket_option::<option::NoDelay>(fd).unwrap());

    core.close(fd).unwrap();
}

#[test]
fn timeouts() {
    let core = test_core();
    let fd = udp_socket(&core);
    assert_eq!(core.socket_option::<option::ReceiveTimeout>(fd).unwrap(), None);
    let timeout = Duration::from_millis(250);
    core.set_socket_option::<option::ReceiveTimeout>(fd, Some(timeout)).unwrap();
    assert_eq!(core.socket_option::<option::ReceiveTimeout>(fd).unwrap(), Some(timeout));
    core.set_socket_option::<option::ReceiveTimeout>(fd, None).unwrap();
    assert_eq!(core.socket_option::<option::ReceiveTimeout>(fd).unwrap(), None);

    core.set_socket_option::<option::SendTimeout>(fd, Some(Duration::from_secs(3))).unwrap();
    assert_eq!(
        core.socket_option::<option::SendTimeout>(fd).unwrap(),
        Some(Duration::from_secs(3))
    );

    // Invalid microseconds.
    let timeval = libc::timeval { tv_sec: 0, tv_usec: 1_000_000 };
    let result = unsafe {
        core.setsockopt(
            fd,
            Level::SOCKET,
            SocketOpt::RECEIVE_TIMEOUT.into_opt(),
            ptr::from_ref(&timeval).cast(),
            size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    expect_io_errno(result, libc::EDOM);
    core.close(fd).unwrap();
}

#[test]
fn linger() {
    let core = test_core();
    let fd = tcp_socket(&core);
    assert_eq!(core.socket_option::<option::Linger>(fd).unwrap(), None);
    core.set_socket_option::<option::Linger>(fd, Some(5)).unwrap();
    assert_eq!(core.socket_option::<option::Linger>(fd).unwrap(), Some(5));
    core.set_socket_option::<option::Linger>(fd, None).unwrap();
    assert_eq!(core.socket_option::<option::Linger>(fd).unwrap(), None);
    core.close(fd).unwrap();
}

#[test]
fn receive_buffer() {
    let core = test_core();
    let fd = udp_socket(&core);
    assert_eq!(core.socket_option::<option::ReceiveBuffer>(fd).unwrap(), 65535);
    core.set_socket_option::<option::ReceiveBuffer>(fd, 1024).unwrap();
    assert_eq!(core.socket_option::<option::ReceiveBuffer>(fd).unwrap(), 1024);
    expect_io_errno(core.set_socket_option::<option::ReceiveBuffer>(fd, 0), libc::EINVAL);
    core.close(fd).unwrap();
}

#[test]
fn raw_options() {
    let core = test_core();
    let raw = core.socket(Domain::IPV4, Type::RAW, Protocol::ICMP).unwrap();
    assert!(!core.socket_option::<option::HeaderIncluded>(raw).unwrap());
    core.set_socket_option::<option::HeaderIncluded>(raw, true).unwrap();
    assert!(core.socket_option::<option::HeaderIncluded>(raw).unwrap());
    assert!(!core.socket_option::<option::RawNoHeader>(raw).unwrap());
    core.set_socket_option::<option::RawNoHeader>(raw, true).unwrap();
    assert!(core.socket_option::<option::RawNoHeader>(raw).unwrap());

    // Only apply to raw sockets.
    let tcp = tcp_socket(&core);
    expect_io_errno(core.set_socket_option::<option::HeaderIncluded>(tcp, true), libc::ENOPROTOOPT);
    expect_io_errno(core.socket_option::<option::RawNoHeader>(tcp), libc::ENOPROTOOPT);
    core.close(tcp).unwrap();
    core.close(raw).unwrap();
}

#[test]
fn option_not_applicable() {
    let core = test_core();
    let udp = udp_socket(&core);
    expect_io_errno(core.set_socket_option::<option::NoDelay>(udp, true), libc::ENOPROTOOPT);
    expect_io_errno(core.socket_option::<option::NoDelay>(udp), libc::ENOPROTOOPT);
    core.close(udp).unwrap();
}

#[test]
fn unknown_options() {
    let core = test_core();
    let fd = tcp_socket(&core);
    let mut value: libc::c_int = 0;
    let mut length = size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        core.getsockopt(
            fd,
            Level::SOCKET,
            Opt::from(libc::SO_SNDBUF),
            ptr::from_mut(&mut value).cast(),
            &mut length,
        )
    };
    expect_io_errno(result, libc::ENOPROTOOPT);
    let result = unsafe {
        core.getsockopt(
            fd,
            Level::from(libc::IPPROTO_IPV6),
            Opt::from(libc::IPV6_V6ONLY),
            ptr::from_mut(&mut value).cast(),
            &mut length,
        )
    };
    expect_io_errno(result, libc::ENOPROTOOPT);

    // Read only options.
    let result = unsafe {
        core.setsockopt(
            fd,
            Level::SOCKET,
            SocketOpt::ERROR.into_opt(),
            ptr::from_ref(&value).cast(),
            length,
        )
    };
    expect_io_errno(result, libc::ENOPROTOOPT);
    let result = unsafe {
        core.setsockopt(
            fd,
            Level::SOCKET,
            SocketOpt::TYPE.into_opt(),
            ptr::from_ref(&value).cast(),
            length,
        )
    };
    expect_io_errno(result, libc::ENOPROTOOPT);
    core.close(fd).unwrap();
}

#[test]
fn raw_option_lengths() {
    let core = test_core();
    let fd = tcp_socket(&core);

    // Too small for a `c_int`.
    let mut value: libc::c_int = 0;
    let mut length = 2;
    let result = unsafe {
        core.getsockopt(
            fd,
            Level::TCP,
            TcpOpt::NO_DELAY.into_opt(),
            ptr::from_mut(&mut value).cast(),
            &mut length,
        )
    };
    expect_io_errno(result, libc::EINVAL);
    let result = unsafe {
        core.setsockopt(fd, Level::TCP, TcpOpt::NO_DELAY.into_opt(), ptr::from_ref(&value).cast(), 2)
    };
    expect_io_errno(result, libc::EINVAL);

    // Larger buffers are fine, the written length is returned.
    let mut buf = [0u8; 16];
    let mut length = buf.len() as libc::socklen_t;
    unsafe {
        core.getsockopt(
            fd,
            Level::SOCKET,
            SocketOpt::TYPE.into_opt(),
            buf.as_mut_ptr().cast(),
            &mut length,
        )
        .unwrap();
    }
    assert_eq!(length as usize, size_of::<libc::c_int>());
    let r#type = libc::c_int::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
    assert_eq!(r#type, libc::SOCK_STREAM);

    expect_io_errno(core.socket_option::<option::Type>(fd + 1000), libc::EBADF);
    core.close(fd).unwrap();
}
