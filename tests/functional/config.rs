use std::time::Duration;

use bsdsock::net::{Domain, Protocol, Type};
use bsdsock::stack::loopback::Loopback;
use bsdsock::{Config, NetworkingCore, FD_SETSIZE};

use crate::util::{expect_io_errno, init, is_send, is_sync, test_core_with, udp_socket};

#[test]
fn core_is_send_and_sync() {
    is_send::<NetworkingCore<Loopback>>();
    is_sync::<NetworkingCore<Loopback>>();
    is_send::<Config>();
    is_sync::<Config>();
}

#[test]
fn config_invalid() {
    init();
    let tests = [
        NetworkingCore::<Loopback>::config().with_max_sockets(0),
        NetworkingCore::<Loopback>::config().with_fd_start(-1),
        NetworkingCore::<Loopback>::config()
            .with_fd_start(FD_SETSIZE as i32 - 8)
            .with_max_sockets(16),
        NetworkingCore::<Loopback>::config().with_queue_packets(0),
        NetworkingCore::<Loopback>::config().with_queue_bytes(0),
        NetworkingCore::<Loopback>::config().with_backlog(0, 5),
        NetworkingCore::<Loopback>::config().with_backlog(6, 5),
        NetworkingCore::<Loopback>::config().with_timer_rate(Duration::ZERO),
    ];
    for config in tests {
        let stack = Loopback::new().unwrap();
        expect_io_errno(config.build(stack), libc::EINVAL);
    }
}

#[test]
fn config_fd_start() {
    let core = test_core_with(Config::default().with_fd_start(100));
    let fd = udp_socket(&core);
    assert_eq!(fd, 100);
    let fd2 = udp_socket(&core);
    assert_eq!(fd2, 101);
    core.close(fd).unwrap();
    core.close(fd2).unwrap();
}

#[test]
fn table_exhaustion() {
    let core = test_core_with(Config::default().with_max_sockets(2));
    let a = udp_socket(&core);
    let b = udp_socket(&core);
    expect_io_errno(core.socket(Domain::IPV4, Type::DGRAM, Protocol::DEFAULT), libc::ENFILE);

    // Closing a socket makes room for a new one.
    core.close(a).unwrap();
    let c = udp_socket(&core);
    expect_io_errno(core.socket(Domain::IPV4, Type::STREAM, Protocol::DEFAULT), libc::ENFILE);
    core.close(b).unwrap();
    core.close(c).unwrap();
}

#[test]
fn listening_needs_room_for_listener() {
    let core = test_core_with(Config::default().with_max_sockets(1));
    let fd = crate::util::tcp_socket(&core);
    core.bind(fd, &crate::util::localhost(4000)).unwrap();
    // No slot left for the socket doing the actual listening.
    expect_io_errno(core.listen(fd, 1), libc::ENFILE);
    core.close(fd).unwrap();
}
