use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bsdsock::net::{option, Ioctl};
use bsdsock::{Config, SockAddr};

use crate::util::{expect_io_errno, tcp_socket, test_core, test_core_with};

/// Address no local interface has, connection attempts are never answered.
fn unreachable() -> SockAddr {
    SockAddr::from(SocketAddr::from(([10, 1, 2, 3], 80)))
}

#[test]
fn sweep_fails_silent_connection_attempt() {
    let core = test_core();
    let fd = tcp_socket(&core);
    core.ioctl(fd, Ioctl::NonBlocking(true)).unwrap();
    expect_io_errno(core.connect(fd, &unreachable()), libc::EINPROGRESS);
    expect_io_errno(core.connect(fd, &unreachable()), libc::EALREADY);
    core.stack().flush();

    core.sweep().unwrap();
    let err = core.socket_option::<option::Error>(fd).unwrap().unwrap();
    assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
    // Error is cleared once read.
    assert!(core.socket_option::<option::Error>(fd).unwrap().is_none());
    core.close(fd).unwrap();
}

#[test]
fn sweep_leaves_listeners_alone() {
    let core = test_core();
    let listener = crate::util::listener(&core, 6200);
    core.sweep().unwrap();
    core.sweep().unwrap();
    let (client, accepted) = crate::util::connected_pair(&core, listener, 6200);
    for fd in [client, accepted, listener] {
        core.close(fd).unwrap();
    }
}

#[test]
fn sweeper_thread_fails_blocking_connect() {
    let core = test_core_with(Config::default().with_timer_rate(Duration::from_millis(10)));
    let _sweeper = core.start_sweeper().unwrap();
    let fd = tcp_socket(&core);
    let start = Instant::now();
    expect_io_errno(core.connect(fd, &unreachable()), libc::ECONNREFUSED);
    assert!(start.elapsed() < Duration::from_secs(5));
    core.close(fd).unwrap();
}

#[test]
fn connect_timeout() {
    let config = Config::default().with_connect_timeout(Some(Duration::from_millis(20)));
    let core = test_core_with(config);
    let fd = tcp_socket(&core);
    expect_io_errno(core.connect(fd, &unreachable()), libc::ETIMEDOUT);

    // Send timeout overrides the configured timeout.
    core.set_socket_option::<option::SendTimeout>(fd, Some(Duration::from_millis(30))).unwrap();
    let start = Instant::now();
    expect_io_errno(core.connect(fd, &unreachable()), libc::ETIMEDOUT);
    assert!(start.elapsed() >= Duration::from_millis(30));
    core.close(fd).unwrap();
}
