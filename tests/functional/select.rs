use std::thread;
use std::time::{Duration, Instant};

use bsdsock::FdSet;

use crate::util::{expect_io_errno, listener, localhost, tcp_socket, test_core, udp_socket};

#[test]
fn fd_set() {
    let mut set = FdSet::new();
    assert!(set.is_empty());
    set.insert(3);
    set.insert(40);
    set.insert(40);
    assert_eq!(set.len(), 2);
    assert!(set.contains(3) && set.contains(40) && !set.contains(4));
    assert_eq!(set.iter().collect::<Vec<_>>(), [3, 40]);
    set.remove(3);
    assert_eq!(set.iter().collect::<Vec<_>>(), [40]);
    set.clear();
    assert!(set.is_empty());
}

#[test]
fn datagram_readiness() {
    let core = test_core();
    let fd = udp_socket(&core);
    core.bind(fd, &localhost(6100)).unwrap();

    let mut read = FdSet::new();
    let mut write = FdSet::new();
    read.insert(fd);
    write.insert(fd);
    let n = core.select(fd + 1, Some(&mut read), Some(&mut write), None, Some(Duration::ZERO)).unwrap();
    assert_eq!(n, 1);
    assert!(read.is_empty());
    assert!(write.contains(fd));

    let sender = udp_socket(&core);
    core.sendto(sender, b"ping", 0, &localhost(6100)).unwrap();
    core.stack().flush();
    let mut read = FdSet::new();
    read.insert(fd);
    assert_eq!(core.select(fd + 1, Some(&mut read), None, None, Some(Duration::ZERO)).unwrap(), 1);
    assert!(read.contains(fd));

    core.close(fd).unwrap();
    core.close(sender).unwrap();
}

#[test]
fn select_timeout() {
    let core = test_core();
    let fd = udp_socket(&core);
    let mut read = FdSet::new();
    read.insert(fd);
    let start = Instant::now();
    let n = core.select(fd + 1, Some(&mut read), None, None, Some(Duration::from_millis(20))).unwrap();
    assert_eq!(n, 0);
    assert!(read.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(20));
    core.close(fd).unwrap();
}

#[test]
fn select_errors() {
    let core = test_core();
    let fd = udp_socket(&core);
    let mut read = FdSet::new();
    read.insert(fd);
    read.insert(fd + 1);
    expect_io_errno(core.select(fd + 2, Some(&mut read), None, None, Some(Duration::ZERO)), libc::EBADF);
    expect_io_errno(core.select(-1, None, None, None, Some(Duration::ZERO)), libc::EINVAL);

    // Descriptors at or above `nfds` are ignored.
    let mut read = FdSet::new();
    read.insert(fd + 1);
    assert_eq!(core.select(fd + 1, Some(&mut read), None, None, Some(Duration::ZERO)).unwrap(), 0);
    core.close(fd).unwrap();
}

#[test]
fn select_woken_by_datagram() {
    let core = test_core();
    let fd = udp_socket(&core);
    core.bind(fd, &localhost(6101)).unwrap();

    let c = core.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let sender = udp_socket(&c);
        c.sendto(sender, b"wake up", 0, &localhost(6101)).unwrap();
        sender
    });
    let mut read = FdSet::new();
    read.insert(fd);
    assert_eq!(core.select(fd + 1, Some(&mut read), None, None, None).unwrap(), 1);
    assert!(read.contains(fd));
    let sender = handle.join().unwrap();

    core.close(fd).unwrap();
    core.close(sender).unwrap();
}

#[test]
fn listener_readable_with_pending_connection() {
    let core = test_core();
    let listener = listener(&core, 6102);
    let mut read = FdSet::new();
    read.insert(listener);
    assert_eq!(core.select(listener + 1, Some(&mut read), None, None, Some(Duration::ZERO)).unwrap(), 0);

    let client = tcp_socket(&core);
    core.connect(client, &localhost(6102)).unwrap();
    let mut read = FdSet::new();
    let mut write = FdSet::new();
    read.insert(listener);
    write.insert(client);
    let nfds = listener.max(client) + 1;
    let timeout = Some(Duration::from_secs(5));
    let mut n = core.select(nfds, Some(&mut read), Some(&mut write), None, timeout).unwrap();
    if !read.contains(listener) {
        // Client side can be established before the server side.
        read.insert(listener);
        n += core.select(nfds, Some(&mut read), None, None, timeout).unwrap();
    }
    assert_eq!(n, 2);
    assert!(read.contains(listener));
    assert!(write.contains(client));

    let (accepted, _) = core.accept(listener).unwrap();
    for fd in [client, accepted, listener] {
        core.close(fd).unwrap();
    }
}

#[test]
fn peer_close_is_readable() {
    let core = test_core();
    let listener = listener(&core, 6103);
    let (client, accepted) = crate::util::connected_pair(&core, listener, 6103);
    core.close(client).unwrap();

    let mut read = FdSet::new();
    let mut except = FdSet::new();
    read.insert(accepted);
    except.insert(accepted);
    let n = core.select(accepted + 1, Some(&mut read), None, Some(&mut except), Some(Duration::from_secs(5))).unwrap();
    assert!(n >= 1);
    assert!(read.contains(accepted));
    let mut buf = [0; 8];
    assert_eq!(core.recv(accepted, &mut buf, 0).unwrap(), 0);
    core.close(accepted).unwrap();
    core.close(listener).unwrap();
}
