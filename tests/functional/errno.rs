use bsdsock::last_error;

use crate::util::{expect_io_errno, test_core, udp_socket};

#[test]
fn last_error_is_per_call() {
    let core = test_core();
    expect_io_errno(core.close(12345), libc::EBADF);
    assert_eq!(last_error(), libc::EBADF);

    // Not reset by a successful call.
    let fd = udp_socket(&core);
    assert_eq!(last_error(), libc::EBADF);

    expect_io_errno(core.listen(fd, 1), libc::EOPNOTSUPP);
    assert_eq!(last_error(), libc::EOPNOTSUPP);
    core.close(fd).unwrap();
}

#[test]
fn last_error_is_per_thread() {
    let core = test_core();
    expect_io_errno(core.getpeername(-1), libc::EBADF);
    std::thread::spawn(|| assert_eq!(last_error(), 0)).join().unwrap();
    assert_eq!(last_error(), libc::EBADF);
}
