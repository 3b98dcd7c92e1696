//! Errno handling.
//!
//! Errors are returned as `io::Error` holding a raw OS error number. Each
//! failing BSD call also stores the number in a per thread cell, see
//! [`last_error`].

use std::cell::Cell;
use std::io;

use crate::stack::Status;

thread_local! {
    static LAST_ERROR: Cell<i32> = const { Cell::new(0) };
}

/// Returns the errno of the last failed BSD call made by this thread.
///
/// Zero if no call failed yet. Like the `errno` variable it is not reset by
/// successful calls.
#[doc(alias = "errno")]
pub fn last_error() -> i32 {
    LAST_ERROR.with(Cell::get)
}

/// Store the error of `result`, if any, as the last error of this thread.
pub(crate) fn record<T>(result: io::Result<T>) -> io::Result<T> {
    if let Err(err) = &result {
        let errno = err.raw_os_error().unwrap_or(libc::EIO);
        LAST_ERROR.with(|last| last.set(errno));
    }
    result
}

/// Create an `io::Error` from `errno`.
pub(crate) fn error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

/// Create an `io::Error` for `status` returned by the stack.
pub(crate) fn status_error(status: Status) -> io::Error {
    error(from_status(status))
}

/// Translate a stack status into an errno.
pub(crate) const fn from_status(status: Status) -> i32 {
    match status {
        Status::InProgress => libc::EINPROGRESS,
        Status::NotConnected => libc::ENOTCONN,
        Status::AlreadyConnected => libc::EISCONN,
        Status::AlreadyBound | Status::NotBound => libc::EINVAL,
        Status::PortUnavailable | Status::DuplicateListen => libc::EADDRINUSE,
        Status::NoFreePorts => libc::EADDRNOTAVAIL,
        Status::NotListening => libc::EINVAL,
        Status::Refused => libc::ECONNREFUSED,
        Status::NoResponse | Status::WaitAborted => libc::ETIMEDOUT,
        Status::Unreachable => libc::ENETUNREACH,
        Status::NoPacket | Status::TxQueueFull | Status::NoMemory => libc::ENOBUFS,
        Status::WindowFull => libc::EWOULDBLOCK,
        Status::InvalidParameters => libc::EINVAL,
        Status::InvalidInterface => libc::EADDRNOTAVAIL,
        Status::NotEnabled => libc::EPROTONOSUPPORT,
        Status::InvalidSocket => libc::EBADF,
    }
}

#[test]
fn status_mapping() {
    assert_eq!(from_status(Status::DuplicateListen), libc::EADDRINUSE);
    assert_eq!(from_status(Status::Refused), libc::ECONNREFUSED);
    assert_eq!(from_status(Status::WindowFull), libc::EWOULDBLOCK);
    assert_eq!(from_status(Status::NoResponse), libc::ETIMEDOUT);
    assert_eq!(from_status(Status::Unreachable), libc::ENETUNREACH);
}

#[test]
fn record_sets_last_error() {
    let res: io::Result<()> = Err(error(libc::ENOTCONN));
    assert!(record(res).is_err());
    assert_eq!(last_error(), libc::ENOTCONN);
    // Success doesn't reset it.
    assert!(record(Ok(())).is_ok());
    assert_eq!(last_error(), libc::ENOTCONN);
}
