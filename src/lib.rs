//! BSD sockets on top of an asynchronous IP stack.
//!
//! This crate maps the classic, thread blocking BSD socket API (`socket`,
//! `bind`, `listen`, `accept`, `recv`, `select`, etc.) onto an IP stack that
//! only provides non-blocking calls and reports progress using callbacks.
//!
//! The main type is [`NetworkingCore`], which owns the socket descriptor
//! table and implements all BSD calls as methods. It's generic over the IP
//! stack, which must implement the [`Stack`] trait. The core in turn
//! implements the [`Callbacks`] trait used by the stack to report incoming
//! data, connection progress and so on. An in-memory stack is provided in
//! [`stack::loopback`].
//!
//! # Examples
//!
//! Sending a datagram to ourselves.
//!
//! ```
//! use std::net::SocketAddr;
//!
//! use bsdsock::net::{Domain, Protocol, Type};
//! use bsdsock::stack::loopback::Loopback;
//! use bsdsock::{NetworkingCore, SockAddr};
//!
//! # fn main() -> std::io::Result<()> {
//! let core = NetworkingCore::new(Loopback::new()?)?;
//!
//! let fd = core.socket(Domain::IPV4, Type::DGRAM, Protocol::UDP)?;
//! let address: SocketAddr = "127.0.0.1:7000".parse().unwrap();
//! core.bind(fd, &SockAddr::from(address))?;
//! core.sendto(fd, b"Hello", 0, &SockAddr::from(address))?;
//!
//! let mut buf = [0; 16];
//! let (n, from) = core.recvfrom(fd, &mut buf, 0)?;
//! assert_eq!(&buf[..n], b"Hello");
//! assert_eq!(from.as_socket_addr(), Some(address));
//! core.close(fd)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Blocking
//!
//! Blocking calls suspend the calling thread, any number of threads can
//! call into the same core concurrently. Sockets can be made non-blocking
//! using [`NetworkingCore::fcntl`] or [`NetworkingCore::ioctl`], or per call
//! using [`net::MSG_DONTWAIT`].
//!
//! # Errors
//!
//! All calls return an [`io::Error`] holding an errno value on failure. The
//! errno of the last failed call is also available per thread using
//! [`last_error`].

#![warn(
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    variant_size_differences
)]

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;
use std::{fmt, io};

mod addr;
mod config;
mod errno;
mod listen;
mod notify;
mod queue;
mod raw;
mod sweeper;
mod table;
mod wakeup;

pub mod net;
pub mod stack;

#[doc(no_inline)]
pub use addr::SockAddr;
#[doc(no_inline)]
pub use config::Config;
#[doc(no_inline)]
pub use errno::last_error;
#[doc(no_inline)]
pub use stack::{Callbacks, Stack};
#[doc(no_inline)]
pub use sweeper::Sweeper;
#[doc(no_inline)]
pub use wakeup::{FdSet, FD_SETSIZE};

use queue::ReceiveQueue;
use raw::RawDemux;
use table::Table;
use wakeup::Waiters;

/// The BSD socket layer.
///
/// See the [crate documentation](crate) for an overview.
pub struct NetworkingCore<S> {
    stack: S,
    config: Config,
    /// The table lock, protects all socket state.
    state: Mutex<State>,
    /// Shared by all blocked callers, see the `wakeup` module.
    wakeup: Condvar,
}

/// State protected by the table lock.
#[derive(Debug)]
pub(crate) struct State {
    pub(crate) table: Table,
    pub(crate) raw: RawDemux,
    pub(crate) waiters: Waiters,
}

impl<S: Stack> NetworkingCore<S> {
    /// Configure a `NetworkingCore`.
    ///
    /// See [`Config`] for the options, use [`Config::build`] to create the
    /// core.
    pub const fn config() -> Config {
        Config::new()
    }

    /// Create a new core on top of `stack`, using the default configuration.
    pub fn new(stack: S) -> io::Result<Arc<NetworkingCore<S>>> {
        Config::new().build(stack)
    }

    /// Create the core and register it with `stack`.
    pub(crate) fn build(stack: S, config: Config) -> Arc<NetworkingCore<S>> {
        let state = State {
            table: Table::new(config.max_sockets, config.fd_start),
            raw: RawDemux::new(),
            waiters: Waiters::new(),
        };
        let core = Arc::new(NetworkingCore {
            stack,
            config,
            state: Mutex::new(state),
            wakeup: Condvar::new(),
        });
        let weak = Arc::downgrade(&core);
        let callbacks: std::sync::Weak<dyn Callbacks> = weak;
        core.stack.attach(callbacks);
        log::debug!(sockets = core.config.max_sockets, fd_start = core.config.fd_start; "created networking core");
        core
    }

    /// Returns the underlying IP stack.
    pub const fn stack(&self) -> &S {
        &self.stack
    }

    /// Acquire the table lock.
    pub(crate) fn lock(&self) -> io::Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| poisoned())
    }

    /// Release the table lock until woken or `deadline` passes.
    pub(crate) fn wait<'a>(
        &'a self,
        state: MutexGuard<'a, State>,
        deadline: Option<Instant>,
    ) -> io::Result<MutexGuard<'a, State>> {
        match deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                self.wakeup
                    .wait_timeout(state, timeout)
                    .map(|(state, _)| state)
                    .map_err(|_| poisoned())
            }
            None => self.wakeup.wait(state).map_err(|_| poisoned()),
        }
    }

    /// Create an empty receive queue with the configured caps.
    pub(crate) const fn new_queue(&self) -> ReceiveQueue {
        ReceiveQueue::new(self.config.queue_packets, self.config.queue_bytes)
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "socket table lock poisoned")
}

impl<S: fmt::Debug> fmt::Debug for NetworkingCore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("NetworkingCore");
        f.field("stack", &self.stack).field("config", &self.config);
        match self.state.try_lock() {
            Ok(state) => f.field("table", &state.table),
            Err(_) => f.field("table", &"<locked>"),
        };
        f.finish()
    }
}
