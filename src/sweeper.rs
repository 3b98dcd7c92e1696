//! Timeout sweeper.
//!
//! The stack doesn't report every connection attempt that fails, e.g. when
//! the peer never answers. The sweeper periodically scans the table for
//! sockets still waiting on a connection whose native socket went back to
//! the closed state.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crate::stack::{Stack, TcpState};
use crate::table::Flags;
use crate::wakeup::Events;
use crate::NetworkingCore;

/// Handle to the background sweeper thread.
///
/// The thread is stopped (and joined) when this is dropped. See
/// [`NetworkingCore::start_sweeper`].
#[derive(Debug)]
#[must_use = "the sweeper is stopped when `Sweeper` is dropped"]
pub struct Sweeper {
    /// Dropping this stops the thread.
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<S: Stack> NetworkingCore<S> {
    /// Start a thread running [`NetworkingCore::sweep`] at the configured
    /// timer rate.
    ///
    /// The thread only holds a weak reference to the core, it stops once
    /// the core is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> io::Result<Sweeper> {
        let core: Weak<Self> = Arc::downgrade(self);
        let rate = self.config.timer_rate;
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("bsdsock-sweeper".into())
            .spawn(move || loop {
                match stopped.recv_timeout(rate) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
                let Some(core) = core.upgrade() else {
                    return;
                };
                if let Err(err) = core.sweep() {
                    log::error!("failed to sweep sockets: {err}");
                    return;
                }
            })?;
        log::debug!(rate_ms = rate.as_millis() as u64; "started sweeper");
        Ok(Sweeper {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Scan the table once for connection attempts that failed silently.
    ///
    /// A listening secondary is armed again, a client socket gets
    /// `ECONNREFUSED` as error and its waiters are woken.
    pub fn sweep(&self) -> io::Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        for index in state.table.indices() {
            let Some(socket) = state.table.get_mut(index) else {
                continue;
            };
            if !socket.is_stream() || !socket.flags.contains(Flags::CONNECTION_INPROGRESS) {
                continue;
            }
            let Some(native) = socket.native else {
                continue;
            };
            if self.stack.tcp_state(native) != TcpState::Closed {
                continue;
            }

            if socket.flags.contains(Flags::SERVER_SECONDARY) {
                log::debug!(port = socket.local_port; "re-arming closed listener");
                self.rearm_in_place(state, index);
            } else {
                socket.flags.remove(Flags::CONNECTION_INPROGRESS);
                socket.set_error(libc::ECONNREFUSED);
                log::debug!(fd = state.table.fd(index); "connection attempt timed out");
                self.wake(state, index, Events::ALL);
            }
        }
        Ok(())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("sweeper thread panicked");
            }
        }
    }
}
