//! [`Config`]uration module.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::errno;
use crate::stack::Stack;
use crate::wakeup::FD_SETSIZE;
use crate::NetworkingCore;

/// Configuration of a [`NetworkingCore`].
///
/// Created by calling [`NetworkingCore::config`].
#[derive(Debug, Clone)]
#[must_use = "no core is created until `bsdsock::Config::build` is called"]
pub struct Config {
    pub(crate) max_sockets: usize,
    pub(crate) fd_start: i32,
    pub(crate) queue_packets: usize,
    pub(crate) queue_bytes: usize,
    pub(crate) min_backlog: usize,
    pub(crate) max_backlog: usize,
    pub(crate) timer_rate: Duration,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) duplicate_raw_packets: bool,
}

impl Config {
    pub(crate) const fn new() -> Config {
        Config {
            max_sockets: 32,
            fd_start: 32,
            queue_packets: 5,
            queue_bytes: 65535,
            min_backlog: 1,
            max_backlog: 5,
            timer_rate: Duration::from_secs(1),
            connect_timeout: Some(Duration::from_secs(20)),
            duplicate_raw_packets: false,
        }
    }

    /// Set the number of sockets in the descriptor table.
    ///
    /// Defaults to 32. The table never grows, once all sockets are in use
    /// creating a socket fails with `ENFILE`.
    pub const fn with_max_sockets(mut self, sockets: usize) -> Self {
        self.max_sockets = sockets;
        self
    }

    /// Set the first file descriptor handed out, defaults to 32.
    ///
    /// Descriptors are `fd_start..fd_start + max_sockets`, which must fit in
    /// a [`FdSet`].
    ///
    /// [`FdSet`]: crate::FdSet
    pub const fn with_fd_start(mut self, fd_start: i32) -> Self {
        self.fd_start = fd_start;
        self
    }

    /// Set the maximum number of packets queued per socket, defaults to 5.
    ///
    /// Datagrams arriving at a full queue are dropped.
    pub const fn with_queue_packets(mut self, packets: usize) -> Self {
        self.queue_packets = packets;
        self
    }

    /// Set the maximum number of bytes queued per socket, defaults to 65535.
    ///
    /// Can be changed per socket using the `SO_RCVBUF` option.
    #[doc(alias = "SO_RCVBUF")]
    pub const fn with_queue_bytes(mut self, bytes: usize) -> Self {
        self.queue_bytes = bytes;
        self
    }

    /// Set the bounds the backlog passed to `listen` is clamped to.
    ///
    /// Defaults to `1..=5`.
    pub const fn with_backlog(mut self, min: usize, max: usize) -> Self {
        self.min_backlog = min;
        self.max_backlog = max;
        self
    }

    /// Set the rate at which the timeout sweeper runs, defaults to once per
    /// second.
    ///
    /// Also see [`NetworkingCore::start_sweeper`].
    pub const fn with_timer_rate(mut self, rate: Duration) -> Self {
        self.timer_rate = rate;
        self
    }

    /// Set the default timeout of blocking `connect` calls, defaults to 20
    /// seconds. `None` waits forever.
    ///
    /// The `SO_SNDTIMEO` option of a socket overrides this.
    pub const fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Deliver raw packets to all matching raw sockets, instead of only the
    /// first one. Defaults to false.
    pub const fn duplicate_raw_packets(mut self, enable: bool) -> Self {
        self.duplicate_raw_packets = enable;
        self
    }

    /// Build a new [`NetworkingCore`] on top of `stack`.
    pub fn build<S: Stack>(self, stack: S) -> io::Result<Arc<NetworkingCore<S>>> {
        let fd_end = usize::try_from(self.fd_start)
            .ok()
            .and_then(|start| start.checked_add(self.max_sockets));
        if self.max_sockets == 0
            || !matches!(fd_end, Some(end) if end <= FD_SETSIZE)
            || self.queue_packets == 0
            || self.queue_bytes == 0
            || self.min_backlog == 0
            || self.min_backlog > self.max_backlog
            || self.timer_rate.is_zero()
        {
            return Err(errno::error(libc::EINVAL));
        }
        Ok(NetworkingCore::build(stack, self))
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}
