//! Per socket receive queue.

use std::collections::VecDeque;

use crate::stack::IpAddress;

/// Unit of buffered data: a TCP segment, UDP datagram or raw packet.
#[derive(Debug)]
pub(crate) struct Payload {
    pub(crate) data: Vec<u8>,
    /// Sender of datagrams and raw packets, `None` for TCP.
    pub(crate) source: Option<(IpAddress, u16)>,
    /// Interface the payload arrived on.
    pub(crate) interface: Option<usize>,
}

impl Payload {
    pub(crate) const fn stream(data: Vec<u8>) -> Payload {
        Payload {
            data,
            source: None,
            interface: None,
        }
    }
}

/// FIFO of received payloads.
///
/// Enforces two caps, bytes and packets. An arrival that would push either
/// count past its cap is dropped, the queue is left unchanged.
#[derive(Debug)]
pub(crate) struct ReceiveQueue {
    packets: VecDeque<Payload>,
    /// Bytes of the front packet already read, only used by stream sockets.
    offset: usize,
    /// Unread bytes in the queue.
    bytes: usize,
    max_packets: usize,
    max_bytes: usize,
}

/// Result of a read from the queue.
#[derive(Debug)]
pub(crate) struct Read {
    /// Bytes copied.
    pub(crate) n: usize,
    pub(crate) source: Option<(IpAddress, u16)>,
    pub(crate) interface: Option<usize>,
}

impl ReceiveQueue {
    pub(crate) const fn new(max_packets: usize, max_bytes: usize) -> ReceiveQueue {
        ReceiveQueue {
            packets: VecDeque::new(),
            offset: 0,
            bytes: 0,
            max_packets,
            max_bytes,
        }
    }

    /// Add `payload` to the back of the queue.
    ///
    /// Returns false if the payload was dropped because it doesn't fit.
    pub(crate) fn enqueue(&mut self, payload: Payload) -> bool {
        if self.packets.len() >= self.max_packets
            || self.bytes + payload.data.len() > self.max_bytes
        {
            return false;
        }
        self.bytes += payload.data.len();
        self.packets.push_back(payload);
        true
    }

    /// Copy data from the front of the queue into `buf`.
    ///
    /// For a `stream` the read can span multiple payloads and an unread
    /// remainder is kept for the next read. Otherwise only the front payload
    /// is read and it's removed completely, even if `buf` was too small.
    ///
    /// If `peek` is true the queue is not modified.
    pub(crate) fn peek_or_dequeue(&mut self, buf: &mut [u8], peek: bool, stream: bool) -> Read {
        let Some(front) = self.packets.front() else {
            return Read {
                n: 0,
                source: None,
                interface: None,
            };
        };
        let source = front.source;
        let interface = front.interface;

        if !stream {
            let n = front.data.len().min(buf.len());
            buf[..n].copy_from_slice(&front.data[..n]);
            if !peek {
                let len = front.data.len();
                self.packets.pop_front();
                self.bytes -= len;
            }
            return Read { n, source, interface };
        }

        let mut n = 0;
        let mut offset = self.offset;
        for payload in &self.packets {
            if n == buf.len() {
                break;
            }
            let available = &payload.data[offset..];
            let len = available.len().min(buf.len() - n);
            buf[n..n + len].copy_from_slice(&available[..len]);
            n += len;
            offset = 0;
        }

        if !peek {
            self.consume(n);
        }
        Read { n, source, interface }
    }

    /// Remove `n` stream bytes from the front of the queue.
    fn consume(&mut self, mut n: usize) {
        self.bytes -= n;
        while n > 0 {
            let Some(front) = self.packets.front() else {
                break;
            };
            let left = front.data.len() - self.offset;
            if n >= left {
                n -= left;
                self.offset = 0;
                self.packets.pop_front();
            } else {
                self.offset += n;
                n = 0;
            }
        }
    }

    /// Unread bytes in the queue.
    pub(crate) const fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of queued payloads.
    #[cfg(test)]
    pub(crate) fn packets(&self) -> usize {
        self.packets.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Number of bytes that can still be queued.
    pub(crate) fn room(&self) -> usize {
        if self.packets.len() >= self.max_packets {
            0
        } else {
            self.max_bytes - self.bytes
        }
    }

    pub(crate) const fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Change the byte cap. Already queued data is kept, even if it exceeds
    /// the new cap.
    pub(crate) fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes.max(self.bytes);
    }

    /// Drop all queued payloads.
    pub(crate) fn clear(&mut self) {
        self.packets.clear();
        self.offset = 0;
        self.bytes = 0;
    }
}
