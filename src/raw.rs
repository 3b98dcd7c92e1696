//! Raw protocol demultiplexer.
//!
//! Raw sockets are registered in one of a fixed number of buckets, based on
//! their protocol. Incoming packets are matched against the sockets in the
//! bucket of the packet's protocol only.

use crate::queue::Payload;
use crate::stack::{LinkFrame, RawPacket, Stack};
use crate::table::{Flags, Index};
use crate::wakeup::Events;
use crate::{NetworkingCore, State};

/// Number of buckets, must be a power of two.
const BUCKETS: usize = 32;

/// Ethernet protocol that matches all frames.
pub(crate) const ETH_P_ALL: u16 = 0x0003;

/// Registry of raw sockets.
#[derive(Debug)]
pub(crate) struct RawDemux {
    buckets: [Vec<Index>; BUCKETS],
    /// Link layer (`AF_PACKET`) sockets.
    link: Vec<Index>,
}

impl RawDemux {
    pub(crate) fn new() -> RawDemux {
        RawDemux {
            buckets: std::array::from_fn(|_| Vec::new()),
            link: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, protocol: u16, index: Index) {
        let bucket = &mut self.buckets[bucket(protocol)];
        if !bucket.contains(&index) {
            bucket.push(index);
        }
    }

    pub(crate) fn unregister(&mut self, protocol: u16, index: Index) {
        self.buckets[bucket(protocol)].retain(|i| *i != index);
    }

    pub(crate) fn register_link(&mut self, index: Index) {
        if !self.link.contains(&index) {
            self.link.push(index);
        }
    }

    pub(crate) fn unregister_link(&mut self, index: Index) {
        self.link.retain(|i| *i != index);
    }

    /// Sockets that may be interested in packets for `protocol`, in
    /// registration order.
    fn candidates(&self, protocol: u16) -> &[Index] {
        &self.buckets[bucket(protocol)]
    }
}

const fn bucket(protocol: u16) -> usize {
    protocol as usize & (BUCKETS - 1)
}

impl<S: Stack> NetworkingCore<S> {
    /// Deliver `packet` to the matching raw socket(s).
    ///
    /// Returns true if at least one socket took the packet, even if its
    /// queue was full and the copy was dropped.
    pub(crate) fn dispatch_raw(&self, state: &mut State, packet: &RawPacket) -> bool {
        let protocol = u16::from(packet.protocol);
        let candidates = state.raw.candidates(protocol).to_vec();
        let mut consumed = false;
        for index in candidates {
            let Some(socket) = state.table.get_mut(index) else {
                log::error!(index = index.0; "stale raw socket in demux");
                continue;
            };
            if !socket.flags.contains(Flags::RAW_SOCKET)
                || socket.protocol != protocol
                || socket.family != packet.source.family()
                || socket
                    .local_interface
                    .is_some_and(|interface| interface != packet.interface)
            {
                continue;
            }

            // IPv6 raw sockets never see the IP header.
            let strip = socket.flags.contains(Flags::RX_NO_HDR) || packet.source.is_ipv6();
            let data = if strip {
                packet.data.get(packet.header_len..).unwrap_or_default().to_vec()
            } else {
                packet.data.clone()
            };
            let payload = Payload {
                data,
                source: Some((packet.source, 0)),
                interface: Some(packet.interface),
            };
            consumed = true;
            if socket.queue.enqueue(payload) {
                log::trace!(fd = state.table.fd(index), protocol = protocol; "raw packet queued");
                self.wake(state, index, Events::READ);
            } else {
                log::debug!(fd = state.table.fd(index), protocol = protocol; "receive queue full, dropping raw packet");
            }
            if !self.config.duplicate_raw_packets {
                break;
            }
        }
        consumed
    }

    /// Deliver `frame` to all matching link layer sockets.
    pub(crate) fn dispatch_link(&self, state: &mut State, frame: &LinkFrame) -> bool {
        let ether_type = match frame.data.get(12..14) {
            Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
            None => return false,
        };
        let candidates = state.raw.link.clone();
        let mut consumed = false;
        for index in candidates {
            let Some(socket) = state.table.get_mut(index) else {
                continue;
            };
            if (socket.protocol != ETH_P_ALL && socket.protocol != ether_type)
                || socket
                    .local_interface
                    .is_some_and(|interface| interface != frame.interface)
            {
                continue;
            }
            consumed = true;
            let payload = Payload {
                data: frame.data.clone(),
                source: None,
                interface: Some(frame.interface),
            };
            if socket.queue.enqueue(payload) {
                self.wake(state, index, Events::READ);
            } else {
                log::debug!(fd = state.table.fd(index); "receive queue full, dropping frame");
            }
        }
        consumed
    }
}

#[test]
fn buckets_by_protocol() {
    let mut demux = RawDemux::new();
    demux.register(17, Index(1));
    demux.register(6, Index(2));
    // Same bucket as 17.
    demux.register(49, Index(3));
    demux.register(17, Index(1));

    assert_eq!(demux.candidates(17), &[Index(1), Index(3)]);
    assert_eq!(demux.candidates(6), &[Index(2)]);
    assert!(demux.candidates(1).is_empty());

    demux.unregister(17, Index(1));
    assert_eq!(demux.candidates(17), &[Index(3)]);
}
