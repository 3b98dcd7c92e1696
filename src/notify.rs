//! Entry points for the notifications of the stack.

use std::sync::MutexGuard;

use crate::queue::Payload;
use crate::stack::{Callbacks, Datagram, LinkFrame, NativeSocket, RawPacket, Segment, Stack};
use crate::table::{Flags, Index, Kind, Role};
use crate::wakeup::Events;
use crate::{NetworkingCore, State};

impl<S: Stack> NetworkingCore<S> {
    /// Lock the table from a callback, the error can't be returned so it's
    /// logged instead.
    fn lock_callback(&self) -> Option<MutexGuard<'_, State>> {
        match self.lock() {
            Ok(state) => Some(state),
            Err(err) => {
                log::error!("dropping stack notification: {err}");
                None
            }
        }
    }

    /// Socket that owns `native`, using the back-pointer stored in it.
    fn owner(&self, state: &State, native: NativeSocket) -> Option<Index> {
        let index = state.table.from_reserved(self.stack.reserved(native))?;
        match state.table.get(index) {
            Some(socket) if socket.native == Some(native) => Some(index),
            _ => {
                log::error!(native = native.0, index = index.0; "back-pointer of native socket points to wrong socket");
                None
            }
        }
    }

    /// Connection of client socket at `index` is established.
    pub(crate) fn client_connected(&self, state: &mut State, index: Index) {
        let Some(socket) = state.table.get_mut(index) else {
            return;
        };
        socket.flags.remove(Flags::CONNECTION_INPROGRESS);
        socket.flags.insert(Flags::CONNECTED);
        if let Some((_, interface)) = socket.native.and_then(|native| self.stack.tcp_local(native)) {
            socket.local_interface = Some(interface);
        }
        log::debug!(fd = state.table.fd(index); "connected");
        let _ = self.drain_tcp(state, index);
        self.wake(state, index, Events::WRITE | Events::READ);
    }

    /// Deliver `datagram` received on the shared `native` socket.
    ///
    /// Sockets connected to the sender take precedence over sockets bound to
    /// the receiving interface, which take precedence over sockets bound to
    /// any interface. Each socket of the best matching class gets a copy.
    fn deliver_datagram(&self, state: &mut State, native: NativeSocket, datagram: Datagram) {
        let source = (datagram.source, datagram.source_port);
        let mut best = Vec::new();
        let mut best_class = u8::MAX;
        for (index, socket) in state.table.iter() {
            if socket.native != Some(native) {
                continue;
            }
            let class = match (socket.peer, socket.local_interface) {
                (Some(peer), _) if peer == source => 0,
                (Some(_), _) => continue,
                (None, Some(interface)) if interface == datagram.interface => 1,
                (None, Some(_)) => continue,
                (None, None) => 2,
            };
            if class < best_class {
                best.clear();
                best_class = class;
            }
            if class == best_class {
                best.push(index);
            }
        }

        if best.is_empty() {
            log::debug!(port = datagram.source_port; "no socket for datagram, dropping it");
            return;
        }
        for index in best {
            let Some(socket) = state.table.get_mut(index) else {
                continue;
            };
            let payload = Payload {
                data: datagram.data.clone(),
                source: Some(source),
                interface: Some(datagram.interface),
            };
            if socket.queue.enqueue(payload) {
                self.wake(state, index, Events::READ);
            } else {
                log::debug!(fd = state.table.fd(index); "receive queue full, dropping datagram");
            }
        }
    }

    /// The connection (attempt) of the stream socket at `index` ended.
    fn disconnected(&self, state: &mut State, index: Index) {
        let Some(socket) = state.table.get(index) else {
            return;
        };
        if socket.flags.contains(Flags::SERVER_SECONDARY) && !socket.flags.contains(Flags::CONNECTED) {
            self.rearm_in_place(state, index);
            return;
        }

        let _ = self.drain_tcp(state, index);
        let Some(socket) = state.table.get_mut(index) else {
            return;
        };
        let mut wake = index;
        if socket.flags.contains(Flags::SERVER_SECONDARY) {
            // Connected but not yet accepted, accept still returns it.
            socket.flags.insert(Flags::DISCONNECTION_REQUEST);
            match socket.role {
                Role::Secondary { master: Some(master) } => wake = master,
                _ => return,
            }
        } else if socket.flags.contains(Flags::CONNECTION_INPROGRESS) {
            socket.flags.remove(Flags::CONNECTION_INPROGRESS);
            socket.set_error(libc::ECONNREFUSED);
            log::debug!(fd = state.table.fd(index); "connection refused");
        } else if socket.flags.contains(Flags::CONNECTED) {
            socket.flags.remove(Flags::CONNECTED);
            socket.flags.insert(Flags::DISCONNECTION_REQUEST);
            log::debug!(fd = state.table.fd(index); "peer closed connection");
        }
        self.wake(state, wake, Events::ALL);
    }
}

impl<S: Stack> Callbacks for NetworkingCore<S> {
    fn on_receive(&self, native: NativeSocket) {
        let Some(mut state) = self.lock_callback() else {
            return;
        };
        let Some(index) = self.owner(&state, native) else {
            return;
        };
        match state.table.get(index).map(|socket| socket.kind) {
            Some(Kind::Stream) => {
                if self.drain_tcp(&mut state, index) {
                    self.wake(&mut state, index, Events::READ);
                }
            }
            Some(Kind::Datagram) => {
                while let Some(datagram) = self.stack.udp_receive(native) {
                    self.deliver_datagram(&mut state, native, datagram);
                }
            }
            Some(Kind::Raw) | None => {}
        }
    }

    fn on_connection_established(&self, native: NativeSocket) {
        let Some(mut state) = self.lock_callback() else {
            return;
        };
        let Some(index) = self.owner(&state, native) else {
            return;
        };
        let Some(socket) = state.table.get(index) else {
            return;
        };
        if socket.flags.contains(Flags::SERVER_SECONDARY) {
            self.secondary_connected(&mut state, index);
        } else if socket.flags.contains(Flags::CONNECTION_INPROGRESS) {
            self.client_connected(&mut state, index);
        }
    }

    fn on_disconnect(&self, native: NativeSocket) {
        let Some(mut state) = self.lock_callback() else {
            return;
        };
        if let Some(index) = self.owner(&state, native) {
            self.disconnected(&mut state, index);
        }
    }

    fn on_syn_received(&self, native: NativeSocket, segment: &Segment) -> bool {
        let Some(mut state) = self.lock_callback() else {
            return false;
        };
        let Some(index) = self.owner(&state, native) else {
            return false;
        };
        let matched = self.match_syn(&mut state, index, segment).is_some();
        if !matched {
            log::debug!(port = segment.local_port, interface = segment.interface; "no listener for connection request");
        }
        matched
    }

    fn on_raw_packet(&self, packet: &RawPacket) -> bool {
        match self.lock_callback() {
            Some(mut state) => self.dispatch_raw(&mut state, packet),
            None => false,
        }
    }

    fn on_link_frame(&self, frame: &LinkFrame) -> bool {
        match self.lock_callback() {
            Some(mut state) => self.dispatch_link(&mut state, frame),
            None => false,
        }
    }
}
