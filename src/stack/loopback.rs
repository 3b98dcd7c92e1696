//! In-memory IP stack.
//!
//! [`Loopback`] implements [`Stack`] without any real network, everything
//! sent to one of its interfaces is delivered back to it. It's meant for
//! testing the BSD layer and for applications that only talk to themselves.
//!
//! Interface 0 is always the loopback interface (`127.0.0.1`), additional
//! interfaces can be added using [`Loopback::with_interfaces`]. Packets sent
//! to any address that's not local are silently dropped, connection attempts
//! to such addresses are never answered.
//!
//! Notifications are delivered from a background thread (the "IP thread"),
//! never from within one of the [`Stack`] methods. Use [`Loopback::flush`] to
//! wait until all notifications are delivered.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::{fmt, io, thread};

use crate::stack::{
    Callbacks, Datagram, IpAddress, LinkFrame, NativeSocket, RawPacket, Segment, Stack, Status, TcpState,
};

/// Maximum number of unread bytes a TCP socket accepts.
const WINDOW: usize = 65535;
/// Maximum number of unread datagrams per UDP socket.
const UDP_QUEUE: usize = 16;
/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65507;
const FIRST_EPHEMERAL_PORT: u16 = 49152;
const LOCALHOST: IpAddress = IpAddress::V4(0x7f00_0001);

/// In-memory IP stack, see the [module documentation](self).
pub struct Loopback {
    shared: Arc<Shared>,
    /// Dropping this stops the IP thread.
    events: Sender<Event>,
}

/// State shared with the IP thread.
struct Shared {
    inner: Mutex<Inner>,
    callbacks: Mutex<Option<Weak<dyn Callbacks>>>,
    /// Number of events posted, but not yet processed.
    pending: Mutex<usize>,
    idle: Condvar,
}

struct Inner {
    interfaces: Vec<IpAddress>,
    sockets: HashMap<u32, Native>,
    next_socket: u32,
    /// Bound TCP client ports.
    tcp_ports: HashMap<u16, u32>,
    udp_ports: HashMap<u16, u32>,
    listeners: HashMap<u16, Listener>,
    next_port: u16,
    unclaimed_packets: usize,
    dropped_datagrams: usize,
}

struct Native {
    reserved: Option<usize>,
    protocol: Protocol,
}

enum Protocol {
    Tcp(Tcp),
    Udp(Udp),
}

struct Tcp {
    state: TcpState,
    /// Zero if not bound.
    port: u16,
    local: Option<(IpAddress, usize)>,
    peer: Option<(IpAddress, u16)>,
    /// Native socket at the other end of the connection.
    remote: Option<u32>,
    received: VecDeque<u8>,
}

struct Udp {
    port: Option<u16>,
    received: VecDeque<Datagram>,
}

struct Listener {
    /// Socket receiving the next connection.
    armed: Option<u32>,
    backlog: usize,
    /// Connection requests that arrived while no socket was armed.
    pending: VecDeque<Pending>,
}

struct Pending {
    client: u32,
    segment: Segment,
}

/// Work for the IP thread.
enum Event {
    /// Connection request from `client` arrived.
    Connect { client: u32, segment: Segment },
    /// Connection attempt of `client` got no answer.
    Timeout(u32),
    Established(u32),
    Receive(u32),
    Disconnect(u32),
    Udp {
        packet: RawPacket,
        port: u16,
        datagram: Datagram,
    },
    Raw(RawPacket),
    Link(LinkFrame),
}

impl Loopback {
    /// Create a stack with only the loopback interface.
    pub fn new() -> io::Result<Loopback> {
        Loopback::with_interfaces(Vec::new())
    }

    /// Create a stack with the loopback interface (interface 0) and an
    /// interface for each address in `addresses`.
    pub fn with_interfaces<I>(addresses: I) -> io::Result<Loopback>
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let mut interfaces = vec![LOCALHOST];
        interfaces.extend(addresses.into_iter().map(IpAddress::from));
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                interfaces,
                sockets: HashMap::new(),
                next_socket: 1,
                tcp_ports: HashMap::new(),
                udp_ports: HashMap::new(),
                listeners: HashMap::new(),
                next_port: FIRST_EPHEMERAL_PORT,
                unclaimed_packets: 0,
                dropped_datagrams: 0,
            }),
            callbacks: Mutex::new(None),
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });
        let (events, receiver) = mpsc::channel();
        let thread_shared = shared.clone();
        // The thread stops once `events` is dropped.
        let _ = thread::Builder::new()
            .name("bsdsock-loopback".into())
            .spawn(move || thread_shared.run(receiver))?;
        Ok(Loopback { shared, events })
    }

    /// Block until all notifications are delivered.
    ///
    /// Notifications can trigger new notifications, e.g. an accepted
    /// connection arming a new listener, this waits until none are left.
    ///
    /// # Notes
    ///
    /// Must not be called from within a [`Callbacks`] method.
    pub fn flush(&self) {
        let mut pending = lock(&self.shared.pending);
        while *pending != 0 {
            pending = self.shared.idle.wait(pending).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of raw packets and link frames no socket claimed.
    pub fn unclaimed_packets(&self) -> usize {
        self.inner().unclaimed_packets
    }

    /// Number of UDP datagrams dropped because no socket was bound to the
    /// port, or its queue was full.
    pub fn dropped_datagrams(&self) -> usize {
        self.inner().dropped_datagrams
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.shared.inner)
    }

    fn post(&self, event: Event) {
        *lock(&self.shared.pending) += 1;
        if self.events.send(event).is_err() {
            log::error!("loopback IP thread stopped, dropping event");
            self.shared.done();
        }
    }
}

/// Lock `mutex`, ignoring poisoning.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn run(&self, events: Receiver<Event>) {
        log::trace!("loopback IP thread started");
        for event in events {
            let callbacks = lock(&self.callbacks).as_ref().and_then(Weak::upgrade);
            match callbacks {
                Some(callbacks) => self.process(&*callbacks, event),
                None => log::trace!("no callbacks attached, dropping event"),
            }
            self.done();
        }
        log::trace!("loopback IP thread stopped");
    }

    fn done(&self) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    /// Process a single event.
    ///
    /// The `inner` lock is never held while calling `callbacks`, the
    /// callbacks call back into the stack.
    fn process(&self, callbacks: &dyn Callbacks, event: Event) {
        match event {
            Event::Connect { client, segment } => self.connect(callbacks, client, &segment),
            Event::Timeout(client) => {
                if let Some(tcp) = lock(&self.inner).tcp(client) {
                    if tcp.state == TcpState::SynSent {
                        log::trace!(socket = client; "connection attempt timed out");
                        tcp.state = TcpState::Closed;
                    }
                }
            }
            Event::Established(socket) => callbacks.on_connection_established(NativeSocket(socket)),
            Event::Receive(socket) => callbacks.on_receive(NativeSocket(socket)),
            Event::Disconnect(socket) => callbacks.on_disconnect(NativeSocket(socket)),
            Event::Udp {
                packet,
                port,
                datagram,
            } => {
                if callbacks.on_raw_packet(&packet) {
                    return;
                }
                let receiver = lock(&self.inner).queue_datagram(port, datagram);
                if let Some(socket) = receiver {
                    callbacks.on_receive(NativeSocket(socket));
                }
            }
            Event::Raw(packet) => {
                if !callbacks.on_raw_packet(&packet) {
                    log::trace!(protocol = packet.protocol; "unclaimed raw packet");
                    lock(&self.inner).unclaimed_packets += 1;
                }
            }
            Event::Link(frame) => {
                if !callbacks.on_link_frame(&frame) {
                    lock(&self.inner).unclaimed_packets += 1;
                }
            }
        }
    }

    /// Handle a connection request of `client`.
    fn connect(&self, callbacks: &dyn Callbacks, client: u32, segment: &Segment) {
        let mut inner = lock(&self.inner);
        if !inner.tcp(client).is_some_and(|tcp| tcp.state == TcpState::SynSent) {
            // Client gave up.
            return;
        }
        let Some(listener) = inner.listeners.get_mut(&segment.local_port) else {
            log::trace!(port = segment.local_port; "no listener, refusing connection");
            inner.close(client);
            drop(inner);
            callbacks.on_disconnect(NativeSocket(client));
            return;
        };
        let Some(server) = listener.armed else {
            if listener.pending.len() < listener.backlog {
                log::trace!(port = segment.local_port; "queueing connection request");
                listener.pending.push_back(Pending {
                    client,
                    segment: segment.clone(),
                });
            } else {
                log::trace!(port = segment.local_port; "backlog full, refusing connection");
                inner.close(client);
                drop(inner);
                callbacks.on_disconnect(NativeSocket(client));
            }
            return;
        };
        drop(inner);

        let accepted = callbacks.on_syn_received(NativeSocket(server), segment);

        let mut inner = lock(&self.inner);
        let armed = inner
            .listeners
            .get(&segment.local_port)
            .is_some_and(|listener| listener.armed == Some(server));
        let waiting = inner.tcp(client).is_some_and(|tcp| tcp.state == TcpState::SynSent);
        if accepted && armed && waiting {
            if let Some(listener) = inner.listeners.get_mut(&segment.local_port) {
                listener.armed = None;
            }
            inner.establish(server, client, segment);
            drop(inner);
            callbacks.on_connection_established(NativeSocket(client));
            callbacks.on_connection_established(NativeSocket(server));
            return;
        }

        if waiting {
            inner.close(client);
        }
        drop(inner);
        if waiting {
            callbacks.on_disconnect(NativeSocket(client));
        }
        if accepted {
            // Matched, but the connection fell through, the listener must be
            // armed again.
            callbacks.on_disconnect(NativeSocket(server));
        }
    }
}

impl Inner {
    fn tcp(&mut self, socket: u32) -> Option<&mut Tcp> {
        match self.sockets.get_mut(&socket) {
            Some(Native {
                protocol: Protocol::Tcp(tcp),
                ..
            }) => Some(tcp),
            _ => None,
        }
    }

    fn udp(&mut self, socket: u32) -> Option<&mut Udp> {
        match self.sockets.get_mut(&socket) {
            Some(Native {
                protocol: Protocol::Udp(udp),
                ..
            }) => Some(udp),
            _ => None,
        }
    }

    fn create(&mut self, protocol: Protocol) -> Result<NativeSocket, Status> {
        let id = self.next_socket;
        self.next_socket = self.next_socket.checked_add(1).ok_or(Status::NoMemory)?;
        self.sockets.insert(
            id,
            Native {
                reserved: None,
                protocol,
            },
        );
        Ok(NativeSocket(id))
    }

    /// Interface `address` belongs to, `None` if it's not a local address.
    fn interface_of(&self, address: IpAddress) -> Option<usize> {
        if address.is_unspecified() {
            return Some(0);
        }
        if let Some(interface) = self.interfaces.iter().position(|a| *a == address) {
            return Some(interface);
        }
        match address {
            IpAddress::V4(addr) if addr >> 24 == 127 => Some(0),
            IpAddress::V6([0, 0, 0, 1]) => Some(0),
            _ => None,
        }
    }

    /// Source address for packets to `destination` sent on `interface`.
    fn source(&self, interface: usize, destination: IpAddress) -> IpAddress {
        let address = self.interfaces.get(interface).copied().unwrap_or(LOCALHOST);
        if destination.is_ipv6() && !address.is_ipv6() {
            IpAddress::V6([0, 0, 0, 1])
        } else {
            address
        }
    }

    /// Pick a free port, `in_use` returns true for ports that are taken.
    fn ephemeral_port<F>(&mut self, in_use: F) -> Result<u16, Status>
    where
        F: Fn(&Inner, u16) -> bool,
    {
        for _ in FIRST_EPHEMERAL_PORT..=u16::MAX {
            let port = self.next_port;
            self.next_port = port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            if !in_use(self, port) {
                return Ok(port);
            }
        }
        Err(Status::NoFreePorts)
    }

    /// Connect `server` and `client`.
    fn establish(&mut self, server: u32, client: u32, segment: &Segment) {
        let client_local = self.tcp(client).and_then(|tcp| tcp.local.map(|(address, _)| (address, tcp.port)));
        let local_address = if segment.local_address.is_unspecified() {
            self.interfaces
                .get(segment.interface)
                .copied()
                .unwrap_or(LOCALHOST)
        } else {
            segment.local_address
        };
        if let Some(tcp) = self.tcp(server) {
            tcp.state = TcpState::Established;
            tcp.port = segment.local_port;
            tcp.local = Some((local_address, segment.interface));
            tcp.peer = client_local;
            tcp.remote = Some(client);
        }
        if let Some(tcp) = self.tcp(client) {
            tcp.state = TcpState::Established;
            tcp.remote = Some(server);
        }
        log::trace!(server = server, client = client, port = segment.local_port; "connection established");
    }

    /// Mark `socket` closed without any handshake.
    fn close(&mut self, socket: u32) {
        if let Some(tcp) = self.tcp(socket) {
            tcp.state = TcpState::Closed;
            tcp.remote = None;
        }
    }

    /// Queue `datagram` on the socket bound to `port`, returns the socket.
    fn queue_datagram(&mut self, port: u16, datagram: Datagram) -> Option<u32> {
        let Some(socket) = self.udp_ports.get(&port).copied() else {
            log::trace!(port = port; "no socket bound, dropping datagram");
            self.dropped_datagrams += 1;
            return None;
        };
        match self.udp(socket) {
            Some(udp) if udp.received.len() < UDP_QUEUE => {
                udp.received.push_back(datagram);
                Some(socket)
            }
            _ => {
                log::trace!(port = port; "queue full, dropping datagram");
                self.dropped_datagrams += 1;
                None
            }
        }
    }

    /// Remove `socket` from the connection requests queued on any port.
    fn forget_pending(&mut self, socket: u32) {
        for listener in self.listeners.values_mut() {
            listener.pending.retain(|pending| pending.client != socket);
        }
    }
}

/// Build an IP header for a packet with `payload_len` bytes.
fn ip_header(protocol: u8, source: IpAddress, destination: IpAddress, payload_len: usize) -> Vec<u8> {
    match (source, destination) {
        (IpAddress::V4(source), IpAddress::V4(destination)) => {
            let total = u16::try_from(20 + payload_len).unwrap_or(u16::MAX);
            let mut header = Vec::with_capacity(20);
            header.extend_from_slice(&[0x45, 0]);
            header.extend_from_slice(&total.to_be_bytes());
            header.extend_from_slice(&[0, 0, 0x40, 0, 64, protocol, 0, 0]);
            header.extend_from_slice(&source.to_be_bytes());
            header.extend_from_slice(&destination.to_be_bytes());
            let checksum = checksum(&header);
            header[10..12].copy_from_slice(&checksum.to_be_bytes());
            header
        }
        (source, destination) => {
            let length = u16::try_from(payload_len).unwrap_or(u16::MAX);
            let mut header = Vec::with_capacity(40);
            header.extend_from_slice(&[0x60, 0, 0, 0]);
            header.extend_from_slice(&length.to_be_bytes());
            header.extend_from_slice(&[protocol, 64]);
            for address in [source, destination] {
                for word in v6_words(address) {
                    header.extend_from_slice(&word.to_be_bytes());
                }
            }
            header
        }
    }
}

fn v6_words(address: IpAddress) -> [u32; 4] {
    match address {
        IpAddress::V6(words) => words,
        // IPv4-mapped.
        IpAddress::V4(addr) => [0, 0, 0xffff, addr],
    }
}

/// Internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = data
        .chunks(2)
        .map(|chunk| u32::from(u16::from_be_bytes([chunk[0], chunk.get(1).copied().unwrap_or(0)])))
        .sum::<u32>();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

impl Stack for Loopback {
    fn attach(&self, callbacks: Weak<dyn Callbacks>) {
        *lock(&self.shared.callbacks) = Some(callbacks);
    }

    fn interface_address(&self, interface: usize) -> Option<IpAddress> {
        self.inner().interfaces.get(interface).copied()
    }

    fn interface_count(&self) -> usize {
        self.inner().interfaces.len()
    }

    fn tcp_create(&self) -> Result<NativeSocket, Status> {
        self.inner().create(Protocol::Tcp(Tcp {
            state: TcpState::Closed,
            port: 0,
            local: None,
            peer: None,
            remote: None,
            received: VecDeque::new(),
        }))
    }

    fn udp_create(&self) -> Result<NativeSocket, Status> {
        self.inner().create(Protocol::Udp(Udp {
            port: None,
            received: VecDeque::new(),
        }))
    }

    fn delete(&self, socket: NativeSocket) -> Result<(), Status> {
        let mut inner = self.inner();
        let native = inner.sockets.remove(&socket.0).ok_or(Status::InvalidSocket)?;
        match native.protocol {
            Protocol::Tcp(tcp) => {
                if inner.tcp_ports.get(&tcp.port) == Some(&socket.0) {
                    let _ = inner.tcp_ports.remove(&tcp.port);
                }
                for listener in inner.listeners.values_mut() {
                    if listener.armed == Some(socket.0) {
                        listener.armed = None;
                    }
                }
                inner.forget_pending(socket.0);
                // Abortive close.
                let remote = tcp.remote.filter(|_| tcp.state == TcpState::Established);
                if let Some(remote) = remote {
                    if let Some(peer) = inner.tcp(remote) {
                        peer.state = TcpState::CloseWait;
                        peer.remote = None;
                        drop(inner);
                        self.post(Event::Disconnect(remote));
                    }
                }
            }
            Protocol::Udp(udp) => {
                if let Some(port) = udp.port {
                    if inner.udp_ports.get(&port) == Some(&socket.0) {
                        let _ = inner.udp_ports.remove(&port);
                    }
                }
            }
        }
        log::trace!(socket = socket.0; "deleted socket");
        Ok(())
    }

    fn set_reserved(&self, socket: NativeSocket, value: Option<usize>) {
        if let Some(native) = self.inner().sockets.get_mut(&socket.0) {
            native.reserved = value;
        }
    }

    fn reserved(&self, socket: NativeSocket) -> Option<usize> {
        self.inner().sockets.get(&socket.0)?.reserved
    }

    fn tcp_bind(&self, socket: NativeSocket, port: u16) -> Result<u16, Status> {
        let mut inner = self.inner();
        let bound = inner.tcp(socket.0).ok_or(Status::InvalidSocket)?.port;
        if bound != 0 {
            return Ok(bound);
        }
        let port = if port == 0 {
            inner.ephemeral_port(|inner, port| {
                inner.tcp_ports.contains_key(&port) || inner.listeners.contains_key(&port)
            })?
        } else if inner.tcp_ports.contains_key(&port) {
            return Err(Status::PortUnavailable);
        } else {
            port
        };
        let _ = inner.tcp_ports.insert(port, socket.0);
        if let Some(tcp) = inner.tcp(socket.0) {
            tcp.port = port;
        }
        Ok(port)
    }

    fn tcp_unbind(&self, socket: NativeSocket) -> Result<(), Status> {
        let mut inner = self.inner();
        let tcp = inner.tcp(socket.0).ok_or(Status::InvalidSocket)?;
        let port = std::mem::take(&mut tcp.port);
        if port == 0 {
            return Err(Status::NotBound);
        }
        if inner.tcp_ports.get(&port) == Some(&socket.0) {
            let _ = inner.tcp_ports.remove(&port);
        }
        Ok(())
    }

    fn tcp_connect(&self, socket: NativeSocket, address: IpAddress, port: u16) -> Result<(), Status> {
        let mut inner = self.inner();
        let interface = inner.interface_of(address);
        let source = interface.map(|interface| inner.source(interface, address));
        let tcp = inner.tcp(socket.0).ok_or(Status::InvalidSocket)?;
        if tcp.port == 0 {
            return Err(Status::NotBound);
        } else if tcp.state != TcpState::Closed {
            return Err(Status::AlreadyConnected);
        }
        tcp.state = TcpState::SynSent;
        tcp.peer = Some((address, port));
        tcp.received.clear();
        let event = match (interface, source) {
            (Some(interface), Some(source)) => {
                tcp.local = Some((source, interface));
                let local_address = if address.is_unspecified() { source } else { address };
                Event::Connect {
                    client: socket.0,
                    segment: Segment {
                        local_port: port,
                        local_address,
                        interface,
                        peer_address: source,
                        peer_port: tcp.port,
                    },
                }
            }
            _ => {
                log::trace!(socket = socket.0; "connecting to unreachable address");
                Event::Timeout(socket.0)
            }
        };
        drop(inner);
        self.post(event);
        Err(Status::InProgress)
    }

    fn tcp_listen(&self, port: u16, socket: NativeSocket, backlog: usize) -> Result<(), Status> {
        let mut inner = self.inner();
        if inner.listeners.contains_key(&port) {
            return Err(Status::DuplicateListen);
        }
        let tcp = inner.tcp(socket.0).ok_or(Status::InvalidSocket)?;
        tcp.state = TcpState::Listen;
        tcp.port = port;
        let _ = inner.listeners.insert(
            port,
            Listener {
                armed: Some(socket.0),
                backlog,
                pending: VecDeque::new(),
            },
        );
        log::trace!(port = port, backlog = backlog; "listening");
        Ok(())
    }

    fn tcp_relisten(&self, port: u16, socket: NativeSocket) -> Result<(), Status> {
        let mut inner = self.inner();
        if !inner.listeners.contains_key(&port) {
            return Err(Status::NotListening);
        }
        let tcp = inner.tcp(socket.0).ok_or(Status::InvalidSocket)?;
        tcp.state = TcpState::Listen;
        tcp.port = port;
        if let Some(listener) = inner.listeners.get_mut(&port) {
            listener.armed = Some(socket.0);
        }
        Ok(())
    }

    fn tcp_unlisten(&self, port: u16) -> Result<(), Status> {
        let mut inner = self.inner();
        let listener = inner.listeners.remove(&port).ok_or(Status::NotListening)?;
        if let Some(tcp) = listener.armed.and_then(|armed| inner.tcp(armed)) {
            tcp.state = TcpState::Closed;
        }
        let mut refused = Vec::new();
        for pending in listener.pending {
            inner.close(pending.client);
            refused.push(pending.client);
        }
        drop(inner);
        for client in refused {
            self.post(Event::Disconnect(client));
        }
        log::trace!(port = port; "stopped listening");
        Ok(())
    }

    fn tcp_accept(&self, socket: NativeSocket) -> Result<(), Status> {
        let mut inner = self.inner();
        let tcp = inner.tcp(socket.0).ok_or(Status::InvalidSocket)?;
        if tcp.state != TcpState::Listen {
            return Err(Status::NotListening);
        }
        let port = tcp.port;
        let listener = inner.listeners.get_mut(&port).ok_or(Status::NotListening)?;
        if listener.armed != Some(socket.0) {
            return Err(Status::NotListening);
        }
        let Some(pending) = listener.pending.pop_front() else {
            return Err(Status::InProgress);
        };
        if !inner
            .tcp(pending.client)
            .is_some_and(|tcp| tcp.state == TcpState::SynSent)
        {
            // Client went away, have the listener armed again.
            inner.close(socket.0);
            drop(inner);
            self.post(Event::Disconnect(socket.0));
            return Err(Status::InProgress);
        }
        if let Some(listener) = inner.listeners.get_mut(&port) {
            listener.armed = None;
        }
        inner.establish(socket.0, pending.client, &pending.segment);
        drop(inner);
        self.post(Event::Established(pending.client));
        Ok(())
    }

    fn tcp_unaccept(&self, socket: NativeSocket) -> Result<(), Status> {
        let mut inner = self.inner();
        let tcp = inner.tcp(socket.0).ok_or(Status::InvalidSocket)?;
        tcp.state = TcpState::Closed;
        tcp.local = None;
        tcp.peer = None;
        tcp.remote = None;
        tcp.received.clear();
        Ok(())
    }

    fn tcp_pending_connection(&self, port: u16) -> Option<Segment> {
        let inner = self.inner();
        let pending = inner.listeners.get(&port)?.pending.front()?;
        Some(pending.segment.clone())
    }

    fn tcp_refuse_pending(&self, port: u16) {
        let mut inner = self.inner();
        let Some(pending) = inner
            .listeners
            .get_mut(&port)
            .and_then(|listener| listener.pending.pop_front())
        else {
            return;
        };
        inner.close(pending.client);
        drop(inner);
        self.post(Event::Disconnect(pending.client));
    }

    fn tcp_disconnect(&self, socket: NativeSocket) -> Result<(), Status> {
        let mut inner = self.inner();
        let tcp = inner.tcp(socket.0).ok_or(Status::InvalidSocket)?;
        let remote = tcp.remote;
        match tcp.state {
            TcpState::SynSent | TcpState::SynReceived => {
                tcp.state = TcpState::Closed;
                inner.forget_pending(socket.0);
                return Ok(());
            }
            TcpState::Established => {
                tcp.state = TcpState::FinWait;
                if let Some(peer) = remote.and_then(|remote| inner.tcp(remote)) {
                    peer.state = TcpState::CloseWait;
                }
            }
            TcpState::CloseWait => {
                tcp.state = TcpState::Closed;
                tcp.remote = None;
                match remote.and_then(|remote| inner.tcp(remote)) {
                    Some(peer) if peer.state == TcpState::FinWait => {
                        peer.state = TcpState::TimedWait;
                        peer.remote = None;
                    }
                    _ => return Ok(()),
                }
            }
            _ => return Err(Status::NotConnected),
        }
        drop(inner);
        if let Some(remote) = remote {
            self.post(Event::Disconnect(remote));
        }
        Ok(())
    }

    fn tcp_send(&self, socket: NativeSocket, data: &[u8]) -> Result<usize, Status> {
        let mut inner = self.inner();
        let tcp = inner.tcp(socket.0).ok_or(Status::InvalidSocket)?;
        if tcp.state != TcpState::Established {
            return Err(Status::NotConnected);
        }
        let remote = tcp.remote.ok_or(Status::NotConnected)?;
        let peer = inner.tcp(remote).ok_or(Status::NotConnected)?;
        let room = WINDOW.saturating_sub(peer.received.len());
        if room == 0 {
            return Err(Status::WindowFull);
        }
        let n = data.len().min(room);
        peer.received.extend(&data[..n]);
        drop(inner);
        self.post(Event::Receive(remote));
        Ok(n)
    }

    fn tcp_receive(&self, socket: NativeSocket, max: usize) -> Option<Vec<u8>> {
        let mut inner = self.inner();
        let tcp = inner.tcp(socket.0)?;
        if tcp.received.is_empty() {
            return None;
        }
        let n = tcp.received.len().min(max);
        Some(tcp.received.drain(..n).collect())
    }

    fn tcp_state(&self, socket: NativeSocket) -> TcpState {
        self.inner()
            .tcp(socket.0)
            .map_or(TcpState::Closed, |tcp| tcp.state)
    }

    fn tcp_peer(&self, socket: NativeSocket) -> Option<(IpAddress, u16)> {
        let mut inner = self.inner();
        let tcp = inner.tcp(socket.0)?;
        match tcp.state {
            TcpState::Established | TcpState::CloseWait | TcpState::FinWait => tcp.peer,
            _ => None,
        }
    }

    fn tcp_local(&self, socket: NativeSocket) -> Option<(IpAddress, usize)> {
        self.inner().tcp(socket.0)?.local
    }

    fn udp_bind(&self, socket: NativeSocket, port: u16) -> Result<u16, Status> {
        let mut inner = self.inner();
        if inner.udp(socket.0).ok_or(Status::InvalidSocket)?.port.is_some() {
            return Err(Status::AlreadyBound);
        }
        let port = if port == 0 {
            inner.ephemeral_port(|inner, port| inner.udp_ports.contains_key(&port))?
        } else if inner.udp_ports.contains_key(&port) {
            return Err(Status::PortUnavailable);
        } else {
            port
        };
        let _ = inner.udp_ports.insert(port, socket.0);
        if let Some(udp) = inner.udp(socket.0) {
            udp.port = Some(port);
        }
        Ok(port)
    }

    fn udp_unbind(&self, socket: NativeSocket) -> Result<(), Status> {
        let mut inner = self.inner();
        let port = inner
            .udp(socket.0)
            .ok_or(Status::InvalidSocket)?
            .port
            .take()
            .ok_or(Status::NotBound)?;
        if inner.udp_ports.get(&port) == Some(&socket.0) {
            let _ = inner.udp_ports.remove(&port);
        }
        Ok(())
    }

    fn udp_send(
        &self,
        socket: NativeSocket,
        address: IpAddress,
        port: u16,
        data: &[u8],
        interface: Option<usize>,
    ) -> Result<(), Status> {
        if data.len() > MAX_DATAGRAM || port == 0 {
            return Err(Status::InvalidParameters);
        }
        let mut inner = self.inner();
        let source_port = inner
            .udp(socket.0)
            .ok_or(Status::InvalidSocket)?
            .port
            .ok_or(Status::NotBound)?;
        let Some(destination) = inner.interface_of(address) else {
            log::trace!(port = port; "dropping datagram to non-local address");
            return Ok(());
        };
        let source = match interface {
            Some(interface) if interface >= inner.interfaces.len() => return Err(Status::InvalidInterface),
            Some(interface) => inner.source(interface, address),
            None => inner.source(destination, address),
        };
        drop(inner);

        let mut packet = ip_header(17, source, address, 8 + data.len());
        let header_len = packet.len();
        let udp_len = u16::try_from(8 + data.len()).unwrap_or(u16::MAX);
        packet.extend_from_slice(&source_port.to_be_bytes());
        packet.extend_from_slice(&port.to_be_bytes());
        packet.extend_from_slice(&udp_len.to_be_bytes());
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(data);
        self.post(Event::Udp {
            packet: RawPacket {
                protocol: 17,
                source,
                interface: destination,
                header_len,
                data: packet,
            },
            port,
            datagram: Datagram {
                data: data.to_vec(),
                source,
                source_port,
                destination: address,
                interface: destination,
            },
        });
        Ok(())
    }

    fn udp_receive(&self, socket: NativeSocket) -> Option<Datagram> {
        self.inner().udp(socket.0)?.received.pop_front()
    }

    fn raw_send(
        &self,
        protocol: u8,
        address: IpAddress,
        data: &[u8],
        header_included: bool,
    ) -> Result<(), Status> {
        let inner = self.inner();
        let Some(interface) = inner.interface_of(address) else {
            return Ok(());
        };
        let source = inner.source(interface, address);
        drop(inner);

        let (header_len, data) = if header_included {
            let header_len = match (address, data.first()) {
                (IpAddress::V4(_), Some(first)) => usize::from(first & 0x0f) * 4,
                (IpAddress::V6(_), Some(_)) => 40,
                (_, None) => 0,
            };
            if header_len == 0 || data.len() < header_len {
                return Err(Status::InvalidParameters);
            }
            (header_len, data.to_vec())
        } else {
            let mut packet = ip_header(protocol, source, address, data.len());
            let header_len = packet.len();
            packet.extend_from_slice(data);
            (header_len, packet)
        };
        self.post(Event::Raw(RawPacket {
            protocol,
            source,
            interface,
            header_len,
            data,
        }));
        Ok(())
    }

    fn link_send(&self, interface: usize, frame: &[u8]) -> Result<(), Status> {
        if interface >= self.inner().interfaces.len() {
            return Err(Status::InvalidInterface);
        }
        self.post(Event::Link(LinkFrame {
            interface,
            data: frame.to_vec(),
        }));
        Ok(())
    }
}

impl fmt::Debug for Loopback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("Loopback")
            .field("interfaces", &inner.interfaces)
            .field("sockets", &inner.sockets.len())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

#[test]
fn ipv4_header_checksum() {
    let header = ip_header(17, LOCALHOST, LOCALHOST, 13);
    assert_eq!(header.len(), 20);
    assert_eq!(&header[2..4], &33u16.to_be_bytes());
    assert_eq!(header[9], 17);
    // Checksum over a header including its checksum is zero.
    assert_eq!(checksum(&header), 0);
}

#[test]
fn local_addresses() {
    let loopback = Loopback::with_interfaces(["10.0.0.1".parse().unwrap()]).unwrap();
    let inner = loopback.inner();
    assert_eq!(inner.interface_of(LOCALHOST), Some(0));
    assert_eq!(inner.interface_of(IpAddress::V4(0x7f00_0002)), Some(0));
    assert_eq!(inner.interface_of(IpAddress::V4(0x0a00_0001)), Some(1));
    assert_eq!(inner.interface_of(IpAddress::V4(0x0a00_0002)), None);
    assert_eq!(inner.interface_of(IpAddress::V4_ANY), Some(0));
}
