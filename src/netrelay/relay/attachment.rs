use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};

use crate::netrelay::relay::buffer::{
    PendingDatagrams, RelayBuffer, TCP_BUFFER_SIZE, UDP_BUFFER_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        })
    }
}

/// The two ends of a TCP pair. `Response` faces the local service,
/// `Relay` faces the relay server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Response,
    Relay,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Response => Side::Relay,
            Side::Relay => Side::Response,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Side::Response => "response",
            Side::Relay => "relay",
        })
    }
}

/// Identifies a channel inside the relay loop. TCP temp ids and UDP channel
/// ids are issued independently, so the protocol is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub protocol: Protocol,
    pub id: Arc<str>,
}

impl ChannelKey {
    pub fn new(protocol: Protocol, id: &str) -> Self {
        Self {
            protocol,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.protocol, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMeta {
    pub agent_id: String,
    /// Local service port.
    pub proxied_port: u16,
    /// Public port the server exposes for it.
    pub proxy_port: u16,
}

/// What to do after bytes were read from one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDisposition {
    /// Buffer is full; arm the peer's write interest now.
    FlushNow,
    /// First bytes into an empty buffer; recheck after the aggregation window.
    ScheduleRecheck,
    /// A recheck is already pending.
    Wait,
}

#[derive(Debug)]
struct Endpoint {
    stream: Option<TcpStream>,
    token: Option<Token>,
    interest: Interest,
    /// Bytes read from this endpoint, waiting to be written to the peer.
    inbound: RelayBuffer,
    flushed_at: Instant,
    eof: bool,
}

impl Endpoint {
    fn new(now: Instant) -> Self {
        Self {
            stream: None,
            token: None,
            interest: Interest::READABLE,
            inbound: RelayBuffer::with_capacity(TCP_BUFFER_SIZE),
            flushed_at: now,
            eof: false,
        }
    }

    fn close(&mut self, registry: &Registry) {
        if let Some(mut s) = self.stream.take() {
            if self.token.is_some() {
                let _ = registry.deregister(&mut s);
            }
            let _ = s.shutdown(Shutdown::Both);
        }
    }
}

/// One proxied TCP connection: the local service socket plus the data socket
/// to the relay server, with a buffer per direction.
#[derive(Debug)]
pub struct TcpRelayPair {
    pub meta: ChannelMeta,
    temp_id: String,
    response: Endpoint,
    relay: Endpoint,
    created_at: Instant,
    closed: bool,
}

impl TcpRelayPair {
    pub fn new(meta: ChannelMeta, temp_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            meta,
            temp_id: temp_id.into(),
            response: Endpoint::new(now),
            relay: Endpoint::new(now),
            created_at: now,
            closed: false,
        }
    }

    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn attach(&mut self, response: TcpStream, relay: TcpStream) {
        self.response.stream = Some(response);
        self.relay.stream = Some(relay);
    }

    pub fn is_connected(&self) -> bool {
        self.response.stream.is_some() && self.relay.stream.is_some()
    }

    fn end(&self, side: Side) -> &Endpoint {
        match side {
            Side::Response => &self.response,
            Side::Relay => &self.relay,
        }
    }

    fn end_mut(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Response => &mut self.response,
            Side::Relay => &mut self.relay,
        }
    }

    /// Bytes read from `side`, not yet written to its peer.
    pub fn buffer(&self, side: Side) -> &RelayBuffer {
        &self.end(side).inbound
    }

    pub fn buffer_mut(&mut self, side: Side) -> &mut RelayBuffer {
        &mut self.end_mut(side).inbound
    }

    pub fn interest(&self, side: Side) -> Interest {
        self.end(side).interest
    }

    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.response.token.into_iter().chain(self.relay.token)
    }

    /// Register the response side for reads and the relay side for reads and
    /// writes; the relay side has the ready frame queued.
    pub fn register(
        &mut self,
        registry: &Registry,
        response_token: Token,
        relay_token: Token,
    ) -> io::Result<()> {
        for (side, token, interest) in [
            (Side::Response, response_token, Interest::READABLE),
            (Side::Relay, relay_token, Interest::READABLE | Interest::WRITABLE),
        ] {
            let end = self.end_mut(side);
            let stream = end
                .stream
                .as_mut()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            registry.register(stream, token, interest)?;
            end.token = Some(token);
            end.interest = interest;
        }
        Ok(())
    }

    /// Move both sockets from one registry to another, keeping interests.
    pub fn migrate(&mut self, old: &Registry, new: &Registry) -> io::Result<()> {
        for end in [&mut self.response, &mut self.relay] {
            let (Some(stream), Some(token)) = (end.stream.as_mut(), end.token) else {
                continue;
            };
            let _ = old.deregister(stream);
            new.register(stream, token, end.interest)?;
        }
        Ok(())
    }

    /// One read from `side` into its buffer. `Ok(0)` is end of stream.
    pub fn read_side(&mut self, side: Side) -> io::Result<usize> {
        let end = self.end_mut(side);
        let stream = end
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        end.inbound.read_from(stream)
    }

    pub fn note_read(&self, side: Side, was_empty: bool) -> ReadDisposition {
        if self.buffer(side).is_full() {
            ReadDisposition::FlushNow
        } else if was_empty {
            ReadDisposition::ScheduleRecheck
        } else {
            ReadDisposition::Wait
        }
    }

    /// Whether the direction read from `from` has bytes and has not been
    /// flushed for at least `window`.
    pub fn flush_due(&self, from: Side, now: Instant, window: Duration) -> bool {
        let end = self.end(from);
        !self.closed
            && !end.inbound.is_empty()
            && now.saturating_duration_since(end.flushed_at) >= window
    }

    /// Write the peer's buffered bytes into `side` until drained or the
    /// socket would block. Returns `true` when drained.
    pub fn flush_into(&mut self, side: Side, now: Instant) -> io::Result<bool> {
        let (src, dst) = match side {
            Side::Response => (&mut self.relay, &mut self.response),
            Side::Relay => (&mut self.response, &mut self.relay),
        };
        let stream = dst
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        src.flushed_at = now;
        loop {
            if src.inbound.is_empty() {
                return Ok(true);
            }
            match src.inbound.write_to(stream) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Add or drop write interest on `side`. No-op when unchanged.
    pub fn set_write_interest(&mut self, registry: &Registry, side: Side, on: bool) -> io::Result<()> {
        let end = self.end_mut(side);
        let want = if on {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if end.interest == want {
            return Ok(());
        }
        let (Some(stream), Some(token)) = (end.stream.as_mut(), end.token) else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        registry.reregister(stream, token, want)?;
        end.interest = want;
        Ok(())
    }

    pub fn mark_eof(&mut self, side: Side) {
        self.end_mut(side).eof = true;
    }

    pub fn is_eof(&self, side: Side) -> bool {
        self.end(side).eof
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close both sockets. Idempotent.
    pub fn close(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.response.close(registry);
        self.relay.close(registry);
    }
}

/// One proxied UDP flow: a single socket shuttling datagrams between the
/// remote relay address and the local service on loopback.
#[derive(Debug)]
pub struct UdpFlow {
    pub meta: ChannelMeta,
    channel_id: String,
    remote_host: String,
    remote_port: u16,
    remote_addr: Option<SocketAddr>,
    local_target: SocketAddr,
    socket: Option<UdpSocket>,
    token: Option<Token>,
    interest: Interest,
    scratch: Box<[u8]>,
    to_local: PendingDatagrams,
    to_remote: PendingDatagrams,
    idle_timeout: Duration,
    last_active: Instant,
    closed: bool,
}

pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_UDP_PENDING_LIMIT: usize = 8 * UDP_BUFFER_SIZE;

impl UdpFlow {
    pub fn new(
        meta: ChannelMeta,
        channel_id: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        let local_target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), meta.proxied_port);
        Self {
            meta,
            channel_id: channel_id.into(),
            remote_host: remote_host.into(),
            remote_port,
            remote_addr: None,
            local_target,
            socket: None,
            token: None,
            interest: Interest::READABLE,
            scratch: vec![0u8; UDP_BUFFER_SIZE].into_boxed_slice(),
            to_local: PendingDatagrams::new(DEFAULT_UDP_PENDING_LIMIT),
            to_remote: PendingDatagrams::new(DEFAULT_UDP_PENDING_LIMIT),
            idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            last_active: Instant::now(),
            closed: false,
        }
    }

    pub fn set_limits(&mut self, idle_timeout: Duration, pending_limit: usize) {
        self.idle_timeout = idle_timeout;
        self.to_local.set_limit(pending_limit);
        self.to_remote.set_limit(pending_limit);
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// Attach the penetrated socket. On an IPv6 socket the local service is
    /// addressed through the v4-mapped loopback.
    pub fn attach(&mut self, socket: UdpSocket, remote: SocketAddr) {
        if matches!(socket.local_addr(), Ok(SocketAddr::V6(_))) {
            self.local_target = SocketAddr::new(
                IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped()),
                self.meta.proxied_port,
            );
        }
        self.socket = Some(socket);
        self.remote_addr = Some(remote);
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        registry.register(socket, token, Interest::READABLE)?;
        self.token = Some(token);
        self.interest = Interest::READABLE;
        Ok(())
    }

    pub fn migrate(&mut self, old: &Registry, new: &Registry) -> io::Result<()> {
        if let (Some(socket), Some(token)) = (self.socket.as_mut(), self.token) {
            let _ = old.deregister(socket);
            new.register(socket, token, self.interest)?;
        }
        Ok(())
    }

    pub fn refresh(&mut self, now: Instant) {
        self.last_active = now;
    }

    pub fn should_close(&self, now: Instant) -> bool {
        self.closed || now.saturating_duration_since(self.last_active) > self.idle_timeout
    }

    /// Receive until the socket would block, forwarding each datagram to the
    /// other party. Returns `true` if datagrams were queued and the socket
    /// needs write interest. Datagrams from unknown sources are dropped.
    pub fn pump(&mut self, now: Instant) -> io::Result<bool> {
        let (Some(socket), Some(remote)) = (self.socket.as_ref(), self.remote_addr) else {
            return Ok(false);
        };
        let mut needs_write = false;
        loop {
            let (n, from) = match socket.recv_from(&mut self.scratch) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(channel = %self.channel_id, err = %e, "relay: udp receive failed");
                    break;
                }
            };
            let (target, queue) = if from == remote {
                (self.local_target, &mut self.to_local)
            } else if is_loopback(from) && from.port() == self.meta.proxied_port {
                (remote, &mut self.to_remote)
            } else {
                tracing::debug!(channel = %self.channel_id, from = %from, "relay: dropped udp datagram from unknown source");
                continue;
            };
            self.last_active = now;

            let datagram = &self.scratch[..n];
            if queue.is_empty() {
                match socket.send_to(datagram, target) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }
            let evicted = queue.push(datagram.to_vec());
            if evicted > 0 {
                tracing::debug!(
                    channel = %self.channel_id,
                    evicted,
                    queued = queue.len(),
                    dropped_total = queue.dropped(),
                    "relay: udp pending queue full; dropped oldest"
                );
            }
            needs_write = true;
        }
        Ok(needs_write)
    }

    /// Send queued datagrams. Returns `true` when both queues are drained.
    /// Every datagram sent counts as activity.
    pub fn flush_pending(&mut self, now: Instant) -> io::Result<bool> {
        let (Some(socket), Some(remote)) = (self.socket.as_ref(), self.remote_addr) else {
            return Ok(true);
        };
        for (queue, target) in [
            (&mut self.to_local, self.local_target),
            (&mut self.to_remote, remote),
        ] {
            while let Some(d) = queue.front() {
                match socket.send_to(d, target) {
                    Ok(_) => {
                        queue.pop_front();
                        self.last_active = now;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(true)
    }

    pub fn set_write_interest(&mut self, registry: &Registry, on: bool) -> io::Result<()> {
        let want = if on {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if self.interest == want {
            return Ok(());
        }
        let (Some(socket), Some(token)) = (self.socket.as_mut(), self.token) else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        registry.reregister(socket, token, want)?;
        self.interest = want;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut s) = self.socket.take() {
            if self.token.is_some() {
                let _ = registry.deregister(&mut s);
            }
        }
    }
}

fn is_loopback(addr: SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6 == Ipv6Addr::LOCALHOST || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

/// A relay attachment held by the event loop, keyed by its temp id or
/// channel id.
#[derive(Debug)]
pub enum RelayChannel {
    Tcp(TcpRelayPair),
    Udp(UdpFlow),
}

impl RelayChannel {
    pub fn key(&self) -> ChannelKey {
        let id = match self {
            RelayChannel::Tcp(p) => p.temp_id(),
            RelayChannel::Udp(f) => f.channel_id(),
        };
        ChannelKey::new(self.protocol(), id)
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            RelayChannel::Tcp(_) => Protocol::Tcp,
            RelayChannel::Udp(_) => Protocol::Udp,
        }
    }

    pub fn meta(&self) -> &ChannelMeta {
        match self {
            RelayChannel::Tcp(p) => &p.meta,
            RelayChannel::Udp(f) => &f.meta,
        }
    }

    pub fn tokens(&self) -> Vec<Token> {
        match self {
            RelayChannel::Tcp(p) => p.tokens().collect(),
            RelayChannel::Udp(f) => f.token().into_iter().collect(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            RelayChannel::Tcp(p) => p.is_closed(),
            RelayChannel::Udp(f) => f.is_closed(),
        }
    }

    /// Closed pairs and idle UDP flows are reclaimed by the sweep.
    pub fn should_sweep(&self, now: Instant) -> bool {
        match self {
            RelayChannel::Tcp(p) => p.is_closed(),
            RelayChannel::Udp(f) => f.should_close(now),
        }
    }

    pub fn migrate(&mut self, old: &Registry, new: &Registry) -> io::Result<()> {
        match self {
            RelayChannel::Tcp(p) => p.migrate(old, new),
            RelayChannel::Udp(f) => f.migrate(old, new),
        }
    }

    pub fn close(&mut self, registry: &Registry) {
        match self {
            RelayChannel::Tcp(p) => p.close(registry),
            RelayChannel::Udp(f) => f.close(registry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn meta(port: u16) -> ChannelMeta {
        ChannelMeta {
            agent_id: "agent-1".into(),
            proxied_port: port,
            proxy_port: 9000,
        }
    }

    fn loopback_pair() -> (TcpStream, std::net::TcpStream) {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(l.local_addr().unwrap()).unwrap();
        let (server, _) = l.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    #[test]
    fn closing_a_pair_closes_both_sockets_once() {
        let poll = mio::Poll::new().unwrap();
        let (response, mut local_peer) = loopback_pair();
        let (relay, mut relay_peer) = loopback_pair();

        let mut pair = TcpRelayPair::new(meta(80), "temp-1");
        pair.attach(response, relay);
        pair.register(poll.registry(), Token(1), Token(2)).unwrap();
        assert_eq!(pair.tokens().collect::<Vec<_>>(), vec![Token(1), Token(2)]);
        assert!(pair.interest(Side::Relay).is_writable());

        pair.close(poll.registry());
        assert!(pair.is_closed());
        pair.close(poll.registry());

        let mut buf = [0u8; 8];
        assert_eq!(local_peer.read(&mut buf).unwrap(), 0);
        assert_eq!(relay_peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn flush_moves_bytes_to_peer_side() {
        let poll = mio::Poll::new().unwrap();
        let (response, mut local_peer) = loopback_pair();
        let (relay, _relay_peer) = loopback_pair();
        let mut pair = TcpRelayPair::new(meta(80), "temp-2");
        pair.attach(response, relay);
        pair.register(poll.registry(), Token(1), Token(2)).unwrap();

        pair.buffer_mut(Side::Relay).put(b"from relay");
        assert!(pair.flush_into(Side::Response, Instant::now()).unwrap());
        assert!(pair.buffer(Side::Relay).is_empty());

        let mut buf = [0u8; 10];
        local_peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"from relay");
        pair.close(poll.registry());
    }

    #[test]
    fn aggregation_flushes_once_per_window() {
        let window = Duration::from_millis(5);
        let mut pair = TcpRelayPair::new(meta(80), "temp-3");
        let t0 = pair.created_at();

        let was_empty = pair.buffer(Side::Relay).is_empty();
        pair.buffer_mut(Side::Relay).put(b"a");
        assert_eq!(pair.note_read(Side::Relay, was_empty), ReadDisposition::ScheduleRecheck);

        // A second read inside the window piggybacks on the pending recheck.
        let was_empty = pair.buffer(Side::Relay).is_empty();
        pair.buffer_mut(Side::Relay).put(b"b");
        assert_eq!(pair.note_read(Side::Relay, was_empty), ReadDisposition::Wait);
        assert!(!pair.flush_due(Side::Relay, t0 + Duration::from_millis(2), window));
        assert!(pair.flush_due(Side::Relay, t0 + window, window));
        assert_eq!(pair.buffer(Side::Relay).as_slice(), b"ab");

        // The other direction is untouched.
        assert!(!pair.flush_due(Side::Response, t0 + window, window));
    }

    #[test]
    fn full_buffer_flushes_immediately() {
        let mut pair = TcpRelayPair::new(meta(80), "temp-4");
        pair.buffer_mut(Side::Response).put(&[7u8; TCP_BUFFER_SIZE]);
        assert_eq!(pair.note_read(Side::Response, true), ReadDisposition::FlushNow);
    }

    #[test]
    fn udp_flow_idle_expiry() {
        let mut flow = UdpFlow::new(meta(53), "chan-1", "relay.example", 60078);
        let now = Instant::now();
        assert!(!flow.should_close(now));
        let later = now + Duration::from_secs(31);
        assert!(flow.should_close(later));
        flow.refresh(later);
        assert!(!flow.should_close(later + Duration::from_secs(1)));
        assert!(flow.should_close(later + Duration::from_secs(31)));
    }

    #[test]
    fn udp_flow_routes_between_remote_and_local() {
        let poll = mio::Poll::new().unwrap();
        let remote = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let local = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        remote.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        local.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

        let sock = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let flow_addr = sock.local_addr().unwrap();
        let mut flow = UdpFlow::new(meta(local.local_addr().unwrap().port()), "chan-2", "127.0.0.1", 0);
        flow.attach(sock, remote.local_addr().unwrap());
        flow.register(poll.registry(), Token(5)).unwrap();

        remote.send_to(b"down", flow_addr).unwrap();
        let mut buf = [0u8; 16];
        let n = wait_pump(&mut flow, || local.recv_from(&mut buf).ok().map(|(n, _)| n));
        assert_eq!(&buf[..n], b"down");

        local.send_to(b"up", flow_addr).unwrap();
        let n = wait_pump(&mut flow, || remote.recv_from(&mut buf).ok().map(|(n, _)| n));
        assert_eq!(&buf[..n], b"up");

        flow.close(poll.registry());
        assert!(flow.should_close(Instant::now()));
    }

    #[test]
    fn sending_queued_datagrams_refreshes_activity() {
        let remote = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        remote.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut flow = UdpFlow::new(meta(53), "chan-3", "127.0.0.1", 0);
        flow.attach(sock, remote.local_addr().unwrap());

        let start = Instant::now();
        let later = start + Duration::from_secs(40);
        assert!(flow.should_close(later));

        flow.to_remote.push(b"queued".to_vec());
        assert!(flow.flush_pending(later).unwrap());
        assert!(!flow.should_close(later + Duration::from_secs(1)));

        let mut buf = [0u8; 16];
        let (n, _) = remote.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"queued");

        // Nothing queued: no send, no refresh.
        let much_later = later + Duration::from_secs(40);
        assert!(flow.flush_pending(much_later).unwrap());
        assert!(flow.should_close(much_later));
    }

    fn wait_pump(flow: &mut UdpFlow, mut recv: impl FnMut() -> Option<usize>) -> usize {
        // The datagram may not have arrived yet; pump until it is forwarded.
        for _ in 0..100 {
            flow.pump(Instant::now()).unwrap();
            if let Some(n) = recv() {
                return n;
            }
        }
        panic!("datagram was not forwarded");
    }
}
