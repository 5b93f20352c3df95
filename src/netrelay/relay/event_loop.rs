use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use mio::event::Event;
use mio::{Events, Poll, Token, Waker};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::netrelay::control::ControlSender;
use crate::netrelay::protocol::{ControlMessage, Directive};
use crate::netrelay::relay::RelayOptions;
use crate::netrelay::relay::attachment::{ChannelKey, ReadDisposition, RelayChannel, Side, UdpFlow};
use crate::netrelay::relay::setup::{self, SetupPool};
use crate::netrelay::relay::task::RelayTask;
use crate::netrelay::relay::timer::{DelayQueue, Periodic};
use crate::netrelay::relay::watchdog::{EmptyPollWatchdog, PollOutcome};
use crate::netrelay::status::{StatusCell, WorkingStatus};

const WAKE_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;
const PREVIEW_BYTES: usize = 64;

struct Shared {
    tasks: mpsc::UnboundedSender<RelayTask>,
    waker: ArcSwap<Waker>,
    status: StatusCell,
}

/// Cloneable handle used by other threads to feed the event loop.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<Shared>,
}

impl RelayHandle {
    /// Queue a task and interrupt the current wait. Returns `false` once the
    /// loop is stopping; the task (and any sockets it owns) is dropped.
    pub fn submit(&self, task: RelayTask) -> bool {
        if !self.shared.status.is_running() {
            return false;
        }
        if self.shared.tasks.send(task).is_err() {
            return false;
        }
        self.wake();
        true
    }

    pub fn shutdown(&self) {
        if self.shared.status.advance(WorkingStatus::Stopping).is_running() {
            self.wake();
        }
    }

    pub fn status(&self) -> WorkingStatus {
        self.shared.status.get()
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.load().wake() {
            tracing::debug!(err = %e, "relay: wake failed");
        }
    }
}

#[derive(Debug, Clone)]
struct Route {
    key: ChannelKey,
    /// `None` for UDP flows.
    side: Option<Side>,
}

/// Start the relay loop on its own thread.
pub fn spawn(opts: RelayOptions, control: ControlSender, runtime: Handle) -> io::Result<RelayHandle> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        tasks: tx,
        waker: ArcSwap::new(waker),
        status: StatusCell::new(),
    });

    let now = Instant::now();
    let event_loop = EventLoop {
        poll,
        shared: shared.clone(),
        tasks: rx,
        channels: HashMap::new(),
        routes: HashMap::new(),
        next_token: WAKE_TOKEN.0 + 1,
        timers: DelayQueue::new(),
        sweep: Periodic::new(opts.sweep_interval, now),
        watchdog_reset: Periodic::new(opts.watchdog_reset_interval, now),
        watchdog: EmptyPollWatchdog::new(opts.watchdog_threshold, opts.watchdog_window),
        setup: SetupPool::new(runtime, opts.setup_concurrency, opts.setup_timeout),
        control,
        opts,
    };

    shared.status.advance(WorkingStatus::Working);
    std::thread::Builder::new()
        .name("relay-event-loop".into())
        .spawn(move || event_loop.run())?;
    Ok(RelayHandle { shared })
}

struct EventLoop {
    poll: Poll,
    shared: Arc<Shared>,
    tasks: mpsc::UnboundedReceiver<RelayTask>,
    channels: HashMap<ChannelKey, RelayChannel>,
    routes: HashMap<Token, Route>,
    next_token: usize,
    timers: DelayQueue<RelayTask>,
    sweep: Periodic,
    watchdog_reset: Periodic,
    watchdog: EmptyPollWatchdog,
    setup: SetupPool,
    control: ControlSender,
    opts: RelayOptions,
}

impl EventLoop {
    fn run(mut self) {
        tracing::info!(relay_addr = %self.opts.relay_addr, "relay: event loop started");
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while self.shared.status.is_running() {
            let now = Instant::now();
            let deadline = self.next_deadline();
            let timeout = deadline.saturating_duration_since(now);

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(err = %e, "relay: poll failed; closing all channels");
                break;
            }

            let now = Instant::now();
            let outcome = if !events.is_empty() {
                PollOutcome::Ready
            } else if now < deadline {
                PollOutcome::Spurious
            } else {
                PollOutcome::TimedOut
            };
            if self.watchdog.observe(outcome, now) {
                tracing::warn!(
                    empty_polls = self.watchdog.count(),
                    "relay: multiplexer keeps returning empty; rebuilding"
                );
                if let Err(e) = self.rebuild() {
                    tracing::error!(err = %e, "relay: multiplexer rebuild failed; closing all channels");
                    break;
                }
                self.watchdog.reset();
            }

            for event in events.iter() {
                self.dispatch(event);
            }
            self.run_timers(Instant::now());
            while let Ok(task) = self.tasks.try_recv() {
                self.apply(task);
            }
        }

        self.shared.status.advance(WorkingStatus::Stopping);
        self.tasks.close();
        self.close_all();
        self.shared.status.advance(WorkingStatus::Stopped);
        tracing::info!("relay: event loop stopped");
    }

    fn next_deadline(&self) -> Instant {
        let periodic = self.sweep.deadline().min(self.watchdog_reset.deadline());
        match self.timers.next_deadline() {
            Some(t) => t.min(periodic),
            None => periodic,
        }
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1).max(WAKE_TOKEN.0 + 1);
        t
    }

    fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: self.shared.clone(),
        }
    }

    fn dispatch(&mut self, event: &Event) {
        let token = event.token();
        if token == WAKE_TOKEN {
            return;
        }
        let Some(route) = self.routes.get(&token).cloned() else {
            return;
        };
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        let writable = event.is_writable();

        match route.side {
            Some(side) => {
                if writable {
                    self.tcp_writable(&route.key, side);
                }
                if readable {
                    self.tcp_readable(&route.key, side);
                }
            }
            None => {
                if writable {
                    self.udp_writable(&route.key);
                }
                if readable {
                    self.udp_readable(&route.key);
                }
            }
        }
    }

    fn tcp_readable(&mut self, key: &ChannelKey, side: Side) {
        let now = Instant::now();
        let registry = self.poll.registry();
        let Some(RelayChannel::Tcp(pair)) = self.channels.get_mut(key) else {
            return;
        };
        if pair.is_closed() || pair.is_eof(side) {
            return;
        }

        let was_empty = pair.buffer(side).is_empty();
        let before = pair.buffer(side).len();
        let mut eof = false;
        let mut failure = None;
        while !pair.buffer(side).is_full() {
            match pair.read_side(side) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let read = pair.buffer(side).len().saturating_sub(before);
        if read > 0 {
            tracing::debug!(temp_id = %key.id, side = %side, bytes = read, "relay: tcp read");
            tracing::trace!(
                temp_id = %key.id,
                preview = %preview(&pair.buffer(side).as_slice()[before..]),
                "relay: tcp payload"
            );
        }

        let mut close = None;
        if let Some(e) = failure {
            close = Some(format!("read from {side} side failed: {e}"));
        } else {
            if read > 0 {
                match pair.note_read(side, was_empty) {
                    ReadDisposition::FlushNow => {
                        if let Err(e) = pair.set_write_interest(registry, side.peer(), true) {
                            close = Some(format!("arm write on {} side failed: {e}", side.peer()));
                        }
                    }
                    ReadDisposition::ScheduleRecheck => self.timers.push(
                        now + self.opts.aggregation_window,
                        RelayTask::ArmWrite {
                            key: key.clone(),
                            from: side,
                        },
                    ),
                    ReadDisposition::Wait => {}
                }
            }
            if eof && close.is_none() {
                pair.mark_eof(side);
                if pair.buffer(side).is_empty() {
                    close = Some(format!("{side} side closed"));
                } else if let Err(e) = pair.set_write_interest(registry, side.peer(), true) {
                    close = Some(format!("arm write on {} side failed: {e}", side.peer()));
                }
            }
        }

        if let Some(reason) = close {
            self.close_channel(key, &reason);
        }
    }

    fn tcp_writable(&mut self, key: &ChannelKey, side: Side) {
        let now = Instant::now();
        let registry = self.poll.registry();
        let Some(RelayChannel::Tcp(pair)) = self.channels.get_mut(key) else {
            return;
        };
        if pair.is_closed() {
            return;
        }

        let pending = pair.buffer(side.peer()).len();
        let mut close = None;
        let mut resume = false;
        match pair.flush_into(side, now) {
            Ok(true) => {
                tracing::debug!(temp_id = %key.id, side = %side, bytes = pending, "relay: tcp write");
                if pair.is_eof(side.peer()) {
                    close = Some(format!("{} side closed", side.peer()));
                } else if let Err(e) = pair.set_write_interest(registry, side, false) {
                    close = Some(format!("drop write interest on {side} side failed: {e}"));
                } else {
                    resume = true;
                }
            }
            Ok(false) => {
                if !pair.interest(side).is_writable() {
                    if let Err(e) = pair.set_write_interest(registry, side, true) {
                        close = Some(format!("arm write on {side} side failed: {e}"));
                    }
                }
            }
            Err(e) => close = Some(format!("write to {side} side failed: {e}")),
        }

        if let Some(reason) = close {
            self.close_channel(key, &reason);
        } else if resume {
            self.tcp_readable(key, side.peer());
        }
    }

    fn udp_readable(&mut self, key: &ChannelKey) {
        let now = Instant::now();
        let registry = self.poll.registry();
        let Some(RelayChannel::Udp(flow)) = self.channels.get_mut(key) else {
            return;
        };
        let close = match flow.pump(now) {
            Ok(true) => flow
                .set_write_interest(registry, true)
                .err()
                .map(|e| format!("arm write failed: {e}")),
            Ok(false) => None,
            Err(e) => Some(format!("send failed: {e}")),
        };
        if let Some(reason) = close {
            self.close_channel(key, &reason);
        }
    }

    fn udp_writable(&mut self, key: &ChannelKey) {
        let registry = self.poll.registry();
        let Some(RelayChannel::Udp(flow)) = self.channels.get_mut(key) else {
            return;
        };
        let close = match flow.flush_pending(Instant::now()) {
            Ok(true) => flow
                .set_write_interest(registry, false)
                .err()
                .map(|e| format!("drop write interest failed: {e}")),
            Ok(false) => None,
            Err(e) => Some(format!("send failed: {e}")),
        };
        if let Some(reason) = close {
            self.close_channel(key, &reason);
        }
    }

    fn run_timers(&mut self, now: Instant) {
        for task in self.timers.pop_due(now) {
            self.apply(task);
        }
        if self.sweep.fire(now) {
            self.sweep_expired(now);
        }
        if self.watchdog_reset.fire(now) {
            self.watchdog.reset();
        }
    }

    fn apply(&mut self, task: RelayTask) {
        tracing::trace!(task = task.kind(), "relay: task");
        match task {
            RelayTask::Register(channel) => self.start_setup(channel),
            RelayTask::Finalize(channel) => self.finalize(channel),
            RelayTask::ArmWrite { key, from } => self.arm_write(&key, from),
            #[cfg(test)]
            RelayTask::Rebuild => {
                if let Err(e) = self.rebuild() {
                    tracing::error!(err = %e, "relay: multiplexer rebuild failed");
                    self.shared.status.advance(WorkingStatus::Stopping);
                }
            }
        }
    }

    fn start_setup(&mut self, channel: RelayChannel) {
        let handle = self.handle();
        match channel {
            RelayChannel::Tcp(pair) => {
                let temp_id = pair.temp_id().to_string();
                let port = pair.meta.proxied_port;
                self.setup.run(
                    setup::connect_tcp_pair(pair, self.opts.relay_addr.clone()),
                    move |pair| {
                        if !handle.submit(RelayTask::Finalize(RelayChannel::Tcp(pair))) {
                            tracing::debug!("relay: dropped connected tcp pair; loop stopping");
                        }
                    },
                    move |e| {
                        tracing::warn!(temp_id = %temp_id, local_port = port, err = %e, "relay: tcp channel setup failed");
                    },
                );
            }
            RelayChannel::Udp(mut flow) => {
                flow.set_limits(self.opts.udp_idle_timeout, self.opts.udp_pending_limit);
                let channel_id = flow.channel_id().to_string();
                let port = flow.meta.proxied_port;
                self.setup.run(
                    setup::penetrate_udp(flow),
                    move |flow| {
                        if !handle.submit(RelayTask::Finalize(RelayChannel::Udp(flow))) {
                            tracing::debug!("relay: dropped penetrated udp flow; loop stopping");
                        }
                    },
                    move |e| {
                        tracing::warn!(channel = %channel_id, local_port = port, err = %e, "relay: udp channel setup failed");
                    },
                );
            }
        }
    }

    fn finalize(&mut self, channel: RelayChannel) {
        let key = channel.key();
        if self.channels.contains_key(&key) {
            tracing::warn!(key = %key, "relay: duplicate channel id; dropping new channel");
            return;
        }

        let channel = match channel {
            RelayChannel::Tcp(mut pair) => {
                if !pair.is_connected() {
                    tracing::warn!(temp_id = %key.id, "relay: tcp channel finalized without sockets");
                    return;
                }
                let ready = ControlMessage::request(
                    pair.meta.agent_id.clone(),
                    Directive::TcpRelayReady,
                    vec![pair.meta.proxied_port.to_string(), pair.temp_id().to_string()],
                );
                let frame = match ready.encode() {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(temp_id = %key.id, err = %e, "relay: cannot encode ready frame");
                        return;
                    }
                };
                pair.buffer_mut(Side::Response).put(&frame);

                let (response_token, relay_token) = (self.alloc_token(), self.alloc_token());
                if let Err(e) = pair.register(self.poll.registry(), response_token, relay_token) {
                    tracing::warn!(temp_id = %key.id, err = %e, "relay: tcp channel register failed");
                    pair.close(self.poll.registry());
                    return;
                }
                self.routes.insert(
                    response_token,
                    Route {
                        key: key.clone(),
                        side: Some(Side::Response),
                    },
                );
                self.routes.insert(
                    relay_token,
                    Route {
                        key: key.clone(),
                        side: Some(Side::Relay),
                    },
                );
                tracing::debug!(temp_id = %key.id, local_port = pair.meta.proxied_port, "relay: tcp channel ready");
                RelayChannel::Tcp(pair)
            }
            RelayChannel::Udp(mut flow) => {
                let token = self.alloc_token();
                if let Err(e) = flow.register(self.poll.registry(), token) {
                    tracing::warn!(channel = %key.id, err = %e, "relay: udp channel register failed");
                    flow.close(self.poll.registry());
                    return;
                }
                self.routes.insert(
                    token,
                    Route {
                        key: key.clone(),
                        side: None,
                    },
                );
                flow.refresh(Instant::now());
                self.announce_udp(&flow);
                RelayChannel::Udp(flow)
            }
        };
        self.channels.insert(key, channel);
    }

    fn announce_udp(&self, flow: &UdpFlow) {
        let ready = ControlMessage::request(
            flow.meta.agent_id.clone(),
            Directive::UdpRelayReady,
            vec![flow.meta.proxied_port.to_string(), flow.channel_id().to_string()],
        );
        if self.control.try_send(ready) {
            tracing::debug!(
                channel = %flow.channel_id(),
                local_port = flow.meta.proxied_port,
                remote = ?flow.remote_addr(),
                "relay: udp channel ready"
            );
        } else {
            tracing::warn!(channel = %flow.channel_id(), "relay: could not queue udp ready reply");
        }
    }

    fn arm_write(&mut self, key: &ChannelKey, from: Side) {
        let now = Instant::now();
        let window = self.opts.aggregation_window;
        let registry = self.poll.registry();
        let Some(RelayChannel::Tcp(pair)) = self.channels.get_mut(key) else {
            return;
        };
        if pair.is_closed() || pair.buffer(from).is_empty() {
            return;
        }
        if pair.interest(from.peer()).is_writable() {
            return;
        }
        if !pair.flush_due(from, now, window) {
            // Flushed inside the window; check again once it has elapsed.
            self.timers.push(
                now + window,
                RelayTask::ArmWrite {
                    key: key.clone(),
                    from,
                },
            );
            return;
        }
        if let Err(e) = pair.set_write_interest(registry, from.peer(), true) {
            let reason = format!("arm write on {} side failed: {e}", from.peer());
            self.close_channel(key, &reason);
        }
    }

    fn sweep_expired(&mut self, now: Instant) {
        let expired: Vec<ChannelKey> = self
            .channels
            .iter()
            .filter(|(_, c)| c.should_sweep(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.close_channel(&key, "idle");
        }
    }

    fn close_channel(&mut self, key: &ChannelKey, reason: &str) {
        let Some(mut channel) = self.channels.remove(key) else {
            return;
        };
        for token in channel.tokens() {
            self.routes.remove(&token);
        }
        let already_closed = channel.is_closed();
        channel.close(self.poll.registry());
        if already_closed {
            return;
        }
        let lifetime_ms = match &channel {
            RelayChannel::Tcp(pair) => Some(pair.created_at().elapsed().as_millis() as u64),
            RelayChannel::Udp(_) => None,
        };
        tracing::debug!(
            key = %key,
            local_port = channel.meta().proxied_port,
            lifetime_ms,
            reason = %reason,
            "relay: channel closed"
        );
    }

    fn close_all(&mut self) {
        let keys: Vec<ChannelKey> = self.channels.keys().cloned().collect();
        for key in keys {
            self.close_channel(&key, "relay stopping");
        }
        if !self.timers.is_empty() {
            tracing::debug!(pending = self.timers.len(), "relay: dropped pending timers");
        }
        self.timers.clear();
        while let Ok(task) = self.tasks.try_recv() {
            drop(task);
        }
    }

    /// Replace the multiplexer and move every registration over to it.
    fn rebuild(&mut self) -> io::Result<()> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let old = std::mem::replace(&mut self.poll, poll);

        let mut failed = Vec::new();
        for (key, channel) in self.channels.iter_mut() {
            if let Err(e) = channel.migrate(old.registry(), self.poll.registry()) {
                tracing::warn!(key = %key, err = %e, "relay: re-register after rebuild failed");
                failed.push(key.clone());
            }
        }
        self.shared.waker.store(waker);
        drop(old);

        for key in failed {
            self.close_channel(&key, "re-register failed");
        }
        tracing::info!(channels = self.channels.len(), "relay: multiplexer rebuilt");
        Ok(())
    }
}

fn preview(bytes: &[u8]) -> String {
    let end = bytes.len().min(PREVIEW_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netrelay::protocol::FrameReader;
    use crate::netrelay::relay::attachment::{ChannelMeta, TcpRelayPair};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn meta(port: u16) -> ChannelMeta {
        ChannelMeta {
            agent_id: "agent-1".into(),
            proxied_port: port,
            proxy_port: 9000,
        }
    }

    fn start(relay_addr: String) -> (RelayHandle, mpsc::Receiver<ControlMessage>) {
        start_with(RelayOptions::new(relay_addr))
    }

    fn start_with(opts: RelayOptions) -> (RelayHandle, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = spawn(opts, ControlSender::new(tx), Handle::current()).unwrap();
        (handle, rx)
    }

    /// Register a TCP pair and return the accepted service and data sockets
    /// once the ready frame has been read.
    async fn open_tcp(
        handle: &RelayHandle,
        service: &TcpListener,
        relay: &TcpListener,
        temp_id: &str,
    ) -> (tokio::net::TcpStream, tokio::net::TcpStream) {
        let port = service.local_addr().unwrap().port();
        let pair = TcpRelayPair::new(meta(port), temp_id);
        assert!(handle.submit(RelayTask::Register(RelayChannel::Tcp(pair))));
        let (svc, _) = timeout(WAIT, service.accept()).await.unwrap().unwrap();
        let (mut data, _) = timeout(WAIT, relay.accept()).await.unwrap().unwrap();
        let mut reader = FrameReader::new();
        let ready = timeout(WAIT, reader.read_message(&mut data)).await.unwrap().unwrap().unwrap();
        assert_eq!(ready.directive(), Some(&Directive::TcpRelayReady));
        assert_eq!(ready.args()[1], temp_id);
        (svc, data)
    }

    /// Register a UDP flow, answer its penetration and wait for the ready
    /// notice. Returns the agent's address as seen by `server`.
    async fn open_udp(
        handle: &RelayHandle,
        control: &mut mpsc::Receiver<ControlMessage>,
        server: &UdpSocket,
        service: &UdpSocket,
        channel_id: &str,
    ) -> std::net::SocketAddr {
        let remote_port = server.local_addr().unwrap().port();
        let local_port = service.local_addr().unwrap().port();
        let flow = UdpFlow::new(meta(local_port), channel_id, "127.0.0.1", remote_port);
        assert!(handle.submit(RelayTask::Register(RelayChannel::Udp(flow))));

        let mut buf = [0u8; 512];
        let (_, agent_addr) = timeout(WAIT, server.recv_from(&mut buf)).await.unwrap().unwrap();
        let ack = ControlMessage::order(Directive::UdpPenetrationAck, vec![]).encode().unwrap();
        server.send_to(&ack, agent_addr).await.unwrap();

        let ready = timeout(WAIT, control.recv()).await.unwrap().unwrap();
        assert_eq!(ready.directive(), Some(&Directive::UdpRelayReady));
        assert_eq!(ready.args()[1], channel_id);
        agent_addr
    }

    async fn tcp_round_trip(svc: &mut tokio::net::TcpStream, data: &mut tokio::net::TcpStream, msg: &[u8]) {
        let mut buf = vec![0u8; msg.len()];
        data.write_all(msg).await.unwrap();
        timeout(WAIT, svc.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(buf, msg);
        svc.write_all(msg).await.unwrap();
        timeout(WAIT, data.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(buf, msg);
    }

    async fn udp_round_trip(server: &UdpSocket, service: &UdpSocket, agent_addr: std::net::SocketAddr, msg: &[u8]) {
        let mut buf = [0u8; 512];
        server.send_to(msg, agent_addr).await.unwrap();
        let (n, from) = timeout(WAIT, service.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], msg);
        service.send_to(msg, from).await.unwrap();
        let (n, from) = timeout(WAIT, server.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], msg);
        assert_eq!(from, agent_addr);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_pair_announces_and_relays() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = service.local_addr().unwrap().port();
        let (handle, _control) = start(relay.local_addr().unwrap().to_string());

        assert!(handle.submit(RelayTask::Register(RelayChannel::Tcp(TcpRelayPair::new(meta(port), "temp-1")))));

        let (mut svc, _) = timeout(WAIT, service.accept()).await.unwrap().unwrap();
        let (mut data, _) = timeout(WAIT, relay.accept()).await.unwrap().unwrap();

        let mut reader = FrameReader::new();
        let ready = timeout(WAIT, reader.read_message(&mut data)).await.unwrap().unwrap().unwrap();
        assert_eq!(ready.directive(), Some(&Directive::TcpRelayReady));
        assert_eq!(ready.args(), [port.to_string(), "temp-1".to_string()]);
        assert_eq!(ready.agent_id, "agent-1");

        data.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 18];
        timeout(WAIT, svc.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");

        let body = vec![b'z'; 64 * 1024];
        svc.write_all(&body).await.unwrap();
        let mut got = vec![0u8; body.len()];
        timeout(WAIT, data.read_exact(&mut got)).await.unwrap().unwrap();
        assert_eq!(got, body);

        handle.shutdown();
        let mut rest = Vec::new();
        timeout(WAIT, data.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn eof_drains_buffered_bytes_before_closing() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = service.local_addr().unwrap().port();
        let (handle, _control) = start(relay.local_addr().unwrap().to_string());

        handle.submit(RelayTask::Register(RelayChannel::Tcp(TcpRelayPair::new(meta(port), "temp-2"))));
        let (mut svc, _) = timeout(WAIT, service.accept()).await.unwrap().unwrap();
        let (mut data, _) = timeout(WAIT, relay.accept()).await.unwrap().unwrap();
        let mut reader = FrameReader::new();
        timeout(WAIT, reader.read_message(&mut data)).await.unwrap().unwrap();

        data.write_all(b"last words").await.unwrap();
        data.shutdown().await.unwrap();

        let mut got = Vec::new();
        timeout(WAIT, svc.read_to_end(&mut got)).await.unwrap().unwrap();
        assert_eq!(got, b"last words");
        handle.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn udp_flow_penetrates_announces_and_relays() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_port = server.local_addr().unwrap().port();
        let local_port = service.local_addr().unwrap().port();
        let (handle, mut control) = start("127.0.0.1:1".into());

        let flow = UdpFlow::new(meta(local_port), "chan-1", "127.0.0.1", remote_port);
        handle.submit(RelayTask::Register(RelayChannel::Udp(flow)));

        let mut buf = [0u8; 512];
        let (n, agent_addr) = timeout(WAIT, server.recv_from(&mut buf)).await.unwrap().unwrap();
        let probe = ControlMessage::parse(&buf[..n]).unwrap();
        assert_eq!(probe.directive(), Some(&Directive::UdpPenetration));
        let ack = ControlMessage::order(Directive::UdpPenetrationAck, vec![]).encode().unwrap();
        server.send_to(&ack, agent_addr).await.unwrap();

        let ready = timeout(WAIT, control.recv()).await.unwrap().unwrap();
        assert_eq!(ready.directive(), Some(&Directive::UdpRelayReady));
        assert_eq!(ready.args(), [local_port.to_string(), "chan-1".to_string()]);

        server.send_to(b"query", agent_addr).await.unwrap();
        let (n, from) = timeout(WAIT, service.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(from.port(), agent_addr.port());

        service.send_to(b"answer", from).await.unwrap();
        let (n, from) = timeout(WAIT, server.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(from, agent_addr);

        handle.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_loop_refuses_tasks() {
        let (handle, _control) = start("127.0.0.1:1".into());
        handle.shutdown();
        let pair = TcpRelayPair::new(meta(1), "temp-3");
        assert!(!handle.submit(RelayTask::Register(RelayChannel::Tcp(pair))));

        let stopped = async {
            while handle.status() != WorkingStatus::Stopped {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        timeout(WAIT, stopped).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_writes_are_aggregated_within_window() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handle, _control) = start(relay.local_addr().unwrap().to_string());
        let (mut svc, mut data) = open_tcp(&handle, &service, &relay, "temp-agg").await;
        svc.set_nodelay(true).unwrap();

        let started = std::time::Instant::now();
        svc.write_all(b"a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        svc.write_all(b"b").await.unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(WAIT, data.read(&mut buf)).await.unwrap().unwrap();
        let elapsed = started.elapsed();
        assert_eq!(&buf[..n], b"ab");
        assert!(elapsed >= Duration::from_millis(4), "flushed after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "flushed after {elapsed:?}");
        handle.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rebuild_keeps_channels_relaying() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_service = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Long periodic deadlines: the loop only turns over when woken.
        let mut opts = RelayOptions::new(relay.local_addr().unwrap().to_string());
        opts.sweep_interval = Duration::from_secs(60);
        opts.watchdog_reset_interval = Duration::from_secs(60);
        let (handle, mut control) = start_with(opts);

        let (mut svc, mut data) = open_tcp(&handle, &service, &relay, "temp-r1").await;
        let agent_addr = open_udp(&handle, &mut control, &server, &udp_service, "chan-r1").await;
        tcp_round_trip(&mut svc, &mut data, b"before").await;
        udp_round_trip(&server, &udp_service, agent_addr, b"before").await;

        assert!(handle.submit(RelayTask::Rebuild));

        tcp_round_trip(&mut svc, &mut data, b"after").await;
        udp_round_trip(&server, &udp_service, agent_addr, b"after").await;

        // New work is picked up through the republished waker.
        let (mut svc2, mut data2) = open_tcp(&handle, &service, &relay, "temp-r2").await;
        tcp_round_trip(&mut svc2, &mut data2, b"fresh").await;
        assert_eq!(handle.status(), WorkingStatus::Working);
        handle.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_and_udp_channels_may_share_an_id() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (handle, mut control) = start(relay.local_addr().unwrap().to_string());

        let (mut svc, mut data) = open_tcp(&handle, &service, &relay, "7").await;
        let agent_addr = open_udp(&handle, &mut control, &server, &udp_service, "7").await;
        tcp_round_trip(&mut svc, &mut data, b"tcp").await;
        udp_round_trip(&server, &udp_service, agent_addr, b"udp").await;

        // Closing the TCP pair leaves the flow with the same id alone.
        drop(svc);
        let mut rest = Vec::new();
        timeout(WAIT, data.read_to_end(&mut rest)).await.unwrap().unwrap();
        udp_round_trip(&server, &udp_service, agent_addr, b"still").await;
        handle.shutdown();
    }
}
