use std::sync::{Arc, Mutex, OnceLock};

use arc_swap::ArcSwap;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

use crate::netrelay::control::{self, ControlOptions, ControlSender, OrderContext, ProxyMap};
use crate::netrelay::error::AgentError;
use crate::netrelay::net;
use crate::netrelay::protocol::{ControlMessage, Directive, FrameReader};
use crate::netrelay::relay::{self, RelayHandle, RelayOptions};
use crate::netrelay::status::{StatusCell, WorkingStatus};

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub control: ControlOptions,
    pub relay: RelayOptions,
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
}

impl AgentOptions {
    /// Defaults for a server whose TCP data channels share the control port.
    pub fn new(server_host: &str, server_port: u16, tcp_ports: Vec<u16>, udp_ports: Vec<u16>) -> Self {
        Self {
            control: ControlOptions::new(server_host, server_port),
            relay: RelayOptions::new(net::join_host_port(server_host, server_port)),
            tcp_ports,
            udp_ports,
        }
    }
}

/// One reverse-tunnel agent: a control channel to the relay server plus the
/// relay event loop serving the channels it orders.
///
/// Cheap to clone; all clones drive the same agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

struct Inner {
    opts: AgentOptions,
    status: StatusCell,
    agent_id: OnceLock<String>,
    tcp_map: ArcSwap<ProxyMap>,
    udp_map: ArcSwap<ProxyMap>,
    outbound: ControlSender,
    outbound_rx: Mutex<Option<mpsc::Receiver<ControlMessage>>>,
    relay: OnceLock<RelayHandle>,
    stop: watch::Sender<bool>,
    shutdown_ack: Arc<Notify>,
    broken: watch::Sender<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(opts: AgentOptions) -> Self {
        let (tx, rx) = mpsc::channel(opts.control.outbound_queue.max(1));
        let (stop, _) = watch::channel(false);
        let (broken, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                opts,
                status: StatusCell::new(),
                agent_id: OnceLock::new(),
                tcp_map: ArcSwap::from_pointee(ProxyMap::new()),
                udp_map: ArcSwap::from_pointee(ProxyMap::new()),
                outbound: ControlSender::new(tx),
                outbound_rx: Mutex::new(Some(rx)),
                relay: OnceLock::new(),
                stop,
                shutdown_ack: Arc::new(Notify::new()),
                broken,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connect, register, and start serving. Fails without side effects
    /// beyond the closed connection when the server refuses anything.
    pub async fn start(&self) -> Result<(), AgentError> {
        let inner = &self.inner;
        let Some(outbound_rx) = inner.outbound_rx.lock().ok().and_then(|mut g| g.take()) else {
            return Err(AgentError::NotStartable("already started"));
        };
        if !inner.status.is_running() {
            return Err(AgentError::NotStartable("already shut down"));
        }

        let copts = &inner.opts.control;
        let addr = net::join_host_port(&copts.server_host, copts.server_port);
        let connect = tokio::time::timeout(copts.dial_timeout, TcpStream::connect(&addr)).await;
        let mut stream = match connect {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(inner.fail_start(AgentError::ChannelRegisterFailed(format!("connect {addr}: {e}")))),
            Err(_) => {
                return Err(inner.fail_start(AgentError::ChannelRegisterFailed(format!(
                    "connect {addr}: timed out after {}",
                    humantime::format_duration(copts.dial_timeout)
                ))));
            }
        };
        let _ = stream.set_nodelay(true);

        let mut reader = FrameReader::new();
        let registration = match control::register(
            &mut stream,
            &mut reader,
            &inner.opts.tcp_ports,
            &inner.opts.udp_ports,
            copts.dial_timeout,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => return Err(inner.fail_start(e)),
        };
        if !inner.status.is_running() {
            inner.teardown();
            return Err(AgentError::NotStartable("shut down during start"));
        }

        let relay = match relay::spawn(
            inner.opts.relay.clone(),
            inner.outbound.clone(),
            tokio::runtime::Handle::current(),
        ) {
            Ok(r) => r,
            Err(e) => return Err(inner.fail_start(AgentError::Io(e))),
        };

        let agent_id = registration.agent_id.clone();
        let _ = inner.agent_id.set(registration.agent_id);
        inner.tcp_map.store(Arc::new(registration.tcp));
        inner.udp_map.store(Arc::new(registration.udp));
        let _ = inner.relay.set(relay);

        let (rd, wr) = stream.into_split();
        let mut tasks = Vec::with_capacity(3);

        let reader_inner = inner.clone();
        let stop = inner.stop.subscribe();
        tasks.push(tokio::spawn(async move {
            let dispatch = |msg| reader_inner.dispatch(msg);
            if let Err(cause) = control::read_loop(rd, reader, stop, dispatch).await {
                reader_inner.broken(cause);
            }
        }));

        let writer_inner = inner.clone();
        let ack = inner.shutdown_ack.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(cause) = control::write_loop(wr, outbound_rx, ack).await {
                writer_inner.broken(cause);
            }
        }));

        tasks.push(tokio::spawn(control::heartbeat_loop(
            inner.outbound.clone(),
            agent_id.clone(),
            copts.heartbeat_interval,
            inner.stop.subscribe(),
        )));

        if let Ok(mut g) = inner.tasks.lock() {
            g.extend(tasks);
        }

        if inner.status.advance(WorkingStatus::Working) != WorkingStatus::Starting {
            // A concurrent shutdown already ran; release what was started since.
            inner.teardown();
            return Err(AgentError::NotStartable("shut down during start"));
        }
        tracing::info!(agent_id = %agent_id, "agent: working");
        Ok(())
    }

    /// Stop relaying, tell the server, and close the control channel. Waits
    /// at most the acknowledgment timeout; later calls return immediately.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    pub fn status(&self) -> WorkingStatus {
        self.inner.status.get()
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.inner.agent_id.get().map(String::as_str)
    }

    pub fn tcp_proxy_map(&self) -> ProxyMap {
        ProxyMap::clone(&self.inner.tcp_map.load())
    }

    pub fn udp_proxy_map(&self) -> ProxyMap {
        ProxyMap::clone(&self.inner.udp_map.load())
    }

    /// Resolves to `Some(cause)` once, when the control channel fails while
    /// the agent is working.
    pub fn subscribe_broken(&self) -> watch::Receiver<Option<String>> {
        self.inner.broken.subscribe()
    }

    pub fn server_host(&self) -> &str {
        &self.inner.opts.control.server_host
    }
}

impl Inner {
    fn fail_start(&self, err: AgentError) -> AgentError {
        tracing::error!(err = %err, "agent: start failed");
        self.status.advance(WorkingStatus::Stopped);
        err
    }

    fn dispatch(&self, msg: ControlMessage) {
        let Some(relay) = self.relay.get() else {
            return;
        };
        let tcp = self.tcp_map.load();
        let udp = self.udp_map.load();
        let ctx = OrderContext {
            agent_id: self.agent_id.get().map(String::as_str).unwrap_or_default(),
            server_host: &self.opts.control.server_host,
            tcp: &tcp,
            udp: &udp,
        };
        match control::order_to_task(&msg, ctx) {
            Ok(Some(task)) => {
                if !relay.submit(task) {
                    tracing::debug!("control: relay loop not accepting tasks");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(err = %e, directive = ?msg.directive(), "control: ignored order"),
        }
    }

    fn broken(self: &Arc<Self>, cause: String) {
        if !self.status.is_running() {
            tracing::debug!(cause = %cause, "control: channel closed while stopping");
            return;
        }
        tracing::error!(cause = %cause, "agent: broken");
        let inner = self.clone();
        tokio::spawn(async move {
            if inner.shutdown().await {
                inner.broken.send_replace(Some(cause));
            }
        });
    }

    /// Returns `true` for the call that actually performed the shutdown.
    async fn shutdown(&self) -> bool {
        if !self.status.advance(WorkingStatus::Stopping).is_running() {
            return false;
        }
        tracing::info!("agent: stopping");

        if let Some(relay) = self.relay.get() {
            relay.shutdown();
        }

        if let Some(agent_id) = self.agent_id.get() {
            let bye = ControlMessage::request(agent_id.clone(), Directive::Shutdown, vec![]);
            let timeout = self.opts.control.shutdown_ack_timeout;
            let delivered = tokio::time::timeout(timeout, async {
                if !self.outbound.send(bye).await {
                    return false;
                }
                self.shutdown_ack.notified().await;
                true
            })
            .await;
            if !matches!(delivered, Ok(true)) {
                tracing::debug!(
                    timeout = %humantime::format_duration(timeout),
                    "agent: shutdown not acknowledged by writer"
                );
            }
        }

        self.teardown();
        tracing::info!("agent: stopped");
        true
    }

    /// Stop the relay loop and the control tasks. Safe to repeat; runs
    /// whatever the status says.
    fn teardown(&self) {
        if let Some(relay) = self.relay.get() {
            relay.shutdown();
            tracing::debug!(relay = %relay.status(), "agent: relay loop told to stop");
        }
        self.stop.send_replace(true);
        let tasks = self.tasks.lock().map(|mut g| std::mem::take(&mut *g)).unwrap_or_default();
        for t in tasks {
            t.abort();
        }
        self.status.advance(WorkingStatus::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netrelay::protocol::write_message;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    /// Accept the control connection and answer the registration handshake.
    async fn accept_agent(
        server: &TcpListener,
        tcp_reply: Option<Vec<String>>,
        udp_reply: Option<Vec<String>>,
    ) -> (TcpStream, FrameReader) {
        let (mut ctrl, _) = server.accept().await.unwrap();
        let mut reader = FrameReader::new();

        let hello = reader.read_message(&mut ctrl).await.unwrap().unwrap();
        assert_eq!(hello.directive(), Some(&Directive::RegisterControl));
        write_message(
            &mut ctrl,
            &ControlMessage::order(Directive::RegisterControlReply, strings(&["1", "agent-7"])),
        )
        .await
        .unwrap();

        for (reply, code) in [
            (tcp_reply, Directive::RegisterTcpProxiesReply),
            (udp_reply, Directive::RegisterUdpProxiesReply),
        ] {
            if let Some(args) = reply {
                reader.read_message(&mut ctrl).await.unwrap().unwrap();
                write_message(&mut ctrl, &ControlMessage::order(code, args)).await.unwrap();
            }
        }
        (ctrl, reader)
    }

    /// Next non-ping frame from the agent.
    async fn next_request(ctrl: &mut TcpStream, reader: &mut FrameReader) -> Option<ControlMessage> {
        loop {
            let msg = timeout(WAIT, reader.read_message(ctrl)).await.unwrap().unwrap()?;
            if msg.directive() != Some(&Directive::Ping) {
                return Some(msg);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_channel_end_to_end() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = service.local_addr().unwrap().port();
        let server_port = server.local_addr().unwrap().port();

        let agent = Agent::new(AgentOptions::new("127.0.0.1", server_port, vec![local_port], vec![]));
        let (started, (mut ctrl, mut reader)) = tokio::join!(
            agent.start(),
            accept_agent(&server, Some(strings(&["9090"])), None)
        );
        started.unwrap();
        assert_eq!(agent.status(), WorkingStatus::Working);
        assert_eq!(agent.agent_id(), Some("agent-7"));
        assert_eq!(agent.tcp_proxy_map(), ProxyMap::from([(local_port, 9090)]));
        assert!(agent.udp_proxy_map().is_empty());

        let order = ControlMessage::order(Directive::NeedTcpRelay, vec![local_port.to_string(), "temp-1".into()]);
        write_message(&mut ctrl, &order).await.unwrap();

        let (mut data, _) = timeout(WAIT, server.accept()).await.unwrap().unwrap();
        let (mut svc, _) = timeout(WAIT, service.accept()).await.unwrap().unwrap();

        let mut data_reader = FrameReader::new();
        let ready = timeout(WAIT, data_reader.read_message(&mut data)).await.unwrap().unwrap().unwrap();
        assert_eq!(ready.directive(), Some(&Directive::TcpRelayReady));
        assert_eq!(ready.agent_id, "agent-7");
        assert_eq!(ready.args(), [local_port.to_string(), "temp-1".to_string()]);

        data.write_all(b"ping from relay").await.unwrap();
        let mut buf = [0u8; 15];
        timeout(WAIT, svc.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"ping from relay");

        svc.write_all(b"pong from service").await.unwrap();
        let mut buf = [0u8; 17];
        timeout(WAIT, data.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"pong from service");

        drop(svc);
        let mut rest = Vec::new();
        timeout(WAIT, data.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());

        agent.shutdown().await;
        assert_eq!(agent.status(), WorkingStatus::Stopped);
        let bye = next_request(&mut ctrl, &mut reader).await.unwrap();
        assert_eq!(bye.directive(), Some(&Directive::Shutdown));
        assert_eq!(bye.agent_id, "agent-7");

        // Idempotent.
        timeout(WAIT, agent.shutdown()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn udp_channel_end_to_end() {
        let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = service.local_addr().unwrap().port();
        let remote_port = relay_udp.local_addr().unwrap().port();

        let agent = Agent::new(AgentOptions::new(
            "127.0.0.1",
            server.local_addr().unwrap().port(),
            vec![],
            vec![local_port],
        ));
        let (started, (mut ctrl, mut reader)) =
            tokio::join!(agent.start(), accept_agent(&server, None, Some(strings(&["9053"]))));
        started.unwrap();
        assert_eq!(agent.udp_proxy_map(), ProxyMap::from([(local_port, 9053)]));

        let order = ControlMessage::order(
            Directive::NeedUdpRelay,
            vec![local_port.to_string(), remote_port.to_string(), "chan-1".into()],
        );
        write_message(&mut ctrl, &order).await.unwrap();

        let mut buf = [0u8; 512];
        let (n, agent_addr) = timeout(WAIT, relay_udp.recv_from(&mut buf)).await.unwrap().unwrap();
        let probe = ControlMessage::parse(&buf[..n]).unwrap();
        assert_eq!(probe.directive(), Some(&Directive::UdpPenetration));
        assert_eq!(probe.agent_id, "agent-7");
        let ack = ControlMessage::order(Directive::UdpPenetrationAck, vec![]).encode().unwrap();
        relay_udp.send_to(&ack, agent_addr).await.unwrap();

        let ready = next_request(&mut ctrl, &mut reader).await.unwrap();
        assert_eq!(ready.directive(), Some(&Directive::UdpRelayReady));
        assert_eq!(ready.args(), [local_port.to_string(), "chan-1".to_string()]);

        relay_udp.send_to(b"dns?", agent_addr).await.unwrap();
        let (n, from) = timeout(WAIT, service.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"dns?");
        service.send_to(b"dns!", from).await.unwrap();
        let (n, _) = timeout(WAIT, relay_udp.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"dns!");

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn refused_port_fails_start() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = Agent::new(AgentOptions::new(
            "127.0.0.1",
            server.local_addr().unwrap().port(),
            vec![80, 443],
            vec![],
        ));
        let (started, _conn) = tokio::join!(agent.start(), accept_agent(&server, Some(strings(&["9000", "0"])), None));
        match started.unwrap_err() {
            AgentError::ProxyRegisterFailed { port, .. } => assert_eq!(port, 443),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(agent.status(), WorkingStatus::Stopped);
        assert!(matches!(agent.start().await, Err(AgentError::NotStartable(_))));
    }

    #[tokio::test]
    async fn unreachable_server_fails_start() {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        drop(l);
        let agent = Agent::new(AgentOptions::new("127.0.0.1", port, vec![80], vec![]));
        assert!(matches!(agent.start().await, Err(AgentError::ChannelRegisterFailed(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn server_hangup_reports_broken_once() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = Agent::new(AgentOptions::new(
            "127.0.0.1",
            server.local_addr().unwrap().port(),
            vec![8080],
            vec![],
        ));
        let mut broken = agent.subscribe_broken();
        let (started, (ctrl, _reader)) =
            tokio::join!(agent.start(), accept_agent(&server, Some(strings(&["9090"])), None));
        started.unwrap();

        drop(ctrl);
        timeout(WAIT, broken.changed()).await.unwrap().unwrap();
        let cause = broken.borrow_and_update().clone();
        assert!(cause.is_some());
        assert_eq!(agent.status(), WorkingStatus::Stopped);
        // Shutting down afterwards is a no-op.
        timeout(WAIT, agent.shutdown()).await.unwrap();
        assert!(!broken.has_changed().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_during_start_stops_everything() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = Agent::new(AgentOptions::new(
            "127.0.0.1",
            server.local_addr().unwrap().port(),
            vec![8080],
            vec![],
        ));

        let other = agent.clone();
        let fake_server = async {
            let (mut ctrl, _) = server.accept().await.unwrap();
            let mut reader = FrameReader::new();
            let hello = reader.read_message(&mut ctrl).await.unwrap().unwrap();
            assert_eq!(hello.directive(), Some(&Directive::RegisterControl));

            other.shutdown().await;

            write_message(
                &mut ctrl,
                &ControlMessage::order(Directive::RegisterControlReply, strings(&["1", "agent-7"])),
            )
            .await
            .unwrap();
            reader.read_message(&mut ctrl).await.unwrap().unwrap();
            write_message(
                &mut ctrl,
                &ControlMessage::order(Directive::RegisterTcpProxiesReply, strings(&["9090"])),
            )
            .await
            .unwrap();
            (ctrl, reader)
        };
        let (started, (mut ctrl, mut reader)) = tokio::join!(agent.start(), fake_server);

        assert!(matches!(started, Err(AgentError::NotStartable(_))));
        assert_eq!(agent.status(), WorkingStatus::Stopped);
        if let Some(relay) = agent.inner.relay.get() {
            let stopped = async {
                while relay.status() != WorkingStatus::Stopped {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            };
            timeout(WAIT, stopped).await.unwrap();
        }
        assert!(agent.inner.tasks.lock().unwrap().is_empty());
        assert_eq!(next_request(&mut ctrl, &mut reader).await, None);
    }

    #[tokio::test]
    async fn shutdown_waits_for_queue_space_to_send_bye() {
        let mut opts = AgentOptions::new("127.0.0.1", 1, vec![], vec![]);
        opts.control.outbound_queue = 1;
        opts.control.shutdown_ack_timeout = Duration::from_secs(2);
        let agent = Agent::new(opts);
        agent.inner.agent_id.set("agent-7".into()).unwrap();
        let mut rx = agent.inner.outbound_rx.lock().unwrap().take().unwrap();

        // Queue already full when shutdown starts.
        assert!(agent.inner.outbound.try_send(ControlMessage::request("agent-7", Directive::Ping, vec![])));

        let ack = agent.inner.shutdown_ack.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            ack.notify_one();
            (first.directive().cloned(), second.directive().cloned())
        });

        timeout(WAIT, agent.shutdown()).await.unwrap();
        let (first, second) = writer.await.unwrap();
        assert_eq!(first, Some(Directive::Ping));
        assert_eq!(second, Some(Directive::Shutdown));
        assert_eq!(agent.status(), WorkingStatus::Stopped);
    }
}
