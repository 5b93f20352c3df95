//! Control channel to the relay server: the registration handshake, and the
//! reader / writer / heartbeat loops that run once the agent is working.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc, watch};

use crate::netrelay::error::AgentError;
use crate::netrelay::protocol::{ControlMessage, Directive, FrameReader, ProtocolError, write_message};
use crate::netrelay::relay::{ChannelMeta, Protocol, RelayChannel, RelayTask, TcpRelayPair, UdpFlow};

/// Local port -> public port assigned by the server.
pub type ProxyMap = BTreeMap<u16, u16>;

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub server_host: String,
    pub server_port: u16,
    pub dial_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown_ack_timeout: Duration,
    pub outbound_queue: usize,
}

impl ControlOptions {
    pub fn new(server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            server_host: server_host.into(),
            server_port,
            dial_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(60),
            shutdown_ack_timeout: Duration::from_secs(1),
            outbound_queue: 256,
        }
    }
}

/// The only way to enqueue outbound control traffic. Messages are written by
/// the writer loop in submission order.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlSender {
    pub fn new(tx: mpsc::Sender<ControlMessage>) -> Self {
        Self { tx }
    }

    /// Waits for queue capacity. `false` once the writer is gone.
    pub async fn send(&self, msg: ControlMessage) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    /// Never waits; a full queue drops the message.
    pub fn try_send(&self, msg: ControlMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    directive = ?msg.directive(),
                    "control: outbound queue full; message dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyAssignment {
    pub mapping: ProxyMap,
    /// Requested ports the server refused, in request order.
    pub rejected: Vec<u16>,
}

/// Pair requested ports with the positional reply. `"0"`, a missing entry or
/// anything that is not a port counts as a rejection.
pub fn align_proxy_reply(requested: &[u16], reply: &[String]) -> ProxyAssignment {
    let mut out = ProxyAssignment::default();
    for (i, &port) in requested.iter().enumerate() {
        match reply.get(i).and_then(|s| s.trim().parse::<u16>().ok()) {
            Some(remote) if remote != 0 => {
                out.mapping.insert(port, remote);
            }
            _ => out.rejected.push(port),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub agent_id: String,
    pub tcp: ProxyMap,
    pub udp: ProxyMap,
}

async fn exchange<S>(
    stream: &mut S,
    reader: &mut FrameReader,
    msg: ControlMessage,
    timeout: Duration,
) -> Result<ControlMessage, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &msg).await.map_err(|e| e.to_string())?;
    loop {
        let reply = tokio::time::timeout(timeout, reader.read_message(stream))
            .await
            .map_err(|_| format!("no reply within {}", humantime::format_duration(timeout)))?;
        match reply {
            Ok(Some(reply)) => return Ok(reply),
            Ok(None) => return Err("connection closed by server".to_string()),
            Err(ProtocolError::Io(e)) => return Err(e.to_string()),
            Err(e) => tracing::warn!(err = %e, "control: dropped malformed reply"),
        }
    }
}

/// Run the startup handshake: register the control channel, then the TCP and
/// UDP proxy ports. Any refusal fails the whole registration.
pub async fn register<S>(
    stream: &mut S,
    reader: &mut FrameReader,
    tcp_ports: &[u16],
    udp_ports: &[u16],
    timeout: Duration,
) -> Result<Registration, AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = exchange(
        stream,
        reader,
        ControlMessage::request("", Directive::RegisterControl, vec![]),
        timeout,
    )
    .await
    .map_err(AgentError::ChannelRegisterFailed)?;

    let agent_id = match reply.args() {
        [flag, id, ..] if flag != "0" && !id.is_empty() => id.clone(),
        _ => {
            return Err(AgentError::ChannelRegisterFailed(format!(
                "refused by server (reply {:?})",
                reply.args()
            )));
        }
    };
    tracing::info!(agent_id = %agent_id, "control: channel registered");

    let tcp = register_proxies(stream, reader, &agent_id, Protocol::Tcp, tcp_ports, timeout).await?;
    let udp = register_proxies(stream, reader, &agent_id, Protocol::Udp, udp_ports, timeout).await?;

    Ok(Registration { agent_id, tcp, udp })
}

async fn register_proxies<S>(
    stream: &mut S,
    reader: &mut FrameReader,
    agent_id: &str,
    protocol: Protocol,
    ports: &[u16],
    timeout: Duration,
) -> Result<ProxyMap, AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if ports.is_empty() {
        return Ok(ProxyMap::new());
    }
    let directive = match protocol {
        Protocol::Tcp => Directive::RegisterTcpProxies,
        Protocol::Udp => Directive::RegisterUdpProxies,
    };
    let args = ports.iter().map(u16::to_string).collect();
    let reply = exchange(stream, reader, ControlMessage::request(agent_id, directive, args), timeout)
        .await
        .map_err(|reason| AgentError::ProxyRegisterFailed {
            protocol,
            port: ports[0],
            reason,
        })?;

    let assignment = align_proxy_reply(ports, reply.args());
    if let Some(&port) = assignment.rejected.first() {
        return Err(AgentError::ProxyRegisterFailed {
            protocol,
            port,
            reason: "refused by server".to_string(),
        });
    }
    tracing::info!(protocol = %protocol, ports = ports.len(), "control: proxies registered");
    Ok(assignment.mapping)
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("frame carries no order")]
    NotAnOrder,
    #[error("missing argument #{0}")]
    MissingArg(usize),
    #[error("bad port {0:?}")]
    BadPort(String),
    #[error("{0} port {1} was not registered")]
    Unregistered(Protocol, u16),
    #[error("unexpected directive {0}")]
    Unexpected(Directive),
}

/// What the reader needs to turn server orders into relay tasks.
#[derive(Debug, Clone, Copy)]
pub struct OrderContext<'a> {
    pub agent_id: &'a str,
    pub server_host: &'a str,
    pub tcp: &'a ProxyMap,
    pub udp: &'a ProxyMap,
}

fn arg(args: &[String], i: usize) -> Result<&str, OrderError> {
    args.get(i).map(String::as_str).ok_or(OrderError::MissingArg(i))
}

fn port_arg(args: &[String], i: usize) -> Result<u16, OrderError> {
    let s = arg(args, i)?;
    s.trim().parse().map_err(|_| OrderError::BadPort(s.to_string()))
}

/// Map an inbound order to a relay task. `Ok(None)` for orders that need no
/// relay work (server pings).
pub fn order_to_task(msg: &ControlMessage, ctx: OrderContext<'_>) -> Result<Option<RelayTask>, OrderError> {
    let order = msg.order.as_ref().ok_or(OrderError::NotAnOrder)?;
    let args = &order.args;
    match &order.directive {
        Directive::NeedTcpRelay => {
            let port = port_arg(args, 0)?;
            let temp_id = arg(args, 1)?;
            let proxy_port = *ctx.tcp.get(&port).ok_or(OrderError::Unregistered(Protocol::Tcp, port))?;
            let meta = ChannelMeta {
                agent_id: ctx.agent_id.to_string(),
                proxied_port: port,
                proxy_port,
            };
            Ok(Some(RelayTask::Register(RelayChannel::Tcp(TcpRelayPair::new(meta, temp_id)))))
        }
        Directive::NeedUdpRelay => {
            let port = port_arg(args, 0)?;
            let remote_port = port_arg(args, 1)?;
            let channel_id = arg(args, 2)?;
            let proxy_port = *ctx.udp.get(&port).ok_or(OrderError::Unregistered(Protocol::Udp, port))?;
            let meta = ChannelMeta {
                agent_id: ctx.agent_id.to_string(),
                proxied_port: port,
                proxy_port,
            };
            let flow = UdpFlow::new(meta, channel_id, ctx.server_host, remote_port);
            Ok(Some(RelayTask::Register(RelayChannel::Udp(flow))))
        }
        Directive::Ping => Ok(None),
        other => Err(OrderError::Unexpected(other.clone())),
    }
}

/// Read orders until the stop signal fires or the channel fails. Returns the
/// failure cause; malformed frames are logged and skipped.
pub async fn read_loop<R, F>(
    mut rd: R,
    mut reader: FrameReader,
    mut stop: watch::Receiver<bool>,
    mut on_order: F,
) -> Result<(), String>
where
    R: AsyncRead + Unpin,
    F: FnMut(ControlMessage),
{
    loop {
        tokio::select! {
            _ = stop.changed() => return Ok(()),
            res = reader.read_message(&mut rd) => match res {
                Ok(Some(msg)) => {
                    tracing::trace!(directive = ?msg.directive(), "control: order received");
                    on_order(msg);
                }
                Ok(None) => return Err("control channel closed by server".to_string()),
                Err(ProtocolError::Io(e)) => return Err(format!("control channel read failed: {e}")),
                Err(e) => tracing::warn!(err = %e, "control: dropped malformed frame"),
            },
        }
    }
}

/// Drain the outbound queue onto the socket. Writing the shutdown directive
/// signals `ack` and ends the loop.
pub async fn write_loop<W>(mut wr: W, mut rx: mpsc::Receiver<ControlMessage>, ack: Arc<Notify>) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let frame = match msg.encode() {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(err = %e, directive = ?msg.directive(), "control: cannot encode message");
                continue;
            }
        };
        if let Err(e) = wr.write_all(&frame).await {
            return Err(format!("control channel write failed: {e}"));
        }
        tracing::trace!(directive = ?msg.directive(), "control: message sent");
        if msg.directive() == Some(&Directive::Shutdown) {
            let _ = wr.flush().await;
            ack.notify_one();
            let _ = wr.shutdown().await;
            return Ok(());
        }
    }
    Ok(())
}

/// Enqueue a ping right away and then every `interval`.
pub async fn heartbeat_loop(
    sender: ControlSender,
    agent_id: String,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {
                if !sender.send(ControlMessage::request(agent_id.clone(), Directive::Ping, vec![])).await {
                    return;
                }
            }
        }
    }
}
