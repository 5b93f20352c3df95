//! Channel setup (connects and the UDP penetration handshake), run on the tokio
//! runtime so the event loop never waits on the network.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::netrelay::net;
use crate::netrelay::protocol::{ControlMessage, Directive, MAX_FRAME_BYTES, ProtocolError};
use crate::netrelay::relay::attachment::{TcpRelayPair, UdpFlow};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("timed out after {}", humantime::format_duration(*.0))]
    TimedOut(Duration),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("unexpected penetration reply {0:?}")]
    UnexpectedReply(Option<Directive>),
    #[error("cannot resolve {0}")]
    Unresolved(String),
}

/// Bounded pool for setup jobs: at most `concurrency` run at once and each is
/// abandoned after `timeout`. Abandoning a job drops its partial sockets.
#[derive(Clone)]
pub struct SetupPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl SetupPool {
    pub fn new(handle: Handle, concurrency: usize, timeout: Duration) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
        }
    }

    pub fn run<T, F, S, E>(&self, job: F, on_ready: S, on_failure: E)
    where
        T: Send + 'static,
        F: Future<Output = Result<T, SetupError>> + Send + 'static,
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(SetupError) + Send + 'static,
    {
        let permits = self.permits.clone();
        let timeout = self.timeout;
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match tokio::time::timeout(timeout, job).await {
                Ok(Ok(v)) => on_ready(v),
                Ok(Err(e)) => on_failure(e),
                Err(_) => on_failure(SetupError::TimedOut(timeout)),
            }
        });
    }
}

async fn connect_nodelay(addr: &str) -> io::Result<mio::net::TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let std = stream.into_std()?;
    std.set_nonblocking(true)?;
    Ok(mio::net::TcpStream::from_std(std))
}

/// Connect the local service side and the relay side of a pair.
pub async fn connect_tcp_pair(
    mut pair: TcpRelayPair,
    relay_addr: String,
) -> Result<TcpRelayPair, SetupError> {
    let local_addr = net::join_host_port("127.0.0.1", pair.meta.proxied_port);
    let response = connect_nodelay(&local_addr).await?;
    let relay = connect_nodelay(&relay_addr).await?;
    pair.attach(response, relay);
    Ok(pair)
}

/// Resolve the remote endpoint, send the penetration probe from a fresh
/// socket and wait for the server's acknowledgement.
pub async fn penetrate_udp(mut flow: UdpFlow) -> Result<UdpFlow, SetupError> {
    let target = net::join_host_port(flow.remote_host(), flow.remote_port());
    let remote: SocketAddr = lookup_host(&target)
        .await?
        .next()
        .ok_or_else(|| SetupError::Unresolved(target.clone()))?;

    let socket = UdpSocket::bind(net::unspecified_for(&remote)).await?;
    let probe = ControlMessage::request(
        flow.meta.agent_id.clone(),
        Directive::UdpPenetration,
        vec![],
    )
    .encode()?;
    socket.send_to(&probe, remote).await?;

    let mut buf = [0u8; MAX_FRAME_BYTES];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if from != remote {
            tracing::debug!(from = %from, "relay: ignored datagram during udp penetration");
            continue;
        }
        let reply = ControlMessage::parse(&buf[..n])?;
        match reply.directive() {
            Some(Directive::UdpPenetrationAck) => break,
            other => return Err(SetupError::UnexpectedReply(other.cloned())),
        }
    }

    let std = socket.into_std()?;
    std.set_nonblocking(true)?;
    flow.attach(mio::net::UdpSocket::from_std(std), remote);
    Ok(flow)
}
