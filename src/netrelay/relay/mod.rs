//! Single-threaded relay engine: every proxied TCP pair and UDP flow is
//! driven by one readiness loop. Connection setup runs on the tokio runtime
//! and hands finished attachments back through [`RelayHandle::submit`].

pub mod attachment;
pub mod buffer;
pub mod event_loop;
pub mod setup;
pub mod task;
pub mod timer;
pub mod watchdog;

use std::time::Duration;

pub use attachment::{ChannelMeta, Protocol, RelayChannel, TcpRelayPair, UdpFlow};
pub use event_loop::{RelayHandle, spawn};
pub use task::RelayTask;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// `host:port` every TCP data channel connects to.
    pub relay_addr: String,
    pub setup_timeout: Duration,
    pub setup_concurrency: usize,
    pub udp_idle_timeout: Duration,
    pub udp_pending_limit: usize,
    pub aggregation_window: Duration,
    pub sweep_interval: Duration,
    pub watchdog_threshold: u32,
    pub watchdog_window: Duration,
    pub watchdog_reset_interval: Duration,
}

impl RelayOptions {
    pub fn new(relay_addr: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            setup_timeout: Duration::from_secs(60),
            setup_concurrency: std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(4),
            udp_idle_timeout: attachment::DEFAULT_UDP_IDLE_TIMEOUT,
            udp_pending_limit: attachment::DEFAULT_UDP_PENDING_LIMIT,
            aggregation_window: Duration::from_millis(5),
            sweep_interval: Duration::from_secs(1),
            watchdog_threshold: 512,
            watchdog_window: Duration::from_millis(10),
            watchdog_reset_interval: Duration::from_secs(60),
        }
    }
}
