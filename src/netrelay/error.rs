use thiserror::Error;

use crate::netrelay::relay::Protocol;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("control channel register failed: {0}")]
    ChannelRegisterFailed(String),
    #[error("{protocol} proxy register failed for port {port}: {reason}")]
    ProxyRegisterFailed {
        protocol: Protocol,
        port: u16,
        reason: String,
    },
    #[error("agent broken: {0}")]
    Broken(String),
    #[error("agent cannot be started: {0}")]
    NotStartable(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
