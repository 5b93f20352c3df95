use crate::netrelay::relay::attachment::{ChannelKey, RelayChannel, Side};

/// Work handed to the relay event loop from other threads, or scheduled by
/// the loop itself.
#[derive(Debug)]
pub enum RelayTask {
    /// A new pair or flow with no sockets yet; the loop starts its setup.
    Register(RelayChannel),
    /// Setup finished; register the sockets and announce readiness.
    Finalize(RelayChannel),
    /// Aggregation recheck: arm write interest on the peer of `from` if the
    /// bytes read from `from` are still waiting.
    ArmWrite { key: ChannelKey, from: Side },
    /// Replace the multiplexer as if the empty-poll watchdog had fired.
    #[cfg(test)]
    Rebuild,
}

impl RelayTask {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayTask::Register(_) => "register",
            RelayTask::Finalize(_) => "finalize",
            RelayTask::ArmWrite { .. } => "arm-write",
            #[cfg(test)]
            RelayTask::Rebuild => "rebuild",
        }
    }
}
