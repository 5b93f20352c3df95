use std::path::PathBuf;

use anyhow::Context;

use crate::netrelay::{
    agent::Agent,
    config,
    error::AgentError,
    logging, net,
    relay::Protocol,
};

/// Command-line overrides layered on top of the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub server: Option<String>,
    pub tcp: Vec<u16>,
    pub udp: Vec<u16>,
}

pub async fn run(config_path: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    cfg.apply_overrides(overrides.server.as_deref(), &overrides.tcp, &overrides.udp)?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    cfg.validate()
        .with_context(|| format!("config: {}", resolved.path.display()))?;

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        server = %net::join_host_port(&cfg.server.host, cfg.server.port),
        relay_port = cfg.server.relay_port(),
        tcp_ports = cfg.proxy.tcp.len(),
        udp_ports = cfg.proxy.udp.len(),
        "netrelay: starting"
    );

    let agent = Agent::new(cfg.agent_options());
    let mut broken = agent.subscribe_broken();

    agent.start().await.context("agent: start")?;
    log_mappings(&agent);

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        cause = broken.wait_for(|b| b.is_some()) => {
            let cause = match cause {
                Ok(cause) => cause.clone().unwrap_or_default(),
                Err(_) => "broken notifier dropped".to_string(),
            };
            tracing::error!(cause = %cause, "shutdown: agent broken");
            Err(AgentError::Broken(cause).into())
        }
    };

    agent.shutdown().await;
    tracing::info!(status = %agent.status(), "netrelay: stopped");
    outcome
}

fn log_mappings(agent: &Agent) {
    let remote = agent.server_host();
    let maps = [
        (Protocol::Tcp, agent.tcp_proxy_map()),
        (Protocol::Udp, agent.udp_proxy_map()),
    ];
    for (protocol, map) in maps {
        for (local, remote_port) in map {
            tracing::info!(
                protocol = %protocol,
                local_port = local,
                remote_addr = %remote,
                remote_port,
                "netrelay: proxy mapped"
            );
        }
    }
    tracing::info!(agent_id = agent.agent_id().unwrap_or_default(), "netrelay: working");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
