use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Join a host and port, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Split `host:port` (or `[v6]:port`). The host is returned without brackets.
pub fn split_host_port(addr: &str) -> anyhow::Result<(String, u16)> {
    let addr = addr.trim();
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("net: unterminated '[' in {addr:?}"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| anyhow::anyhow!("net: missing port in {addr:?}"))?;
        (host, port)
    } else {
        addr.rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("net: missing port in {addr:?}"))?
    };
    if host.is_empty() {
        anyhow::bail!("net: missing host in {addr:?}");
    }
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("net: invalid port in {addr:?}"))?;
    Ok((host.to_string(), port))
}

/// Ephemeral bind address in the same family as `remote`.
pub fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}
