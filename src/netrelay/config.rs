use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::netrelay::{
    agent::AgentOptions,
    net,
    relay::buffer::UDP_BUFFER_SIZE,
};

pub const CONFIG_ENV: &str = "NETRELAY_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already folds NETRELAY_CONFIG into the flag; this covers callers
    // that resolve without going through the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("netrelay.toml"));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["netrelay.toml", "netrelay.yaml", "netrelay.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no netrelay.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/netrelay/netrelay.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("org", "netrelay", "netrelay")
            .context("config: resolve user config dir")?;
        return Ok(proj.config_dir().join("netrelay.toml"));
    }
}

/// Create `path` from the commented template when it does not exist yet.
/// Returns whether a file was written.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_extension(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_extension(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

/// Read and normalise a config file. Required keys are checked later by
/// [`Config::validate`] so command-line overrides can fill them in.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_extension(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        ext => anyhow::bail!("config: unsupported config extension {ext:?}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub control: ControlConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Port TCP data channels connect to; `None` means the control port.
    pub relay_port: Option<u16>,
}

impl ServerConfig {
    pub fn relay_port(&self) -> u16 {
        self.relay_port.unwrap_or(self.port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub tcp: Vec<u16>,
    pub udp: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub dial_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown_ack_timeout: Duration,
    pub outbound_queue: usize,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
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

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    server: Option<FileServer>,
    proxy: Option<FileProxy>,
    control: Option<FileControl>,
    relay: Option<FileRelay>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    #[serde(default)]
    host: String,
    port: Option<i64>,
    relay_port: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProxy {
    #[serde(default)]
    tcp: Vec<i64>,
    #[serde(default)]
    udp: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileControl {
    dial_timeout_ms: Option<i64>,
    heartbeat_interval_ms: Option<i64>,
    shutdown_ack_timeout_ms: Option<i64>,
    outbound_queue: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    setup_timeout_ms: Option<i64>,
    setup_concurrency: Option<i64>,
    udp_idle_timeout_ms: Option<i64>,
    udp_pending_limit: Option<i64>,
    aggregation_window_ms: Option<i64>,
    sweep_interval_ms: Option<i64>,
    watchdog_threshold: Option<i64>,
    watchdog_window_ms: Option<i64>,
    watchdog_reset_interval_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

/// Non-positive or missing values fall back to `default_ms`.
fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

fn count(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(n) if n > 0 => n as usize,
        _ => default,
    }
}

fn port(key: &str, v: i64) -> anyhow::Result<u16> {
    match u16::try_from(v) {
        Ok(p) if p != 0 => Ok(p),
        _ => anyhow::bail!("config: {key} {v} out of range (expected 1..=65535)"),
    }
}

/// Ports in first-seen order with duplicates dropped.
fn dedup_ports(ports: impl IntoIterator<Item = u16>) -> Vec<u16> {
    let mut out: Vec<u16> = Vec::new();
    for p in ports {
        if !out.contains(&p) {
            out.push(p);
        }
    }
    out
}

fn non_empty(v: Option<String>, default: &str) -> String {
    match v {
        Some(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => default.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let server = fc.server.unwrap_or_default();
        let server = ServerConfig {
            host: server.host.trim().to_string(),
            port: match server.port {
                Some(p) => port("server.port", p)?,
                None => 0,
            },
            relay_port: server
                .relay_port
                .map(|p| port("server.relay_port", p))
                .transpose()?,
        };

        let proxy = fc.proxy.unwrap_or_default();
        let mut tcp = Vec::with_capacity(proxy.tcp.len());
        for (i, p) in proxy.tcp.into_iter().enumerate() {
            tcp.push(port(&format!("proxy.tcp[{i}]"), p)?);
        }
        let mut udp = Vec::with_capacity(proxy.udp.len());
        for (i, p) in proxy.udp.into_iter().enumerate() {
            udp.push(port(&format!("proxy.udp[{i}]"), p)?);
        }

        let c = fc.control.unwrap_or_default();
        let control = ControlConfig {
            dial_timeout: millis(c.dial_timeout_ms, 5000),
            heartbeat_interval: millis(c.heartbeat_interval_ms, 60_000),
            shutdown_ack_timeout: millis(c.shutdown_ack_timeout_ms, 1000),
            outbound_queue: count(c.outbound_queue, 256),
        };

        let r = fc.relay.unwrap_or_default();
        let default_concurrency = std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(4);
        let relay = RelayConfig {
            setup_timeout: millis(r.setup_timeout_ms, 60_000),
            setup_concurrency: count(r.setup_concurrency, default_concurrency),
            udp_idle_timeout: millis(r.udp_idle_timeout_ms, 30_000),
            udp_pending_limit: count(r.udp_pending_limit, 8 * UDP_BUFFER_SIZE).max(UDP_BUFFER_SIZE),
            aggregation_window: millis(r.aggregation_window_ms, 5),
            sweep_interval: millis(r.sweep_interval_ms, 1000),
            watchdog_threshold: u32::try_from(count(r.watchdog_threshold, 512)).unwrap_or(u32::MAX),
            watchdog_window: millis(r.watchdog_window_ms, 10),
            watchdog_reset_interval: millis(r.watchdog_reset_interval_ms, 60_000),
        };

        let l = fc.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: non_empty(l.level, "info").to_ascii_lowercase(),
            format: non_empty(l.format, "text").to_ascii_lowercase(),
            output: non_empty(l.output, "stderr"),
            add_source: l.add_source,
        };
        match logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("config: logging.format {other:?} (expected text or json)"),
        }

        Ok(Config {
            server,
            proxy: ProxyConfig {
                tcp: dedup_ports(tcp),
                udp: dedup_ports(udp),
            },
            control,
            relay,
            logging,
        })
    }

    /// Apply command-line overrides. `server` is `host:port`; non-empty port
    /// lists replace the configured ones.
    pub fn apply_overrides(
        &mut self,
        server: Option<&str>,
        tcp: &[u16],
        udp: &[u16],
    ) -> anyhow::Result<()> {
        if let Some(addr) = server {
            let (host, port) = net::split_host_port(addr).context("config: --server")?;
            if port == 0 {
                anyhow::bail!("config: --server port must be 1..=65535");
            }
            self.server.host = host;
            self.server.port = port;
        }
        if tcp.contains(&0) || udp.contains(&0) {
            anyhow::bail!("config: proxied ports must be 1..=65535");
        }
        if !tcp.is_empty() {
            self.proxy.tcp = dedup_ports(tcp.iter().copied());
        }
        if !udp.is_empty() {
            self.proxy.udp = dedup_ports(udp.iter().copied());
        }
        Ok(())
    }

    /// Check the keys the agent cannot start without.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("config: missing server.host");
        }
        if self.server.port == 0 {
            anyhow::bail!("config: missing server.port");
        }
        if self.proxy.tcp.is_empty() && self.proxy.udp.is_empty() {
            anyhow::bail!("config: missing proxy.tcp / proxy.udp (at least one port is required)");
        }
        Ok(())
    }

    pub fn agent_options(&self) -> AgentOptions {
        let host = self.server.host.as_str();
        let mut opts = AgentOptions::new(host, self.server.port, self.proxy.tcp.clone(), self.proxy.udp.clone());

        let control = &mut opts.control;
        control.dial_timeout = self.control.dial_timeout;
        control.heartbeat_interval = self.control.heartbeat_interval;
        control.shutdown_ack_timeout = self.control.shutdown_ack_timeout;
        control.outbound_queue = self.control.outbound_queue;

        let r = &self.relay;
        let relay = &mut opts.relay;
        relay.relay_addr = net::join_host_port(host, self.server.relay_port());
        relay.setup_timeout = r.setup_timeout;
        relay.setup_concurrency = r.setup_concurrency;
        relay.udp_idle_timeout = r.udp_idle_timeout;
        relay.udp_pending_limit = r.udp_pending_limit;
        relay.aggregation_window = r.aggregation_window;
        relay.sweep_interval = r.sweep_interval;
        relay.watchdog_threshold = r.watchdog_threshold;
        relay.watchdog_window = r.watchdog_window;
        relay.watchdog_reset_interval = r.watchdog_reset_interval;

        opts
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# netrelay configuration (auto-generated)
#
# This file was created because netrelay could not find a configuration file
# at the resolved config path. Fill in the relay server address and the local
# ports to expose, or pass them with --server/--tcp/--udp.

[server]
host = ""
port = 7000
# relay_port = 7000 # TCP data channels; defaults to port

[proxy]
tcp = []
udp = []

[control]
dial_timeout_ms = 5000
heartbeat_interval_ms = 60000
shutdown_ack_timeout_ms = 1000

[relay]
setup_timeout_ms = 60000
udp_idle_timeout_ms = 30000
aggregation_window_ms = 5

[logging]
level = "info"
format = "text" # text | json
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# netrelay configuration (auto-generated)
#
# This file was created because netrelay could not find a configuration file
# at the resolved config path. Fill in the relay server address and the local
# ports to expose, or pass them with --server/--tcp/--udp.

server:
  host: ""
  port: 7000
  # relay_port: 7000 # TCP data channels; defaults to port

proxy:
  tcp: []
  udp: []

control:
  dial_timeout_ms: 5000
  heartbeat_interval_ms: 60000
  shutdown_ack_timeout_ms: 1000

relay:
  setup_timeout_ms: 60000
  udp_idle_timeout_ms: 30000
  aggregation_window_ms: 5

logging:
  level: "info"
  format: "text" # text | json
  output: "stderr"
  add_source: false
"#;
