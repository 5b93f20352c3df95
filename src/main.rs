mod netrelay;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "netrelay",
    version,
    about = "netrelay - reverse-tunnel agent exposing local TCP/UDP services through a relay server"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses NETRELAY_CONFIG; then auto-detects netrelay.toml > netrelay.yaml > netrelay.yml from CWD; then falls back to the OS default path (Linux: /etc/netrelay/netrelay.toml; others: user config dir).
    #[arg(long, env = "NETRELAY_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Relay server control address (host:port); overrides [server] host/port.
    #[arg(long, value_name = "HOST:PORT")]
    server: Option<String>,

    /// Local TCP port to expose; repeatable, replaces [proxy] tcp.
    #[arg(long = "tcp", value_name = "PORT", value_parser = clap::value_parser!(u16).range(1..))]
    tcp: Vec<u16>,

    /// Local UDP port to expose; repeatable, replaces [proxy] udp.
    #[arg(long = "udp", value_name = "PORT", value_parser = clap::value_parser!(u16).range(1..))]
    udp: Vec<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    netrelay::run(
        cli.config,
        netrelay::app::Overrides {
            server: cli.server,
            tcp: cli.tcp,
            udp: cli.udp,
        },
    )
    .await
}
