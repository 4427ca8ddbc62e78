mod outpost;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "outpost",
    version,
    about = "Outpost - expose local HTTP services through a public relay"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses OUTPOST_CONFIG; then auto-detects outpost.toml > outpost.yaml > outpost.yml from CWD; then falls back to the OS default path (Linux: /etc/outpost/outpost.toml; others: user config dir).
    #[arg(long, env = "OUTPOST_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Tunnel a local HTTP port through a relay without a config file.
    Http {
        /// Local port to expose.
        port: u16,
        /// Relay tunnel endpoint.
        #[arg(long, default_value = "ws://127.0.0.1:7000/")]
        server: String,
        #[arg(long, env = "OUTPOST_API_KEY")]
        api_key: Option<String>,
        /// Requested subdomain; a random one is assigned when omitted.
        #[arg(long)]
        subdomain: Option<String>,
        /// Local host the port is served on.
        #[arg(long, default_value = "localhost")]
        host: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None => outpost::run(cli.config).await,
        Some(Command::Http {
            port,
            server,
            api_key,
            subdomain,
            host,
        }) => {
            let mut opts = outpost::tunnel::client::ClientOptions::new(server, port);
            opts.local_host = host;
            opts.api_key = api_key.filter(|k| !k.is_empty());
            opts.subdomain = subdomain
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty());
            outpost::run_http(opts).await
        }
    }
}
