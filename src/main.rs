mod eldatun;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use eldatun::app;

#[derive(Debug, Parser)]
#[command(name = "eldatun", version, about = "HTTP(S)-hijacking multiplexed tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Client-side subcommands.
    Client {
        #[command(subcommand)]
        command: ClientCommand,
    },
    /// Run the HTTP(S) hijack endpoint (+ optional redirector).
    Server {
        /// Path to the server config file (.toml/.yaml/.yml). Falls back to ELDATUN_CONFIG, then
        /// cwd auto-detection, then the OS default config path.
        #[arg(long, env = "ELDATUN_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    /// One-shot dial through the pool, splicing the flow against stdin/stdout.
    Dial {
        /// Remote address to dial, e.g. "example.invalid:443".
        address: String,
        /// Remote network: "tcp" or "udp".
        #[arg(long, default_value = "tcp")]
        remote_net: String,
        #[arg(long, env = "ELDATUN_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Listen locally, forwarding every accepted TCP connection through the pool.
    Forward {
        /// Local address to listen on, e.g. "127.0.0.1:9000".
        local_addr: String,
        /// Remote address to forward every connection to.
        remote_addr: String,
        #[arg(long, env = "ELDATUN_CONFIG")]
        config: Option<PathBuf>,
    },
    /// SOCKS5 ingress (+ optional TUN ingress, preconnect pool).
    Proxy {
        /// Local address the SOCKS5 listener binds to, e.g. "127.0.0.1:1080".
        local_addr: String,
        #[arg(long, env = "ELDATUN_CONFIG")]
        config: Option<PathBuf>,
    },
}

/// Raises `RLIMIT_NOFILE` to its hard max, best-effort: every spliced flow holds two file
/// descriptors open for its lifetime. Logging isn't set up yet at this point, so failures go to
/// stderr directly rather than through `tracing`, same as the original's `init()`-time behavior.
#[cfg(unix)]
fn raise_nofile_rlimit() {
    match rlimit::increase_nofile_limit(u64::MAX) {
        Ok(new_limit) => eprintln!("eldatun: raised RLIMIT_NOFILE to {new_limit}"),
        Err(e) => eprintln!("eldatun: unable to raise RLIMIT_NOFILE: {e}"),
    }
}

#[cfg(not(unix))]
fn raise_nofile_rlimit() {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    raise_nofile_rlimit();
    let cli = Cli::parse();
    match cli.command {
        Command::Client { command } => match command {
            ClientCommand::Dial { address, remote_net, config } => {
                app::run_client_dial(config, remote_net, address).await
            }
            ClientCommand::Forward { local_addr, remote_addr, config } => {
                app::run_client_forward(config, local_addr, remote_addr).await
            }
            ClientCommand::Proxy { local_addr, config } => app::run_client_proxy(config, local_addr).await,
        },
        Command::Server { config } => app::run_server(config).await,
    }
}
