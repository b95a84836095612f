//! Orchestration: resolves config, wires up the subsystems the active subcommand needs, and runs
//! them to completion under a shared shutdown signal. No reload loop here — unlike the teacher
//! crate this is grounded on, eldatun's config has no hot-reload path (spec scope: "Persisted
//! state: none", no reload operation).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use tokio::task::JoinSet;

use crate::eldatun::admin;
use crate::eldatun::client::connector::ConnectorOptions;
use crate::eldatun::client::direct_dial::DirectDialer;
use crate::eldatun::client::pool::{Pool, PoolOptions};
use crate::eldatun::client::socks5::{self, Socks5Options};
use crate::eldatun::client::tun::{IpFlowSource, UnavailableTunSource};
use crate::eldatun::config::{self, ClientConfig, ServerConfig};
use crate::eldatun::logging;
use crate::eldatun::net::normalize_bind_addr;
use crate::eldatun::server::http::{self, HttpServerOptions};
use crate::eldatun::splice::splice_growing_buffer;
use crate::eldatun::telemetry::SessionRegistry;

fn build_pool(cfg: &ClientConfig) -> Arc<Pool> {
    Pool::new(PoolOptions {
        connector: ConnectorOptions {
            address: cfg.address.clone(),
            connect_timeout: cfg.connect_timeout,
            max_substreams: cfg.max_connection_multiplex,
            remote_dial_timeout: cfg.remote_timeout,
            keep_alive_timeout: cfg.keep_alive_timeout,
        },
        preconnect_pool_size: cfg.preconnect_pool_size,
    })
}

fn spawn_admin_if_configured(tasks: &mut JoinSet<anyhow::Result<()>>, addr: &Option<String>, state: admin::AdminState) {
    let Some(addr) = addr.clone() else { return };
    let bind = normalize_bind_addr(&addr).into_owned();
    tasks.spawn(async move {
        let addr: SocketAddr = bind.parse().with_context(|| format!("invalid admin_addr: {bind}"))?;
        admin::serve(addr, state).await
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn drain(mut tasks: JoinSet<anyhow::Result<()>>) {
    let drain_fut = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain_fut).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

/// `eldatun client dial <addr> [--remote-net tcp|udp]`: one-shot dial through the pool, splicing
/// the resulting flow against the process's own stdin/stdout. Exits once either side closes.
pub async fn run_client_dial(config_path: Option<PathBuf>, network: String, address: String) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path, "eldatun-client")?;
    let cfg = config::load_client_config(&resolved.path)?;
    let _logrt = logging::init(&cfg.log_level)?;

    let pool = build_pool(&cfg);
    let upstream = pool.dial_context(&network, &address).await?;

    let stdio = StdioStream::new();
    splice_growing_buffer(stdio, upstream).await.context("dial: flow ended with an error")?;
    Ok(())
}

/// `eldatun client forward <local-addr> <remote-addr>`: listens locally, forwarding every
/// accepted TCP connection through the pool to a fixed remote address.
pub async fn run_client_forward(config_path: Option<PathBuf>, listen_addr: String, remote_address: String) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path, "eldatun-client")?;
    let cfg = config::load_client_config(&resolved.path)?;
    let _logrt = logging::init(&cfg.log_level)?;

    let pool = build_pool(&cfg);
    if cfg.preconnect_pool_size > 0 {
        pool.enable_preconnect();
    }

    let bind = normalize_bind_addr(&listen_addr).into_owned();
    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("bind {bind}"))?;
    tracing::info!(listen_addr = %bind, remote = %remote_address, "client forward: listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let pool = pool.clone();
        let remote_address = remote_address.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = accepted?;
                        let pool = pool.clone();
                        let remote_address = remote_address.clone();
                        tokio::spawn(async move {
                            match pool.dial_context("tcp", &remote_address).await {
                                Ok(upstream) => {
                                    if let Err(e) = splice_growing_buffer(stream, upstream).await {
                                        tracing::debug!(peer = %peer, err = %e, "forward: flow ended");
                                    }
                                }
                                Err(e) => tracing::warn!(peer = %peer, err = %e, "forward: dial failed"),
                            }
                        });
                    }
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        });
    }

    spawn_admin_if_configured(
        &mut tasks,
        &cfg.admin_addr,
        admin::AdminState { sessions: Arc::new(SessionRegistry::new()), pool: Some(pool.clone()) },
    );

    wait_and_drain(shutdown_tx, tasks).await
}

/// `eldatun client proxy <local-addr>`: SOCKS5 ingress, optional TUN ingress, optional preconnect
/// pool with periodic pings.
pub async fn run_client_proxy(config_path: Option<PathBuf>, listen_addr: String) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path, "eldatun-client")?;
    let cfg = config::load_client_config(&resolved.path)?;
    let _logrt = logging::init(&cfg.log_level)?;

    let pool = build_pool(&cfg);
    if cfg.preconnect_pool_size > 0 {
        pool.enable_preconnect();
    }

    let bypass = match &cfg.direct_dial {
        Some(pattern) => {
            let re = Regex::new(pattern).with_context(|| format!("invalid direct_dial regex {pattern:?}"))?;
            tracing::info!(pattern = %pattern, "client proxy: direct-dial bypass configured");
            Some(re)
        }
        None => None,
    };
    let dialer = Arc::new(DirectDialer::new(pool.clone(), bypass));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let bind = normalize_bind_addr(&listen_addr).into_owned();
        let dialer = dialer.clone();
        let shutdown = shutdown_rx.clone();
        let dial_timeout = cfg.remote_timeout;
        tasks.spawn(async move {
            let addr: SocketAddr = bind.parse().with_context(|| format!("invalid socks5 listen_addr {bind}"))?;
            socks5::serve(dialer, Socks5Options { listen_addr: addr, dial_timeout }, shutdown)
                .await
                .map_err(Into::into)
        });
    }

    if let Some(device) = &cfg.tun_device {
        tracing::info!(device = %device, "client proxy: tun ingress requested");
        let source = UnavailableTunSource;
        let dial: crate::eldatun::client::tun::DialFn = {
            let pool = pool.clone();
            Arc::new(move |network, address| {
                let pool = pool.clone();
                Box::pin(async move { pool.dial_context(&network, &address).await })
            })
        };
        if let Err(e) = source.run(dial).await {
            tracing::warn!(err = %e, "client proxy: tun ingress unavailable");
        }
    }

    spawn_admin_if_configured(
        &mut tasks,
        &cfg.admin_addr,
        admin::AdminState { sessions: Arc::new(SessionRegistry::new()), pool: Some(pool.clone()) },
    );

    wait_and_drain(shutdown_tx, tasks).await
}

/// `eldatun server`: runs the HTTP(S) hijack endpoint, an optional plaintext redirector, and an
/// optional admin server.
pub async fn run_server(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path, "eldatun-server")?;
    let cfg: ServerConfig = config::load_server_config(&resolved.path)?;
    let _logrt = logging::init(&cfg.log_level)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let listen_addr: SocketAddr = normalize_bind_addr(&cfg.listen_addr)
        .parse()
        .with_context(|| format!("invalid listen_addr {}", cfg.listen_addr))?;

    let http_opts = Arc::new(HttpServerOptions {
        listen_addr,
        token: cfg.token.clone(),
        static_dir: cfg.static_dir.clone(),
        domain: cfg.domain.clone(),
        session_deadline: cfg.dial_timeout,
        keep_alive_timeout: cfg.keep_alive_timeout,
    });

    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { http::serve(http_opts, shutdown).await.map_err(Into::into) });
    }

    if let Some(redirector_addr) = &cfg.redirector_addr {
        let redirector_addr: SocketAddr = normalize_bind_addr(redirector_addr)
            .parse()
            .with_context(|| format!("invalid redirector_addr {redirector_addr}"))?;
        let domain = cfg.domain.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { http::serve_redirector(redirector_addr, domain, shutdown).await.map_err(Into::into) });
    }

    spawn_admin_if_configured(
        &mut tasks,
        &cfg.admin_addr,
        admin::AdminState { sessions: Arc::new(SessionRegistry::new()), pool: None },
    );

    wait_and_drain(shutdown_tx, tasks).await
}

async fn wait_and_drain(shutdown_tx: tokio::sync::watch::Sender<bool>, mut tasks: JoinSet<anyhow::Result<()>>) -> anyhow::Result<()> {
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    drain(tasks).await;
    Ok(())
}

/// Adapts the process's stdin/stdout into a single duplex stream for `client dial`.
struct StdioStream {
    stdin: tokio::io::Stdin,
    stdout: tokio::io::Stdout,
}

impl StdioStream {
    fn new() -> Self {
        Self { stdin: tokio::io::stdin(), stdout: tokio::io::stdout() }
    }
}

impl tokio::io::AsyncRead for StdioStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().stdin).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for StdioStream {
    fn poll_write(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.get_mut().stdout).poll_write(cx, buf)
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().stdout).poll_flush(cx)
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().stdout).poll_shutdown(cx)
    }
}
