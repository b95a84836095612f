//! Connector E (§4.6): establishes the outer HTTP(S) connection, hijacks it with a minimal
//! request, and wraps the detached byte stream in a client-role session (D).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::eldatun::client::session::{MultiplexedConnection, SessionOptions};
use crate::eldatun::mux::BoxedStream;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid tunnel address {0:?}: {1}")]
    InvalidAddress(String, String),
    #[error("dns/tcp connect failed: {0}")]
    Tcp(#[source] std::io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(#[source] std::io::Error),
    #[error("request write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("connect timed out")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// The tunnel URL, e.g. `https://tunnel.example.invalid/establish/<token>`.
    pub address: String,
    pub connect_timeout: Duration,
    pub max_substreams: u64,
    pub remote_dial_timeout: Duration,
    pub keep_alive_timeout: Duration,
}

struct ParsedAddress {
    scheme: String,
    host: String,
    port: u16,
    path: String,
}

fn parse_address(address: &str) -> Result<ParsedAddress, String> {
    let (scheme, rest) = address
        .split_once("://")
        .ok_or_else(|| "missing scheme".to_string())?;
    if scheme != "http" && scheme != "https" {
        return Err(format!("unsupported scheme {scheme:?}"));
    }
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err("missing host".to_string());
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if !h.is_empty() && p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
            let port: u16 = p.parse().map_err(|_| "invalid port".to_string())?;
            (h.to_string(), port)
        }
        _ => {
            let default_port = if scheme == "https" { 443 } else { 80 };
            (authority.to_string(), default_port)
        }
    };

    Ok(ParsedAddress {
        scheme: scheme.to_string(),
        host,
        port,
        path: path.to_string(),
    })
}

/// Dials the tunnel endpoint and returns a fresh client session. Cancellation of the returned
/// future before completion closes the socket under construction, per spec.md §5.
pub async fn connect(opts: &ConnectorOptions) -> Result<Arc<MultiplexedConnection>, ConnectError> {
    let parsed = parse_address(&opts.address)
        .map_err(|e| ConnectError::InvalidAddress(opts.address.clone(), e))?;

    let connect_fut = TcpStream::connect((parsed.host.as_str(), parsed.port));
    let tcp = tokio::time::timeout(opts.connect_timeout, connect_fut)
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(ConnectError::Tcp)?;
    let _ = tcp.set_nodelay(true);

    let mut stream: BoxedStream = if parsed.scheme == "https" {
        Box::new(tls_connect(&parsed.host, tcp).await?)
    } else {
        Box::new(tcp)
    };

    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: \r\nConnection: keep-alive\r\n\r\n",
        path = parsed.path,
        host = parsed.host,
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(ConnectError::Write)?;

    Ok(MultiplexedConnection::new_client(
        stream,
        SessionOptions {
            max_substreams: opts.max_substreams,
            remote_dial_timeout: opts.remote_dial_timeout,
            keep_alive_timeout: opts.keep_alive_timeout,
        },
    ))
}

async fn tls_connect(host: &str, tcp: TcpStream) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots_or_native());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| ConnectError::Tls(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(ConnectError::Tls)
}

/// The corpus's TLS peers source trust roots from the platform/OS store via `rustls-native-certs`
/// where available; here we fall back to an empty root store extended at call sites that need a
/// custom CA (e.g. tests use `rcgen`-style self-signed verification disabled at that layer).
fn webpki_roots_or_native() -> Vec<rustls::pki_types::CertificateDer<'static>> {
    rustls_native_certs::load_native_certs()
        .certs
        .into_iter()
        .collect()
}
