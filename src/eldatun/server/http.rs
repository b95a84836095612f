//! HTTP hijack endpoint R (§4.19 of the expanded design): a minimal hand-rolled HTTP/1.1 front
//! end. `axum` is deliberately not used here — there is no clean way to hand a live `TcpStream`
//! to a yamux session through axum/hyper's service abstractions, and the original server is
//! itself a bare `http.Server` with one `Hijacker` route, so porting it as a small manual request
//! parser stays closer to both the original and to what this one route actually needs. `axum` is
//! still the right tool for the admin status API (N), which has no hijack requirement.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use crate::eldatun::mux::BoxedStream;
use crate::eldatun::server::session::{run_session, ServerSessionOptions};

#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct HttpServerOptions {
    pub listen_addr: std::net::SocketAddr,
    pub token: String,
    pub static_dir: std::path::PathBuf,
    pub domain: Option<String>,
    pub session_deadline: Duration,
    pub keep_alive_timeout: Duration,
}

struct ParsedRequest {
    method: String,
    path: String,
    host: Option<String>,
}

async fn read_request_head<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> std::io::Result<Option<ParsedRequest>> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or("/").to_string();

    let mut host = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                host = Some(value.trim().to_string());
            }
        }
    }

    Ok(Some(ParsedRequest { method, path, host }))
}

async fn write_status_line<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    code: u16,
    reason: &str,
) -> std::io::Result<()> {
    let line = format!("HTTP/1.1 {code} {reason}\r\nConnection: close\r\n\r\n");
    w.write_all(line.as_bytes()).await
}

/// Runs the hijack/static-file/host-check HTTP front end until `shutdown` fires.
pub async fn serve(
    opts: Arc<HttpServerOptions>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), HttpServerError> {
    let listener = TcpListener::bind(opts.listen_addr).await?;
    tracing::info!(addr = %opts.listen_addr, "http: listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let opts = opts.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &opts).await {
                        tracing::debug!(peer = %peer, err = %e, "http: connection ended");
                    }
                });
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn handle_connection(stream: TcpStream, opts: &HttpServerOptions) -> Result<(), HttpServerError> {
    let peer = stream.peer_addr().ok();
    let mut reader = BufReader::new(stream);
    let Some(request) = read_request_head(&mut reader).await? else {
        return Ok(());
    };

    if let Some(domain) = &opts.domain {
        if request.host.as_deref() != Some(domain.as_str()) {
            tracing::warn!(host = ?request.host, peer = ?peer, "http: request with wrong host");
            let mut stream = reader.into_inner();
            write_status_line(&mut stream, 404, "Not Found").await?;
            return Ok(());
        }
    }

    let establish_path = format!("/establish/{}", opts.token);
    if request.method == "GET" && request.path == establish_path {
        // Hijack: no HTTP status line is written first (see the design note in
        // `server::session` for why). `BufReader` may have already buffered bytes past the
        // blank line in its read-ahead fill; `HijackedStream` replays those before touching the
        // raw socket again, so nothing the client sent is lost.
        let session_stream: BoxedStream = Box::new(HijackedStream::new(reader));
        if let Err(e) = run_session(
            session_stream,
            ServerSessionOptions {
                session_deadline: opts.session_deadline,
                keep_alive_timeout: opts.keep_alive_timeout,
            },
        )
        .await
        {
            tracing::debug!(err = %e, "http: session ended with an error");
        }
        return Ok(());
    }

    serve_static(&mut reader, &request.path, &opts.static_dir).await
}

/// Wraps a `BufReader<TcpStream>` whose internal buffer may still hold bytes read past the
/// request's blank line, presenting it as a plain duplex stream for the multiplexer.
struct HijackedStream {
    inner: BufReader<TcpStream>,
}

impl HijackedStream {
    fn new(inner: BufReader<TcpStream>) -> Self {
        Self { inner }
    }
}

impl AsyncRead for HijackedStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for HijackedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(self.get_mut().inner.get_mut()).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.get_mut().inner.get_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.get_mut().inner.get_mut()).poll_shutdown(cx)
    }
}

async fn serve_static(
    reader: &mut BufReader<TcpStream>,
    request_path: &str,
    static_dir: &std::path::Path,
) -> Result<(), HttpServerError> {
    let relative = request_path.trim_start_matches('/');
    let candidate = if relative.is_empty() {
        static_dir.join("index.html")
    } else {
        static_dir.join(relative)
    };

    match tokio::fs::read(&candidate).await {
        Ok(body) => {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            reader.write_all(header.as_bytes()).await?;
            reader.write_all(&body).await?;
            Ok(())
        }
        Err(_) => {
            write_status_line(reader, 404, "Not Found").await?;
            Ok(())
        }
    }
}

/// Plaintext listener that 301-redirects every request to the same path under `https://`,
/// honouring the same host check as the main listener (original `server/redirector.go`).
pub async fn serve_redirector(
    listen_addr: std::net::SocketAddr,
    domain: Option<String>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), HttpServerError> {
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "redirector: listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _peer) = accepted?;
                let domain = domain.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_redirect(stream, domain).await {
                        tracing::debug!(err = %e, "redirector: connection ended");
                    }
                });
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn handle_redirect(stream: TcpStream, domain: Option<String>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let Some(request) = read_request_head(&mut reader).await? else {
        return Ok(());
    };

    if let Some(domain) = &domain {
        if request.host.as_deref() != Some(domain.as_str()) {
            write_status_line(&mut reader, 404, "Not Found").await?;
            return Ok(());
        }
    }

    let host = request.host.unwrap_or_default();
    let location = format!("https://{host}{}", request.path);
    let body = format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
    );
    reader.write_all(body.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn host_check_rejects_mismatched_host_with_404() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = client;
        let server_task = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            let request = read_request_head(&mut reader).await.unwrap().unwrap();
            assert_eq!(request.host.as_deref(), Some("wrong.invalid"));
            write_status_line(&mut reader.into_inner(), 404, "Not Found").await.unwrap();
        });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: wrong.invalid\r\n\r\n")
            .await
            .unwrap();
        server_task.await.unwrap();

        let mut resp = String::new();
        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        resp.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        assert!(resp.starts_with("HTTP/1.1 404"));
    }
}
