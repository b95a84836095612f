//! Per-sub-stream handler H (§4.9): reads one `DialRequest`, dials upstream, reports the
//! outcome, then splices.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};

use crate::eldatun::control::{self, DialRequest, DialResponse};
use crate::eldatun::error::{is_udp_like, network_allowed, HandlerError};
use crate::eldatun::packet::PacketConn;
use crate::eldatun::splice::{splice_packets, splice_streams, DatagramSink, DatagramSource};

pub struct HandlerOptions {
    pub session_deadline: Duration,
}

/// Handles one accepted sub-stream end to end. `sub_stream` must already be the raw yamux
/// stream handed back by `MuxSession::accept` — this function owns its full lifecycle.
pub async fn handle_substream<S>(
    mut sub_stream: S,
    opts: &HandlerOptions,
) -> Result<(), HandlerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request: DialRequest = match control::read_packet(&mut sub_stream).await {
        Ok(r) => r,
        Err(e) => return Err(HandlerError::Protocol(e)),
    };

    if !network_allowed(&request.network) {
        let resp = DialResponse::error(format!("network {} not allowed", request.network));
        let _ = control::write_packet(&mut sub_stream, &resp).await;
        return Err(HandlerError::NetworkNotAllowed(request.network));
    }

    let dial_timeout = request.timeout.min(opts.session_deadline);

    if is_udp_like(&request.network) {
        match dial_udp(&request.address, dial_timeout).await {
            Ok(socket) => {
                control::write_packet(&mut sub_stream, &DialResponse::ok()).await?;
                let mut packetized = PacketConn::new(sub_stream);
                let (client_src, client_sink) = packetized.split();
                run_udp_splice(client_src, client_sink, socket).await;
                Ok(())
            }
            Err(e) => {
                let resp = DialResponse::error(e.to_string());
                let _ = control::write_packet(&mut sub_stream, &resp).await;
                Ok(())
            }
        }
    } else {
        match tokio::time::timeout(dial_timeout, TcpStream::connect(&request.address)).await {
            Ok(Ok(upstream)) => {
                control::write_packet(&mut sub_stream, &DialResponse::ok()).await?;
                if let Err(e) = splice_streams(sub_stream, upstream).await {
                    tracing::debug!(err = %e, "handler: tcp flow ended");
                }
                Ok(())
            }
            Ok(Err(e)) => {
                let resp = DialResponse::error(e.to_string());
                let _ = control::write_packet(&mut sub_stream, &resp).await;
                Ok(())
            }
            Err(_) => {
                let resp = DialResponse::error("dial timed out");
                let _ = control::write_packet(&mut sub_stream, &resp).await;
                Ok(())
            }
        }
    }
}

async fn dial_udp(address: &str, timeout: Duration) -> std::io::Result<UdpSocket> {
    tokio::time::timeout(timeout, async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(address).await?;
        Ok::<_, std::io::Error>(socket)
    })
    .await
    .unwrap_or_else(|_| Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "udp dial timed out")))
}

struct UdpDatagramSource(std::sync::Arc<UdpSocket>);
struct UdpDatagramSink(std::sync::Arc<UdpSocket>);

#[async_trait::async_trait]
impl DatagramSource for UdpDatagramSource {
    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; 65535];
        let n = self.0.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl DatagramSink for UdpDatagramSink {
    async fn send(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.0.send(buf).await.map(|_| ())
    }

    async fn shutdown(&mut self) {}
}

async fn run_udp_splice<R, W>(client_src: R, client_sink: W, socket: UdpSocket)
where
    R: DatagramSource + 'static,
    W: DatagramSink + 'static,
{
    let socket = std::sync::Arc::new(socket);
    let upstream_src = UdpDatagramSource(socket.clone());
    let upstream_sink = UdpDatagramSink(socket);

    let (fwd, rev) = splice_packets(
        Box::new(client_src),
        Box::new(upstream_sink),
        Box::new(upstream_src),
        Box::new(client_sink),
    )
    .await;
    if let Err(e) = fwd {
        tracing::debug!(err = %e, "handler: udp client->upstream ended");
    }
    if let Err(e) = rev {
        tracing::debug!(err = %e, "handler: udp upstream->client ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disallowed_network_is_rejected_with_protocol_response() {
        let (server_io, mut client_io) = tokio::io::duplex(4096);
        let opts = HandlerOptions { session_deadline: Duration::from_secs(5) };

        let request = DialRequest {
            network: "icmp".into(),
            address: "example.invalid:0".into(),
            timeout: Duration::from_secs(1),
        };
        control::write_packet(&mut client_io, &request).await.unwrap();

        let result = handle_substream(server_io, &opts).await;
        assert!(matches!(result, Err(HandlerError::NetworkNotAllowed(n)) if n == "icmp"));

        let resp: DialResponse = control::read_packet(&mut client_io).await.unwrap();
        assert!(resp.err.unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn tcp_dial_failure_reports_error_and_returns_ok() {
        let (server_io, mut client_io) = tokio::io::duplex(4096);
        let opts = HandlerOptions { session_deadline: Duration::from_secs(5) };

        let request = DialRequest {
            network: "tcp".into(),
            address: "127.0.0.1:1".into(),
            timeout: Duration::from_millis(200),
        };
        control::write_packet(&mut client_io, &request).await.unwrap();

        let result = handle_substream(server_io, &opts).await;
        assert!(result.is_ok());

        let resp: DialResponse = control::read_packet(&mut client_io).await.unwrap();
        assert!(resp.err.is_some());
    }
}
