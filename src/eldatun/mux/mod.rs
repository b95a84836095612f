//! Stream multiplexer (component C): a thin wrapper over `tokio-yamux` exposing the contract
//! spec.md §4.3 asks for — `open`, `accept`, `close`, `ping`, `is_closed` — over any duplex
//! byte stream (a raw TCP socket or a TLS stream).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// A bidirectional async byte stream, boxed so callers don't need to know the concrete
/// transport (plain TCP vs TLS-over-TCP).
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Both the keepalive interval and the connection write timeout are pinned to the same
/// configured `keep_alive_timeout`, per spec.md §4.3: "the multiplexer performs its own
/// keepalive (interval and write timeout both configurable to `keepAliveTimeout`)".
fn keepalive_config(keep_alive_timeout: Duration) -> tokio_yamux::Config {
    tokio_yamux::Config {
        enable_keepalive: true,
        keepalive_interval: keep_alive_timeout,
        connection_write_timeout: keep_alive_timeout,
        ..Default::default()
    }
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("multiplexer session is closed")]
    Closed,
    #[error("yamux: {0}")]
    Yamux(#[from] std::io::Error),
}

/// One multiplexed session over an underlying duplex stream. Role (client vs. server) only
/// affects yamux stream-id parity; the operation set is identical on both sides.
pub struct MuxSession {
    control: Mutex<tokio_yamux::Control>,
    incoming: Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    closed: AtomicBool,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MuxSession {
    pub fn new_client<S>(stream: S, keep_alive_timeout: Duration) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_session(tokio_yamux::Session::new_client(stream, keepalive_config(keep_alive_timeout)))
    }

    pub fn new_server<S>(stream: S, keep_alive_timeout: Duration) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_session(tokio_yamux::Session::new_server(stream, keepalive_config(keep_alive_timeout)))
    }

    fn from_session<S>(mut session: tokio_yamux::Session<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        use futures_util::StreamExt;

        let control = session.control();
        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let closed_flag = std::sync::Arc::new(AtomicBool::new(false));
        let closed_flag_task = closed_flag.clone();

        let accept_task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            closed_flag_task.store(true, Ordering::SeqCst);
        });

        Self {
            control: Mutex::new(control),
            incoming: Mutex::new(rx),
            closed: AtomicBool::new(false),
            accept_task,
        }
    }

    /// Opens a new outbound sub-stream. Errors once the session has been closed, either by us
    /// or because the peer's side of the duplex stream went away.
    pub async fn open(&self) -> Result<BoxedStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await.map_err(MuxError::Yamux)?;
        Ok(Box::new(st))
    }

    /// Accepts the next inbound sub-stream opened by the peer. Resolves to `Err(Closed)` once
    /// the accept loop has drained (the peer hung up or the underlying stream errored).
    pub async fn accept(&self) -> Result<BoxedStream, MuxError> {
        let mut rx = self.incoming.lock().await;
        match rx.recv().await {
            Some(st) => Ok(Box::new(st)),
            None => {
                self.closed.store(true, Ordering::SeqCst);
                Err(MuxError::Closed)
            }
        }
    }

    /// Measures round-trip time by opening and immediately dropping a sub-stream: the yamux
    /// SYN/ACK handshake for that stream is a faithful proxy for link RTT without requiring a
    /// dedicated control-plane ping message. Used by the pool's keepalive loop (component F) to
    /// detect a half-dead session before a real dial would have to discover it the hard way.
    pub async fn ping(&self) -> Result<Duration, MuxError> {
        let start = Instant::now();
        let _st = self.open().await?;
        Ok(start.elapsed())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tears the session down. Idempotent: a second call observes `is_closed() == true` and
    /// returns immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.accept_task.abort();
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn open(&self) -> Result<BoxedStream, MuxError>;
    async fn accept(&self) -> Result<BoxedStream, MuxError>;
    async fn ping(&self) -> Result<Duration, MuxError>;
    fn is_closed(&self) -> bool;
    async fn close(&self);
}

#[async_trait]
impl Multiplexer for MuxSession {
    async fn open(&self) -> Result<BoxedStream, MuxError> {
        MuxSession::open(self).await
    }

    async fn accept(&self) -> Result<BoxedStream, MuxError> {
        MuxSession::accept(self).await
    }

    async fn ping(&self) -> Result<Duration, MuxError> {
        MuxSession::ping(self).await
    }

    fn is_closed(&self) -> bool {
        MuxSession::is_closed(self)
    }

    async fn close(&self) {
        MuxSession::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_keep_alive() -> Duration {
        Duration::from_secs(30)
    }

    #[tokio::test]
    async fn open_then_accept_roundtrip() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let client = MuxSession::new_client(client_io, test_keep_alive());
        let server = MuxSession::new_server(server_io, test_keep_alive());

        let mut opened = client.open().await.unwrap();
        let accept_task = tokio::spawn(async move { server.accept().await.unwrap() });

        opened.write_all(b"hello").await.unwrap();
        opened.flush().await.unwrap();

        let mut accepted = accept_task.await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observed_as_closed() {
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let client = MuxSession::new_client(client_io, test_keep_alive());

        assert!(!client.is_closed());
        client.close().await;
        client.close().await; // second call must not panic or hang
        assert!(client.is_closed());

        let err = client.open().await.unwrap_err();
        assert!(matches!(err, MuxError::Closed));
    }

    #[tokio::test]
    async fn accept_reports_closed_once_peer_goes_away() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = MuxSession::new_server(server_io, test_keep_alive());
        drop(client_io);

        let err = server.accept().await.unwrap_err();
        assert!(matches!(err, MuxError::Closed));
        assert!(server.is_closed());
    }
}
