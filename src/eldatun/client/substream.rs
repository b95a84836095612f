//! Sub-stream wrapper (§4.5): the client-visible handle for one dialed flow.
//!
//! State machine: `ReadyForGreeting -> GreetingConsumed -> Closed`. The first read lazily
//! consumes the server's per-sub-stream `DialResponse` before any application byte is handed
//! to the caller; the write path is transparent throughout. `close` fires the owning session's
//! on-disconnect callback exactly once.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};

use crate::eldatun::control::{self, DialResponse};
use crate::eldatun::mux::BoxedStream;

/// Fired exactly once when the wrapper is closed, whether by an explicit `close()` call or by
/// the greeting carrying an error. Used by the owning session to decrement `activeCount` and
/// run its drain check (§4.4).
pub type OnDisconnect = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadyForGreeting,
    GreetingConsumed,
    Closed,
}

type GreetingFuture =
    Pin<Box<dyn Future<Output = (ReadHalf<BoxedStream>, Result<DialResponse, io::Error>)> + Send>>;

pub struct SubStreamWrapper {
    read_half: Option<ReadHalf<BoxedStream>>,
    greeting_fut: Option<GreetingFuture>,
    write_half: WriteHalf<BoxedStream>,
    state: State,
    on_disconnect: Option<OnDisconnect>,
    last_err: Option<String>,
}

impl SubStreamWrapper {
    pub fn new(stream: BoxedStream, on_disconnect: OnDisconnect) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            read_half: Some(read_half),
            greeting_fut: None,
            write_half,
            state: State::ReadyForGreeting,
            on_disconnect: Some(on_disconnect),
            last_err: None,
        }
    }

    /// The remote dial's reported outcome, once the greeting has been consumed. `None` before
    /// the first read.
    pub fn remote_dial_error(&self) -> Option<&str> {
        match &self.state {
            State::GreetingConsumed | State::Closed => self.last_err.as_deref(),
            State::ReadyForGreeting => None,
        }
    }

    /// Idempotent. Fires the on-disconnect callback exactly once and shuts down the write half;
    /// a pending greeting read, if any, is abandoned.
    pub async fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        if let Some(cb) = self.on_disconnect.take() {
            cb();
        }
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut self.write_half).await;
    }
}

impl AsyncRead for SubStreamWrapper {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.state {
                State::Closed => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sub-stream closed")));
                }
                State::GreetingConsumed => {
                    let read_half = this.read_half.as_mut().expect("greeting consumed implies read_half present");
                    return Pin::new(read_half).poll_read(cx, buf);
                }
                State::ReadyForGreeting => {
                    if this.greeting_fut.is_none() {
                        let mut read_half = this.read_half.take().expect("read_half present before greeting");
                        this.greeting_fut = Some(Box::pin(async move {
                            let result = control::read_packet::<_, DialResponse>(&mut read_half)
                                .await
                                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
                            (read_half, result)
                        }));
                    }
                    let fut = this.greeting_fut.as_mut().unwrap();
                    match fut.as_mut().poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready((read_half, result)) => {
                            this.read_half = Some(read_half);
                            this.greeting_fut = None;
                            this.state = State::GreetingConsumed;
                            match result {
                                Ok(resp) => {
                                    this.last_err = resp.err;
                                }
                                Err(e) => {
                                    this.state = State::Closed;
                                    return Poll::Ready(Err(e));
                                }
                            }
                            if let Some(msg) = this.last_err.clone() {
                                this.state = State::Closed;
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::ConnectionRefused,
                                    format!("remote dial failed: {msg}"),
                                )));
                            }
                            // loop again: fall through to GreetingConsumed and serve real data
                        }
                    }
                }
            }
        }
    }
}

impl AsyncWrite for SubStreamWrapper {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().write_half).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write_half).poll_flush(cx)
    }

    /// Shutdown is the one call every splice/copy helper actually makes on EOF or error, so it
    /// doubles as the trigger for the owning session's on-disconnect bookkeeping: the first poll
    /// fires `on_disconnect` and marks the wrapper closed, mirroring the inherent `close()`.
    /// Idempotent for the same reason `close()` is.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state != State::Closed {
            this.state = State::Closed;
            if let Some(cb) = this.on_disconnect.take() {
                cb();
            }
        }
        Pin::new(&mut this.write_half).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn boxed(io: tokio::io::DuplexStream) -> BoxedStream {
        Box::new(io)
    }

    #[tokio::test]
    async fn first_read_consumes_greeting_then_serves_data() {
        let (server, client) = tokio::io::duplex(4096);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let mut wrapper = SubStreamWrapper::new(boxed(client), Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        let mut server = server;
        tokio::spawn(async move {
            control::write_packet(&mut server, &DialResponse::ok()).await.unwrap();
            server.write_all(b"hello").await.unwrap();
        });

        let mut buf = [0u8; 5];
        wrapper.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remote_dial_error_surfaces_on_first_read() {
        let (server, client) = tokio::io::duplex(4096);
        let mut wrapper = SubStreamWrapper::new(boxed(client), Box::new(|| {}));

        tokio::spawn(async move {
            let mut server = server;
            control::write_packet(&mut server, &DialResponse::error("connection refused"))
                .await
                .unwrap();
        });

        let mut buf = [0u8; 1];
        let err = wrapper.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn async_write_shutdown_fires_on_disconnect_same_as_close() {
        let (_server, client) = tokio::io::duplex(64);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let mut wrapper = SubStreamWrapper::new(boxed(client), Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::io::AsyncWriteExt::shutdown(&mut wrapper).await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut wrapper).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_fires_on_disconnect_exactly_once() {
        let (_server, client) = tokio::io::duplex(64);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let mut wrapper = SubStreamWrapper::new(boxed(client), Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        wrapper.close().await;
        wrapper.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
