//! Client session D (`MultiplexedConnection`, §4.4): enforces the per-session sub-stream cap
//! and drives the drain-to-close lifecycle described in spec.md's Design Notes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::eldatun::control::{self, DialRequest};
use crate::eldatun::error::TunnelError;
use crate::eldatun::client::substream::SubStreamWrapper;
use crate::eldatun::mux::{BoxedStream, MuxSession};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// 0 means unlimited.
    pub max_substreams: u64,
    pub remote_dial_timeout: Duration,
    pub keep_alive_timeout: Duration,
}

struct Counters {
    used: u64,
    active: u64,
    dialable: bool,
}

/// One underlying multiplexed byte stream, plus the bookkeeping that turns raw `open()` calls
/// into capped, fate-sharing sub-streams.
pub struct MultiplexedConnection {
    mux: Arc<MuxSession>,
    counters: Mutex<Counters>,
    closed: AtomicBool,
    opts: SessionOptions,
}

impl MultiplexedConnection {
    pub fn new_client(stream: BoxedStream, opts: SessionOptions) -> Arc<Self> {
        Arc::new(Self {
            mux: Arc::new(MuxSession::new_client(stream, opts.keep_alive_timeout)),
            counters: Mutex::new(Counters { used: 0, active: 0, dialable: true }),
            closed: AtomicBool::new(false),
            opts,
        })
    }

    /// Opens a sub-stream, writes the `DialRequest`, and returns a wrapper whose first read
    /// lazily consumes the server's `DialResponse` (§4.5). Enforces the cap from §4.4 step 1.
    pub async fn dial_context(
        self: &Arc<Self>,
        network: &str,
        address: &str,
    ) -> Result<SubStreamWrapper, TunnelError> {
        {
            let mut c = self.counters.lock().unwrap();
            if !c.dialable {
                return Err(TunnelError::LimitExceeded);
            }
            c.used += 1;
            c.active += 1;
            if self.opts.max_substreams > 0 && c.used >= self.opts.max_substreams {
                c.dialable = false;
            }
        }

        let mut stream = match self.mux.open().await {
            Ok(s) => s,
            Err(_) => {
                self.dec_active_and_drain();
                return Err(TunnelError::LimitExceeded);
            }
        };

        let req = DialRequest {
            network: network.to_string(),
            address: address.to_string(),
            timeout: self.opts.remote_dial_timeout,
        };
        if let Err(e) = control::write_packet(&mut stream, &req).await {
            self.dec_active_and_drain();
            return Err(TunnelError::Protocol(e));
        }

        let this = self.clone();
        let wrapper = SubStreamWrapper::new(
            stream,
            Box::new(move || this.dec_active_and_drain()),
        );
        Ok(wrapper)
    }

    fn dec_active_and_drain(self: &Arc<Self>) {
        let mut c = self.counters.lock().unwrap();
        c.active = c.active.saturating_sub(1);
        let should_close = c.active == 0 && !c.dialable;
        drop(c);
        if should_close && !self.closed.swap(true, Ordering::SeqCst) {
            let mux = self.mux.clone();
            tokio::spawn(async move { mux.close().await });
        }
    }

    /// Consults the multiplexer; if it reports closed, latches `dialable=false` and runs the
    /// drain check before returning the (possibly just-flipped) flag.
    pub fn is_dialable(self: &Arc<Self>) -> bool {
        if self.mux.is_closed() {
            let mut c = self.counters.lock().unwrap();
            c.dialable = false;
            drop(c);
            self.dec_active_and_drain();
        }
        self.counters.lock().unwrap().dialable
    }

    pub fn close(self: &Arc<Self>) {
        self.counters.lock().unwrap().dialable = false;
        self.dec_active_and_drain();
    }

    pub async fn ping(&self) -> Result<Duration, TunnelError> {
        self.mux
            .ping()
            .await
            .map_err(|e| TunnelError::Connect(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(max: u64) -> SessionOptions {
        SessionOptions {
            max_substreams: max,
            remote_dial_timeout: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(30),
        }
    }

    async fn server_echo_greeting(server_io: tokio::io::DuplexStream) {
        let server = MuxSession::new_server(server_io, Duration::from_secs(30));
        loop {
            let mut st = match server.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let _req: DialRequest = match control::read_packet(&mut st).await {
                    Ok(r) => r,
                    Err(_) => return,
                };
                let _ = control::write_packet(&mut st, &crate::eldatun::control::DialResponse::ok()).await;
            });
        }
    }

    #[tokio::test]
    async fn cap_of_two_admits_exactly_two() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        tokio::spawn(server_echo_greeting(server_io));

        let session = MultiplexedConnection::new_client(Box::new(client_io), opts(2));

        let a = session.dial_context("tcp", "a:1").await;
        let b = session.dial_context("tcp", "b:1").await;
        let c = session.dial_context("tcp", "c:1").await;

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert!(matches!(c, Err(TunnelError::LimitExceeded)));
    }

    #[tokio::test]
    async fn zero_cap_is_unlimited() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        tokio::spawn(server_echo_greeting(server_io));

        let session = MultiplexedConnection::new_client(Box::new(client_io), opts(0));
        for i in 0..5 {
            let r = session.dial_context("tcp", &format!("h{i}:1")).await;
            assert!(r.is_ok(), "dial {i} should succeed under unlimited cap");
        }
    }

    /// Once a session hits its `max_substreams` cap, closing the last active sub-stream by
    /// normal means (the growing-buffer splice shutting it down on EOF, as every real consumer
    /// does) must drain `active` back to zero and close the underlying mux session.
    #[tokio::test]
    async fn splicing_a_substream_shut_drains_active_and_closes_capped_session() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        tokio::spawn(server_echo_greeting(server_io));

        let session = MultiplexedConnection::new_client(Box::new(client_io), opts(1));
        let wrapper = session.dial_context("tcp", "a:1").await.unwrap();
        assert!(matches!(
            session.dial_context("tcp", "b:1").await,
            Err(TunnelError::LimitExceeded)
        ));

        let (local, peer) = tokio::io::duplex(64);
        drop(peer); // local's read side observes immediate EOF

        let _ = crate::eldatun::splice::splice_growing_buffer(local, wrapper).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.mux.is_closed());
    }
}
