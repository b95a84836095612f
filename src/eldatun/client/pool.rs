//! Dialer / pool F (§4.7): a bag of preconnected sessions, picked at random with lazy cleanup,
//! topped up by a background preconnect loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;

use crate::eldatun::client::connector::{self, ConnectError, ConnectorOptions};
use crate::eldatun::client::session::MultiplexedConnection;
use crate::eldatun::client::substream::SubStreamWrapper;
use crate::eldatun::error::TunnelError;

pub struct PoolOptions {
    pub connector: ConnectorOptions,
    pub preconnect_pool_size: usize,
}

pub struct Pool {
    sessions: Mutex<Vec<Arc<MultiplexedConnection>>>,
    opts: PoolOptions,
    closed: AtomicBool,
    last_id: AtomicU64,
    preconnect_started: AtomicBool,
}

impl Pool {
    pub fn new(opts: PoolOptions) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
            opts,
            closed: AtomicBool::new(false),
            last_id: AtomicU64::new(0),
            preconnect_started: AtomicBool::new(false),
        })
    }

    /// Swap-and-pop a uniformly random element repeatedly, discarding non-dialable sessions,
    /// until a dialable one is found or the pool is empty.
    async fn take_from_pool(&self) -> Option<Arc<MultiplexedConnection>> {
        let mut guard = self.sessions.lock().await;
        while !guard.is_empty() {
            let idx = rand::rng().random_range(0..guard.len());
            let last = guard.len() - 1;
            guard.swap(idx, last);
            let candidate = guard.pop().unwrap();
            if candidate.is_dialable() {
                return Some(candidate);
            }
        }
        None
    }

    async fn dial_via(
        &self,
        session: Arc<MultiplexedConnection>,
        network: &str,
        address: &str,
    ) -> Result<SubStreamWrapper, TunnelError> {
        match session.dial_context(network, address).await {
            Ok(wrapper) => {
                if session.is_dialable() {
                    self.sessions.lock().await.push(session);
                }
                Ok(wrapper)
            }
            Err(e) => {
                session.close();
                Err(e)
            }
        }
    }

    pub async fn dial_context(
        &self,
        network: &str,
        address: &str,
    ) -> Result<SubStreamWrapper, TunnelError> {
        if let Some(session) = self.take_from_pool().await {
            if let Ok(w) = self.dial_via(session, network, address).await {
                return Ok(w);
            }
        }

        let session = connector::connect(&self.opts.connector)
            .await
            .map_err(connect_err_to_tunnel_err)?;
        self.last_id.fetch_add(1, Ordering::Relaxed);
        self.dial_via(session, network, address).await
    }

    /// Idempotent: calling this more than once is a no-op past the first call.
    pub fn enable_preconnect(self: &Arc<Self>) {
        if self.preconnect_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = self.clone();
        tokio::spawn(async move {
            let mut high_water_mark = 0usize;
            loop {
                if pool.closed.load(Ordering::SeqCst) {
                    return;
                }

                let current = {
                    let mut guard = pool.sessions.lock().await;
                    guard.retain(|s| s.is_dialable());
                    guard.len()
                };

                if current < pool.opts.preconnect_pool_size && high_water_mark < pool.opts.preconnect_pool_size {
                    match connector::connect(&pool.opts.connector).await {
                        Ok(session) => {
                            pool.sessions.lock().await.push(session);
                        }
                        Err(e) => {
                            tracing::warn!(err = %e, "preconnect: failed to establish session");
                        }
                    }
                }
                high_water_mark = current;

                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
    }

    pub async fn ping(&self) -> Result<Duration, TunnelError> {
        let session = self
            .take_from_pool()
            .await
            .ok_or(TunnelError::NoActiveConnections)?;
        let result = session.ping().await;
        if session.is_dialable() {
            self.sessions.lock().await.push(session);
        }
        result
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.sessions.lock().await;
        for s in guard.drain(..) {
            s.close();
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn connect_err_to_tunnel_err(e: ConnectError) -> TunnelError {
    TunnelError::Connect(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eldatun::client::session::SessionOptions;
    use crate::eldatun::control;
    use crate::eldatun::mux::MuxSession;

    fn unlimited_opts() -> SessionOptions {
        SessionOptions {
            max_substreams: 0,
            remote_dial_timeout: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(30),
        }
    }

    async fn serve_one(server_io: tokio::io::DuplexStream) {
        let server = MuxSession::new_server(server_io, Duration::from_secs(30));
        while let Ok(mut st) = server.accept().await {
            tokio::spawn(async move {
                let _req: crate::eldatun::control::DialRequest =
                    control::read_packet(&mut st).await.unwrap();
                control::write_packet(&mut st, &control::DialResponse::ok()).await.unwrap();
            });
        }
    }

    #[tokio::test]
    async fn take_from_pool_only_returns_dialable_sessions() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        tokio::spawn(serve_one(server_io));
        let session = MultiplexedConnection::new_client(Box::new(client_io), unlimited_opts());
        session.close(); // not dialable anymore, active==0 so it also self-closes

        let pool = Pool::new(PoolOptions {
            connector: ConnectorOptions {
                address: "http://unused.invalid/establish/x".into(),
                connect_timeout: Duration::from_secs(1),
                max_substreams: 0,
                remote_dial_timeout: Duration::from_secs(1),
                keep_alive_timeout: Duration::from_secs(1),
            },
            preconnect_pool_size: 0,
        });
        pool.sessions.lock().await.push(session);

        assert!(pool.take_from_pool().await.is_none());
    }

    #[tokio::test]
    async fn ping_with_empty_pool_fails_with_no_active_connections() {
        let pool = Pool::new(PoolOptions {
            connector: ConnectorOptions {
                address: "http://unused.invalid/establish/x".into(),
                connect_timeout: Duration::from_secs(1),
                max_substreams: 0,
                remote_dial_timeout: Duration::from_secs(1),
                keep_alive_timeout: Duration::from_secs(1),
            },
            preconnect_pool_size: 0,
        });
        let err = pool.ping().await.unwrap_err();
        assert!(matches!(err, TunnelError::NoActiveConnections));
    }
}
