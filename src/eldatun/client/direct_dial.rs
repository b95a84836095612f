//! Direct-dial bypass Q: wraps the pool's dial function so addresses matching a configured
//! regex skip the tunnel entirely and dial the local network stack directly. Intended for
//! split-tunnel setups where some destinations (e.g. the LAN, the resolver itself) should never
//! traverse the multiplexed session.

use std::sync::Arc;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};

use crate::eldatun::client::pool::Pool;
use crate::eldatun::client::substream::SubStreamWrapper;
use crate::eldatun::error::{is_udp_like, TunnelError};

/// Either a tunnelled sub-stream or a directly-dialed TCP connection. UDP direct-dials are
/// exposed separately via [`DirectDialer::dial_udp_direct`] since a bare `UdpSocket` has no
/// notion of a connected peer the way `TcpStream` does.
pub enum Dialed {
    Tunnelled(SubStreamWrapper),
    Direct(TcpStream),
}

impl AsyncRead for Dialed {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Dialed::Tunnelled(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Dialed::Direct(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Dialed {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Dialed::Tunnelled(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Dialed::Direct(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Dialed::Tunnelled(s) => std::pin::Pin::new(s).poll_flush(cx),
            Dialed::Direct(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Dialed::Tunnelled(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Dialed::Direct(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

pub struct DirectDialer {
    pool: Arc<Pool>,
    bypass: Option<Regex>,
}

impl DirectDialer {
    pub fn new(pool: Arc<Pool>, bypass: Option<Regex>) -> Self {
        Self { pool, bypass }
    }

    fn host_matches_bypass(&self, address: &str) -> bool {
        let Some(re) = &self.bypass else { return false };
        let host = address.rsplit_once(':').map_or(address, |(h, _)| h);
        re.is_match(host)
    }

    pub async fn dial(&self, network: &str, address: &str) -> Result<Dialed, TunnelError> {
        if self.host_matches_bypass(address) {
            let conn = TcpStream::connect(address)
                .await
                .map_err(TunnelError::Connect)?;
            return Ok(Dialed::Direct(conn));
        }
        self.pool
            .dial_context(network, address)
            .await
            .map(Dialed::Tunnelled)
    }

    /// Direct UDP dial for bypassed addresses; callers needing the tunnelled path should use
    /// [`DirectDialer::dial`] with a UDP-like `network` and wrap the resulting sub-stream in
    /// `PacketConn` themselves.
    pub async fn dial_udp_direct(&self, address: &str) -> Result<Option<UdpSocket>, TunnelError> {
        if !self.host_matches_bypass(address) {
            return Ok(None);
        }
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(TunnelError::Connect)?;
        socket.connect(address).await.map_err(TunnelError::Connect)?;
        Ok(Some(socket))
    }

    pub fn network_is_udp(network: &str) -> bool {
        is_udp_like(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_regex_matches_host_only_not_port() {
        let re = Regex::new(r"^10\.0\.0\.\d+$").unwrap();
        let dialer = DirectDialer::new_for_test_matcher(Some(re));
        assert!(dialer.host_matches_bypass("10.0.0.5:443"));
        assert!(!dialer.host_matches_bypass("10.0.1.5:443"));
    }

    impl DirectDialer {
        fn new_for_test_matcher(bypass: Option<Regex>) -> Self {
            Self { pool: Pool::new(crate::eldatun::client::pool::PoolOptions {
                connector: crate::eldatun::client::connector::ConnectorOptions {
                    address: "http://unused.invalid/establish/x".into(),
                    connect_timeout: std::time::Duration::from_secs(1),
                    max_substreams: 0,
                    remote_dial_timeout: std::time::Duration::from_secs(1),
                    keep_alive_timeout: std::time::Duration::from_secs(1),
                },
                preconnect_pool_size: 0,
            }), bypass }
        }
    }
}
