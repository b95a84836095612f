//! Client forwarder J (§4.11): bridges one already-accepted local connection to an upstream
//! dialed through the pool, using the growing-buffer splice.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::eldatun::client::pool::Pool;
use crate::eldatun::error::TunnelError;
use crate::eldatun::splice::splice_growing_buffer;

pub struct ForwardRequest<'a> {
    pub network: &'a str,
    pub address: &'a str,
    pub dial_timeout: Duration,
}

/// Dials `request.address` through `pool`, calls `on_connected` once the upstream sub-stream is
/// established, then splices it against `client_conn` until either side quiesces. A cancelled
/// `shutdown` watch closes both peers by returning early; the caller is responsible for
/// dropping `client_conn` in that case (spec.md §5: "cancellation of a spliced flow closes both
/// peers"). Dial errors are surfaced; post-connect I/O errors are swallowed, per §7's
/// propagation policy for `UpstreamIO`.
pub async fn forward_connection<C>(
    pool: &Pool,
    mut client_conn: C,
    request: &ForwardRequest<'_>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    on_connected: impl FnOnce() + Send,
) -> Result<(), TunnelError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let dial = pool.dial_context(request.network, request.address);
    let upstream = tokio::select! {
        res = tokio::time::timeout(request.dial_timeout, dial) => {
            res.map_err(|_| TunnelError::Cancelled)??
        }
        _ = shutdown.changed() => {
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut client_conn).await;
            return Err(TunnelError::Cancelled);
        }
    };

    on_connected();

    tokio::select! {
        result = splice_growing_buffer(client_conn, upstream) => {
            if let Err(e) = result {
                tracing::debug!(err = %e, "forwarder: flow ended");
            }
            Ok(())
        }
        _ = shutdown.changed() => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eldatun::client::connector::ConnectorOptions;
    use crate::eldatun::client::pool::PoolOptions;

    #[tokio::test]
    async fn dial_timeout_surfaces_as_cancelled() {
        let pool = Pool::new(PoolOptions {
            connector: ConnectorOptions {
                address: "http://198.51.100.1:1/establish/x".into(),
                connect_timeout: Duration::from_millis(50),
                max_substreams: 0,
                remote_dial_timeout: Duration::from_secs(1),
                keep_alive_timeout: Duration::from_secs(1),
            },
            preconnect_pool_size: 0,
        });

        let (client_io, _peer) = tokio::io::duplex(64);
        let (_tx, rx) = tokio::sync::watch::channel(false);

        let request = ForwardRequest {
            network: "tcp",
            address: "example.invalid:80",
            dial_timeout: Duration::from_millis(1),
        };

        let result = forward_connection(&pool, client_io, &request, rx, || {}).await;
        assert!(result.is_err());
    }
}
