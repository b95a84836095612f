//! TUN ingress interface P: a trait describing the shape of a TUN-based ingress, with a stub
//! implementation that reports the feature unavailable. A full user-space netstack (IP
//! reassembly, a TCP state machine, a UDP NAT table) is out of scope here the same way it is out
//! of scope for the core tunnel components; this crate ships the plugin point a real
//! platform-specific backend could fill in.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::eldatun::client::substream::SubStreamWrapper;
use crate::eldatun::error::TunnelError;

/// The same "dial function of (network, address) -> byte stream" shape the server session (G)
/// and the direct-dial middleware (Q) are built around, so a real `IpFlowSource` backend would
/// forward every reassembled flow through the pool exactly like the SOCKS5 ingress does.
pub type DialFn = Arc<
    dyn Fn(String, String) -> Pin<Box<dyn Future<Output = Result<SubStreamWrapper, TunnelError>> + Send>>
        + Send
        + Sync,
>;

#[async_trait]
pub trait IpFlowSource: Send + Sync {
    async fn run(&self, dial: DialFn) -> anyhow::Result<()>;
}

/// The only implementation shipped here. Always fails, so the CLI can wire a `--tun` flag
/// unconditionally and simply never see a flow on platforms (or builds) with no netstack backend
/// compiled in.
pub struct UnavailableTunSource;

#[async_trait]
impl IpFlowSource for UnavailableTunSource {
    async fn run(&self, _dial: DialFn) -> anyhow::Result<()> {
        anyhow::bail!("tun ingress requires a platform-specific user-space netstack; not implemented")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unavailable_source_always_errors() {
        let source = UnavailableTunSource;
        let dial: DialFn = Arc::new(|_network, _address| Box::pin(async { Err(TunnelError::NoActiveConnections) }));
        let err = source.run(dial).await.unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }
}
