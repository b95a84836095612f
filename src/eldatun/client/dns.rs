//! DNS forwarder K (§4.12, optional): a per-process relay for DNS-over-TCP-over-tunnel used by
//! the TUN ingress (P). Maintains one logical upstream sub-stream to a configured resolver,
//! reconnecting on any error and replaying the pending-request queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::eldatun::client::pool::Pool;
use crate::eldatun::client::substream::SubStreamWrapper;
use crate::eldatun::packet::{PacketConn, PacketReadHalf, PacketWriteHalf};

/// A fixed-content harmless query injected on (re)connect when the pending queue is empty, to
/// validate the new upstream actually works before any real traffic depends on it.
const NULL_QUERY: &[u8] = &[
    0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
];

pub type OnReply = Box<dyn FnOnce(Vec<u8>) + Send>;

struct Pending {
    bytes: Vec<u8>,
    on_reply: Option<OnReply>,
}

type Upstream = PacketWriteHalf<WriteHalf<SubStreamWrapper>>;

struct State {
    queue: VecDeque<Pending>,
    upstream: Option<Upstream>,
}

pub struct DnsForwarder {
    pool: Arc<Pool>,
    resolver_addr: String,
    state: Mutex<State>,
}

impl DnsForwarder {
    pub fn new(pool: Arc<Pool>, resolver_addr: impl Into<String>) -> Arc<Self> {
        let this = Arc::new(Self {
            pool,
            resolver_addr: resolver_addr.into(),
            state: Mutex::new(State { queue: VecDeque::new(), upstream: None }),
        });
        let reconnect_loop = this.clone();
        tokio::spawn(async move { reconnect_loop.reconnect_loop().await });
        this
    }

    /// Enqueues `bytes`, writing immediately if an upstream is already connected; `on_reply`
    /// runs once, concurrently, when the matching reply arrives. The write itself happens under
    /// the lock, same as the original's pointer swaps and replay burst — only the blocking read
    /// in `read_loop` stays outside it.
    pub async fn send_request(&self, bytes: Vec<u8>, on_reply: OnReply) {
        let mut state = self.state.lock().await;
        let write_now = state.upstream.is_some();
        state.queue.push_back(Pending { bytes: bytes.clone(), on_reply: Some(on_reply) });
        if write_now {
            if let Some(up) = state.upstream.as_mut() {
                if up.write_datagram(&bytes).await.is_err() {
                    let mut dead = state.upstream.take().unwrap();
                    drop(state);
                    dead.shutdown().await;
                    return;
                }
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let sub = match self.pool.dial_context("udp", &self.resolver_addr).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(err = %e, "dns forwarder: redial failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let (read_half, mut write_half) = PacketConn::new(sub).split();

            let replay: Vec<Vec<u8>> = {
                let state = self.state.lock().await;
                state.queue.iter().map(|p| p.bytes.clone()).collect()
            };
            let mut ok = true;
            if replay.is_empty() {
                ok = write_half.write_datagram(NULL_QUERY).await.is_ok();
            } else {
                for bytes in &replay {
                    if write_half.write_datagram(bytes).await.is_err() {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                write_half.shutdown().await;
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            {
                let mut state = self.state.lock().await;
                state.upstream = Some(write_half);
            }

            self.read_loop(read_half).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Owns the read half exclusively, so the blocking `read_datagram` below never holds
    /// `self.state`'s lock: `send_request` can keep enqueueing and writing new outbound queries
    /// while a reply is pending, instead of being serialized behind it.
    async fn read_loop(&self, mut read_half: PacketReadHalf<ReadHalf<SubStreamWrapper>>) {
        loop {
            let datagram = match read_half.read_datagram().await {
                Ok(Some(d)) => d,
                _ => {
                    let mut state = self.state.lock().await;
                    if let Some(mut dead) = state.upstream.take() {
                        drop(state);
                        dead.shutdown().await;
                    }
                    return;
                }
            };

            let mut state = self.state.lock().await;
            match state.queue.pop_front() {
                Some(mut pending) => {
                    if let Some(cb) = pending.on_reply.take() {
                        tokio::spawn(async move { cb(datagram) });
                    }
                }
                None => {
                    tracing::debug!("dns forwarder: reply received with an empty pending queue, discarding");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_query_is_well_formed_length() {
        assert_eq!(NULL_QUERY.len(), 16);
    }
}
