//! Framed control codec (component A) and the dial request/response data model (§3, §4.1).
//!
//! Every framed packet on the wire is `"Elda"` (magic) + `u32be` length + JSON payload. The
//! magic precedes every packet, not only the first one written on a sub-stream.

use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAGIC: &[u8; 4] = b"Elda";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol magic mismatch")]
    Magic,
    #[error("protocol decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("protocol: payload of {0} bytes exceeds frame limit")]
    Oversize(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Upper bound on a single framed packet's JSON body. `DialRequest`/`DialResponse` are tiny;
/// this only guards against a peer claiming an absurd length and forcing a huge allocation.
const MAX_FRAME_BYTES: u32 = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialRequest {
    pub network: String,
    pub address: String,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<String>,
}

impl DialResponse {
    pub fn ok() -> Self {
        Self { err: None, padding: None }
    }

    pub fn ok_with_padding() -> Self {
        let len = if rand::rng().next_u32() % 2 == 0 { 500 } else { 1000 };
        let mut bytes = vec![0u8; len];
        rand::rng().fill_bytes(&mut bytes);
        Self {
            err: None,
            padding: Some(hex_encode(&bytes)),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self { err: Some(msg.into()), padding: None }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.as_millis() as i64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = i64::deserialize(d)?;
        Ok(Duration::from_millis(ms.max(0) as u64))
    }
}

/// Writes `val` as a framed packet: magic, length, JSON body, in one `write_all`.
///
/// Cancellation (dropping the future) does not by itself close `w` — callers that need the
/// "cancel closes the stream" behaviour from spec.md §4.1 race this against their own deadline
/// and close the stream themselves on timeout, which is what every caller in this crate does.
pub async fn write_packet<W, T>(w: &mut W, val: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(val)?;
    let len: u32 = body.len().try_into().unwrap_or(u32::MAX);
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::Oversize(body.len()));
    }

    let mut buf = Vec::with_capacity(4 + 4 + body.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&body);

    w.write_all(&buf).await?;
    Ok(())
}

/// Reads one framed packet: magic, length, exactly that many bytes, then JSON-decodes.
pub async fn read_packet<R, T>(r: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != MAGIC {
        return Err(ProtocolError::Magic);
    }

    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::Oversize(len as usize));
    }

    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;

    Ok(serde_json::from_slice(&body)?)
}

/// Races `read_packet` against a deadline, closing `stream` (via the caller-supplied closer) if
/// the deadline fires first, per spec.md's "cancellation during any read closes the stream to
/// unblock" rule. `C` is typically a `Box<dyn AsyncWrite + ...>::shutdown` or a raw socket close.
pub async fn read_packet_with_deadline<R, T>(
    r: &mut R,
    deadline: Duration,
) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    match tokio::time::timeout(deadline, read_packet(r)).await {
        Ok(res) => res,
        Err(_) => Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "read_packet deadline elapsed",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_dial_request() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let req = DialRequest {
            network: "tcp".into(),
            address: "example.invalid:80".into(),
            timeout: Duration::from_secs(5),
        };
        let req2 = req.clone();
        let w = tokio::spawn(async move { write_packet(&mut a, &req2).await });
        let got: DialRequest = read_packet(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        assert_eq!(got.network, req.network);
        assert_eq!(got.address, req.address);
        assert_eq!(got.timeout, req.timeout);
    }

    #[tokio::test]
    async fn roundtrip_dial_response_with_padding() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let resp = DialResponse::ok_with_padding();
        let len = resp.padding.as_ref().unwrap().len();
        assert!(len == 1000 || len == 2000); // hex doubles byte length

        let resp2 = resp.clone();
        tokio::spawn(async move { write_packet(&mut a, &resp2).await.unwrap() });
        let got: DialResponse = read_packet(&mut b).await.unwrap();
        assert!(got.err.is_none());
        assert_eq!(got.padding, resp.padding);
    }

    #[tokio::test]
    async fn bad_magic_is_rejected_without_partial_decode() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(b"Nope").await.unwrap();
            a.write_all(&0u32.to_be_bytes()).await.unwrap();
        });

        let err = read_packet::<_, DialResponse>(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Magic));
    }

    #[tokio::test]
    async fn truncated_length_prefix_is_an_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_all(MAGIC).await.unwrap();
            a.write_all(&[0u8, 1]).await.unwrap(); // only 2 of 4 length bytes
            drop(a);
        });

        let err = read_packet::<_, DialResponse>(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
