//! Packet-framed stream adapter (component B).
//!
//! Wraps an `AsyncRead + AsyncWrite` sub-stream so callers exchange discrete datagrams instead
//! of a byte stream: each datagram is a `u16be` length prefix followed by exactly that many
//! bytes. Max payload is 65535 bytes, matching the UDP framing in spec.md §3.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_DATAGRAM_LEN: usize = u16::MAX as usize;
/// Smallest read buffer this adapter will fill without risking truncating a max-size datagram.
pub const MIN_READ_BUF_LEN: usize = MAX_DATAGRAM_LEN + 1;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("datagram of {0} bytes exceeds the {MAX_DATAGRAM_LEN} byte limit")]
    WriteTooLarge(usize),
    #[error("read buffer of {0} bytes is smaller than the required {MIN_READ_BUF_LEN}")]
    ReadBufTooSmall(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A length-prefixed datagram channel layered over any duplex byte stream (typically a
/// multiplexer sub-stream).
///
/// Both fatal error cases from spec.md §4.2 — an over-size write and an under-size read buffer
/// — are checked before anything touches the wire or the caller's buffer.
pub struct PacketConn<RW> {
    inner: RW,
}

impl<RW> PacketConn<RW>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: RW) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> RW {
        self.inner
    }

    /// Reads one datagram into `buf`, returning the number of bytes written. `buf` must be at
    /// least `MIN_READ_BUF_LEN` bytes so a max-size datagram always fits. Returns `Ok(0)` on a
    /// clean EOF before any bytes of the next length prefix arrive.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, PacketError> {
        if buf.len() < MIN_READ_BUF_LEN {
            return Err(PacketError::ReadBufTooSmall(buf.len()));
        }

        let mut len_buf = [0u8; 2];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(0),
            Err(e) => return Err(e.into()),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        self.inner.read_exact(&mut buf[..len]).await?;
        Ok(len)
    }

    /// Writes one datagram. `buf` must be at most 65535 bytes.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), PacketError> {
        if buf.len() > MAX_DATAGRAM_LEN {
            return Err(PacketError::WriteTooLarge(buf.len()));
        }
        let len = buf.len() as u16;
        let mut framed = Vec::with_capacity(2 + buf.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(buf);
        self.inner.write_all(&framed).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Convenience wrapper over `read` that owns its buffer; `None` on clean EOF.
    pub async fn read_datagram(&mut self) -> Result<Option<Vec<u8>>, PacketError> {
        let mut buf = vec![0u8; MIN_READ_BUF_LEN];
        let n = self.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    pub async fn write_datagram(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        self.write(payload).await
    }

    /// Splits into independent read/write halves so the two directions of a splice can run
    /// concurrently without sharing a lock — read framing and write framing need no shared
    /// state, so this is always safe.
    pub fn split(self) -> (PacketReadHalf<tokio::io::ReadHalf<RW>>, PacketWriteHalf<tokio::io::WriteHalf<RW>>)
    where
        RW: Send + 'static,
    {
        let (r, w) = tokio::io::split(self.inner);
        (PacketReadHalf { inner: r }, PacketWriteHalf { inner: w })
    }
}

pub struct PacketReadHalf<R> {
    inner: R,
}

impl<R> PacketReadHalf<R>
where
    R: AsyncRead + Unpin,
{
    pub async fn read_datagram(&mut self) -> Result<Option<Vec<u8>>, PacketError> {
        let mut len_buf = [0u8; 2];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }
}

pub struct PacketWriteHalf<W> {
    inner: W,
}

impl<W> PacketWriteHalf<W>
where
    W: AsyncWrite + Unpin,
{
    pub async fn write_datagram(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        if payload.len() > MAX_DATAGRAM_LEN {
            return Err(PacketError::WriteTooLarge(payload.len()));
        }
        let len = payload.len() as u16;
        let mut framed = Vec::with_capacity(2 + payload.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(payload);
        self.inner.write_all(&framed).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_datagram() {
        let (a, b) = tokio::io::duplex(8192);
        let mut a = PacketConn::new(a);
        let mut b = PacketConn::new(b);

        let payload = vec![7u8; 4096];
        let payload2 = payload.clone();
        tokio::spawn(async move { a.write(&payload2).await.unwrap() });
        let got = b.read_datagram().await.unwrap().unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn max_len_boundary_is_accepted() {
        let (a, b) = tokio::io::duplex(1 << 17);
        let mut a = PacketConn::new(a);
        let mut b = PacketConn::new(b);

        let payload = vec![1u8; MAX_DATAGRAM_LEN];
        let payload2 = payload.clone();
        tokio::spawn(async move { a.write(&payload2).await.unwrap() });
        let got = b.read_datagram().await.unwrap().unwrap();
        assert_eq!(got.len(), MAX_DATAGRAM_LEN);
    }

    #[tokio::test]
    async fn write_of_65536_is_rejected() {
        let (a, _b) = tokio::io::duplex(8);
        let mut a = PacketConn::new(a);
        let payload = vec![0u8; MAX_DATAGRAM_LEN + 1];
        let err = a.write(&payload).await.unwrap_err();
        assert!(matches!(err, PacketError::WriteTooLarge(n) if n == MAX_DATAGRAM_LEN + 1));
    }

    #[tokio::test]
    async fn read_buffer_smaller_than_65536_is_rejected() {
        let (_a, b) = tokio::io::duplex(8);
        let mut b = PacketConn::new(b);
        let mut small = [0u8; 65535];
        let err = b.read(&mut small).await.unwrap_err();
        assert!(matches!(err, PacketError::ReadBufTooSmall(65535)));
    }

    #[tokio::test]
    async fn two_writes_are_not_coalesced() {
        let (mut a, b) = tokio::io::duplex(8192);
        let mut b = PacketConn::new(b);
        let first = vec![1u8; 40];
        let second = vec![2u8; 80];
        let (f2, s2) = (first.clone(), second.clone());
        tokio::spawn(async move {
            let mut w = PacketConn::new(&mut a);
            w.write(&f2).await.unwrap();
            w.write(&s2).await.unwrap();
        });

        let got1 = b.read_datagram().await.unwrap().unwrap();
        let got2 = b.read_datagram().await.unwrap().unwrap();
        assert_eq!(got1, first);
        assert_eq!(got2, second);
    }

    #[tokio::test]
    async fn clean_eof_before_any_bytes_is_none() {
        let (a, b) = tokio::io::duplex(8);
        drop(a);
        let mut b = PacketConn::new(b);
        assert!(b.read_datagram().await.unwrap().is_none());
    }
}
