//! SOCKS5 ingress O: a CONNECT-only, no-auth listener that hands each accepted connection to the
//! forwarder (J). UDP ASSOCIATE and username/password auth are out of scope; any request for
//! either is replied to with the generic failure code and the connection is closed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::eldatun::client::direct_dial::DirectDialer;
use crate::eldatun::splice::splice_growing_buffer;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_OK: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("unsupported socks version {0}")]
    BadVersion(u8),
    #[error("client offered no acceptable auth method")]
    NoAcceptableMethod,
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Socks5Options {
    pub listen_addr: SocketAddr,
    pub dial_timeout: Duration,
}

pub async fn serve(
    dialer: Arc<DirectDialer>,
    opts: Socks5Options,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(opts.listen_addr).await?;
    tracing::info!(addr = %opts.listen_addr, "socks5: listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let dialer = dialer.clone();
                let dial_timeout = opts.dial_timeout;
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(dialer, stream, dial_timeout, shutdown).await {
                        tracing::debug!(peer = %peer, err = %e, "socks5: connection ended");
                    }
                });
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn handle_connection(
    dialer: Arc<DirectDialer>,
    mut stream: TcpStream,
    dial_timeout: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), Socks5Error> {
    negotiate_method(&mut stream).await?;

    let target = match read_request(&mut stream).await {
        Ok(t) => t,
        Err(e) => {
            let reply = match &e {
                Socks5Error::UnsupportedCommand(_) => REPLY_COMMAND_NOT_SUPPORTED,
                _ => REPLY_GENERAL_FAILURE,
            };
            let _ = write_reply(&mut stream, reply).await;
            return Err(e);
        }
    };

    let dial = dialer.dial("tcp", &target);
    let upstream = tokio::select! {
        res = tokio::time::timeout(dial_timeout, dial) => {
            match res {
                Ok(Ok(s)) => s,
                _ => {
                    let _ = write_reply(&mut stream, REPLY_HOST_UNREACHABLE).await;
                    return Err(Socks5Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream dial failed")));
                }
            }
        }
        _ = shutdown.changed() => return Ok(()),
    };

    write_reply(&mut stream, REPLY_OK).await?;

    tokio::select! {
        result = splice_growing_buffer(stream, upstream) => {
            if let Err(e) = result {
                tracing::debug!(err = %e, "socks5: flow ended");
            }
        }
        _ = shutdown.changed() => {}
    }
    Ok(())
}

async fn negotiate_method(stream: &mut TcpStream) -> Result<(), Socks5Error> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let [version, nmethods] = header;
    if version != VERSION {
        return Err(Socks5Error::BadVersion(version));
    }
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    } else {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        Err(Socks5Error::NoAcceptableMethod)
    }
}

async fn read_request(stream: &mut TcpStream) -> Result<String, Socks5Error> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, cmd, _rsv, atyp] = header;
    if version != VERSION {
        return Err(Socks5Error::BadVersion(version));
    }
    if cmd != CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(cmd));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets)).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets)).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| Socks5Error::UnsupportedAddressType(atyp))?
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok(format!("{host}:{port}"))
}

async fn write_reply(stream: &mut TcpStream, reply: u8) -> std::io::Result<()> {
    let mut packet = vec![VERSION, reply, 0x00, ATYP_IPV4];
    packet.extend_from_slice(&[0, 0, 0, 0]);
    packet.extend_from_slice(&0u16.to_be_bytes());
    stream.write_all(&packet).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn negotiate_rejects_client_with_no_no_auth_offer() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[VERSION, 1, 0x02]).await.unwrap();
        let handle = tokio::spawn(async move {
            let mut header = [0u8; 2];
            server.read_exact(&mut header).await.unwrap();
            let [_v, n] = header;
            let mut methods = vec![0u8; n as usize];
            server.read_exact(&mut methods).await.unwrap();
            let result = if methods.contains(&METHOD_NO_AUTH) {
                server.write_all(&[VERSION, METHOD_NO_AUTH]).await.unwrap();
                Ok(())
            } else {
                server.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await.unwrap();
                Err::<(), _>(())
            };
            result
        });
        assert!(handle.await.unwrap().is_err());
    }

    #[test]
    fn request_parsing_constants_are_standard_socks5() {
        assert_eq!(VERSION, 0x05);
        assert_eq!(CMD_CONNECT, 0x01);
    }
}
