//! Server session runner G (§4.8): wraps one hijacked connection in the multiplexer and spawns
//! handler H for every inbound sub-stream.

use std::sync::Arc;
use std::time::Duration;

use crate::eldatun::control::{self, DialResponse};
use crate::eldatun::mux::{BoxedStream, MuxError, MuxSession};
use crate::eldatun::server::handler::{self, HandlerOptions};

pub struct ServerSessionOptions {
    pub session_deadline: Duration,
    pub keep_alive_timeout: Duration,
}

/// Runs one server-side session to completion: brings up the multiplexer in server role, emits
/// the padded greeting over a dedicated server-initiated sub-stream, then loops accepting
/// sub-streams until the peer disconnects. Returns `Ok(())` on a clean end-of-stream; any other
/// error is fatal to this session.
///
/// The greeting travels over its own sub-stream rather than as raw bytes on the hijacked socket:
/// writing it before the multiplexer starts would corrupt yamux's framing for every session,
/// since the client hands the same socket straight to its client-role session without parsing
/// anything off it first (connector E never reads an HTTP response). No `200 OK` status line is
/// emitted either, for the same reason — the hijacked socket is binary from the first byte.
pub async fn run_session(stream: BoxedStream, opts: ServerSessionOptions) -> Result<(), MuxError> {
    let session = Arc::new(MuxSession::new_server(stream, opts.keep_alive_timeout));

    let mut greeting_stream = session.open().await?;
    control::write_packet(&mut greeting_stream, &DialResponse::ok_with_padding())
        .await
        .map_err(|_| MuxError::Closed)?;
    drop(greeting_stream);

    let handler_opts = Arc::new(HandlerOptions { session_deadline: opts.session_deadline });

    loop {
        match session.accept().await {
            Ok(sub_stream) => {
                let handler_opts = handler_opts.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler::handle_substream(sub_stream, &handler_opts).await {
                        tracing::debug!(err = %e, "server session: sub-stream handler ended with an error");
                    }
                });
            }
            Err(MuxError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eldatun::control::DialRequest;

    #[tokio::test]
    async fn client_receives_padded_greeting_before_any_substream() {
        let (server_io, client_io) = tokio::io::duplex(1 << 16);
        tokio::spawn(run_session(
            Box::new(server_io),
            ServerSessionOptions {
                session_deadline: Duration::from_secs(5),
                keep_alive_timeout: Duration::from_secs(30),
            },
        ));

        let client = crate::eldatun::mux::MuxSession::new_client(client_io, Duration::from_secs(30));
        let mut greeting_stream = client.accept().await.unwrap();
        let greeting: DialResponse = control::read_packet(&mut greeting_stream).await.unwrap();
        assert!(greeting.err.is_none());
        assert!(greeting.padding.is_some());
        drop(greeting_stream);

        let mut initial = client.open().await.unwrap();
        let request = DialRequest {
            network: "tcp".into(),
            address: "127.0.0.1:1".into(),
            timeout: Duration::from_millis(200),
        };
        control::write_packet(&mut initial, &request).await.unwrap();
        let resp: DialResponse = control::read_packet(&mut initial).await.unwrap();
        assert!(resp.err.is_some());
    }
}
