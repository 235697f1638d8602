//! WebSocket acceptor (WS and WSS) with bearer-token gating.
//!
//! The upgrade is served on a single path and only completes when the
//! request carries `Authorization: Bearer <token>` matching the
//! tunnel's token; the comparison is constant-time. The upgraded
//! connection is exposed as a byte duplex where each write becomes one
//! binary frame and a close frame reads as EOF.

use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::{BoxedDuplex, TransportError};

/// The single upgrade path served by the acceptor.
pub const TUNNEL_PATH: &str = "/tunnel";

/// WS/WSS acceptor. TLS termination happens before the upgrade when an
/// acceptor is configured.
pub struct WsAcceptor {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    token: String,
}

impl WsAcceptor {
    pub async fn bind(
        addr: SocketAddr,
        token: String,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let scheme = if tls.is_some() { "wss" } else { "ws" };
        info!(
            addr = %listener.local_addr()?,
            "{scheme} acceptor listening on {TUNNEL_PATH}"
        );
        Ok(Self {
            listener,
            tls,
            token,
        })
    }

    /// Accept the next authenticated WebSocket connection. Failed
    /// handshakes and rejected upgrades are logged and skipped.
    pub async fn accept(&mut self) -> Result<(BoxedDuplex, SocketAddr), TransportError> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            debug!(%peer, "incoming websocket transport connection");

            let callback = upgrade_callback(&self.token);

            match &self.tls {
                Some(tls) => {
                    let tls_stream = match tls.accept(socket).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(%peer, "TLS handshake failed: {e}");
                            continue;
                        }
                    };
                    match tokio_tungstenite::accept_hdr_async(tls_stream, callback).await {
                        Ok(ws) => return Ok((Box::new(WsByteStream::new(ws)), peer)),
                        Err(e) => {
                            warn!(%peer, "websocket upgrade rejected: {e}");
                            continue;
                        }
                    }
                }
                None => match tokio_tungstenite::accept_hdr_async(socket, callback).await {
                    Ok(ws) => return Ok((Box::new(WsByteStream::new(ws)), peer)),
                    Err(e) => {
                        warn!(%peer, "websocket upgrade rejected: {e}");
                        continue;
                    }
                },
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

impl std::fmt::Debug for WsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsAcceptor")
            .field("local_addr", &self.listener.local_addr())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Compare a presented bearer token against the expected one without
/// leaking a timing signal about the matching prefix length.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

fn upgrade_callback(
    token: &str,
) -> impl FnOnce(&Request, Response) -> Result<Response, ErrorResponse> + '_ {
    move |req: &Request, response: Response| {
        if req.uri().path() != TUNNEL_PATH {
            debug!(path = req.uri().path(), "upgrade on unknown path");
            return Err(error_response(StatusCode::NOT_FOUND));
        }

        let presented = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match presented {
            Some(presented) if token_matches(token, presented) => Ok(response),
            _ => {
                debug!("upgrade rejected: bad or missing bearer token");
                Err(error_response(StatusCode::UNAUTHORIZED))
            }
        }
    }
}

fn error_response(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

/// Byte-duplex adapter over an upgraded WebSocket.
///
/// Binary frames only: each write is sent as one frame, text and
/// control frames on the read side are skipped, and a close frame is
/// EOF. `shutdown` sends a close frame, which is a bilateral close.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
    eof: bool,
}

impl<S> WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
        }
    }
}

fn ws_io_error(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::ErrorKind::BrokenPipe.into()
        }
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    this.pending = Bytes::from(data);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    this.eof = true;
                }
                Poll::Ready(Some(Ok(_))) => {
                    // Text and ping/pong frames carry no tunnel bytes.
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_io_error(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_io_error(e))),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(ws_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_close(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            // Closing an already-closed socket is a clean shutdown.
            Poll::Ready(Err(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed,
            )) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(ws_io_error(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> std::fmt::Debug for WsByteStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsByteStream")
            .field("eof", &self.eof)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_matches() {
        assert!(token_matches("s3cret-token-abcd", "s3cret-token-abcd"));
        assert!(!token_matches("s3cret-token-abcd", "wrong"));
        assert!(!token_matches("s3cret-token-abcd", ""));
        assert!(!token_matches("s3cret-token-abcd", "s3cret-token-abcD"));
    }
}
