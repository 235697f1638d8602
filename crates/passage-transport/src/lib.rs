//! Transport acceptors for the passage data plane.
//!
//! Each stream-oriented transport (TCP, WS, WSS) accepts connections and
//! presents them as byte duplexes; the engine relays or multiplexes on
//! top without knowing the wire protocol. UDP is datagram-oriented and
//! handled directly by the engine.

pub mod tcp;
pub mod tls;
pub mod ws;

pub use tcp::TcpAcceptor;
pub use tls::{load_tls_acceptor, TlsSettings, TlsVersion};
pub use ws::{WsAcceptor, WsByteStream};

use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte channel.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// An accepted connection, erased to a byte duplex.
pub type BoxedDuplex = Box<dyn Duplex>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("transport configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream-transport acceptor, dispatched by variant.
///
/// A narrow capability — accept or be dropped — so the engine can match
/// exhaustively on the tunnel's transport instead of going through a
/// trait object.
pub enum StreamAcceptor {
    Tcp(TcpAcceptor),
    Ws(WsAcceptor),
}

impl StreamAcceptor {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Result<(BoxedDuplex, SocketAddr), TransportError> {
        match self {
            StreamAcceptor::Tcp(a) => a.accept().await,
            StreamAcceptor::Ws(a) => a.accept().await,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        match self {
            StreamAcceptor::Tcp(a) => a.local_addr(),
            StreamAcceptor::Ws(a) => a.local_addr(),
        }
    }
}
