//! TCP acceptor.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::{BoxedDuplex, TransportError};

/// Plain TCP acceptor: every accepted socket is one duplex.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(addr = %listener.local_addr()?, "TCP acceptor listening");
        Ok(Self { listener })
    }

    pub async fn accept(&mut self) -> Result<(BoxedDuplex, SocketAddr), TransportError> {
        let (socket, peer) = self.listener.accept().await?;
        debug!(%peer, "accepted TCP connection");
        Ok((Box::new(socket), peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

impl std::fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("local_addr", &self.listener.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_bind_and_accept() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let (mut duplex, _peer) = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 2];
        duplex.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_a_bind_error() {
        let first = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        match TcpAcceptor::bind(addr).await {
            Err(TransportError::Bind { .. }) => {}
            other => panic!("expected bind error, got {:?}", other.map(|_| ())),
        }
    }
}
