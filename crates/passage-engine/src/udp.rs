//! UDP datagram relay.
//!
//! The listener keeps one upstream socket per client source address. A
//! datagram from a new source dials the target and spawns a return pump
//! forwarding replies back to that source. Flows idle for five minutes
//! are closed and removed. Datagram boundaries are preserved 1:1.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::counters::TunnelCounters;
use crate::model::HostPort;
use crate::EngineError;

/// Inactivity timeout for one client flow.
pub const FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Read buffer size. A datagram filling the whole buffer cannot be told
/// apart from a truncated larger one and is dropped, so the largest
/// forwarded datagram is 65535 bytes.
const DATAGRAM_BUF_SIZE: usize = 65536;

pub(crate) struct UdpTunnel {
    socket: Arc<UdpSocket>,
    target: HostPort,
    flows: Arc<DashMap<SocketAddr, Arc<UdpSocket>>>,
    counters: Arc<TunnelCounters>,
}

impl UdpTunnel {
    /// Bind the listen socket. Bind failures surface immediately so a
    /// start attempt can report them.
    pub(crate) async fn bind(
        listen: SocketAddr,
        target: HostPort,
        counters: Arc<TunnelCounters>,
    ) -> Result<Self, EngineError> {
        let socket = UdpSocket::bind(listen)
            .await
            .map_err(|e| EngineError::Bind(format!("failed to bind udp {listen}: {e}")))?;
        info!(addr = %listen, "UDP acceptor listening");
        Ok(Self {
            socket: Arc::new(socket),
            target,
            flows: Arc::new(DashMap::new()),
            counters,
        })
    }

    pub(crate) fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the datagram pump until cancelled.
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result<(), EngineError> {
        let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];
        loop {
            let (n, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("udp read error: {e}");
                        continue;
                    }
                },
            };

            if n == buf.len() {
                debug!(%peer, "dropping oversized datagram");
                continue;
            }
            self.counters.add_bytes_in(n as u64);

            let upstream = match self.flows.get(&peer) {
                Some(entry) => entry.value().clone(),
                None => match self.open_flow(peer, &cancel).await {
                    Some(socket) => socket,
                    None => continue,
                },
            };

            if let Err(e) = upstream.send(&buf[..n]).await {
                debug!(%peer, "upstream send failed, dropping flow: {e}");
                self.flows.remove(&peer);
            }
        }
    }

    /// Dial the target for a new client source and spawn its return
    /// pump.
    async fn open_flow(
        &self,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> Option<Arc<UdpSocket>> {
        let target_addr = match self.target.resolve().await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(target = %self.target, "cannot resolve udp target: {e}");
                self.counters.incr_errors();
                return None;
            }
        };

        let bind_addr: SocketAddr = if target_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let upstream = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("cannot bind upstream udp socket: {e}");
                self.counters.incr_errors();
                return None;
            }
        };
        if let Err(e) = upstream.connect(target_addr).await {
            warn!(target = %self.target, "udp connect failed: {e}");
            self.counters.incr_errors();
            return None;
        }

        let upstream = Arc::new(upstream);
        self.flows.insert(peer, upstream.clone());
        self.counters.incr_connections();
        debug!(%peer, target = %target_addr, "opened udp flow");

        tokio::spawn(flow_return_pump(
            upstream.clone(),
            self.socket.clone(),
            peer,
            self.flows.clone(),
            self.counters.clone(),
            cancel.clone(),
        ));

        Some(upstream)
    }
}

/// Forward target replies back to one client source until the flow goes
/// idle, errors, or the tunnel stops.
async fn flow_return_pump(
    upstream: Arc<UdpSocket>,
    server: Arc<UdpSocket>,
    peer: SocketAddr,
    flows: Arc<DashMap<SocketAddr, Arc<UdpSocket>>>,
    counters: Arc<TunnelCounters>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];
    loop {
        let recv = tokio::select! {
            _ = cancel.cancelled() => break,
            res = tokio::time::timeout(FLOW_IDLE_TIMEOUT, upstream.recv(&mut buf)) => res,
        };
        match recv {
            Err(_) => {
                debug!(%peer, "udp flow idle, closing");
                break;
            }
            Ok(Err(e)) => {
                debug!(%peer, "udp upstream read error: {e}");
                break;
            }
            Ok(Ok(n)) => {
                if n == buf.len() {
                    debug!(%peer, "dropping oversized reply datagram");
                    continue;
                }
                counters.add_bytes_out(n as u64);
                if let Err(e) = server.send_to(&buf[..n], peer).await {
                    debug!(%peer, "reply to client failed: {e}");
                    break;
                }
            }
        }
    }
    flows.remove(&peer);
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_target() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_datagrams_roundtrip_with_boundaries() {
        let target = echo_target().await;
        let counters = Arc::new(TunnelCounters::new());
        let tunnel = UdpTunnel::bind(
            "127.0.0.1:0".parse().unwrap(),
            HostPort::new("127.0.0.1", target.port()),
            counters.clone(),
        )
        .await
        .unwrap();
        let tunnel_addr = tunnel.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        tokio::spawn(async move { tunnel.run(run_cancel).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(tunnel_addr).await.unwrap();

        for payload in [&b"alpha"[..], &b"b"[..], &b"gamma-gamma"[..]] {
            client.send(payload).await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
                .await
                .expect("reply in time")
                .unwrap();
            assert_eq!(&buf[..n], payload);
        }

        let snap = counters.snapshot();
        assert_eq!(snap.connections, 1);
        assert_eq!(snap.bytes_in, 17);
        assert_eq!(snap.bytes_out, 17);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_two_sources_get_separate_flows() {
        let target = echo_target().await;
        let counters = Arc::new(TunnelCounters::new());
        let tunnel = UdpTunnel::bind(
            "127.0.0.1:0".parse().unwrap(),
            HostPort::new("127.0.0.1", target.port()),
            counters.clone(),
        )
        .await
        .unwrap();
        let tunnel_addr = tunnel.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        tokio::spawn(async move { tunnel.run(run_cancel).await });

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"from-a", tunnel_addr).await.unwrap();
        b.send_to(b"from-b", tunnel_addr).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), a.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"from-a");
        let n = tokio::time::timeout(Duration::from_secs(5), b.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"from-b");

        assert_eq!(counters.snapshot().connections, 2);
        cancel.cancel();
    }
}
