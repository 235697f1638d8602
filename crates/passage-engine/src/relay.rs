//! Bidirectional byte pump between an accepted duplex and the target.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::counters::TunnelCounters;
use crate::model::HostPort;

/// Deadline for dialing the target.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Relay one inbound duplex to the tunnel target.
///
/// Dials the target, then pumps both directions until EOF, error, or
/// cancellation. A dial failure counts as a transient error against the
/// tunnel and closes the inbound side; it never tears the tunnel down.
pub async fn relay<I>(
    inbound: I,
    target: &HostPort,
    counters: &Arc<TunnelCounters>,
    cancel: &CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Send + Unpin,
{
    counters.incr_connections();

    let dial = TcpStream::connect((target.host.as_str(), target.port));
    let upstream = match tokio::time::timeout(DIAL_TIMEOUT, dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(%target, "target dial failed: {e}");
            counters.incr_errors();
            return;
        }
        Err(_) => {
            debug!(%target, "target dial timed out after {DIAL_TIMEOUT:?}");
            counters.incr_errors();
            return;
        }
    };

    let (client_read, client_write) = tokio::io::split(inbound);
    let (upstream_read, upstream_write) = upstream.into_split();

    let inbound_half = pump(client_read, upstream_write, counters, true);
    let outbound_half = pump(upstream_read, client_write, counters, false);

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("relay cancelled");
        }
        (client_to_target, target_to_client) = async { tokio::join!(inbound_half, outbound_half) } => {
            if let Err(e) = client_to_target {
                debug!("client→target copy ended with error: {e}");
            }
            if let Err(e) = target_to_client {
                debug!("target→client copy ended with error: {e}");
            }
        }
    }
}

/// Copy until EOF, counting bytes as they move, then half-close the
/// write side so the opposite direction can drain.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    counters: &TunnelCounters,
    inbound: bool,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        if inbound {
            counters.add_bytes_in(n as u64);
        } else {
            counters.add_bytes_out(n as u64);
        }
        total += n as u64;
    }
    writer.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_relay_echoes_and_counts() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (mut client, inbound) = tokio::io::duplex(4096);
        let counters = Arc::new(TunnelCounters::new());
        let cancel = CancellationToken::new();

        let relay_counters = counters.clone();
        let relay_cancel = cancel.clone();
        let target = HostPort::new("127.0.0.1", target_addr.port());
        let relay_task = tokio::spawn(async move {
            relay(inbound, &target, &relay_counters, &relay_cancel).await;
        });

        client.write_all(b"PING").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PING");

        drop(client);
        relay_task.await.unwrap();

        let snap = counters.snapshot();
        assert_eq!(snap.bytes_in, 4);
        assert_eq!(snap.bytes_out, 4);
        assert_eq!(snap.connections, 1);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test]
    async fn test_dial_failure_is_counted_not_fatal() {
        // A port nothing listens on: bind then drop to reserve-and-free.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = probe.local_addr().unwrap();
        drop(probe);

        let (_client, inbound) = tokio::io::duplex(4096);
        let counters = Arc::new(TunnelCounters::new());
        let cancel = CancellationToken::new();

        let target = HostPort::new("127.0.0.1", dead_addr.port());
        relay(inbound, &target, &counters, &cancel).await;

        let snap = counters.snapshot();
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.bytes_in, 0);
    }
}
