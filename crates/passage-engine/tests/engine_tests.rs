//! End-to-end data-plane behaviour with real sockets.

use passage_engine::{
    EngineError, HostPort, MuxParams, SecretToken, SessionRegistry, Transport, TunnelInstance,
    TunnelSpec,
};
use passage_mux::{MuxConfig, MuxError, MuxSession};
use passage_proto::{OwnerId, TunnelId};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn spec(transport: Transport, listen_port: u16, target_port: u16) -> TunnelSpec {
    TunnelSpec {
        transport,
        listen: HostPort::new("127.0.0.1", listen_port),
        target: HostPort::new("127.0.0.1", target_port),
        token: SecretToken::new("integration-test-token"),
        mux: MuxParams::default(),
        tls: None,
    }
}

/// Reserve an ephemeral port and free it for the tunnel to claim.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// TCP echo server; returns its port.
async fn echo_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_passthrough_counts_and_stops() {
    let target_port = echo_target().await;
    let instance = TunnelInstance::spawn(
        TunnelId::generate(),
        OwnerId::generate(),
        spec(Transport::Tcp, free_port(), target_port),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(instance.local_addr()).await.unwrap();
    client.write_all(b"PING").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"PING");
    drop(client);

    // Counters settle once the relay observes both EOFs.
    let mut snap = instance.counters();
    for _ in 0..50 {
        snap = instance.counters();
        if snap.bytes_in == 4 && snap.bytes_out == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(snap.bytes_in, 4);
    assert_eq!(snap.bytes_out, 4);
    assert_eq!(snap.connections, 1);

    assert!(instance.stop_and_wait(Duration::from_secs(10)).await);
    assert!(instance.is_done());
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_conflict_surfaces_as_bind_error() {
    let target_port = echo_target().await;
    let first = TunnelInstance::spawn(
        TunnelId::generate(),
        OwnerId::generate(),
        spec(Transport::Tcp, free_port(), target_port),
    )
    .await
    .unwrap();
    let taken = first.local_addr().port();

    match TunnelInstance::spawn(
        TunnelId::generate(),
        OwnerId::generate(),
        spec(Transport::Tcp, taken, target_port),
    )
    .await
    {
        Err(e) if e.is_bind_failure() => {}
        other => panic!("expected bind failure, got {:?}", other.map(|_| ())),
    }

    first.stop_and_wait(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_lets_in_flight_transfer_drain() {
    // Target swallows bytes and reports the total it saw.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = listener.local_addr().unwrap().port();
    let (total_tx, total_rx) = tokio::sync::oneshot::channel::<u64>();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut total = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n as u64,
            }
        }
        let _ = total_tx.send(total);
    });

    let instance = TunnelInstance::spawn(
        TunnelId::generate(),
        OwnerId::generate(),
        spec(Transport::Tcp, free_port(), target_port),
    )
    .await
    .unwrap();

    const PAYLOAD: usize = 1024 * 1024;
    let addr = instance.local_addr();
    let sender = tokio::spawn(async move {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&vec![7u8; PAYLOAD]).await.unwrap();
        client.shutdown().await.unwrap();
        // Hold the socket open until the peer closes so the relay can
        // finish the reverse direction too.
        let mut sink = Vec::new();
        let _ = client.read_to_end(&mut sink).await;
    });

    // Stop while the transfer is (likely) in flight; the relay drains
    // within the grace window.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(instance.stop_and_wait(Duration::from_secs(10)).await);

    sender.await.unwrap();
    let seen_by_target = total_rx.await.unwrap();
    assert_eq!(seen_by_target, PAYLOAD as u64);
    assert_eq!(instance.counters().bytes_in, PAYLOAD as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_connection_is_force_closed_after_grace() {
    let target_port = echo_target().await;
    let instance = TunnelInstance::spawn(
        TunnelId::generate(),
        OwnerId::generate(),
        spec(Transport::Tcp, free_port(), target_port),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(instance.local_addr()).await.unwrap();
    client.write_all(b"hold").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();

    // The idle relay cannot drain, so the short grace expires and the
    // instance force-closes it.
    assert!(!instance.stop_and_wait(Duration::from_millis(200)).await);
    assert!(instance.is_done());
}

#[tokio::test(flavor = "multi_thread")]
async fn mux_streams_relay_and_enforce_limit() {
    let target_port = echo_target().await;
    let mut tunnel_spec = spec(Transport::TcpMux, free_port(), target_port);
    tunnel_spec.mux.streams = 2;

    let instance = TunnelInstance::spawn(
        TunnelId::generate(),
        OwnerId::generate(),
        tunnel_spec.clone(),
    )
    .await
    .unwrap();

    let transport = TcpStream::connect(instance.local_addr()).await.unwrap();
    let client = MuxSession::client(
        transport,
        MuxConfig {
            max_streams: 2,
            ..tunnel_spec.mux.to_config()
        },
    );

    let mut s1 = client.open_stream().unwrap();
    let mut s2 = client.open_stream().unwrap();
    assert!(matches!(
        client.open_stream(),
        Err(MuxError::StreamLimit(2))
    ));

    // The two admitted streams relay normally.
    s1.write_all(b"one").await.unwrap();
    s2.write_all(b"two").await.unwrap();
    s1.shutdown().await.unwrap();
    s2.shutdown().await.unwrap();
    let mut reply = Vec::new();
    s1.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"one");
    reply.clear();
    s2.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"two");

    drop(s1);
    drop(s2);
    assert!(instance.stop_and_wait(Duration::from_secs(10)).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn registry_holds_exactly_one_instance_per_tunnel() {
    let target_port = echo_target().await;
    let registry = SessionRegistry::new();
    let id = TunnelId::generate();
    let owner = OwnerId::generate();

    let instance = TunnelInstance::spawn(id, owner, spec(Transport::Tcp, free_port(), target_port))
        .await
        .unwrap();
    registry.insert(instance.clone()).unwrap();

    let second = TunnelInstance::spawn(id, owner, spec(Transport::Tcp, free_port(), target_port))
        .await
        .unwrap();
    assert!(matches!(
        registry.insert(second.clone()),
        Err(EngineError::AlreadyRegistered(_))
    ));
    second.stop_and_wait(Duration::from_secs(5)).await;

    assert_eq!(registry.len(), 1);
    assert!(registry.lookup(id).is_some());
    let removed = registry.remove(id).unwrap();
    removed.stop_and_wait(Duration::from_secs(5)).await;
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_resets_counters() {
    let target_port = echo_target().await;
    let id = TunnelId::generate();
    let owner = OwnerId::generate();

    let instance = TunnelInstance::spawn(id, owner, spec(Transport::Tcp, free_port(), target_port))
        .await
        .unwrap();
    let mut client = TcpStream::connect(instance.local_addr()).await.unwrap();
    client.write_all(b"data").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    drop(client);
    instance.stop_and_wait(Duration::from_secs(5)).await;
    assert!(instance.counters().bytes_in > 0);

    let fresh = TunnelInstance::spawn(id, owner, spec(Transport::Tcp, free_port(), target_port))
        .await
        .unwrap();
    assert_eq!(fresh.counters().bytes_in, 0);
    assert_eq!(fresh.counters().connections, 0);
    fresh.stop_and_wait(Duration::from_secs(5)).await;
}
