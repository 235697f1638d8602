//! WSS tunnel authentication through the manager.

use passage_control::{
    Caller, ControlError, CreateTunnel, Manager, MemoryCache, MemoryStore, PushBus, TunnelState,
};
use passage_engine::{HostPort, SecretToken, SessionRegistry, TlsParams, Transport};
use passage_proto::OwnerId;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Error as WsError;

const TOKEN: &str = "s3cret-token-0123456789";

/// Accept any certificate; the tests use a throwaway self-signed one.
#[derive(Debug)]
struct AcceptAnyCert(rustls::crypto::CryptoProvider);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Reserve an ephemeral port and free it for the tunnel to claim.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn self_signed_files() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file
        .write_all(cert.key_pair.serialize_pem().as_bytes())
        .unwrap();
    (cert_file, key_file)
}

async fn wss_handshake(
    addr: std::net::SocketAddr,
    token: &str,
) -> Result<(), WsError> {
    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(addr).await.map_err(WsError::Io)?;
    let tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .map_err(WsError::Io)?;

    let request = Request::builder()
        .method("GET")
        .uri(format!("wss://localhost:{}/tunnel", addr.port()))
        .header("Host", format!("localhost:{}", addr.port()))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Authorization", format!("Bearer {token}"))
        .body(())
        .unwrap();

    tokio_tungstenite::client_async(request, tls).await.map(|_| ())
}

#[tokio::test(flavor = "multi_thread")]
async fn wss_rejects_bad_token_and_keeps_counters_clean() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (cert_file, key_file) = self_signed_files();
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let registry = Arc::new(SessionRegistry::new());
    let bus = PushBus::new(Default::default());
    let manager = Manager::new(store, cache, registry.clone(), bus);

    let owner = OwnerId::generate();
    let record = manager
        .create(
            CreateTunnel {
                name: "wss-gate".to_string(),
                description: String::new(),
                transport: Transport::Wss,
                listen: HostPort::new("127.0.0.1", free_port()),
                target: HostPort::new("127.0.0.1", 1),
                token: Some(SecretToken::new(TOKEN)),
                mux: None,
                tls: Some(TlsParams::new(
                    cert_file.path().to_string_lossy(),
                    key_file.path().to_string_lossy(),
                )),
            },
            owner,
        )
        .await
        .unwrap();

    manager.start(record.id, Caller::user(owner)).await.unwrap();
    let instance = registry.lookup(record.id).unwrap();
    let addr = instance.local_addr();

    match wss_handshake(addr, "wrong").await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {other:?}"),
    }

    // The rejected attempt left no trace in the counters.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = manager.status(record.id).await.unwrap();
    assert_eq!(status.state, TunnelState::Active);
    assert_eq!(status.counters.connections, 0);
    assert_eq!(status.counters.bytes_in, 0);
    assert_eq!(status.counters.bytes_out, 0);

    // A correct token completes the TLS + upgrade handshake.
    wss_handshake(addr, TOKEN).await.unwrap();

    manager.stop(record.id, Caller::user(owner)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn wss_with_unreadable_cert_fails_at_start() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let registry = Arc::new(SessionRegistry::new());
    let bus = PushBus::new(Default::default());
    let manager = Manager::new(store, cache, registry, bus);

    let owner = OwnerId::generate();
    let record = manager
        .create(
            CreateTunnel {
                name: "wss-broken".to_string(),
                description: String::new(),
                transport: Transport::Wss,
                listen: HostPort::new("127.0.0.1", free_port()),
                target: HostPort::new("127.0.0.1", 1),
                token: Some(SecretToken::new(TOKEN)),
                mux: None,
                tls: Some(TlsParams::new("/nonexistent/cert.pem", "/nonexistent/key.pem")),
            },
            owner,
        )
        .await
        .unwrap();

    match manager.start(record.id, Caller::user(owner)).await {
        Err(ControlError::BindFailed(msg)) => assert!(msg.contains("TLS")),
        other => panic!("expected bind failure, got {other:?}"),
    }
    assert_eq!(
        manager.status(record.id).await.unwrap().state,
        TunnelState::Error
    );
}
