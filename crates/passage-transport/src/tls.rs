//! Server-side TLS configuration loading.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, SupportedProtocolVersion};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::TransportError;

/// TLS protocol versions selectable for a tunnel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

impl TlsVersion {
    fn supported(self) -> &'static SupportedProtocolVersion {
        match self {
            TlsVersion::V1_2 => &rustls::version::TLS12,
            TlsVersion::V1_3 => &rustls::version::TLS13,
        }
    }
}

impl std::str::FromStr for TlsVersion {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.2" => Ok(TlsVersion::V1_2),
            "1.3" => Ok(TlsVersion::V1_3),
            other => Err(TransportError::Config(format!(
                "unsupported TLS version: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsVersion::V1_2 => write!(f, "1.2"),
            TlsVersion::V1_3 => write!(f, "1.3"),
        }
    }
}

/// Certificate material and version bounds for a TLS endpoint.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
}

impl TlsSettings {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            min_version: TlsVersion::V1_2,
            max_version: TlsVersion::V1_3,
        }
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::Tls(format!("cannot read certificate {}: {e}", path.display()))
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| {
            TransportError::Tls(format!("invalid certificate {}: {e}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("cannot read key {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::Tls(format!("invalid key {}: {e}", path.display())))?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {}", path.display())))
}

/// Build a TLS acceptor from settings. Unreadable material fails here,
/// at bind time, not on first handshake.
pub fn load_tls_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor, TransportError> {
    if settings.min_version > settings.max_version {
        return Err(TransportError::Config(format!(
            "TLS min version {} above max {}",
            settings.min_version, settings.max_version
        )));
    }

    let certs = read_certs(&settings.cert_path)?;
    let key = read_key(&settings.key_path)?;

    let versions: Vec<&'static SupportedProtocolVersion> =
        [TlsVersion::V1_2, TlsVersion::V1_3]
            .into_iter()
            .filter(|v| *v >= settings.min_version && *v <= settings.max_version)
            .map(TlsVersion::supported)
            .collect();

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&versions)
        .map_err(|e| TransportError::Tls(format!("unsupported TLS protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("invalid certificate/key pair: {e}")))?;

    info!(
        cert = %settings.cert_path.display(),
        min = %settings.min_version,
        max = %settings.max_version,
        "loaded TLS server configuration"
    );
    Ok(TlsAcceptor::from(Arc::new(config)))
}
