//! Tunnel data-plane configuration model.

use passage_mux::MuxConfig;
use passage_transport::{TlsSettings, TlsVersion};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A rejected tunnel configuration. Carries the first failed check.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

fn invalid(msg: impl Into<String>) -> ValidationError {
    ValidationError(msg.into())
}

/// Wire protocol between the public endpoint and the tunnel process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Tcp,
    Udp,
    Ws,
    Wss,
    TcpMux,
    WsMux,
    WssMux,
}

impl Transport {
    /// Whether logical streams are multiplexed over one connection.
    pub fn is_mux(self) -> bool {
        matches!(self, Transport::TcpMux | Transport::WsMux | Transport::WssMux)
    }

    /// Whether the listen side terminates TLS.
    pub fn is_tls(self) -> bool {
        matches!(self, Transport::Wss | Transport::WssMux)
    }

    pub fn is_websocket(self) -> bool {
        matches!(
            self,
            Transport::Ws | Transport::Wss | Transport::WsMux | Transport::WssMux
        )
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Ws => "ws",
            Transport::Wss => "wss",
            Transport::TcpMux => "tcp-mux",
            Transport::WsMux => "ws-mux",
            Transport::WssMux => "wss-mux",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Transport {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            "ws" => Ok(Transport::Ws),
            "wss" => Ok(Transport::Wss),
            "tcp-mux" => Ok(Transport::TcpMux),
            "ws-mux" => Ok(Transport::WsMux),
            "wss-mux" => Ok(Transport::WssMux),
            other => Err(invalid(format!("unknown transport: {other}"))),
        }
    }
}

/// A host and port pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a socket address, preferring the first result.
    pub async fn resolve(&self) -> std::io::Result<std::net::SocketAddr> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        addrs.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {self}"),
            )
        })
    }

    fn validate(&self, what: &str) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(invalid(format!("{what} host is required")));
        }
        if self.port == 0 {
            return Err(invalid(format!("{what} port must be 1..=65535")));
        }
        Ok(())
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Shared secret gating a tunnel's public endpoint.
///
/// `Debug` and `Display` never reveal the value; equality is
/// constant-time.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretToken(String);

impl SecretToken {
    pub const MIN_LEN: usize = 16;
    const GENERATED_LEN: usize = 32;
    const CHARSET: &'static [u8] =
        b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generate a fresh random token.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let token: String = (0..Self::GENERATED_LEN)
            .map(|_| Self::CHARSET[rng.gen_range(0..Self::CHARSET.len())] as char)
            .collect();
        Self(token)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented token.
    pub fn matches(&self, presented: &str) -> bool {
        passage_transport::ws::token_matches(&self.0, presented)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.0.len() < Self::MIN_LEN {
            return Err(invalid(format!(
                "token must be at least {} bytes",
                Self::MIN_LEN
            )));
        }
        if !self.0.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(invalid("token must be printable ASCII"));
        }
        Ok(())
    }
}

impl PartialEq for SecretToken {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl Eq for SecretToken {}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(****)")
    }
}

/// Multiplexing parameters; only meaningful for mux transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxParams {
    /// Concurrent logical streams per transport connection.
    pub streams: u32,
    /// Largest data frame payload.
    pub frame_size: u32,
    /// Per-stream receive window in bytes.
    pub receive_buffer: u32,
    /// Keepalive ping period in seconds.
    pub keepalive_secs: u64,
}

impl Default for MuxParams {
    fn default() -> Self {
        Self {
            streams: 8,
            frame_size: 32 * 1024,
            receive_buffer: 4 * 1024 * 1024,
            keepalive_secs: 30,
        }
    }
}

impl MuxParams {
    pub fn to_config(&self) -> MuxConfig {
        MuxConfig {
            max_streams: self.streams,
            frame_size: self.frame_size,
            receive_window: self.receive_buffer,
            keepalive: Duration::from_secs(self.keepalive_secs),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if !(1..=64).contains(&self.streams) {
            return Err(invalid("mux streams must be 1..=64"));
        }
        if !(1024..=65536).contains(&self.frame_size) {
            return Err(invalid("mux frame size must be 1024..=65536"));
        }
        if self.receive_buffer < 65536 {
            return Err(invalid("mux receive buffer must be at least 65536"));
        }
        if !(5..=300).contains(&self.keepalive_secs) {
            return Err(invalid("mux keepalive must be 5..=300 seconds"));
        }
        Ok(())
    }
}

/// TLS material for wss transports. Versions use the original string
/// form ("1.2", "1.3").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsParams {
    pub cert_path: String,
    pub key_path: String,
    pub min_version: String,
    pub max_version: String,
}

impl TlsParams {
    pub fn new(cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            min_version: "1.2".to_string(),
            max_version: "1.3".to_string(),
        }
    }

    pub fn to_settings(&self) -> Result<TlsSettings, ValidationError> {
        let min: TlsVersion = self
            .min_version
            .parse()
            .map_err(|_| invalid(format!("bad TLS min version: {}", self.min_version)))?;
        let max: TlsVersion = self
            .max_version
            .parse()
            .map_err(|_| invalid(format!("bad TLS max version: {}", self.max_version)))?;
        let mut settings = TlsSettings::new(&self.cert_path, &self.key_path);
        settings.min_version = min;
        settings.max_version = max;
        Ok(settings)
    }
}

/// The data-plane slice of a tunnel definition: everything needed to
/// run the listen→target relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub transport: Transport,
    pub listen: HostPort,
    pub target: HostPort,
    pub token: SecretToken,
    #[serde(default)]
    pub mux: MuxParams,
    #[serde(default)]
    pub tls: Option<TlsParams>,
}

impl TunnelSpec {
    /// Check every field range and cross-field consistency. TLS
    /// material readability is checked at start time, not here.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listen.validate("listen")?;
        self.target.validate("target")?;
        self.token.validate()?;
        if self.transport.is_mux() {
            self.mux.validate()?;
        }
        if self.transport.is_tls() {
            let tls = self
                .tls
                .as_ref()
                .ok_or_else(|| invalid(format!("{} requires TLS parameters", self.transport)))?;
            tls.to_settings()?;
        }
        Ok(())
    }
}
