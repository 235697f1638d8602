//! Tunnel data-plane engine.
//!
//! Accepts connections on a tunnel's listen endpoint, optionally
//! multiplexes logical streams over each transport connection, and
//! relays every stream to the tunnel's target. The engine owns the
//! per-tunnel counters and the [`SessionRegistry`] of live instances;
//! lifecycle decisions (when to start, stop, or declare a tunnel
//! broken) belong to the control plane.

pub mod counters;
pub mod instance;
pub mod model;
pub mod registry;
pub mod relay;
mod udp;

pub use counters::{CounterSnapshot, TunnelCounters};
pub use instance::{ExitStatus, TunnelInstance};
pub use model::{
    HostPort, MuxParams, SecretToken, TlsParams, Transport, TunnelSpec, ValidationError,
};
pub use registry::SessionRegistry;
pub use relay::{relay, DIAL_TIMEOUT};
pub use udp::FLOW_IDLE_TIMEOUT;

use passage_proto::TunnelId;
use passage_transport::TransportError;
use thiserror::Error;

/// Data-plane errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The listen endpoint could not be bound (port in use, TLS
    /// material unreadable, address unresolvable).
    #[error("bind failed: {0}")]
    Bind(String),

    /// The configuration was rejected before any socket was touched.
    #[error("invalid tunnel spec: {0}")]
    InvalidSpec(String),

    /// The accept loop or transport failed repeatedly; the instance
    /// gave up.
    #[error("persistent I/O failure: {0}")]
    PersistentIo(String),

    /// A second instance was registered for the same tunnel.
    #[error("tunnel {0} already has a live instance")]
    AlreadyRegistered(TunnelId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this failure belongs to the bind/start phase.
    pub fn is_bind_failure(&self) -> bool {
        matches!(self, EngineError::Bind(_))
    }
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Bind { .. } | TransportError::Tls(_) => {
                EngineError::Bind(e.to_string())
            }
            TransportError::Config(msg) => EngineError::InvalidSpec(msg),
            TransportError::Io(e) => EngineError::Io(e),
        }
    }
}
