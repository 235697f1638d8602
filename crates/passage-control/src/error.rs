//! Control-plane error taxonomy.

use passage_proto::TunnelId;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced to control-plane callers. Each variant maps to one
/// handling category; internal details stay in the logs.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("tunnel {0} not found")]
    NotFound(TunnelId),

    #[error("caller is not the owner and not an admin")]
    Forbidden,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: owner is limited to {limit} tunnels")]
    QuotaExceeded { limit: u32 },

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("tunnel {0} is not running")]
    NotRunning(TunnelId),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Invariant violation or other unexpected condition. The message
    /// is safe to show; context lives in the audit log.
    #[error("internal error")]
    Internal(String),
}
