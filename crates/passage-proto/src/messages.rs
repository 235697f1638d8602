//! Push-bus message envelope.
//!
//! Outbound events and inbound subscriber messages share a JSON envelope
//! of the form `{"type": ..., "data": ..., "timestamp": ...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TunnelId;

/// An outbound push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl PushMessage {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Greeting sent to a subscriber right after registration.
    pub fn welcome(subscription_id: &str) -> Self {
        Self::new(
            "welcome",
            serde_json::json!({ "subscription_id": subscription_id }),
        )
    }

    /// Tunnel lifecycle transition.
    pub fn tunnel_state(tunnel_id: TunnelId, state: &str) -> Self {
        Self::new(
            "tunnel-state",
            serde_json::json!({ "tunnel_id": tunnel_id, "state": state }),
        )
    }

    /// Periodic counter sample for one tunnel.
    pub fn metrics_update(tunnel_id: TunnelId, sample: Value) -> Self {
        Self::new(
            "metrics-update",
            serde_json::json!({ "tunnel_id": tunnel_id, "sample": sample }),
        )
    }

    pub fn ping() -> Self {
        Self::new("ping", Value::Null)
    }

    pub fn pong() -> Self {
        Self::new("pong", Value::Null)
    }
}

/// Subscriber channels that can be toggled with subscribe/unsubscribe.
pub const CHANNEL_TUNNEL_STATE: &str = "tunnel-state";
pub const CHANNEL_METRICS: &str = "metrics";

/// An inbound message from a subscriber.
///
/// Anything outside this set is parsed as [`ClientMessage::Unknown`],
/// logged, and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
    Pong,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse an inbound JSON text; malformed input maps to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or(ClientMessage::Unknown)
    }
}
