//! Durable tunnel records and control-plane value types.

use chrono::{DateTime, Utc};
use passage_engine::{
    CounterSnapshot, HostPort, MuxParams, SecretToken, TlsParams, Transport, TunnelSpec,
};
use passage_proto::{OwnerId, TunnelId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a tunnel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Inactive,
    Connecting,
    Active,
    Error,
}

impl TunnelState {
    /// The legal transition matrix. Anything outside it is a bug.
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Inactive, Connecting)
                | (Connecting, Active)
                | (Connecting, Error)
                | (Active, Inactive)
                | (Active, Error)
                | (Error, Connecting)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Inactive => "inactive",
            TunnelState::Connecting => "connecting",
            TunnelState::Active => "active",
            TunnelState::Error => "error",
        }
    }

    /// States that must have exactly one live instance registered.
    pub fn expects_instance(self) -> bool {
        matches!(self, TunnelState::Connecting | TunnelState::Active)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable definition of one tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: TunnelId,
    pub owner: OwnerId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub spec: TunnelSpec,
    pub state: TunnelState,
    /// Last persisted counter snapshot; live values come from the
    /// running instance.
    #[serde(default)]
    pub counters: CounterSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TunnelRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields accepted by `Manager::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnel {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub transport: Transport,
    pub listen: HostPort,
    pub target: HostPort,
    /// Generated when omitted.
    #[serde(default)]
    pub token: Option<SecretToken>,
    #[serde(default)]
    pub mux: Option<MuxParams>,
    #[serde(default)]
    pub tls: Option<TlsParams>,
}

impl CreateTunnel {
    pub fn into_spec(self) -> (String, String, TunnelSpec) {
        let spec = TunnelSpec {
            transport: self.transport,
            listen: self.listen,
            target: self.target,
            token: self.token.unwrap_or_else(SecretToken::generate),
            mux: self.mux.unwrap_or_default(),
            tls: self.tls,
        };
        (self.name, self.description, spec)
    }
}

/// A partial update to a tunnel record. `None` leaves a field alone;
/// for TLS, `Some(None)` clears the parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub transport: Option<Transport>,
    pub listen: Option<HostPort>,
    pub target: Option<HostPort>,
    pub token: Option<SecretToken>,
    pub mux: Option<MuxParams>,
    #[serde(default, with = "double_option")]
    pub tls: Option<Option<TlsParams>>,
}

impl TunnelPatch {
    pub fn apply(&self, record: &mut TunnelRecord) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(description) = &self.description {
            record.description = description.clone();
        }
        if let Some(transport) = self.transport {
            record.spec.transport = transport;
        }
        if let Some(listen) = &self.listen {
            record.spec.listen = listen.clone();
        }
        if let Some(target) = &self.target {
            record.spec.target = target.clone();
        }
        if let Some(token) = &self.token {
            record.spec.token = token.clone();
        }
        if let Some(mux) = &self.mux {
            record.spec.mux = mux.clone();
        }
        if let Some(tls) = &self.tls {
            record.spec.tls = tls.clone();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.transport.is_none()
            && self.listen.is_none()
            && self.target.is_none()
            && self.token.is_none()
            && self.mux.is_none()
            && self.tls.is_none()
    }
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Ok(Some(Option::deserialize(deserializer)?))
    }
}

/// Resource limits of a tunnel owner; a policy input read from the
/// store, never written by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuota {
    pub max_tunnels: u32,
    pub max_bandwidth_bps: u64,
    pub max_connections: u32,
}

impl UserQuota {
    pub fn unlimited() -> Self {
        Self {
            max_tunnels: u32::MAX,
            max_bandwidth_bps: u64::MAX,
            max_connections: u32::MAX,
        }
    }
}

impl Default for UserQuota {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// The caller of a manager operation, as established by the outer
/// authentication layer.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub owner: OwnerId,
    pub admin: bool,
}

impl Caller {
    pub fn user(owner: OwnerId) -> Self {
        Self {
            owner,
            admin: false,
        }
    }

    pub fn admin(owner: OwnerId) -> Self {
        Self { owner, admin: true }
    }
}

/// Derived throughput figures for a running tunnel.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_bytes: u64,
    pub bytes_per_sec: f64,
    pub connections_per_sec: f64,
    pub error_rate: f64,
}

/// Answer to `Manager::status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub last_ping: Option<DateTime<Utc>>,
    pub counters: CounterSnapshot,
    /// Present only while an instance is running.
    pub performance: Option<PerformanceMetrics>,
}

/// One metrics sample for one tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub tunnel_id: TunnelId,
    pub timestamp: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connection_count: u64,
    pub bytes_per_sec: f64,
    pub last_ping: DateTime<Utc>,
    pub online: bool,
}

/// Record filter for listings.
#[derive(Debug, Clone, Default)]
pub struct TunnelFilter {
    pub owner: Option<OwnerId>,
    pub state: Option<TunnelState>,
    pub name_contains: Option<String>,
}

/// 1-based pagination request.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: 50 }
    }
}

impl Page {
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }
}

/// One page of results plus the total count.
#[derive(Debug, Clone)]
pub struct PageOf<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_matrix() {
        use TunnelState::*;
        let legal = [
            (Inactive, Connecting),
            (Connecting, Active),
            (Connecting, Error),
            (Active, Inactive),
            (Active, Error),
            (Error, Connecting),
        ];
        for from in [Inactive, Connecting, Active, Error] {
            for to in [Inactive, Connecting, Active, Error] {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_patch_apply() {
        let (name, description, spec) = CreateTunnel {
            name: "edge".to_string(),
            description: String::new(),
            transport: Transport::Tcp,
            listen: HostPort::new("127.0.0.1", 19001),
            target: HostPort::new("127.0.0.1", 19101),
            token: None,
            mux: None,
            tls: None,
        }
        .into_spec();

        let now = Utc::now();
        let mut record = TunnelRecord {
            id: TunnelId::generate(),
            owner: OwnerId::generate(),
            name,
            description,
            spec,
            state: TunnelState::Inactive,
            counters: CounterSnapshot::default(),
            created_at: now,
            updated_at: now,
            last_seen: None,
            deleted_at: None,
        };

        let patch = TunnelPatch {
            name: Some("edge-2".to_string()),
            target: Some(HostPort::new("10.0.0.1", 8080)),
            ..Default::default()
        };
        patch.apply(&mut record);
        assert_eq!(record.name, "edge-2");
        assert_eq!(record.spec.target, HostPort::new("10.0.0.1", 8080));
        assert_eq!(record.spec.listen, HostPort::new("127.0.0.1", 19001));
    }

    #[test]
    fn test_empty_patch_is_identity() {
        assert!(TunnelPatch::default().is_empty());
    }
}
