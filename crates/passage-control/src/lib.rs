//! Tunnel control plane.
//!
//! The [`Manager`] owns tunnel records and the session registry,
//! enforces quotas, and orchestrates the data-plane engine. The
//! [`Collector`] samples live counters into durable history, and the
//! [`PushBus`] fans events out to authenticated subscribers.
//!
//! Persistence ([`TunnelStore`]), caching ([`CacheStore`]), and token
//! authentication ([`TokenAuthenticator`]) are traits; the embedding
//! layer picks the backends. The composition root builds store and
//! cache first, then the bus, then the collector, then the manager —
//! no component holds a reference to its container.

pub mod auth;
pub mod cache;
pub mod collector;
pub mod error;
pub mod manager;
pub mod model;
pub mod push;
pub mod store;

pub use auth::{AuthError, StaticTokenAuthenticator, TokenAuthenticator};
pub use cache::{CacheStore, MemoryCache, NullCache};
pub use collector::{Collector, CollectorConfig};
pub use error::ControlError;
pub use manager::{Manager, GLOBAL_STOP_GRACE, STOP_GRACE};
pub use model::{
    Caller, CreateTunnel, MetricSample, Page, PageOf, PerformanceMetrics, TunnelFilter,
    TunnelPatch, TunnelRecord, TunnelState, TunnelStatus, UserQuota,
};
pub use push::{
    PushBus, PushBusConfig, PushSink, PushSocket, PushSource, SubscriptionId, WsPushSocket,
};
pub use store::{MemoryStore, StoreError, TunnelStore};
