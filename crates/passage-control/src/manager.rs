//! Tunnel manager: CRUD, quota enforcement, and lifecycle
//! orchestration over the data-plane engine.

use chrono::Utc;
use passage_engine::{EngineError, SessionRegistry, TunnelInstance};
use passage_proto::{OwnerId, PushMessage, TunnelId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cache::CacheStore;
use crate::error::ControlError;
use crate::model::{
    Caller, CreateTunnel, Page, PageOf, PerformanceMetrics, TunnelFilter, TunnelPatch,
    TunnelRecord, TunnelState, TunnelStatus,
};
use crate::push::PushBus;
use crate::store::{StoreError, TunnelStore};

/// Grace window for draining one tunnel on stop.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Grace window for draining everything on global shutdown.
pub const GLOBAL_STOP_GRACE: Duration = Duration::from_secs(30);

/// Cache pubsub channel carrying state events to sibling replicas.
const EVENTS_CHANNEL: &str = "passage:events";

struct ManagerInner {
    store: Arc<dyn TunnelStore>,
    cache: Arc<dyn CacheStore>,
    registry: Arc<SessionRegistry>,
    bus: PushBus,
    /// Serializes start/stop/update/delete so the registry and the
    /// store cannot diverge under concurrent lifecycle calls.
    lifecycle: tokio::sync::Mutex<()>,
}

/// The control-plane entry point for everything tunnel-shaped.
///
/// Owns the tunnel records and the session registry exclusively; the
/// collector and the HTTP layer only read. Cheap to clone.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Composition-root constructor: the store and cache handles come
    /// first, then the bus, then the manager borrowing all three.
    pub fn new(
        store: Arc<dyn TunnelStore>,
        cache: Arc<dyn CacheStore>,
        registry: Arc<SessionRegistry>,
        bus: PushBus,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                cache,
                registry,
                bus,
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn bus(&self) -> &PushBus {
        &self.inner.bus
    }

    /// Create a tunnel record in `inactive` state.
    pub async fn create(
        &self,
        req: CreateTunnel,
        owner: OwnerId,
    ) -> Result<TunnelRecord, ControlError> {
        let (name, description, spec) = req.into_spec();
        if !(3..=50).contains(&name.len()) {
            return Err(ControlError::Validation(
                "tunnel name must be 3..=50 characters".to_string(),
            ));
        }
        spec.validate()
            .map_err(|e| ControlError::Validation(e.to_string()))?;

        let quota = self.inner.store.owner_quota(owner).await?;
        let count = self.inner.store.count_tunnels_by_owner(owner).await?;
        if count >= u64::from(quota.max_tunnels) {
            return Err(ControlError::QuotaExceeded {
                limit: quota.max_tunnels,
            });
        }

        let now = Utc::now();
        let record = TunnelRecord {
            id: TunnelId::generate(),
            owner,
            name,
            description,
            spec,
            state: TunnelState::Inactive,
            counters: Default::default(),
            created_at: now,
            updated_at: now,
            last_seen: None,
            deleted_at: None,
        };

        self.inner
            .store
            .insert_tunnel(&record)
            .await
            .map_err(conflict_on_duplicate)?;
        self.cache_record(&record).await;

        info!(tunnel_id = %record.id, name = %record.name, %owner, "tunnel created");
        Ok(record)
    }

    /// Apply a patch. A running instance is stopped first.
    pub async fn update(
        &self,
        id: TunnelId,
        patch: TunnelPatch,
        caller: Caller,
    ) -> Result<TunnelRecord, ControlError> {
        let _guard = self.inner.lifecycle.lock().await;
        let mut record = self.require(id).await?;
        authorize(&record, caller)?;

        if patch.is_empty() {
            return Ok(record);
        }

        if let Some(instance) = self.inner.registry.lookup(id) {
            self.halt_instance(&mut record, instance).await;
        }

        patch.apply(&mut record);
        if !(3..=50).contains(&record.name.len()) {
            return Err(ControlError::Validation(
                "tunnel name must be 3..=50 characters".to_string(),
            ));
        }
        record
            .spec
            .validate()
            .map_err(|e| ControlError::Validation(e.to_string()))?;
        record.updated_at = Utc::now();

        self.inner
            .store
            .update_tunnel(&record)
            .await
            .map_err(conflict_on_duplicate)?;
        self.cache_record(&record).await;

        info!(tunnel_id = %id, "tunnel updated");
        Ok(record)
    }

    /// Soft-delete a record, stopping its instance if running.
    pub async fn delete(&self, id: TunnelId, caller: Caller) -> Result<(), ControlError> {
        let _guard = self.inner.lifecycle.lock().await;
        let mut record = self.require(id).await?;
        authorize(&record, caller)?;

        if let Some(instance) = self.inner.registry.lookup(id) {
            self.halt_instance(&mut record, instance).await;
        }

        self.inner.store.delete_tunnel(id, Utc::now()).await?;
        self.inner.cache.delete(&config_key(id)).await;

        info!(tunnel_id = %id, "tunnel deleted");
        Ok(())
    }

    /// Start a tunnel: `inactive | error → connecting → active`, or
    /// `→ error` when the bind fails.
    pub async fn start(&self, id: TunnelId, caller: Caller) -> Result<(), ControlError> {
        let _guard = self.inner.lifecycle.lock().await;
        let mut record = self.require(id).await?;
        authorize(&record, caller)?;

        if self.inner.registry.contains(id) {
            return Err(ControlError::Conflict(
                "tunnel is already running".to_string(),
            ));
        }

        // A record claiming liveness without a registry entry violates
        // the one-instance invariant; recover by forcing `error`.
        if record.state.expects_instance() {
            warn!(
                tunnel_id = %id, state = %record.state,
                "record claims a live instance but none is registered, repairing"
            );
            record.state = TunnelState::Error;
            self.persist_and_emit(&record).await?;
        }

        let quota = self.inner.store.owner_quota(record.owner).await?;
        let count = self
            .inner
            .store
            .count_tunnels_by_owner(record.owner)
            .await?;
        // The record being started is part of the count already.
        if count.saturating_sub(1) >= u64::from(quota.max_tunnels) {
            return Err(ControlError::QuotaExceeded {
                limit: quota.max_tunnels,
            });
        }

        transition(&mut record, TunnelState::Connecting)?;
        self.persist_and_emit(&record).await?;

        let instance =
            match TunnelInstance::spawn(id, record.owner, record.spec.clone()).await {
                Ok(instance) => instance,
                Err(e) => {
                    transition(&mut record, TunnelState::Error)?;
                    self.persist_and_emit(&record).await?;
                    return Err(start_error(e));
                }
            };

        if let Err(e) = self.inner.registry.insert(instance.clone()) {
            error!(tunnel_id = %id, "registry insert failed: {e}");
            instance.stop_and_wait(STOP_GRACE).await;
            transition(&mut record, TunnelState::Error)?;
            self.persist_and_emit(&record).await?;
            return Err(ControlError::Internal(e.to_string()));
        }

        transition(&mut record, TunnelState::Active)?;
        record.last_seen = Some(Utc::now());
        self.persist_and_emit(&record).await?;

        tokio::spawn(monitor_exit(self.inner.clone(), id, instance));

        info!(tunnel_id = %id, listen = %record.spec.listen, "tunnel started");
        Ok(())
    }

    /// Stop a running tunnel and persist its final counters.
    pub async fn stop(&self, id: TunnelId, caller: Caller) -> Result<(), ControlError> {
        let _guard = self.inner.lifecycle.lock().await;
        let mut record = self.require(id).await?;
        authorize(&record, caller)?;

        let instance = self
            .inner
            .registry
            .lookup(id)
            .ok_or(ControlError::NotRunning(id))?;

        self.halt_instance(&mut record, instance).await;
        info!(tunnel_id = %id, "tunnel stopped");
        Ok(())
    }

    /// Current state, liveness, counters, and derived throughput.
    pub async fn status(&self, id: TunnelId) -> Result<TunnelStatus, ControlError> {
        let record = self.require(id).await?;

        Ok(match self.inner.registry.lookup(id) {
            Some(instance) => {
                let counters = instance.counters();
                let elapsed =
                    (Utc::now() - instance.started_at()).num_milliseconds().max(1) as f64 / 1000.0;
                let total = counters.bytes_in + counters.bytes_out;
                let error_rate = if counters.connections > 0 {
                    counters.errors as f64 / counters.connections as f64 * 100.0
                } else {
                    0.0
                };
                TunnelStatus {
                    state: record.state,
                    last_ping: Some(instance.last_ping()),
                    counters,
                    performance: Some(PerformanceMetrics {
                        total_bytes: total,
                        bytes_per_sec: total as f64 / elapsed,
                        connections_per_sec: counters.connections as f64 / elapsed,
                        error_rate,
                    }),
                }
            }
            None => TunnelStatus {
                state: record.state,
                last_ping: record.last_seen,
                counters: record.counters,
                performance: None,
            },
        })
    }

    /// Page through records. Non-admin callers only see their own;
    /// running tunnels carry live counters.
    pub async fn list(
        &self,
        mut filter: TunnelFilter,
        page: Page,
        caller: Caller,
    ) -> Result<PageOf<TunnelRecord>, ControlError> {
        if !caller.admin {
            filter.owner = Some(caller.owner);
        }
        let mut result = self.inner.store.list_tunnels(&filter, page).await?;
        for record in &mut result.items {
            if let Some(instance) = self.inner.registry.lookup(record.id) {
                record.counters = instance.counters();
                record.last_seen = Some(instance.last_ping());
            }
        }
        Ok(result)
    }

    /// Stop every running tunnel, sharing a 30-second drain budget.
    pub async fn shutdown(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        let instances = self.inner.registry.snapshot();
        if instances.is_empty() {
            return;
        }
        info!(count = instances.len(), "global shutdown, stopping all tunnels");

        for instance in &instances {
            instance.stop();
        }

        let deadline = Instant::now() + GLOBAL_STOP_GRACE;
        for instance in instances {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1));
            if !instance.stop_and_wait(remaining).await {
                warn!(tunnel_id = %instance.tunnel_id(), "force-closed during shutdown");
            }
            let id = instance.tunnel_id();
            self.inner.registry.remove(id);

            if let Ok(Some(mut record)) = self.inner.store.get_tunnel(id).await {
                record.counters = instance.counters();
                record.last_seen = Some(Utc::now());
                if record.state.can_transition_to(TunnelState::Inactive) {
                    record.state = TunnelState::Inactive;
                }
                if let Err(e) = self.inner.store.update_tunnel(&record).await {
                    warn!(tunnel_id = %id, "failed to persist shutdown state: {e}");
                } else {
                    emit_state(&self.inner, &record).await;
                }
            }
        }
    }

    async fn require(&self, id: TunnelId) -> Result<TunnelRecord, ControlError> {
        self.inner
            .store
            .get_tunnel(id)
            .await?
            .ok_or(ControlError::NotFound(id))
    }

    /// Stop an instance, remove it from the registry, and persist the
    /// `inactive` transition with final counters.
    async fn halt_instance(&self, record: &mut TunnelRecord, instance: Arc<TunnelInstance>) {
        let drained = instance.stop_and_wait(STOP_GRACE).await;
        if !drained {
            warn!(tunnel_id = %record.id, "relays force-closed after stop grace");
        }
        self.inner.registry.remove(record.id);

        record.counters = instance.counters();
        record.last_seen = Some(Utc::now());
        if record.state.can_transition_to(TunnelState::Inactive) {
            record.state = TunnelState::Inactive;
        } else {
            record.state = TunnelState::Inactive;
            warn!(tunnel_id = %record.id, "stop from unexpected state, forcing inactive");
        }
        if let Err(e) = self.inner.store.update_tunnel(record).await {
            warn!(tunnel_id = %record.id, "failed to persist stop: {e}");
        }
        self.cache_record(record).await;
        emit_state(&self.inner, record).await;
    }

    async fn persist_and_emit(&self, record: &TunnelRecord) -> Result<(), ControlError> {
        self.inner.store.update_tunnel(record).await?;
        self.cache_record(record).await;
        emit_state(&self.inner, record).await;
        Ok(())
    }

    async fn cache_record(&self, record: &TunnelRecord) {
        if let Ok(json) = serde_json::to_string(record) {
            self.inner
                .cache
                .set(&config_key(record.id), &json, None)
                .await;
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("running", &self.inner.registry.len())
            .finish()
    }
}

fn config_key(id: TunnelId) -> String {
    format!("tunnel:config:{id}")
}

/// Broadcast a state event to the owner's subscribers and, best-effort,
/// to sibling control-plane replicas over the cache pubsub channel.
async fn emit_state(inner: &ManagerInner, record: &TunnelRecord) {
    let event = PushMessage::tunnel_state(record.id, record.state.as_str());
    inner.bus.to_owner(record.owner, &event);
    if let Ok(json) = serde_json::to_string(&event) {
        inner.cache.publish(EVENTS_CHANNEL, &json).await;
    }
}

fn authorize(record: &TunnelRecord, caller: Caller) -> Result<(), ControlError> {
    if caller.admin || record.owner == caller.owner {
        Ok(())
    } else {
        Err(ControlError::Forbidden)
    }
}

fn transition(record: &mut TunnelRecord, next: TunnelState) -> Result<(), ControlError> {
    if !record.state.can_transition_to(next) {
        error!(
            tunnel_id = %record.id, from = %record.state, to = %next,
            "illegal state transition"
        );
        return Err(ControlError::Internal(format!(
            "illegal transition {} -> {next}",
            record.state
        )));
    }
    record.state = next;
    Ok(())
}

fn conflict_on_duplicate(e: StoreError) -> ControlError {
    match e {
        StoreError::Duplicate(name) => {
            ControlError::Conflict(format!("tunnel name '{name}' is already in use"))
        }
        other => ControlError::Store(other),
    }
}

fn start_error(e: EngineError) -> ControlError {
    match e {
        EngineError::Bind(msg) => ControlError::BindFailed(msg),
        EngineError::InvalidSpec(msg) => ControlError::Validation(msg),
        other => ControlError::Internal(other.to_string()),
    }
}

/// Watch one instance for an unexpected exit. A clean stop is handled
/// by the stop path; anything else transitions the record to `error`,
/// drops the registry entry, and emits an event. No automatic restart.
async fn monitor_exit(
    inner: Arc<ManagerInner>,
    id: TunnelId,
    instance: Arc<TunnelInstance>,
) {
    let status = instance.wait_exit().await;
    if instance.stop_requested() {
        return;
    }

    let _guard = inner.lifecycle.lock().await;
    let ours = match inner.registry.lookup(id) {
        Some(current) if Arc::ptr_eq(&current, &instance) => {
            inner.registry.remove(id);
            true
        }
        _ => false,
    };
    if !ours {
        return;
    }

    warn!(tunnel_id = %id, ?status, "data-plane instance exited unexpectedly");
    match inner.store.get_tunnel(id).await {
        Ok(Some(mut record)) => {
            record.counters = instance.counters();
            record.last_seen = Some(Utc::now());
            record.state = TunnelState::Error;
            if let Err(e) = inner.store.update_tunnel(&record).await {
                warn!(tunnel_id = %id, "failed to persist error state: {e}");
            }
            emit_state(&inner, &record).await;
        }
        Ok(None) => {}
        Err(e) => warn!(tunnel_id = %id, "cannot load record after exit: {e}"),
    }
}
