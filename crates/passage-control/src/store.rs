//! Persistence interface and the in-memory reference implementation.
//!
//! The manager and the collector only ever talk to [`TunnelStore`]; the
//! backing database is an embedding concern. [`MemoryStore`] backs
//! tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use passage_proto::{OwnerId, TunnelId};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::model::{MetricSample, Page, PageOf, TunnelFilter, TunnelRecord, UserQuota};

/// Typed persistence errors; nothing panics across this boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for tunnel records and metric history.
#[async_trait]
pub trait TunnelStore: Send + Sync {
    async fn insert_tunnel(&self, record: &TunnelRecord) -> Result<(), StoreError>;

    /// Replace the stored record. The `(owner, name)` pair stays
    /// unique across live records.
    async fn update_tunnel(&self, record: &TunnelRecord) -> Result<(), StoreError>;

    /// Soft delete: the record keeps existing with a deletion
    /// timestamp and stops appearing in reads.
    async fn delete_tunnel(&self, id: TunnelId, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn get_tunnel(&self, id: TunnelId) -> Result<Option<TunnelRecord>, StoreError>;

    async fn list_tunnels(
        &self,
        filter: &TunnelFilter,
        page: Page,
    ) -> Result<PageOf<TunnelRecord>, StoreError>;

    async fn count_tunnels_by_owner(&self, owner: OwnerId) -> Result<u64, StoreError>;

    /// The owner's resource limits. Policy lives with the embedding
    /// layer; unknown owners get the permissive default.
    async fn owner_quota(&self, owner: OwnerId) -> Result<UserQuota, StoreError>;

    async fn append_metric_sample(&self, sample: &MetricSample) -> Result<(), StoreError>;

    async fn query_metric_range(
        &self,
        tunnel: TunnelId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError>;

    /// Garbage-collect history; returns how many samples went away.
    async fn delete_metrics_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    tunnels: HashMap<TunnelId, TunnelRecord>,
    metrics: Vec<MetricSample>,
    quotas: HashMap<OwnerId, UserQuota>,
}

/// In-memory [`TunnelStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the quota returned for an owner.
    pub fn set_owner_quota(&self, owner: OwnerId, quota: UserQuota) {
        self.inner.write().unwrap().quotas.insert(owner, quota);
    }
}

fn matches_filter(record: &TunnelRecord, filter: &TunnelFilter) -> bool {
    if record.is_deleted() {
        return false;
    }
    if let Some(owner) = filter.owner {
        if record.owner != owner {
            return false;
        }
    }
    if let Some(state) = filter.state {
        if record.state != state {
            return false;
        }
    }
    if let Some(fragment) = &filter.name_contains {
        if !record.name.contains(fragment.as_str()) {
            return false;
        }
    }
    true
}

fn name_taken(inner: &MemoryStoreInner, record: &TunnelRecord) -> bool {
    inner.tunnels.values().any(|existing| {
        existing.id != record.id
            && !existing.is_deleted()
            && existing.owner == record.owner
            && existing.name == record.name
    })
}

#[async_trait]
impl TunnelStore for MemoryStore {
    async fn insert_tunnel(&self, record: &TunnelRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.tunnels.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id.to_string()));
        }
        if name_taken(&inner, record) {
            return Err(StoreError::Duplicate(record.name.clone()));
        }
        inner.tunnels.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_tunnel(&self, record: &TunnelRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.tunnels.contains_key(&record.id) {
            return Err(StoreError::NotFound);
        }
        if name_taken(&inner, record) {
            return Err(StoreError::Duplicate(record.name.clone()));
        }
        inner.tunnels.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete_tunnel(&self, id: TunnelId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.tunnels.get_mut(&id) {
            Some(record) if !record.is_deleted() => {
                record.deleted_at = Some(at);
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }

    async fn get_tunnel(&self, id: TunnelId) -> Result<Option<TunnelRecord>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .tunnels
            .get(&id)
            .filter(|record| !record.is_deleted())
            .cloned())
    }

    async fn list_tunnels(
        &self,
        filter: &TunnelFilter,
        page: Page,
    ) -> Result<PageOf<TunnelRecord>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut matched: Vec<&TunnelRecord> = inner
            .tunnels
            .values()
            .filter(|record| matches_filter(record, filter))
            .collect();
        matched.sort_by_key(|record| (record.created_at, record.id.0));

        let total = matched.len() as u64;
        let items = matched
            .into_iter()
            .skip(page.offset())
            .take(page.limit as usize)
            .cloned()
            .collect();

        Ok(PageOf {
            items,
            total,
            page: page.page,
            limit: page.limit,
        })
    }

    async fn count_tunnels_by_owner(&self, owner: OwnerId) -> Result<u64, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .tunnels
            .values()
            .filter(|record| !record.is_deleted() && record.owner == owner)
            .count() as u64)
    }

    async fn owner_quota(&self, owner: OwnerId) -> Result<UserQuota, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.quotas.get(&owner).copied().unwrap_or_default())
    }

    async fn append_metric_sample(&self, sample: &MetricSample) -> Result<(), StoreError> {
        self.inner.write().unwrap().metrics.push(sample.clone());
        Ok(())
    }

    async fn query_metric_range(
        &self,
        tunnel: TunnelId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut samples: Vec<MetricSample> = inner
            .metrics
            .iter()
            .filter(|s| s.tunnel_id == tunnel && s.timestamp >= from && s.timestamp <= to)
            .cloned()
            .collect();
        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }

    async fn delete_metrics_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.metrics.len();
        inner.metrics.retain(|s| s.timestamp >= cutoff);
        Ok((before - inner.metrics.len()) as u64)
    }
}
