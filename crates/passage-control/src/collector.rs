//! Periodic metrics sampling over the session registry.

use chrono::Utc;
use passage_engine::SessionRegistry;
use passage_proto::{PushMessage, TunnelId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::model::MetricSample;
use crate::push::PushBus;
use crate::store::{StoreError, TunnelStore};

/// Collector timing. Defaults are production values; tests shrink them.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Counter sample period.
    pub sample_interval: Duration,
    /// History older than this is garbage-collected.
    pub retention: chrono::Duration,
    /// How often the retention delete runs.
    pub retention_sweep: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            retention: chrono::Duration::days(30),
            retention_sweep: Duration::from_secs(60 * 60),
        }
    }
}

/// Samples live instances, persists the history, and publishes
/// `metrics-update` events. Never mutates tunnel records; the manager
/// draws all state conclusions.
pub struct Collector {
    store: Arc<dyn TunnelStore>,
    cache: Arc<dyn CacheStore>,
    registry: Arc<SessionRegistry>,
    bus: PushBus,
    config: CollectorConfig,
}

impl Collector {
    pub fn new(
        store: Arc<dyn TunnelStore>,
        cache: Arc<dyn CacheStore>,
        registry: Arc<SessionRegistry>,
        bus: PushBus,
        config: CollectorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            bus,
            config,
        }
    }

    /// Read back stored history for one tunnel.
    pub async fn history(
        &self,
        tunnel: TunnelId,
        from: chrono::DateTime<Utc>,
        to: chrono::DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError> {
        self.store.query_metric_range(tunnel, from, to).await
    }

    /// Run the sample and retention loops until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval = ?self.config.sample_interval,
            "metrics collector running"
        );
        let mut sample_tick = tokio::time::interval(self.config.sample_interval);
        sample_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sample_tick.tick().await;

        let mut retention_tick = tokio::time::interval(self.config.retention_sweep);
        retention_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        retention_tick.tick().await;

        // Previous snapshot per tunnel, for the bytes/s derivation.
        let mut previous: HashMap<TunnelId, (Instant, u64)> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("metrics collector stopped");
                    return;
                }
                _ = sample_tick.tick() => {
                    self.sample_all(&mut previous).await;
                }
                _ = retention_tick.tick() => {
                    let cutoff = Utc::now() - self.config.retention;
                    match self.store.delete_metrics_older_than(cutoff).await {
                        Ok(0) => {}
                        Ok(n) => debug!(removed = n, "metric history garbage-collected"),
                        Err(e) => warn!("metric retention sweep failed: {e}"),
                    }
                }
            }
        }
    }

    async fn sample_all(&self, previous: &mut HashMap<TunnelId, (Instant, u64)>) {
        let now = Instant::now();
        let instances = self.registry.snapshot();

        // Forget tunnels that are no longer registered.
        previous.retain(|id, _| instances.iter().any(|i| i.tunnel_id() == *id));

        for instance in instances {
            let id = instance.tunnel_id();
            let counters = instance.counters();
            let total = counters.bytes_in + counters.bytes_out;

            let bytes_per_sec = match previous.insert(id, (now, total)) {
                Some((then, before)) => {
                    let elapsed = now.duration_since(then).as_secs_f64();
                    if elapsed > 0.0 {
                        (total.saturating_sub(before)) as f64 / elapsed
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };

            instance.touch_ping();
            let sample = MetricSample {
                tunnel_id: id,
                timestamp: Utc::now(),
                bytes_in: counters.bytes_in,
                bytes_out: counters.bytes_out,
                connection_count: counters.connections,
                bytes_per_sec,
                last_ping: instance.last_ping(),
                online: !instance.is_done(),
            };

            if let Err(e) = self.store.append_metric_sample(&sample).await {
                warn!(tunnel_id = %id, "failed to persist metric sample: {e}");
            }

            if let Ok(json) = serde_json::to_string(&sample) {
                self.cache
                    .set(
                        &format!("tunnel:stats:{id}"),
                        &json,
                        Some(Duration::from_secs(5 * 60)),
                    )
                    .await;
            }

            let payload = serde_json::to_value(&sample).unwrap_or_default();
            self.bus
                .to_owner(instance.owner(), &PushMessage::metrics_update(id, payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::store::MemoryStore;
    use passage_engine::{HostPort, SecretToken, Transport, TunnelInstance, TunnelSpec};
    use passage_proto::OwnerId;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn sink_target() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut sink = Vec::new();
                    let _ = tokio::io::AsyncReadExt::read_to_end(&mut socket, &mut sink).await;
                });
            }
        });
        port
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_samples_are_persisted_and_pinged() {
        let target_port = sink_target().await;
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let registry = Arc::new(SessionRegistry::new());
        let bus = PushBus::new(Default::default());

        let owner = OwnerId::generate();
        let id = TunnelId::generate();
        let listen_port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let instance = TunnelInstance::spawn(
            id,
            owner,
            TunnelSpec {
                transport: Transport::Tcp,
                listen: HostPort::new("127.0.0.1", listen_port),
                target: HostPort::new("127.0.0.1", target_port),
                token: SecretToken::generate(),
                mux: Default::default(),
                tls: None,
            },
        )
        .await
        .unwrap();
        registry.insert(instance.clone()).unwrap();

        let mut client = TcpStream::connect(instance.local_addr()).await.unwrap();
        client.write_all(b"traffic").await.unwrap();
        client.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let collector = Collector::new(
            store.clone(),
            cache.clone(),
            registry.clone(),
            bus,
            CollectorConfig {
                sample_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move { collector.run(run_cancel).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let samples = store
            .query_metric_range(
                id,
                Utc::now() - chrono::Duration::hours(1),
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert!(!samples.is_empty());
        let last = samples.last().unwrap();
        assert_eq!(last.bytes_in, 7);
        assert!(last.online);

        // Cached stats were refreshed too.
        assert!(cache.get(&format!("tunnel:stats:{id}")).await.is_some());

        instance.stop_and_wait(Duration::from_secs(5)).await;
    }
}
